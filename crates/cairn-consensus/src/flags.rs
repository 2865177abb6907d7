//! Script rules by activation height.

use cairn_core::constants::ChainParams;
use cairn_core::traits::ScriptFlags;

/// Script flags enforced for a block at `height`.
pub fn script_flags(height: u64, params: &ChainParams) -> ScriptFlags {
    let mut flags = ScriptFlags::P2SH;
    if height >= params.bip66_height {
        flags = flags | ScriptFlags::DERSIG | ScriptFlags::STRICTENC;
    }
    if height >= params.bip65_height {
        flags = flags | ScriptFlags::CHECKLOCKTIMEVERIFY;
    }
    if height >= params.csv_height {
        flags = flags | ScriptFlags::CHECKSEQUENCEVERIFY;
    }
    if height >= params.segwit_height {
        flags = flags | ScriptFlags::WITNESS;
    }
    flags
}
