use super::kohya::is_kohya_key;
use super::sgm::is_sgm_key;
use super::ConvertError;
use crate::lora::types::TargetKind;

/// Key-naming scheme of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Keys namespaced by target, e.g. `unet.down_blocks.0...lora.down.weight`.
    Canonical,
    /// Keys without any target namespace; all belong to the UNet.
    LegacyUnprefixed,
    /// `lora_unet_*` / `lora_te_*` flat underscore names.
    Kohya,
    /// Kohya names that use `input_blocks` / `middle_block` / `output_blocks`
    /// numbering and need a block remap first.
    SgmBlocks,
}

/// Classify a checkpoint by its keys.
///
/// Kohya keys must make up the whole checkpoint, as must prefixed keys;
/// any mixture is an error. An empty checkpoint is canonical.
pub fn detect_dialect<'a>(keys: impl IntoIterator<Item = &'a str>) -> Result<Dialect, ConvertError> {
    let mut total = 0usize;
    let mut kohya = 0usize;
    let mut sgm = false;
    let mut prefixed = 0usize;

    for key in keys {
        total += 1;
        if is_kohya_key(key) {
            kohya += 1;
            sgm |= is_sgm_key(key);
        } else if TargetKind::from_key(key).is_some() {
            prefixed += 1;
        }
    }

    if kohya > 0 {
        if kohya != total {
            return Err(ConvertError::MixedDialect {
                kohya,
                other: total - kohya,
            });
        }
        return Ok(if sgm { Dialect::SgmBlocks } else { Dialect::Kohya });
    }

    match prefixed {
        p if p == total => Ok(Dialect::Canonical),
        0 => Ok(Dialect::LegacyUnprefixed),
        p => Err(ConvertError::MixedPrefixes {
            prefixed: p,
            unprefixed: total - p,
        }),
    }
}
