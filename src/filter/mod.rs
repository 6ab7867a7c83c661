//! Preprocessing filters applied before the coder.
//!
//! A block's method arguments select at most one of these; the matching
//! inverse travels inside the block as a ZPAQL post-processor program, so
//! extraction needs nothing from this module. `args[1]` encodes the
//! choice: 0 none, 1 variable-length LZ77, 2 byte-aligned LZ77, 3 BWT,
//! plus 4 for a leading E8E9 pass.

pub mod bwt;
pub mod e8e9;
pub mod lz77;

pub use bwt::{bwt_forward, bwt_inverse, MAX_BWT};
pub use e8e9::{e8e9_forward, e8e9_inverse};
pub use lz77::{lz77_encode, Lz77Config};

use crate::error::{Error, Result};

/// Applies the preprocessing selected by `args` and returns the bytes to
/// hand to the coder. `input` is mutated in place by the E8E9 pass.
pub fn preprocess(input: &mut Vec<u8>, args: &[i32; 9]) -> Result<Vec<u8>> {
    let kind = args[1];
    if (4..=7).contains(&kind) {
        e8e9_forward(input);
    }
    match kind & 3 {
        0 => Ok(std::mem::take(input)),
        1 | 2 => Ok(lz77_encode(input, &Lz77Config::from_args(args))),
        3 => {
            if input.len() > MAX_BWT {
                return Err(Error::TooBig("BWT block".into()));
            }
            Ok(bwt_forward(input))
        }
        _ => unreachable!("kind masked to 0..=3"),
    }
}
