pub mod attributes;
pub mod batch;
pub mod map_codec;
pub mod node;

use crate::error::CodecError;

/// Version written by every encoder.
pub const CURRENT_VERSION: u32 = 4;
/// Oldest version the decoder still accepts.
pub const MIN_VERSION: u32 = 1;

pub use batch::{decode_batch, encode_batch};
pub use map_codec::{decode, decode_slice, decode_tiles, encode, encode_tiles, encode_to_vec};

/// Turns a short read into `CodecError::Truncated`.
pub(crate) fn need<T>(value: Option<T>) -> Result<T, CodecError> {
    value.ok_or(CodecError::Truncated)
}
