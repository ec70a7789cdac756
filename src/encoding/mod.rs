//! On-disk encodings: the tuple record format shared by every data file and
//! the checksummed framing used for run metadata.

pub mod bincode;
pub mod tuple;

pub use tuple::{decode_key, decode_tuple, encode_tuple, encoded_len, TombstoneRule, DELETED_MARKER};
