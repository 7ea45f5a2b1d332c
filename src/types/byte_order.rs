use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[cfg(target_endian = "big")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Big;

#[cfg(target_endian = "little")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Little;

/// Byte order / endianness.
///
/// Chunks whose element type has no byte order (strings, opaque data, single bytes) record no
/// byte order at all rather than a third variant.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ByteOrder {
    /// Big Endian
    Big,
    /// Little Endian
    Little,
}

impl ByteOrder {
    /// Returns whether data recorded in `recorded` order must be swapped to be delivered in
    /// this order.
    pub fn needs_swap(self, recorded: Option<ByteOrder>) -> bool {
        matches!(recorded, Some(recorded) if recorded != self)
    }
}
