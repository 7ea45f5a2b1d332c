pub mod byte_order;
pub mod element_type;

// Re-export types for convenience.
pub use crate::types::byte_order::{ByteOrder, NATIVE_BYTE_ORDER};
pub use crate::types::element_type::ElementType;
