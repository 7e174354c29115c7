//! Little-endian binary codec for the ROS1 message wire format.
//!
//! The codec knows nothing about message schemas; it moves primitives,
//! strings, time values, and arrays of each. Schema-driven (de)serialization
//! of whole messages lives in [`crate::msg`].

mod de;
mod error;
mod ser;

pub use {
    de::ByteReader,
    error::{CodecError, CodecResult},
    ser::ByteWriter,
};
