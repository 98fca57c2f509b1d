//! Small shared utilities

pub mod bip_buffer;

pub use bip_buffer::BipBuffer;
