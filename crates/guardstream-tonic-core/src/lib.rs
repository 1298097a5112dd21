#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Downstream crates reach the engine through
// `guardstream_tonic_core::guardstream`.
pub use guardstream;

pub mod proto {
    tonic::include_proto!("guardstream");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("guardstream_descriptor");
}
