//! Blob store backend implementations.

pub mod filesystem;
pub mod memory;
pub mod object;
pub mod peer;
pub mod relay;

#[cfg(feature = "aws")]
pub mod s3;

#[cfg(feature = "azure")]
pub mod azure;
