//! Filesystem artifacts.
//!
//! - [`filesystem`] - Tree copying that preserves modes and symlinks, digests
//! - [`layer`] - Reproducible `.tar.zst` layer export with image config

pub mod filesystem;
pub mod layer;
