//! Backend adapters for format-specific implementations.
//!
//! Each module provides a thin adapter between the uniform plugin contract
//! and one codec stack. All are feature-gated; the registry only registers
//! what is compiled in.

#[cfg(feature = "png")]
pub(crate) mod png;

#[cfg(feature = "image")]
pub(crate) mod image_rs;

#[cfg(feature = "tiff")]
pub(crate) mod tiff;

#[cfg(feature = "ffmpeg")]
pub(crate) mod ffmpeg;

#[cfg(feature = "clipboard")]
pub(crate) mod clipboard;
