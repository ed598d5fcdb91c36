//! # ndio
//!
//! Uniform ndimage I/O: one `open()` over pluggable image, volume, and
//! video backends.
//!
//! A resource — file path, in-memory bytes, reader, URL, or a special
//! device token like `"<video0>"` — goes in together with a direction;
//! resolution picks the backend (extension candidates first, content
//! sniffing as fallback), and out comes an open [`Plugin`] with one uniform
//! operation set: read one element, iterate, write, metadata, properties,
//! close.
//!
//! ## Reading
//!
//! ```no_run
//! use ndio::{OpenMode, open};
//!
//! let mut image = open("photo.png", OpenMode::Read)?;
//! let frame = image.read(None)?;
//! println!("{:?} via {}", frame.shape(), image.backend_id());
//! # Ok::<(), ndio::NdioError>(())
//! ```
//!
//! ## Writing to memory
//!
//! ```no_run
//! use ndio::{NdImage, OpenMode, OpenOptions, open_with};
//!
//! let frame = NdImage::from_u8(&[2, 2, 3], vec![0; 12]).unwrap();
//! let mut sink = open_with(
//!     "<bytes>",
//!     OpenMode::Write,
//!     OpenOptions::new().with_format_hint("png"),
//! )?;
//! sink.write(&frame)?;
//! sink.close()?;
//! let encoded = sink.result_bytes().unwrap();
//! # let _ = encoded;
//! # Ok::<(), ndio::NdioError>(())
//! ```
//!
//! Backends are feature-gated; enable only what you need. Subprocess-backed
//! ones (`ffmpeg`, `clipboard`) additionally probe for their binary at
//! first use and are skipped during automatic resolution when it is
//! missing.

#![forbid(unsafe_code)]

mod backends;
pub mod config;
mod error;
pub mod legacy;
mod ndimage;
mod plugin;
pub mod registry;
mod resolve;
mod resource;

pub use error::NdioError;
pub use ndimage::{ElementType, Length, MetaMap, NdData, NdImage, Properties};
pub use plugin::{BackendInstance, Elements, Plugin};
pub use registry::{BackendDescriptor, FormatDescriptor, InterfaceKind, ModeSet, Registry};
pub use resolve::{OpenOptions, open, open_with};
pub use resource::{DeviceKind, OpenMode, Request, Resource};
