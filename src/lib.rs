//! A library for working with ZIP archives and gzip-framed files.
//!
//! The centerpiece is [`Archive`]: an entry index over a ZIP container that
//! opens read-only, switches into an appending session on the first
//! [`add`](Archive::add), and rewrites the central directory when finalized.
//! Opening is deliberately forgiving: a missing or damaged container starts
//! out empty instead of failing, so the same call serves both "read this
//! archive" and "create this archive".
//!
//! ```no_run
//! use zipkit::Archive;
//!
//! let mut archive = Archive::open("bundle.zip");
//! archive.add("docs/readme.txt", "hello")?;
//! archive.finalize()?;
//!
//! let archive = Archive::open("bundle.zip");
//! for entry in archive.items() {
//!     println!("{} ({} bytes)", entry.name(), entry.size());
//! }
//! # Ok::<(), zipkit::result::ZipError>(())
//! ```
//!
//! Whole directory trees move through [`Archive::pack`] and
//! [`Archive::unpack`]; single files move through the [`gzip`] module's
//! [`encode`](gzip::encode) / [`decode`](gzip::decode) pair.
//!
//! Out of scope: zip64 containers, encryption, multi-member gzip streams,
//! and non-seekable (streaming) access.

#![warn(missing_docs)]

pub use crate::archive::{Archive, Entry};
pub use crate::compression::CompressionMethod;
pub use crate::path::sanitize_name;
pub use crate::result::{ZipError, ZipResult};
pub use crate::types::DateTime;

mod archive;
mod compression;
mod crc32;
pub mod gzip;
mod path;
mod read;
pub mod result;
mod spec;
mod types;
mod write;
