//! # tillsync storage
//!
//! Byte-store backends underneath the tillsync logs.
//!
//! A backend is an **opaque, append-only byte store**. It knows nothing
//! about frames, records or queue entries; `tillsync_core` owns every
//! format decision and only asks a backend to append, read back, make
//! data durable and cut a torn tail off.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - one OS file per log, durable across restarts
//! - [`InMemoryBackend`] - for tests and throwaway stations
//!
//! ## Example
//!
//! ```rust
//! use tillsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"order:42").unwrap();
//! assert_eq!(backend.read_at(offset, 8).unwrap(), b"order:42");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
