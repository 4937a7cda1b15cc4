//! Purpose: Define the public Rust API for moving authorization data in and out of a directory.
//! Exports: Directory boundary, remote and in-memory directories, transfers, manifest compiler.
//! Role: Surface used by the CLI and integration tests; core codecs stay reachable via `core`.
//! Invariants: Additive-only; operations return `core::error::Error` and never panic on bad input.
//! Invariants: Transfers never hold more than one record per kind in memory at a time.

mod directory;
mod memory;
mod remote;
mod transfer;

pub mod manifest;

pub use crate::core::archive::UnknownMembers;
pub use crate::core::codec::CodecConfig;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use directory::{
    DEFAULT_PAGE_SIZE, Directory, ExportMessage, ExportOptions, ExportStream, ImportAbort,
    ImportAck, ImportRequest, ImportStream, Opcode, Page, PageRequest, STREAM_BUFFER,
};
pub use manifest::{Manifest, Plan, RelationSpec, Step};
pub use memory::MemoryDirectory;
pub use remote::RemoteDirectory;
pub use transfer::{Silent, Transfer, TransferConfig, TransferObserver};
