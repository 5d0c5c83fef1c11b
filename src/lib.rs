// ABOUTME: Library root for the pg_dump importer
// ABOUTME: Exposes the import core, the remote proxy client and configuration loading

pub mod config;
pub mod dump;
pub mod error;
pub mod import;
pub mod remote;

pub use dump::ParsedDump;
pub use error::ImporterError;
pub use import::{ImportController, ImportOptions, ImportStatus};
pub use remote::{ConnectionDescriptor, RemoteClient, SqlProxy};
