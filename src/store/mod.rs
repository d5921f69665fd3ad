//! Persistence layer — libSQL-backed archive of finished interviews.

pub mod archive;
pub mod migrations;

pub use archive::{Archive, LibSqlArchive, MemoryArchive};
