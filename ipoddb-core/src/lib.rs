//! ipoddb-core: iPod iTunesDB storage engine
//!
//! This crate provides:
//! - iTunesDB reading and writing (little-endian tagged blocks)
//! - iTunesSD shuffle database output
//! - an in-memory index of tracks, artists, albums and playlists
//! - a write-ahead action log shared between processes using the same device
//! - an in-memory query engine over track snapshots
//!
//! [`IPod`] is the entry point for applications.

pub mod block;
pub mod error;
pub mod ipod;
pub mod itunesdb;
pub mod listitem;
pub mod log;
pub mod parser;
pub mod path;
pub mod query;
pub mod string;
pub mod track;
pub mod tracklist;
pub mod validate;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use ipod::{IPod, Logging};
pub use itunesdb::{Artist, ItunesDb};
pub use listitem::{ItemProperty, ListItem};
pub use log::{ActionLog, LogAction, Snapshot};
pub use query::{Filter, Query, QueryHandle, QueryMaker, QueryResult, QueryType};
pub use track::Track;
pub use tracklist::TrackList;
pub use validate::{validate_itunesdb, ValidationResult};
