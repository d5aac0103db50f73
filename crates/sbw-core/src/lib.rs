//! sbw-core: read-only access to Starbound world files
//!
//! This crate focuses on a small, well-factored surface:
//! - memory-mapped byte region (`region`)
//! - BTreeDB5 container index with point lookups and range scans (`btree`)
//! - SBON tagged value decoder and encoder (`sbon`, `sbon_write`)
//! - world façade with cached metadata and path accessors (`world`)
//! - typed summaries, JSON export and zip backups for the CLI
//!
pub mod backup;
pub mod btree;
pub mod error;
pub mod fixture;
pub mod json;
pub mod model;
pub mod region;
pub mod sbon;
pub mod sbon_write;
pub mod world;

pub use btree::{BTree, BlockStats, Header, IndexEntry, RangeScan, RecordLocation};
pub use error::{Error, Result};
pub use json::{JsonOpts, dynamic_to_json};
pub use model::{CelestialDetails, WorldFile, WorldSummary};
pub use region::ByteRegion;
pub use sbon::{Dynamic, DynamicMap, VersionedDocument, decode, read_sbvj01};
pub use world::{RegionKey, WorldMetadata, WorldReader, open_world};
