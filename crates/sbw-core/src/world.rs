//! World file façade: header validation, record keys and metadata.

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use flate2::read::ZlibDecoder;

use crate::btree::{BTree, Header, RecordLocation, key_hex};
use crate::error::{Error, Result};
use crate::region::ByteRegion;
use crate::sbon::{Decoder, Dynamic, DynamicMap};

pub const WORLD_IDENTIFIER: &str = "World4";
pub const WORLD_KEY_SIZE: u32 = 5;
pub const METADATA_IDENTIFIER: &str = "WorldMetadata";
/// Largest inflated record accepted.
pub const MAX_RECORD_SIZE: u64 = 256 << 20;

/// Key of a world record: a layer byte and a sector coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionKey {
    pub layer: u8,
    pub x: u16,
    pub y: u16,
}

impl RegionKey {
    pub const METADATA: RegionKey = RegionKey {
        layer: 0,
        x: 0,
        y: 0,
    };
    pub const TILE_LAYER: u8 = 1;
    pub const ENTITY_LAYER: u8 = 2;

    pub fn new(layer: u8, x: u16, y: u16) -> Self {
        Self { layer, x, y }
    }

    pub fn to_bytes(self) -> [u8; 5] {
        let [x0, x1] = self.x.to_be_bytes();
        let [y0, y1] = self.y.to_be_bytes();
        [self.layer, x0, x1, y0, y1]
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let [layer, x0, x1, y0, y1] = *<&[u8; 5]>::try_from(b).ok()?;
        Some(Self {
            layer,
            x: u16::from_be_bytes([x0, x1]),
            y: u16::from_be_bytes([y0, y1]),
        })
    }
}

/// Decoded metadata record of a world.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMetadata {
    pub width: i32,
    pub height: i32,
    pub identifier: String,
    pub version: Option<i32>,
    pub data: DynamicMap,
}

impl WorldMetadata {
    pub fn as_map(&self) -> &DynamicMap {
        &self.data
    }

    /// Look up a dot-separated path such as `worldTemplate.seed`.
    pub fn get(&self, path: &str) -> Option<&Dynamic> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, r),
            None => (path, ""),
        };
        self.data.get(head)?.pointer(rest)
    }

    pub fn require(&self, path: &str) -> Result<&Dynamic> {
        self.get(path)
            .ok_or_else(|| Error::FieldNotFound(path.to_string()))
    }

    pub fn require_str(&self, path: &str) -> Result<&str> {
        self.require(path)?.as_str().ok_or_else(|| {
            Error::InvalidFormat(format!("field {path} is not a string"))
        })
    }

    pub fn world_template(&self) -> Result<&DynamicMap> {
        self.require("worldTemplate")?
            .as_map()
            .ok_or_else(|| Error::invalid("worldTemplate is not a map"))
    }

    pub fn seed(&self) -> Result<&Dynamic> {
        self.require("worldTemplate.seed")
    }

    pub fn player_start(&self) -> Option<&Dynamic> {
        self.get("playerStart")
    }
}

#[derive(Debug)]
pub struct WorldReader {
    tree: BTree,
    metadata: OnceLock<WorldMetadata>,
}

pub fn open_world(path: &Path) -> Result<WorldReader> {
    let region = ByteRegion::map_file(path)?;
    WorldReader::open(region)
}

impl WorldReader {
    pub fn open(region: ByteRegion) -> Result<Self> {
        let tree = BTree::open(region)?;
        let header = tree.header();
        let ident = header.content_identifier.as_str();
        if ident != WORLD_IDENTIFIER {
            return Err(if ident.starts_with("World") {
                Error::UnsupportedVersion(format!(
                    "world format {ident}, expected {WORLD_IDENTIFIER}"
                ))
            } else {
                Error::invalid(format!("container holds {ident:?}, not a world"))
            });
        }
        if header.key_size != WORLD_KEY_SIZE {
            return Err(Error::invalid(format!(
                "world key size {}, expected {WORLD_KEY_SIZE}",
                header.key_size
            )));
        }
        Ok(Self {
            tree,
            metadata: OnceLock::new(),
        })
    }

    pub fn header(&self) -> &Header {
        self.tree.header()
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Inflated bytes of the record stored under `key`.
    pub fn read_raw(&self, key: RegionKey) -> Result<Vec<u8>> {
        let packed = self.tree.get(&key.to_bytes())?;
        inflate(&packed, MAX_RECORD_SIZE).map_err(|e| match e {
            Error::InvalidFormat(msg) => {
                Error::InvalidFormat(format!("record {}: {msg}", key_hex(&key.to_bytes())))
            }
            other => other,
        })
    }

    /// Decode the metadata record once; later calls return the cached copy.
    pub fn read_metadata(&self) -> Result<&WorldMetadata> {
        if let Some(m) = self.metadata.get() {
            return Ok(m);
        }
        let loaded = self.load_metadata()?;
        Ok(self.metadata.get_or_init(|| loaded))
    }

    fn load_metadata(&self) -> Result<WorldMetadata> {
        let raw = self.read_raw(RegionKey::METADATA)?;
        let mut d = Decoder::new(&raw);
        let width = d.read_i32()?;
        let height = d.read_i32()?;
        let doc = d.read_document()?;
        if doc.identifier != METADATA_IDENTIFIER {
            return Err(Error::invalid(format!(
                "metadata document is {:?}, expected {METADATA_IDENTIFIER}",
                doc.identifier
            )));
        }
        let Dynamic::Map(data) = doc.content else {
            return Err(Error::invalid(format!(
                "metadata is a {}, expected a map",
                doc.content.kind()
            )));
        };
        tracing::debug!(width, height, version = ?doc.version, keys = data.len(), "decoded world metadata");
        Ok(WorldMetadata {
            width,
            height,
            identifier: doc.identifier,
            version: doc.version,
            data,
        })
    }

    /// Keys stored in one layer, in ascending sector order.
    pub fn region_keys(&self, layer: u8) -> impl Iterator<Item = Result<RegionKey>> + '_ {
        self.region_entries(layer).map(|r| r.map(|(key, _)| key))
    }

    /// Keys of one layer with the location of each record, as a bounded
    /// range scan.
    pub fn region_entries(
        &self,
        layer: u8,
    ) -> impl Iterator<Item = Result<(RegionKey, RecordLocation)>> + '_ {
        let lo = RegionKey::new(layer, 0, 0).to_bytes().to_vec();
        let hi = RegionKey::new(layer, u16::MAX, u16::MAX).to_bytes().to_vec();
        self.tree.scan_range(lo..=hi).map(|r| {
            r.and_then(|e| {
                RegionKey::from_bytes(&e.key)
                    .map(|k| (k, e.location))
                    .ok_or_else(|| Error::invalid(format!("bad world key {}", key_hex(&e.key))))
            })
        })
    }
}

/// Inflate a zlib record, refusing output larger than `limit` bytes.
pub fn inflate(data: &[u8], limit: u64) -> Result<Vec<u8>> {
    let cap = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(cap));
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::invalid(format!("does not inflate: {e}")))?;
    if out.len() as u64 > limit {
        return Err(Error::invalid(format!("inflates past {limit} bytes")));
    }
    Ok(out)
}
