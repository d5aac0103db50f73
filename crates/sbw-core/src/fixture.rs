//! Builders for small synthetic BTreeDB5 images, used by the test suites.
//! These produce fresh images in memory; nothing here edits an existing file.

use std::collections::BTreeMap;
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::btree::{
    FREE_TAG, HEADER_SIZE, IDENTIFIER_LEN, INDEX_TAG, LEAF_POINTER_LEN, LEAF_TAG, LEGACY_MAGIC,
    MAGIC, NO_BLOCK, ROOT_INFO_OFFSETS, ROOT_SELECTOR_OFFSET,
};
use crate::sbon::{Dynamic, VersionedDocument};
use crate::sbon_write::{encode_document, write_vlq};
use crate::world::{METADATA_IDENTIFIER, RegionKey, WORLD_IDENTIFIER, WORLD_KEY_SIZE};

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    block_size: u32,
    key_size: u32,
    identifier: String,
    leaf_fanout: usize,
    index_fanout: usize,
    free_blocks: u32,
    alt_root: bool,
    legacy_magic: bool,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ContainerBuilder {
    /// Keys passed to [`insert`](Self::insert) must be `key_size` bytes.
    pub fn new(identifier: &str, key_size: u32) -> Self {
        Self {
            block_size: 256,
            key_size,
            identifier: identifier.to_string(),
            leaf_fanout: 8,
            index_fanout: 8,
            free_blocks: 0,
            alt_root: false,
            legacy_magic: false,
            entries: BTreeMap::new(),
        }
    }

    pub fn world() -> Self {
        Self::new(WORLD_IDENTIFIER, WORLD_KEY_SIZE)
    }

    pub fn block_size(mut self, n: u32) -> Self {
        self.block_size = n;
        self
    }
    pub fn leaf_fanout(mut self, n: usize) -> Self {
        self.leaf_fanout = n.max(1);
        self
    }
    pub fn index_fanout(mut self, n: usize) -> Self {
        self.index_fanout = n.max(2);
        self
    }
    /// Prepend `n` free blocks linked into a free list.
    pub fn free_blocks(mut self, n: u32) -> Self {
        self.free_blocks = n;
        self
    }
    /// Store the tree in the second root slot and point the first at nothing.
    pub fn alt_root(mut self, yes: bool) -> Self {
        self.alt_root = yes;
        self
    }
    pub fn legacy_magic(mut self, yes: bool) -> Self {
        self.legacy_magic = yes;
        self
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn entry(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size as usize;
        let mut blocks: Vec<Vec<u8>> = Vec::new();

        for i in 0..self.free_blocks {
            let mut b = vec![0u8; bs];
            b[..2].copy_from_slice(FREE_TAG);
            let next = if i + 1 < self.free_blocks { i + 1 } else { NO_BLOCK };
            b[2..6].copy_from_slice(&next.to_be_bytes());
            blocks.push(b);
        }

        // (first key, first block) per node of the level being built
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();
        let all: Vec<(&Vec<u8>, &Vec<u8>)> = self.entries.iter().collect();
        let chunks: Vec<&[(&Vec<u8>, &Vec<u8>)]> = if all.is_empty() {
            vec![&[]]
        } else {
            all.chunks(self.leaf_fanout).collect()
        };
        for chunk in chunks {
            let mut stream = Vec::new();
            stream.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            for (k, v) in chunk {
                stream.extend_from_slice(k);
                write_vlq(&mut stream, v.len() as u64);
                stream.extend_from_slice(v);
            }
            let payload = bs - LEAF_TAG.len() - LEAF_POINTER_LEN;
            let pieces: Vec<&[u8]> = stream.chunks(payload).collect();
            let first = blocks.len() as u32;
            for (i, piece) in pieces.iter().enumerate() {
                let mut b = vec![0u8; bs];
                b[..2].copy_from_slice(LEAF_TAG);
                b[2..2 + piece.len()].copy_from_slice(piece);
                let next = if i + 1 < pieces.len() {
                    first + i as u32 + 1
                } else {
                    NO_BLOCK
                };
                b[bs - LEAF_POINTER_LEN..].copy_from_slice(&next.to_be_bytes());
                blocks.push(b);
            }
            let first_key = chunk.first().map(|(k, _)| (*k).clone()).unwrap_or_default();
            level.push((first_key, first));
        }

        let root_is_leaf = level.len() == 1;
        let mut depth: u8 = 0;
        while level.len() > 1 {
            let mut next_level = Vec::new();
            for group in level.chunks(self.index_fanout) {
                let mut b = vec![0u8; bs];
                b[..2].copy_from_slice(INDEX_TAG);
                b[2] = depth;
                b[3..7].copy_from_slice(&((group.len() - 1) as u32).to_be_bytes());
                b[7..11].copy_from_slice(&group[0].1.to_be_bytes());
                let mut at = 11;
                for (k, ptr) in &group[1..] {
                    b[at..at + k.len()].copy_from_slice(k);
                    at += k.len();
                    b[at..at + 4].copy_from_slice(&ptr.to_be_bytes());
                    at += 4;
                }
                next_level.push((group[0].0.clone(), blocks.len() as u32));
                blocks.push(b);
            }
            level = next_level;
            depth += 1;
        }
        let root = level[0].1;

        let device_size = HEADER_SIZE + (blocks.len() * bs) as u64;
        let mut out = self.header(root, root_is_leaf, device_size);
        for b in blocks {
            out.extend_from_slice(&b);
        }
        out
    }

    fn header(&self, root: u32, root_is_leaf: bool, device_size: u64) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_SIZE as usize];
        let magic = if self.legacy_magic { LEGACY_MAGIC } else { MAGIC };
        h[..8].copy_from_slice(magic);
        h[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        let ident = self.identifier.as_bytes();
        let n = ident.len().min(IDENTIFIER_LEN);
        h[12..12 + n].copy_from_slice(&ident[..n]);
        h[28..32].copy_from_slice(&self.key_size.to_be_bytes());
        h[ROOT_SELECTOR_OFFSET] = u8::from(self.alt_root);

        let free_head = if self.free_blocks > 0 { 0 } else { NO_BLOCK };
        let (live, stale) = if self.alt_root {
            (ROOT_INFO_OFFSETS[1], ROOT_INFO_OFFSETS[0])
        } else {
            (ROOT_INFO_OFFSETS[0], ROOT_INFO_OFFSETS[1])
        };
        write_root(&mut h, live, free_head, device_size, root, root_is_leaf);
        write_root(&mut h, stale, NO_BLOCK, 0, NO_BLOCK, false);
        h
    }
}

fn write_root(h: &mut [u8], at: usize, free: u32, device: u64, root: u32, leaf: bool) {
    h[at..at + 4].copy_from_slice(&free.to_be_bytes());
    h[at + 4..at + 12].copy_from_slice(&device.to_be_bytes());
    h[at + 12..at + 16].copy_from_slice(&root.to_be_bytes());
    h[at + 16] = u8::from(leaf);
}

pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

/// Compressed metadata record: size prefix plus a `WorldMetadata` document.
pub fn metadata_record(width: i32, height: i32, content: &Dynamic) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&width.to_be_bytes());
    raw.extend_from_slice(&height.to_be_bytes());
    raw.extend_from_slice(&encode_document(&VersionedDocument {
        identifier: METADATA_IDENTIFIER.to_string(),
        version: Some(1),
        content: content.clone(),
    }));
    deflate(&raw)
}

/// A world holding only its metadata record.
pub fn world_image(width: i32, height: i32, metadata: &Dynamic) -> io::Result<Vec<u8>> {
    let record = metadata_record(width, height, metadata)?;
    Ok(ContainerBuilder::world()
        .entry(RegionKey::METADATA.to_bytes(), record)
        .build())
}
