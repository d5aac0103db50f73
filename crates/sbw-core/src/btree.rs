//! BTreeDB5 container reader.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! header (512 bytes)
//!   0..8    magic "BTreeDB5"
//!   8..12   block size
//!   12..28  content identifier, NUL padded ("World4")
//!   28..32  key size
//!   32      root selector (0 = slot A, else slot B)
//!   33..50  root slot A \ free-list head u32, device size i64,
//!   50..67  root slot B / root block u32, root-is-leaf u8
//! block n at 512 + n * block_size, starting with a two byte tag:
//!   "II" index: level u8, count u32, begin pointer u32, count x (key, pointer u32)
//!   "LL" leaf:  payload, then next-leaf pointer u32 in the last four bytes
//!   "FF" free:  free-list bookkeeping, ignored when reading
//! ```
//!
//! A leaf's payload continues across its chain of next-leaf blocks and holds
//! `count u32` followed by `count x (key, vlq length, value bytes)`.

use std::iter::FusedIterator;
use std::ops::{Bound, RangeBounds};

use crate::error::{Error, Result};
use crate::region::ByteRegion;
use crate::sbon::read_vlq;

pub const MAGIC: &[u8; 8] = b"BTreeDB5";
/// Older container revision; recognised but not readable.
pub const LEGACY_MAGIC: &[u8; 8] = b"BTreeDB4";
pub const HEADER_SIZE: u64 = 512;
pub const MIN_BLOCK_SIZE: u32 = 64;
pub const NO_BLOCK: u32 = u32::MAX;

pub const ROOT_SELECTOR_OFFSET: usize = 32;
pub const ROOT_INFO_OFFSETS: [usize; 2] = [33, 50];
pub const ROOT_INFO_SIZE: usize = 17;
pub const IDENTIFIER_LEN: usize = 16;

pub const FREE_TAG: &[u8; 2] = b"FF";
pub const INDEX_TAG: &[u8; 2] = b"II";
pub const LEAF_TAG: &[u8; 2] = b"LL";
pub const INDEX_HEADER_LEN: usize = 11;
pub const LEAF_POINTER_LEN: usize = 4;

/// Guards descent against pointer cycles in a corrupt index.
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub free_head: u32,
    pub device_size: i64,
    pub root_block: u32,
    pub root_is_leaf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub block_size: u32,
    pub content_identifier: String,
    pub key_size: u32,
    pub using_alt_root: bool,
    pub roots: [RootInfo; 2],
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_i64(b: &[u8], at: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    i64::from_be_bytes(buf)
}

pub fn key_hex(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

impl Header {
    pub fn parse(region: &ByteRegion) -> Result<Header> {
        let magic = region
            .read(0, MAGIC.len() as u64)
            .map_err(|_| Error::invalid("file too short for a BTreeDB header"))?;
        if magic == LEGACY_MAGIC {
            return Err(Error::UnsupportedVersion(
                "BTreeDB4 containers are not supported".into(),
            ));
        }
        if magic != MAGIC {
            return Err(Error::invalid(format!(
                "bad magic {:?}, expected BTreeDB5",
                String::from_utf8_lossy(magic)
            )));
        }
        let head = region
            .read(0, HEADER_SIZE)
            .map_err(|_| Error::invalid("truncated BTreeDB5 header"))?;

        let block_size = be_u32(head, 8) as i32;
        if block_size < MIN_BLOCK_SIZE as i32 || !(block_size as u32).is_power_of_two() {
            return Err(Error::invalid(format!(
                "block size {block_size} is not a power of two >= {MIN_BLOCK_SIZE}"
            )));
        }
        let ident = &head[12..12 + IDENTIFIER_LEN];
        let ident_len = ident.iter().position(|&b| b == 0).unwrap_or(IDENTIFIER_LEN);
        let content_identifier = std::str::from_utf8(&ident[..ident_len])
            .map_err(|_| Error::invalid("content identifier is not utf8"))?
            .to_string();
        let key_size = be_u32(head, 28) as i32;
        if key_size <= 0 || key_size as u32 >= block_size as u32 {
            return Err(Error::invalid(format!("bad key size {key_size}")));
        }
        let using_alt_root = head[ROOT_SELECTOR_OFFSET] != 0;
        let root_at = |off: usize| RootInfo {
            free_head: be_u32(head, off),
            device_size: be_i64(head, off + 4),
            root_block: be_u32(head, off + 12),
            root_is_leaf: head[off + 16] != 0,
        };
        Ok(Header {
            block_size: block_size as u32,
            content_identifier,
            key_size: key_size as u32,
            using_alt_root,
            roots: [root_at(ROOT_INFO_OFFSETS[0]), root_at(ROOT_INFO_OFFSETS[1])],
        })
    }

    pub fn active_root(&self) -> &RootInfo {
        &self.roots[usize::from(self.using_alt_root)]
    }

    pub fn block_offset(&self, block: u32) -> u64 {
        HEADER_SIZE + u64::from(block) * u64::from(self.block_size)
    }
}

/// Where a value lives: the first block of its leaf chain, the offset into
/// that chain's concatenated payload, and the value length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub block: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub location: RecordLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Free,
    Index,
    Leaf,
    Unknown,
}

impl BlockKind {
    fn of(block: &[u8]) -> BlockKind {
        match &block[..2] {
            t if t == FREE_TAG => BlockKind::Free,
            t if t == INDEX_TAG => BlockKind::Index,
            t if t == LEAF_TAG => BlockKind::Leaf,
            _ => BlockKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub free: u64,
    pub index: u64,
    pub leaf: u64,
    pub unknown: u64,
}

impl BlockStats {
    pub fn total(&self) -> u64 {
        self.free + self.index + self.leaf + self.unknown
    }
}

#[derive(Debug, Clone)]
pub struct IndexNode {
    pub block: u32,
    pub level: u8,
    pub begin: u32,
    pub entries: Vec<(Vec<u8>, u32)>,
}

impl IndexNode {
    /// Number of child pointers: the begin pointer plus one per key.
    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Slot 0 is the begin pointer; slot `i` is the pointer of key `i - 1`.
    pub fn child(&self, slot: usize) -> Option<u32> {
        match slot {
            0 => Some(self.begin),
            i => self.entries.get(i - 1).map(|(_, p)| *p),
        }
    }

    /// Slot of the subtree that may hold `key`: the greatest separator key
    /// not above it, or the begin pointer when every key is greater.
    pub fn slot_for(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() <= key)
    }
}

#[derive(Debug, Clone)]
pub struct LeafNode {
    pub block: u32,
    pub entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Index(IndexNode),
    Leaf(LeafNode),
}

#[derive(Debug)]
pub struct BTree {
    region: ByteRegion,
    header: Header,
}

impl BTree {
    pub fn open(region: ByteRegion) -> Result<Self> {
        let header = Header::parse(&region)?;
        tracing::debug!(
            block_size = header.block_size,
            key_size = header.key_size,
            identifier = %header.content_identifier,
            alt_root = header.using_alt_root,
            "opened BTreeDB5 container"
        );
        Ok(Self { region, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn region(&self) -> &ByteRegion {
        &self.region
    }

    pub fn block_count(&self) -> u64 {
        self.region.size().saturating_sub(HEADER_SIZE) / u64::from(self.header.block_size)
    }

    pub fn block(&self, id: u32) -> Result<&[u8]> {
        if id == NO_BLOCK {
            return Err(Error::invalid("dereferenced the null block pointer"));
        }
        self.region
            .read(self.header.block_offset(id), u64::from(self.header.block_size))
            .map_err(|_| Error::invalid(format!("block {id} lies past the end of the file")))
    }

    pub fn read_node(&self, id: u32) -> Result<Node> {
        let data = self.block(id)?;
        match BlockKind::of(data) {
            BlockKind::Index => self.parse_index(id, data).map(Node::Index),
            BlockKind::Leaf => self.parse_leaf(id).map(Node::Leaf),
            BlockKind::Free => Err(Error::invalid(format!(
                "free block {id} is referenced from the index"
            ))),
            BlockKind::Unknown => Err(Error::invalid(format!(
                "block {id} has unknown tag {:?}",
                String::from_utf8_lossy(&data[..2])
            ))),
        }
    }

    fn parse_index(&self, id: u32, data: &[u8]) -> Result<IndexNode> {
        let ks = self.header.key_size as usize;
        let level = data[2];
        let count = be_u32(data, 3) as usize;
        let begin = be_u32(data, 7);
        let needed = count
            .checked_mul(ks + 4)
            .and_then(|n| n.checked_add(INDEX_HEADER_LEN));
        if needed.is_none_or(|n| n > data.len()) {
            return Err(Error::invalid(format!(
                "index block {id} declares {count} keys, more than fit in a block"
            )));
        }
        let mut entries: Vec<(Vec<u8>, u32)> = Vec::with_capacity(count);
        let mut at = INDEX_HEADER_LEN;
        for _ in 0..count {
            let key = data[at..at + ks].to_vec();
            let ptr = be_u32(data, at + ks);
            if let Some((prev, _)) = entries.last()
                && *prev >= key
            {
                return Err(Error::invalid(format!("index block {id} keys are not sorted")));
            }
            entries.push((key, ptr));
            at += ks + 4;
        }
        Ok(IndexNode {
            block: id,
            level,
            begin,
            entries,
        })
    }

    fn parse_leaf(&self, id: u32) -> Result<LeafNode> {
        let ks = self.header.key_size as usize;
        let mut stream = LeafStream::open(self, id)?;
        let count = stream.read_u32()? as usize;
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = stream.read_vec(ks)?;
            let length = read_vlq(|| stream.read_u8())?;
            let offset = stream.position();
            stream.skip(length)?;
            if let Some(prev) = entries.last()
                && prev.key >= key
            {
                return Err(Error::invalid(format!("leaf block {id} keys are not sorted")));
            }
            entries.push(IndexEntry {
                key,
                location: RecordLocation {
                    block: id,
                    offset,
                    length,
                },
            });
        }
        Ok(LeafNode { block: id, entries })
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.header.key_size as usize {
            return Err(Error::invalid(format!(
                "key {} has {} bytes, container keys have {}",
                key_hex(key),
                key.len(),
                self.header.key_size
            )));
        }
        Ok(())
    }

    /// Descend from the active root to the leaf whose range covers `key`.
    fn find_leaf(&self, key: &[u8]) -> Result<LeafNode> {
        let mut block = self.header.active_root().root_block;
        for _ in 0..MAX_TREE_DEPTH {
            match self.read_node(block)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Index(node) => {
                    let slot = node.slot_for(key);
                    block = node.child(slot).unwrap_or(node.begin);
                    tracing::trace!(from = node.block, to = block, slot, "index descent");
                }
            }
        }
        Err(Error::invalid(format!(
            "index deeper than {MAX_TREE_DEPTH} levels"
        )))
    }

    pub fn lookup(&self, key: &[u8]) -> Result<RecordLocation> {
        self.check_key(key)?;
        let leaf = self.find_leaf(key)?;
        leaf.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .map(|i| leaf.entries[i].location)
            .map_err(|_| Error::KeyNotFound(key_hex(key)))
    }

    pub fn read_record(&self, loc: &RecordLocation) -> Result<Vec<u8>> {
        if loc.length > self.region.size() {
            return Err(Error::invalid(format!(
                "record length {} exceeds file size",
                loc.length
            )));
        }
        let mut stream = LeafStream::open(self, loc.block)?;
        stream.skip(loc.offset)?;
        stream.read_vec(loc.length as usize)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let loc = self.lookup(key)?;
        self.read_record(&loc)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.lookup(key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lazily walk the entries whose keys fall in `range`, in ascending order.
    pub fn scan_range<R: RangeBounds<Vec<u8>>>(&self, range: R) -> RangeScan<'_> {
        RangeScan {
            tree: self,
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            started: false,
            done: false,
        }
    }

    pub fn entries(&self) -> RangeScan<'_> {
        self.scan_range(..)
    }

    /// Classify every block by its tag. Free-list contents are not followed.
    pub fn block_stats(&self) -> Result<BlockStats> {
        let mut stats = BlockStats::default();
        let count = self.block_count().min(u64::from(NO_BLOCK));
        for id in 0..count as u32 {
            match BlockKind::of(self.block(id)?) {
                BlockKind::Free => stats.free += 1,
                BlockKind::Index => stats.index += 1,
                BlockKind::Leaf => stats.leaf += 1,
                BlockKind::Unknown => stats.unknown += 1,
            }
        }
        Ok(stats)
    }
}

/// Sequential reader over one leaf chain's payload.
struct LeafStream<'t> {
    tree: &'t BTree,
    data: &'t [u8],
    block: u32,
    cursor: usize,
    position: u64,
    hops: u64,
}

impl<'t> LeafStream<'t> {
    fn open(tree: &'t BTree, block: u32) -> Result<Self> {
        let data = Self::leaf_block(tree, block)?;
        Ok(Self {
            tree,
            data,
            block,
            cursor: LEAF_TAG.len(),
            position: 0,
            hops: 0,
        })
    }

    fn leaf_block(tree: &'t BTree, block: u32) -> Result<&'t [u8]> {
        let data = tree.block(block)?;
        if BlockKind::of(data) != BlockKind::Leaf {
            return Err(Error::invalid(format!("expected leaf block at {block}")));
        }
        Ok(data)
    }

    fn payload_end(&self) -> usize {
        self.data.len() - LEAF_POINTER_LEN
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn next_block(&mut self) -> Result<()> {
        let next = be_u32(self.data, self.payload_end());
        if next == NO_BLOCK {
            return Err(Error::invalid(format!(
                "leaf chain ends at block {} in the middle of a record",
                self.block
            )));
        }
        self.hops += 1;
        if self.hops > self.tree.block_count() {
            return Err(Error::invalid("leaf chain loops back on itself"));
        }
        self.data = Self::leaf_block(self.tree, next)?;
        self.block = next;
        self.cursor = LEAF_TAG.len();
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.cursor == self.payload_end() {
            self.next_block()?;
        }
        let b = self.data[self.cursor];
        self.cursor += 1;
        self.position += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let v = self.read_vec(4)?;
        Ok(be_u32(&v, 0))
    }

    fn read_vec(&mut self, mut n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while n > 0 {
            if self.cursor == self.payload_end() {
                self.next_block()?;
            }
            let take = n.min(self.payload_end() - self.cursor);
            out.extend_from_slice(&self.data[self.cursor..self.cursor + take]);
            self.cursor += take;
            self.position += take as u64;
            n -= take;
        }
        Ok(out)
    }

    fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            if self.cursor == self.payload_end() {
                self.next_block()?;
            }
            let take = n.min((self.payload_end() - self.cursor) as u64);
            self.cursor += take as usize;
            self.position += take;
            n -= take;
        }
        Ok(())
    }
}

/// Forward-only, in-order walk over a key range. Yields at most one error
/// and then stops.
pub struct RangeScan<'t> {
    tree: &'t BTree,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    stack: Vec<(IndexNode, usize)>,
    leaf: std::vec::IntoIter<IndexEntry>,
    started: bool,
    done: bool,
}

impl RangeScan<'_> {
    fn after_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
        }
    }

    fn before_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
        }
    }

    /// Walk down from `block`, following `target` if given, else the
    /// leftmost child, and load the leaf reached.
    fn descend(&mut self, mut block: u32, target: Option<Vec<u8>>) -> Result<()> {
        loop {
            if self.stack.len() >= MAX_TREE_DEPTH {
                return Err(Error::invalid(format!(
                    "index deeper than {MAX_TREE_DEPTH} levels"
                )));
            }
            match self.tree.read_node(block)? {
                Node::Leaf(leaf) => {
                    self.leaf = leaf.entries.into_iter();
                    return Ok(());
                }
                Node::Index(node) => {
                    let slot = target.as_deref().map_or(0, |k| node.slot_for(k));
                    block = node.child(slot).unwrap_or(node.begin);
                    self.stack.push((node, slot));
                }
            }
        }
    }

    /// Move to the next leaf in key order. `Ok(false)` when the tree or the
    /// range is exhausted.
    fn advance(&mut self) -> Result<bool> {
        while let Some((node, slot)) = self.stack.last_mut() {
            if *slot + 1 < node.child_count() {
                *slot += 1;
                let lower = &node.entries[*slot - 1].0;
                let child = node.entries[*slot - 1].1;
                let past_end = match &self.end {
                    Bound::Unbounded => false,
                    Bound::Included(e) => lower > e,
                    Bound::Excluded(e) => lower >= e,
                };
                if past_end {
                    return Ok(false);
                }
                self.descend(child, None)?;
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    fn fail(&mut self, e: Error) -> Option<Result<IndexEntry>> {
        self.done = true;
        Some(Err(e))
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            let target = match &self.start {
                Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
                Bound::Unbounded => None,
            };
            let root = self.tree.header.active_root().root_block;
            if let Err(e) = self.descend(root, target) {
                return self.fail(e);
            }
        }
        while !self.done {
            if let Some(entry) = self.leaf.next() {
                if !self.before_end(&entry.key) {
                    self.done = true;
                    return None;
                }
                if self.after_start(&entry.key) {
                    return Some(Ok(entry));
                }
                continue;
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => return self.fail(e),
            }
        }
        None
    }
}

impl FusedIterator for RangeScan<'_> {}
