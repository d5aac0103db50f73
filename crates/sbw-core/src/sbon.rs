//! SBON: the tagged binary value format used inside world records and
//! `SBVJ01` files.
use std::collections::HashMap;

use crate::error::{Error, Result};

pub const SBVJ01_MAGIC: &[u8; 6] = b"SBVJ01";
/// Containers nested deeper than this are rejected as corrupt.
pub const MAX_DEPTH: usize = 256;
const MAX_VLQ_BYTES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Null = 1,
    Float = 2,
    Bool = 3,
    Int = 4,
    String = 5,
    List = 6,
    Map = 7,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Tag> {
        let t = match b {
            1 => Tag::Null,
            2 => Tag::Float,
            3 => Tag::Bool,
            4 => Tag::Int,
            5 => Tag::String,
            6 => Tag::List,
            7 => Tag::Map,
            _ => return None,
        };
        Some(t)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Dynamic>),
    Map(DynamicMap),
}

impl Dynamic {
    pub fn kind(&self) -> &'static str {
        match self {
            Dynamic::Null => "null",
            Dynamic::Bool(_) => "bool",
            Dynamic::Int(_) => "int",
            Dynamic::Float(_) => "float",
            Dynamic::String(_) => "string",
            Dynamic::List(_) => "list",
            Dynamic::Map(_) => "map",
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Dynamic::Null => Tag::Null,
            Dynamic::Bool(_) => Tag::Bool,
            Dynamic::Int(_) => Tag::Int,
            Dynamic::Float(_) => Tag::Float,
            Dynamic::String(_) => Tag::String,
            Dynamic::List(_) => Tag::List,
            Dynamic::Map(_) => Tag::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Dynamic::Null)
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Dynamic::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Dynamic::Int(n) => Some(*n),
            _ => None,
        }
    }
    /// Ints widen to floats; the format stores whole-number JSON numbers as ints.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Dynamic::Float(f) => Some(*f),
            Dynamic::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Dynamic::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&[Dynamic]> {
        match self {
            Dynamic::List(items) => Some(items),
            _ => None,
        }
    }
    pub fn as_map(&self) -> Option<&DynamicMap> {
        match self {
            Dynamic::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Dynamic> {
        self.as_map()?.get(key)
    }

    /// Walk a dot-separated path. Numeric segments index into lists.
    pub fn pointer(&self, path: &str) -> Option<&Dynamic> {
        if path.is_empty() {
            return Some(self);
        }
        let mut cur = self;
        for seg in path.split('.') {
            cur = match cur {
                Dynamic::Map(m) => m.get(seg)?,
                Dynamic::List(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

impl From<bool> for Dynamic {
    fn from(b: bool) -> Self {
        Dynamic::Bool(b)
    }
}
impl From<i64> for Dynamic {
    fn from(n: i64) -> Self {
        Dynamic::Int(n)
    }
}
impl From<f64> for Dynamic {
    fn from(f: f64) -> Self {
        Dynamic::Float(f)
    }
}
impl From<&str> for Dynamic {
    fn from(s: &str) -> Self {
        Dynamic::String(s.to_string())
    }
}
impl From<String> for Dynamic {
    fn from(s: String) -> Self {
        Dynamic::String(s)
    }
}
impl From<Vec<Dynamic>> for Dynamic {
    fn from(items: Vec<Dynamic>) -> Self {
        Dynamic::List(items)
    }
}
impl From<DynamicMap> for Dynamic {
    fn from(m: DynamicMap) -> Self {
        Dynamic::Map(m)
    }
}

/// String-keyed map that keeps insertion order.
#[derive(Debug, Clone, Default)]
pub struct DynamicMap {
    entries: Vec<(String, Dynamic)>,
    /// key -> position in `entries`
    index: HashMap<String, usize>,
}

impl PartialEq for DynamicMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl DynamicMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
            index: HashMap::with_capacity(n),
        }
    }

    /// Inserts or replaces. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Dynamic) -> Option<Dynamic> {
        let key = key.into();
        if let Some(&at) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[at].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&Dynamic> {
        self.index.get(key).map(|&at| &self.entries[at].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dynamic)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>> FromIterator<(K, Dynamic)> for DynamicMap {
    fn from_iter<I: IntoIterator<Item = (K, Dynamic)>>(iter: I) -> Self {
        let mut m = DynamicMap::new();
        for (k, v) in iter {
            m.insert(k, v);
        }
        m
    }
}

/// A dynamic value tagged with an identifier and an optional version, as
/// stored in world metadata and `SBVJ01` files.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub identifier: String,
    pub version: Option<i32>,
    pub content: Dynamic,
}

/// Reads one VLQ from `next`: base-128 groups, most significant first.
pub(crate) fn read_vlq(mut next: impl FnMut() -> Result<u8>) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..MAX_VLQ_BYTES {
        let b = next()?;
        if value > (u64::MAX >> 7) {
            return Err(Error::invalid("varint overflows 64 bits"));
        }
        value = (value << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::invalid(format!(
        "varint longer than {MAX_VLQ_BYTES} bytes"
    )))
}

pub(crate) fn unzigzag(v: u64) -> i64 {
    if v & 1 == 1 {
        -((v >> 1) as i64) - 1
    } else {
        (v >> 1) as i64
    }
}

/// Decode one dynamic value from the start of `data`, returning the value
/// and the number of bytes it occupied.
pub fn decode(data: &[u8]) -> Result<(Dynamic, usize)> {
    let mut d = Decoder::new(data);
    let v = d.read_dynamic()?;
    Ok((v, d.pos()))
}

/// Decode a standalone `SBVJ01` file image.
pub fn read_sbvj01(data: &[u8]) -> Result<VersionedDocument> {
    if data.len() < SBVJ01_MAGIC.len() || &data[..SBVJ01_MAGIC.len()] != SBVJ01_MAGIC {
        return Err(Error::invalid("missing SBVJ01 magic"));
    }
    let mut d = Decoder::new(&data[SBVJ01_MAGIC.len()..]);
    d.read_document()
}

#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }
    pub fn pos(&self) -> usize {
        self.pos
    }
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_document(&mut self) -> Result<VersionedDocument> {
        let identifier = self.read_string()?;
        let version = match self.read_u8()? {
            0 => None,
            _ => Some(self.read_i32()?),
        };
        let content = self.read_dynamic()?;
        Ok(VersionedDocument {
            identifier,
            version,
            content,
        })
    }

    pub fn read_dynamic(&mut self) -> Result<Dynamic> {
        let at = self.pos;
        let raw = self.read_u8()?;
        let tag = Tag::from_u8(raw).ok_or(Error::UnknownTag {
            tag: raw,
            offset: at,
        })?;
        let v = match tag {
            Tag::Null => Dynamic::Null,
            Tag::Float => Dynamic::Float(self.read_f64()?),
            Tag::Bool => Dynamic::Bool(self.read_u8()? != 0),
            Tag::Int => Dynamic::Int(self.read_signed_varint()?),
            Tag::String => Dynamic::String(self.read_string()?),
            Tag::List => self.nested(Self::read_list)?,
            Tag::Map => self.nested(Self::read_map)?,
        };
        Ok(v)
    }

    fn nested(&mut self, f: fn(&mut Self) -> Result<Dynamic>) -> Result<Dynamic> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::invalid(format!(
                "values nested deeper than {MAX_DEPTH} at {:#x}",
                self.pos
            )));
        }
        self.depth += 1;
        let v = f(self);
        self.depth -= 1;
        v
    }

    fn read_list(&mut self) -> Result<Dynamic> {
        let count = self.read_count()?;
        // Every element takes at least one byte, so a bogus count cannot
        // reserve more than the input could hold.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.read_dynamic()?);
        }
        Ok(Dynamic::List(items))
    }

    fn read_map(&mut self) -> Result<Dynamic> {
        let count = self.read_count()?;
        let mut map = DynamicMap::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_dynamic()?;
            map.insert(key, value);
        }
        Ok(Dynamic::Map(map))
    }

    fn read_count(&mut self) -> Result<usize> {
        let n = self.read_varint()?;
        usize::try_from(n).map_err(|_| Error::invalid(format!("count {n} too large")))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_count()?;
        let at = self.pos;
        let bytes = self.read_slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::invalid(format!("invalid utf8 in string at {at:#x}")))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        read_vlq(|| self.read_u8())
    }

    pub fn read_signed_varint(&mut self) -> Result<i64> {
        Ok(unzigzag(self.read_varint()?))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        let s = self.read_slice(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }
    pub fn read_f64(&mut self) -> Result<f64> {
        let s = self.read_slice(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(f64::from_be_bytes(b))
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }
}
