use crate::sbon::{Dynamic, SBVJ01_MAGIC, VersionedDocument};

pub fn encode(value: &Dynamic) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_dynamic(value);
    w.out
}

pub fn encode_document(doc: &VersionedDocument) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_document(doc);
    w.out
}

/// Full `SBVJ01` file image: magic followed by the document.
pub fn encode_sbvj01(doc: &VersionedDocument) -> Vec<u8> {
    let mut w = Writer::new();
    w.out.extend_from_slice(SBVJ01_MAGIC);
    w.write_document(doc);
    w.out
}

pub fn write_vlq(out: &mut Vec<u8>, v: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rest = v;
    loop {
        groups[n] = (rest & 0x7F) as u8;
        n += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | cont);
    }
}

pub fn write_signed_vlq(out: &mut Vec<u8>, v: i64) {
    let z = if v < 0 {
        ((!(v as u64)) << 1) | 1
    } else {
        (v as u64) << 1
    };
    write_vlq(out, z);
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self {
            out: Vec::with_capacity(256),
        }
    }
    fn push(&mut self, b: u8) {
        self.out.push(b);
    }
    fn write_str(&mut self, s: &str) {
        write_vlq(&mut self.out, s.len() as u64);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn write_document(&mut self, doc: &VersionedDocument) {
        self.write_str(&doc.identifier);
        match doc.version {
            Some(v) => {
                self.push(1);
                self.out.extend_from_slice(&v.to_be_bytes());
            }
            None => self.push(0),
        }
        self.write_dynamic(&doc.content);
    }

    fn write_dynamic(&mut self, v: &Dynamic) {
        self.push(v.tag() as u8);
        match v {
            Dynamic::Null => {}
            Dynamic::Bool(b) => self.push(u8::from(*b)),
            Dynamic::Int(n) => write_signed_vlq(&mut self.out, *n),
            Dynamic::Float(f) => self.out.extend_from_slice(&f.to_be_bytes()),
            Dynamic::String(s) => self.write_str(s),
            Dynamic::List(items) => {
                write_vlq(&mut self.out, items.len() as u64);
                for it in items {
                    self.write_dynamic(it);
                }
            }
            Dynamic::Map(m) => {
                write_vlq(&mut self.out, m.len() as u64);
                for (k, val) in m.iter() {
                    self.write_str(k);
                    self.write_dynamic(val);
                }
            }
        }
    }
}
