use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};

use sbw_core::btree::{NO_BLOCK, ROOT_INFO_OFFSETS};
use sbw_core::fixture::ContainerBuilder;
use sbw_core::{BTree, ByteRegion, Error, RegionKey};

fn key(i: u16) -> Vec<u8> {
    RegionKey::new(1 + (i % 3) as u8, i, i.wrapping_mul(7) % 13).to_bytes().to_vec()
}

fn value(i: u16, len: usize) -> Vec<u8> {
    (0..len + i as usize % 5).map(|b| (b as u16 ^ i) as u8).collect()
}

fn dataset(n: u16, len: usize) -> BTreeMap<Vec<u8>, Vec<u8>> {
    (0..n).map(|i| (key(i), value(i, len))).collect()
}

fn tree_from(builder: ContainerBuilder, data: &BTreeMap<Vec<u8>, Vec<u8>>) -> BTree {
    let mut b = builder;
    for (k, v) in data {
        b.insert(k.clone(), v.clone());
    }
    BTree::open(ByteRegion::from_vec(b.build())).expect("open")
}

fn keys_of(tree: &BTree, lo: Bound<Vec<u8>>, hi: Bound<Vec<u8>>) -> Vec<Vec<u8>> {
    tree.scan_range((lo, hi))
        .map(|r| r.expect("scan").key)
        .collect()
}

#[test]
fn lookup_agrees_with_full_scan() {
    let data = dataset(200, 20);
    let tree = tree_from(ContainerBuilder::world(), &data);
    assert!(!tree.header().active_root().root_is_leaf);

    let scanned: Vec<_> = tree.entries().map(|r| r.unwrap()).collect();
    let keys: Vec<&Vec<u8>> = scanned.iter().map(|e| &e.key).collect();
    let expected: Vec<&Vec<u8>> = data.keys().collect();
    assert_eq!(keys, expected);
    for e in &scanned {
        assert_eq!(tree.lookup(&e.key).unwrap(), e.location);
    }

    for (k, v) in &data {
        assert_eq!(&tree.get(k).unwrap(), v);
        assert!(tree.contains(k).unwrap());
    }
}

#[test]
fn missing_and_malformed_keys() {
    let data = dataset(50, 8);
    let tree = tree_from(ContainerBuilder::world(), &data);
    let absent = RegionKey::new(9, 9, 9).to_bytes();
    assert!(matches!(tree.lookup(&absent), Err(Error::KeyNotFound(_))));
    assert!(!tree.contains(&absent).unwrap());
    let below_all = [0u8; 5];
    assert!(matches!(tree.get(&below_all), Err(Error::KeyNotFound(_))));
    assert!(matches!(tree.lookup(&[1, 2, 3]), Err(Error::InvalidFormat(_))));
}

#[test]
fn range_scans_match_filtered_scan() {
    let data = dataset(150, 4);
    let tree = tree_from(
        ContainerBuilder::world().leaf_fanout(4).index_fanout(3),
        &data,
    );
    let all: Vec<Vec<u8>> = data.keys().cloned().collect();
    let edges = [
        vec![0u8; 5],
        all[0].clone(),
        all[17].clone(),
        all[90].clone(),
        RegionKey::new(2, 60, 0).to_bytes().to_vec(),
        all[all.len() - 1].clone(),
        vec![0xFF; 5],
    ];
    let bounds = |k: &Vec<u8>| {
        [
            Bound::Included(k.clone()),
            Bound::Excluded(k.clone()),
            Bound::Unbounded,
        ]
    };
    for lo_key in &edges {
        for hi_key in &edges {
            for lo in bounds(lo_key) {
                for hi in bounds(hi_key) {
                    let expected: Vec<Vec<u8>> = all
                        .iter()
                        .filter(|k| (lo.as_ref(), hi.as_ref()).contains(*k))
                        .cloned()
                        .collect();
                    let got = keys_of(&tree, lo.clone(), hi.clone());
                    assert_eq!(got, expected, "range {lo:?}..{hi:?}");
                }
            }
        }
    }
}

#[test]
fn records_span_leaf_chains() {
    // 64 byte blocks hold 58 payload bytes, so every value crosses blocks
    let data = dataset(40, 150);
    let tree = tree_from(
        ContainerBuilder::world()
            .block_size(64)
            .leaf_fanout(3)
            .index_fanout(4),
        &data,
    );
    for (k, v) in &data {
        assert_eq!(&tree.get(k).unwrap(), v);
    }
    let n = tree.entries().map(|r| r.unwrap()).count();
    assert_eq!(n, data.len());
    let stats = tree.block_stats().unwrap();
    assert!(stats.index >= 5);
    assert!(stats.leaf > 40);
    assert_eq!(stats.total(), tree.block_count());
}

#[test]
fn alternate_root_slot() {
    let data = dataset(30, 10);
    let tree = tree_from(ContainerBuilder::world().alt_root(true), &data);
    assert!(tree.header().using_alt_root);
    assert_eq!(tree.header().roots[0].root_block, NO_BLOCK);
    for (k, v) in &data {
        assert_eq!(&tree.get(k).unwrap(), v);
    }
}

#[test]
fn free_blocks_are_counted_and_skipped() {
    let data = dataset(30, 10);
    let tree = tree_from(ContainerBuilder::world().free_blocks(3), &data);
    let stats = tree.block_stats().unwrap();
    assert_eq!(stats.free, 3);
    assert_eq!(stats.unknown, 0);
    assert_eq!(tree.header().active_root().free_head, 0);
    assert_eq!(tree.entries().count(), data.len());
}

#[test]
fn empty_container() {
    let tree = tree_from(ContainerBuilder::world(), &BTreeMap::new());
    assert!(tree.header().active_root().root_is_leaf);
    assert_eq!(tree.entries().count(), 0);
    assert!(matches!(
        tree.lookup(&[0; 5]),
        Err(Error::KeyNotFound(_))
    ));
}

#[test]
fn scan_can_be_abandoned_early() {
    let data = dataset(100, 4);
    let tree = tree_from(ContainerBuilder::world().leaf_fanout(2), &data);
    let first: Vec<_> = tree.entries().take(3).map(|r| r.unwrap().key).collect();
    assert_eq!(first.len(), 3);
    // the tree is untouched by a dropped scan
    let again: Vec<_> = tree.entries().take(3).map(|r| r.unwrap().key).collect();
    assert_eq!(first, again);
    let mut scan = tree.entries();
    while scan.next().is_some() {}
    assert!(scan.next().is_none());
}

#[test]
fn header_validation() {
    let image = ContainerBuilder::world().entry([1u8, 0, 0, 0, 0], b"v".to_vec()).build();

    let mut bad_magic = image.clone();
    bad_magic[..8].copy_from_slice(b"NotADb!!");
    assert!(matches!(
        BTree::open(ByteRegion::from_vec(bad_magic)),
        Err(Error::InvalidFormat(_))
    ));

    let legacy = ContainerBuilder::world().legacy_magic(true).build();
    assert!(matches!(
        BTree::open(ByteRegion::from_vec(legacy)),
        Err(Error::UnsupportedVersion(_))
    ));

    for size in [0u32, 32, 100, 0x8000_0000] {
        let mut bad = image.clone();
        bad[8..12].copy_from_slice(&size.to_be_bytes());
        assert!(
            matches!(BTree::open(ByteRegion::from_vec(bad)), Err(Error::InvalidFormat(_))),
            "block size {size}"
        );
    }

    let mut short = image.clone();
    short.truncate(100);
    assert!(matches!(
        BTree::open(ByteRegion::from_vec(short)),
        Err(Error::InvalidFormat(_))
    ));
    assert!(BTree::open(ByteRegion::from_vec(Vec::new())).is_err());
}

#[test]
fn dangling_root_is_reported() {
    let mut image = ContainerBuilder::world().entry([1u8, 0, 0, 0, 0], b"v".to_vec()).build();
    let at = ROOT_INFO_OFFSETS[0] + 12;
    image[at..at + 4].copy_from_slice(&9999u32.to_be_bytes());
    let tree = BTree::open(ByteRegion::from_vec(image)).unwrap();
    assert!(matches!(
        tree.lookup(&[1, 0, 0, 0, 0]),
        Err(Error::InvalidFormat(_))
    ));
    let mut scan = tree.entries();
    assert!(matches!(scan.next(), Some(Err(_))));
    assert!(scan.next().is_none());
}

#[test]
fn byte_region_bounds() {
    let r = ByteRegion::from_vec((0u8..10).collect());
    assert_eq!(r.read(2, 3).unwrap(), &[2, 3, 4]);
    assert_eq!(r.read(10, 0).unwrap(), &[] as &[u8]);
    assert!(matches!(
        r.read(8, 4),
        Err(Error::OutOfRange {
            offset: 8,
            length: 4,
            size: 10
        })
    ));
    assert!(matches!(r.read(u64::MAX, 2), Err(Error::OutOfRange { .. })));
}

#[test]
fn byte_region_maps_files() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("data.bin");
    std::fs::write(&p, b"hello world").unwrap();
    let r = ByteRegion::map_file(&p).unwrap();
    assert!(r.is_mapped());
    assert_eq!(r.size(), 11);
    assert_eq!(r.read(6, 5).unwrap(), b"world");

    let empty = dir.path().join("empty.bin");
    std::fs::write(&empty, b"").unwrap();
    let r = ByteRegion::map_file(&empty).unwrap();
    assert_eq!(r.size(), 0);

    assert!(matches!(
        ByteRegion::map_file(&dir.path().join("missing")),
        Err(Error::Io(_))
    ));
}
