//! PBF framing and block decoding.
//!
//! A PBF file is a sequence of frames:
//!
//!   u32 (big-endian)  header_len
//!   [header_len]      BlobHeader protobuf  { 1: type string, 2: indexdata, 3: datasize }
//!   [datasize]        Blob protobuf
//!
//! [`BlockSource`] walks the frames without decoding any blob, producing
//! [`WorkItem`]s that the parse stage decodes in parallel.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use memmap2::Mmap;
use osmcache::{Coord, Member, MemberKind, Node, Relation, Tags, Way};
use osmpbf::{BlobDecode, BlobReader, Element, RelMemberType};

/// Upper bound of a BlobHeader, per the PBF format.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;
/// Upper bound of a Blob, per the PBF format.
pub const MAX_BLOB_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobKind {
    Header,
    Data,
    Unknown(String),
}

impl BlobKind {
    fn from_type(ty: &str) -> Self {
        match ty {
            "OSMHeader" => BlobKind::Header,
            "OSMData" => BlobKind::Data,
            other => BlobKind::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Header => f.write_str("OSMHeader"),
            BlobKind::Data => f.write_str("OSMData"),
            BlobKind::Unknown(ty) => f.write_str(ty),
        }
    }
}

/// The extent of one frame within the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Offset of the frame's length prefix.
    pub offset: u64,
    pub header_len: u32,
    pub data_len: u32,
    pub kind: BlobKind,
}

impl WorkItem {
    /// Bytes covered by the frame, length prefix included.
    #[inline]
    pub fn frame_len(&self) -> u64 {
        4 + u64::from(self.header_len) + u64::from(self.data_len)
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.frame_len()
    }
}

/// Elements decoded from one work item, grouped by kind.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Block {
    pub coords: Vec<Coord>,
    pub nodes: Vec<Node>,
    pub ways: Vec<Way>,
    pub relations: Vec<Relation>,
}

impl Block {
    /// Adds a node: always as a coordinate, and as a node too when it is tagged.
    pub fn push_node(&mut self, node: Node) {
        self.coords.push(node.coord());
        if !node.tags.is_empty() {
            self.nodes.push(node);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
            && self.nodes.is_empty()
            && self.ways.is_empty()
            && self.relations.is_empty()
    }
}

/// Anything the parse stage can read blocks from.
pub trait ElementSource: Sync {
    /// A fresh scan over all work items.
    fn work_items(&self) -> Box<dyn Iterator<Item = Result<WorkItem>> + Send + '_>;

    fn decode(&self, item: &WorkItem) -> Result<Block>;
}

/// Lazily scans frame boundaries in a byte buffer.
///
/// Yields at most one error, after which the scan ends.
pub struct BlockSource<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BlockSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl Iterator for BlockSource<'_> {
    type Item = Result<WorkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        match scan_frame(self.data, self.pos) {
            Ok(item) => {
                self.pos = item.end() as usize;
                Some(Ok(item))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn scan_frame(data: &[u8], offset: usize) -> Result<WorkItem> {
    let rest = &data[offset..];
    ensure!(rest.len() >= 4, "truncated frame length at offset {offset}");
    let header_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    ensure!(
        header_len <= MAX_HEADER_LEN,
        "blob header of {header_len} bytes at offset {offset} exceeds {MAX_HEADER_LEN}"
    );
    let header = rest
        .get(4..4 + header_len as usize)
        .with_context(|| format!("truncated blob header at offset {offset}"))?;
    let (kind, data_len) =
        parse_blob_header(header).with_context(|| format!("bad blob header at offset {offset}"))?;
    ensure!(
        data_len <= MAX_BLOB_LEN,
        "blob of {data_len} bytes at offset {offset} exceeds {MAX_BLOB_LEN}"
    );
    let end = 4 + header_len as usize + data_len as usize;
    ensure!(rest.len() >= end, "truncated blob at offset {offset}");
    Ok(WorkItem {
        offset: offset as u64,
        header_len,
        data_len,
        kind,
    })
}

/// Reads `type` and `datasize` from a BlobHeader, skipping other fields.
fn parse_blob_header(mut p: &[u8]) -> Result<(BlobKind, u32)> {
    let mut kind = None;
    let mut data_len = None;
    while !p.is_empty() {
        let key = read_varint(&mut p)?;
        let (field, wire) = (key >> 3, key & 7);
        match (field, wire) {
            (1, 2) => {
                let raw = read_bytes(&mut p)?;
                let ty = std::str::from_utf8(raw).context("blob type is not UTF-8")?;
                kind = Some(BlobKind::from_type(ty));
            }
            (3, 0) => {
                let size = read_varint(&mut p)?;
                data_len = Some(u32::try_from(size).context("datasize out of range")?);
            }
            (_, 0) => {
                read_varint(&mut p)?;
            }
            (_, 1) => skip(&mut p, 8)?,
            (_, 2) => {
                read_bytes(&mut p)?;
            }
            (_, 5) => skip(&mut p, 4)?,
            (_, w) => bail!("unsupported wire type {w}"),
        }
    }
    let kind = kind.context("missing blob type")?;
    let data_len = data_len.context("missing datasize")?;
    Ok((kind, data_len))
}

fn read_varint(p: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = p.split_first().context("truncated varint")?;
        *p = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("varint overflow")
}

fn skip(p: &mut &[u8], n: usize) -> Result<()> {
    ensure!(p.len() >= n, "truncated field");
    *p = &p[n..];
    Ok(())
}

fn read_bytes<'a>(p: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint(p)? as usize;
    ensure!(p.len() >= len, "truncated field");
    let (head, tail) = p.split_at(len);
    *p = tail;
    Ok(head)
}

/// A memory-mapped PBF file.
pub struct PbfSource {
    path: PathBuf,
    mmap: Mmap,
}

impl PbfSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        // SAFETY: the file is opened read-only and not modified while mapped.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping {}", path.display()))?;
        Ok(Self { path, mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame(&self, item: &WorkItem) -> Result<&[u8]> {
        self.mmap
            .get(item.offset as usize..item.end() as usize)
            .with_context(|| format!("work item at offset {} is out of bounds", item.offset))
    }
}

impl ElementSource for PbfSource {
    fn work_items(&self) -> Box<dyn Iterator<Item = Result<WorkItem>> + Send + '_> {
        Box::new(BlockSource::new(&self.mmap))
    }

    fn decode(&self, item: &WorkItem) -> Result<Block> {
        if item.kind != BlobKind::Data {
            return Ok(Block::default());
        }
        let frame = self.frame(item)?;
        let blob = BlobReader::new(frame)
            .next()
            .with_context(|| format!("no blob at offset {}", item.offset))?
            .with_context(|| format!("reading blob at offset {}", item.offset))?;
        let decoded = blob
            .decode()
            .with_context(|| format!("decoding blob at offset {}", item.offset))?;

        let mut block = Block::default();
        let BlobDecode::OsmData(data) = decoded else {
            return Ok(block);
        };
        for element in data.elements() {
            match element {
                Element::Node(n) => block.push_node(Node {
                    id: n.id(),
                    lon: n.lon(),
                    lat: n.lat(),
                    tags: collect_tags(n.tags()),
                }),
                Element::DenseNode(n) => block.push_node(Node {
                    id: n.id(),
                    lon: n.lon(),
                    lat: n.lat(),
                    tags: collect_tags(n.tags()),
                }),
                Element::Way(w) => block
                    .ways
                    .push(Way::new(w.id(), w.refs().collect(), collect_tags(w.tags()))),
                Element::Relation(r) => {
                    let members = r
                        .members()
                        .map(|m| {
                            let role = m.role()?.to_owned();
                            Ok(Member {
                                kind: member_kind(m.member_type),
                                id: m.member_id,
                                role,
                            })
                        })
                        .collect::<Result<Vec<_>, osmpbf::Error>>()
                        .with_context(|| format!("relation {} has a bad member role", r.id()))?;
                    block.relations.push(Relation {
                        id: r.id(),
                        members,
                        tags: collect_tags(r.tags()),
                    });
                }
            }
        }
        Ok(block)
    }
}

fn collect_tags<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> Tags {
    tags.map(|(k, v)| (k.to_owned(), v.to_owned())).collect()
}

fn member_kind(ty: RelMemberType) -> MemberKind {
    match ty {
        RelMemberType::Node => MemberKind::Node,
        RelMemberType::Way => MemberKind::Way,
        RelMemberType::Relation => MemberKind::Relation,
    }
}

/// Pre-decoded blocks held in memory; one work item per block.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    blocks: Vec<Block>,
}

impl MemorySource {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }
}

impl ElementSource for MemorySource {
    fn work_items(&self) -> Box<dyn Iterator<Item = Result<WorkItem>> + Send + '_> {
        Box::new((0..self.blocks.len()).map(|i| {
            Ok(WorkItem {
                offset: i as u64,
                header_len: 0,
                data_len: 0,
                kind: BlobKind::Data,
            })
        }))
    }

    fn decode(&self, item: &WorkItem) -> Result<Block> {
        self.blocks
            .get(item.offset as usize)
            .cloned()
            .with_context(|| format!("no block {}", item.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
        while v >= 0x80 {
            buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        buf.push(v as u8);
    }

    /// A frame with a BlobHeader that also carries indexdata, and a dummy blob.
    fn frame(ty: &str, data_len: usize) -> Vec<u8> {
        frame_with(ty, &vec![0xAB; data_len])
    }

    fn frame_with(ty: &str, data: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.push(1 << 3 | 2);
        put_varint(&mut header, ty.len() as u64);
        header.extend_from_slice(ty.as_bytes());
        header.push(2 << 3 | 2);
        put_varint(&mut header, 3);
        header.extend_from_slice(b"idx");
        header.push(3 << 3);
        put_varint(&mut header, data.len() as u64);

        let mut out = (header.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        out
    }

    fn zigzag(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    fn put_field(buf: &mut Vec<u8>, field: u64, bytes: &[u8]) {
        put_varint(buf, field << 3 | 2);
        put_varint(buf, bytes.len() as u64);
        buf.extend_from_slice(bytes);
    }

    fn put_uint(buf: &mut Vec<u8>, field: u64, v: u64) {
        put_varint(buf, field << 3);
        put_varint(buf, v);
    }

    fn packed(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &v in values {
            put_varint(&mut buf, v);
        }
        buf
    }

    /// An uncompressed OSMData blob holding one plain node, two dense nodes,
    /// one way and one relation.
    fn data_blob() -> Vec<u8> {
        let strings = ["", "highway", "path", "amenity", "bench", "outer", "type", "route"];
        let mut table = Vec::new();
        for s in strings {
            put_field(&mut table, 1, s.as_bytes());
        }

        // node 7 at 13.0/52.0, amenity=bench
        let mut node = Vec::new();
        put_uint(&mut node, 1, zigzag(7));
        put_field(&mut node, 2, &packed(&[3]));
        put_field(&mut node, 3, &packed(&[4]));
        put_uint(&mut node, 8, zigzag(520_000_000));
        put_uint(&mut node, 9, zigzag(130_000_000));
        let mut nodes = Vec::new();
        put_field(&mut nodes, 1, &node);

        // nodes 5 (untagged) and 6 (amenity=bench), delta coded
        let mut dense = Vec::new();
        put_field(&mut dense, 1, &packed(&[5, 1].map(zigzag)));
        put_field(&mut dense, 8, &packed(&[10_000_000, 10_000_000].map(zigzag)));
        put_field(&mut dense, 9, &packed(&[30_000_000, 10_000_000].map(zigzag)));
        put_field(&mut dense, 10, &packed(&[0, 3, 4, 0]));
        let mut dense_group = Vec::new();
        put_field(&mut dense_group, 2, &dense);

        // way 9, highway=path, refs [7, 5]
        let mut way = Vec::new();
        put_uint(&mut way, 1, 9);
        put_field(&mut way, 2, &packed(&[1]));
        put_field(&mut way, 3, &packed(&[2]));
        put_field(&mut way, 8, &packed(&[7, -2].map(zigzag)));
        let mut ways = Vec::new();
        put_field(&mut ways, 3, &way);

        // relation 11, type=route, members way 9 as "outer" and node 7 without role
        let mut rel = Vec::new();
        put_uint(&mut rel, 1, 11);
        put_field(&mut rel, 2, &packed(&[6]));
        put_field(&mut rel, 3, &packed(&[7]));
        put_field(&mut rel, 8, &packed(&[5, 0]));
        put_field(&mut rel, 9, &packed(&[9, -2].map(zigzag)));
        put_field(&mut rel, 10, &packed(&[1, 0]));
        let mut relations = Vec::new();
        put_field(&mut relations, 4, &rel);

        let mut block = Vec::new();
        put_field(&mut block, 1, &table);
        for group in [nodes, dense_group, ways, relations] {
            put_field(&mut block, 2, &group);
        }

        let mut blob = Vec::new();
        put_field(&mut blob, 1, &block);
        put_uint(&mut blob, 2, block.len() as u64);
        blob
    }

    #[test]
    fn test_pbf_source_decodes_every_element_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.osm.pbf");
        let mut file = frame("OSMHeader", 8);
        file.extend(frame_with("OSMData", &data_blob()));
        std::fs::write(&path, &file).unwrap();

        let source = PbfSource::open(&path).unwrap();
        let items: Vec<WorkItem> = source.work_items().map(|i| i.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert!(source.decode(&items[0]).unwrap().is_empty());

        let block = source.decode(&items[1]).unwrap();
        let mut coords: Vec<(i64, f64, f64)> =
            block.coords.iter().map(|c| (c.id, c.lon, c.lat)).collect();
        coords.sort_by_key(|c| c.0);
        let expected = [(5, 3.0, 1.0), (6, 4.0, 2.0), (7, 13.0, 52.0)];
        assert_eq!(coords.len(), expected.len());
        for (got, want) in coords.iter().zip(&expected) {
            assert_eq!(got.0, want.0);
            assert!((got.1 - want.1).abs() < 1e-7 && (got.2 - want.2).abs() < 1e-7, "{got:?}");
        }

        let mut tagged: Vec<i64> = block.nodes.iter().map(|n| n.id).collect();
        tagged.sort_unstable();
        assert_eq!(tagged, vec![6, 7]);
        assert!(block
            .nodes
            .iter()
            .all(|n| n.tags.get("amenity").map(String::as_str) == Some("bench")));

        assert_eq!(block.ways.len(), 1);
        assert_eq!(block.ways[0].id, 9);
        assert_eq!(block.ways[0].refs, vec![7, 5]);
        assert_eq!(block.ways[0].tags, osmcache::tags_from([("highway", "path")]));

        assert_eq!(block.relations.len(), 1);
        let rel = &block.relations[0];
        assert_eq!(rel.id, 11);
        assert_eq!(rel.tags, osmcache::tags_from([("type", "route")]));
        assert_eq!(
            rel.members,
            vec![
                Member {
                    kind: MemberKind::Way,
                    id: 9,
                    role: "outer".into(),
                },
                Member {
                    kind: MemberKind::Node,
                    id: 7,
                    role: String::new(),
                },
            ]
        );
    }

    #[test]
    fn test_items_partition_the_file() {
        let sizes = [0usize, 17, 300, 1, 70_000];
        let mut file = frame("OSMHeader", 12);
        for &n in &sizes {
            file.extend(frame("OSMData", n));
        }

        let items: Vec<WorkItem> = BlockSource::new(&file).map(|i| i.unwrap()).collect();
        assert_eq!(items.len(), sizes.len() + 1);
        assert_eq!(items[0].kind, BlobKind::Header);
        assert!(items[1..].iter().all(|i| i.kind == BlobKind::Data));

        let mut expected_offset = 0;
        for (item, &n) in items[1..].iter().zip(&sizes) {
            assert_eq!(item.data_len as usize, n);
        }
        for item in &items {
            assert_eq!(item.offset, expected_offset);
            expected_offset = item.end();
        }
        assert_eq!(expected_offset, file.len() as u64);
    }

    #[test]
    fn test_empty_file_has_no_items() {
        assert_eq!(BlockSource::new(&[]).count(), 0);
    }

    #[test]
    fn test_truncated_blob_errors_once() {
        let mut file = frame("OSMData", 10);
        let mut broken = frame("OSMData", 50);
        broken.truncate(broken.len() - 1);
        file.extend(broken);

        let items: Vec<Result<WorkItem>> = BlockSource::new(&file).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert!(format!("{err:#}").contains("truncated blob"));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let file = (MAX_HEADER_LEN + 1).to_be_bytes().to_vec();
        let items: Vec<Result<WorkItem>> = BlockSource::new(&file).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_missing_datasize_is_rejected() {
        let mut header = vec![1 << 3 | 2, 7];
        header.extend_from_slice(b"OSMData");
        let mut file = (header.len() as u32).to_be_bytes().to_vec();
        file.extend_from_slice(&header);

        let err = BlockSource::new(&file).next().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("missing datasize"));
    }

    #[test]
    fn test_unknown_blob_kind_is_kept() {
        let file = frame("Sidecar", 4);
        let item = BlockSource::new(&file).next().unwrap().unwrap();
        assert_eq!(item.kind, BlobKind::Unknown("Sidecar".into()));
    }

    #[test]
    fn test_tagged_nodes_also_become_coords() {
        let mut block = Block::default();
        block.push_node(Node {
            id: 1,
            lon: 1.0,
            lat: 2.0,
            tags: Tags::new(),
        });
        block.push_node(Node {
            id: 2,
            lon: 3.0,
            lat: 4.0,
            tags: osmcache::tags_from([("shop", "bakery")]),
        });
        assert_eq!(block.coords.len(), 2);
        assert_eq!(block.nodes.len(), 1);
        assert_eq!(block.nodes[0].id, 2);
    }

    #[test]
    fn test_memory_source_serves_its_blocks() {
        let mut block = Block::default();
        block.ways.push(Way::new(9, vec![1, 2], Tags::new()));
        let source = MemorySource::new(vec![Block::default(), block.clone()]);

        let items: Vec<WorkItem> = source.work_items().map(|i| i.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(source.decode(&items[1]).unwrap(), block);
    }
}
