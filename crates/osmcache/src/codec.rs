//! Binary value encoding for cached elements.
//!
//! All values are little-endian. Coordinates are stored as Q7 fixed point
//! (1e-7 degree ticks in an `i32`), which is the precision OSM itself uses.
//!
//!   Coord    : i32 lon_q7, i32 lat_q7
//!   Node     : i32 lon_q7, i32 lat_q7, TAGS
//!   Way      : uvarint n, n x svarint delta(ref), TAGS
//!   Relation : uvarint n, n x (u8 kind, svarint delta(id), STR role), TAGS
//!   TAGS     : uvarint n, n x (STR key, STR value)
//!   STR      : uvarint len, len bytes of UTF-8
//!
//! Keys are `u64` big-endian of `id ^ 1 << 63`, so that LMDB's lexicographic key
//! order equals signed identity order.

use std::io::{self, ErrorKind};

use crate::element::{Coord, Member, MemberKind, Node, Relation, Tags, Way};

const SIGN_BIT: u64 = 1 << 63;

/// Maps a signed identity onto an order-preserving unsigned key.
#[inline]
pub fn id_to_key(id: i64) -> u64 {
    (id as u64) ^ SIGN_BIT
}

#[inline]
pub fn key_to_id(key: u64) -> i64 {
    (key ^ SIGN_BIT) as i64
}

#[inline]
pub fn to_q7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

#[inline]
pub fn from_q7(q7: i32) -> f64 {
    q7 as f64 * 1e-7
}

/// An element kind that can live in an [`crate::ElementStore`].
pub trait Record: Sized + Send + 'static {
    /// Name of the kind; also the LMDB database and directory name.
    const KIND: &'static str;

    fn id(&self) -> i64;

    /// Appends the value encoding (without the id) to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(id: i64, bytes: &[u8]) -> io::Result<Self>;
}

impl Record for Coord {
    const KIND: &'static str = "coords";

    fn id(&self) -> i64 {
        self.id
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, to_q7(self.lon));
        put_i32(buf, to_q7(self.lat));
    }

    fn decode(id: i64, mut p: &[u8]) -> io::Result<Self> {
        let lon = from_q7(le_i32(&mut p)?);
        let lat = from_q7(le_i32(&mut p)?);
        finish(p)?;
        Ok(Coord { id, lon, lat })
    }
}

impl Record for Node {
    const KIND: &'static str = "nodes";

    fn id(&self) -> i64 {
        self.id
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_i32(buf, to_q7(self.lon));
        put_i32(buf, to_q7(self.lat));
        put_tags(buf, &self.tags);
    }

    fn decode(id: i64, mut p: &[u8]) -> io::Result<Self> {
        let lon = from_q7(le_i32(&mut p)?);
        let lat = from_q7(le_i32(&mut p)?);
        let tags = read_tags(&mut p)?;
        finish(p)?;
        Ok(Node { id, lon, lat, tags })
    }
}

impl Record for Way {
    const KIND: &'static str = "ways";

    fn id(&self) -> i64 {
        self.id
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.refs.len() as u64);
        let mut last = 0i64;
        for &r in &self.refs {
            put_svarint(buf, r.wrapping_sub(last));
            last = r;
        }
        put_tags(buf, &self.tags);
    }

    fn decode(id: i64, mut p: &[u8]) -> io::Result<Self> {
        let count = read_len(&mut p)?;
        let mut refs = Vec::with_capacity(count);
        let mut last = 0i64;
        for _ in 0..count {
            last = last.wrapping_add(read_svarint(&mut p)?);
            refs.push(last);
        }
        let tags = read_tags(&mut p)?;
        finish(p)?;
        Ok(Way::new(id, refs, tags))
    }
}

impl Record for Relation {
    const KIND: &'static str = "relations";

    fn id(&self) -> i64 {
        self.id
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.members.len() as u64);
        let mut last = 0i64;
        for member in &self.members {
            buf.push(member.kind as u8);
            put_svarint(buf, member.id.wrapping_sub(last));
            last = member.id;
            put_str(buf, &member.role);
        }
        put_tags(buf, &self.tags);
    }

    fn decode(id: i64, mut p: &[u8]) -> io::Result<Self> {
        let count = read_len(&mut p)?;
        let mut members = Vec::with_capacity(count);
        let mut last = 0i64;
        for _ in 0..count {
            let kind = le_u8(&mut p)?;
            let kind = MemberKind::from_u8(kind)
                .ok_or_else(|| bad(&format!("unknown member kind {}", kind)))?;
            last = last.wrapping_add(read_svarint(&mut p)?);
            let role = read_str(&mut p)?;
            members.push(Member { kind, id: last, role });
        }
        let tags = read_tags(&mut p)?;
        finish(p)?;
        Ok(Relation { id, members, tags })
    }
}

// ---------- readers ----------

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated cache value"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8]) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_i32(buf: &mut &[u8]) -> io::Result<i32> {
    let b = take(buf, 4)?;
    Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_uvarint(buf: &mut &[u8]) -> io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = le_u8(buf)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(bad("varint overflow"))
}

fn read_svarint(buf: &mut &[u8]) -> io::Result<i64> {
    let v = read_uvarint(buf)?;
    Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
}

/// Reads a length and checks it against the remaining input, so a corrupt
/// count cannot trigger a huge allocation.
fn read_len(buf: &mut &[u8]) -> io::Result<usize> {
    let n = read_uvarint(buf)?;
    if n > buf.len() as u64 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "length exceeds cache value"));
    }
    Ok(n as usize)
}

fn read_str(buf: &mut &[u8]) -> io::Result<String> {
    let len = read_len(buf)?;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| bad("string is not UTF-8"))
}

fn read_tags(buf: &mut &[u8]) -> io::Result<Tags> {
    let count = read_len(buf)?;
    let mut tags = Tags::with_capacity(count);
    for _ in 0..count {
        let key = read_str(buf)?;
        let value = read_str(buf)?;
        tags.insert(key, value);
    }
    Ok(tags)
}

#[inline]
fn finish(rest: &[u8]) -> io::Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(bad("trailing bytes after cache value"))
    }
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

// ---------- writers ----------

#[inline]
fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

#[inline]
fn put_svarint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn put_tags(buf: &mut Vec<u8>, tags: &Tags) {
    put_uvarint(buf, tags.len() as u64);
    for (k, v) in tags {
        put_str(buf, k);
        put_str(buf, v);
    }
}
