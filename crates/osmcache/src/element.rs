use std::collections::HashMap;

/// Tag set of an element. Order is irrelevant.
pub type Tags = HashMap<String, String>;

/// A bare coordinate: identity plus WGS-84 longitude/latitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
}

/// A tagged point feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
}

impl Node {
    pub fn coord(&self) -> Coord {
        Coord {
            id: self.id,
            lon: self.lon,
            lat: self.lat,
        }
    }
}

/// A line or polygon skeleton.
///
/// `refs` is the ordered list of vertex identities. `nodes` is only populated
/// by [`crate::CoordsCache::fill_way`] and holds one resolved coordinate per
/// ref, in ref order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Tags,
    pub nodes: Vec<Coord>,
}

impl Way {
    pub fn new(id: i64, refs: Vec<i64>, tags: Tags) -> Self {
        Self {
            id,
            refs,
            tags,
            nodes: Vec::new(),
        }
    }

    /// True once every ref has a resolved coordinate.
    pub fn is_filled(&self) -> bool {
        !self.refs.is_empty() && self.nodes.len() == self.refs.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberKind {
    Node = 0,
    Way = 1,
    Relation = 2,
}

impl MemberKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MemberKind::Node),
            1 => Some(MemberKind::Way),
            2 => Some(MemberKind::Relation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub kind: MemberKind,
    pub id: i64,
    pub role: String,
}

/// A tagged group of typed member references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
}

/// Builds a [`Tags`] map from string pairs. Mostly useful in tests and decoders.
pub fn tags_from<'a, I>(pairs: I) -> Tags
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}
