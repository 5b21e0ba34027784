//! Tag tables deciding which tags of each element kind are worth caching.

use std::collections::HashSet;

use osmcache::Tags;

/// Keys that make a point a feature of its own.
const POINT_FEATURES: &[&str] = &[
    "aeroway",
    "amenity",
    "barrier",
    "craft",
    "emergency",
    "highway",
    "historic",
    "leisure",
    "man_made",
    "natural",
    "office",
    "place",
    "power",
    "public_transport",
    "railway",
    "shop",
    "sport",
    "tourism",
];

const WAY_FEATURES: &[&str] = &[
    "aeroway",
    "amenity",
    "barrier",
    "boundary",
    "building",
    "highway",
    "landuse",
    "leisure",
    "man_made",
    "natural",
    "power",
    "railway",
    "route",
    "waterway",
];

const RELATION_FEATURES: &[&str] = &[
    "boundary",
    "building",
    "landuse",
    "leisure",
    "natural",
    "route",
    "type",
    "waterway",
];

/// Descriptive keys kept alongside a feature key but never enough on their own.
const ATTRIBUTES: &[&str] = &[
    "access",
    "admin_level",
    "area",
    "bridge",
    "layer",
    "lanes",
    "maxspeed",
    "name",
    "oneway",
    "ref",
    "surface",
    "tunnel",
    "width",
];

/// A per-kind whitelist of tag keys.
#[derive(Debug, Clone)]
pub struct TagFilter {
    features: HashSet<String>,
    attributes: HashSet<String>,
}

impl TagFilter {
    pub fn new<'a>(
        features: impl IntoIterator<Item = &'a str>,
        attributes: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            features: features.into_iter().map(str::to_owned).collect(),
            attributes: attributes.into_iter().map(str::to_owned).collect(),
        }
    }

    /// Drops every key not in the table. Returns whether a feature key survived,
    /// i.e. whether the element classifies.
    pub fn filter(&self, tags: &mut Tags) -> bool {
        tags.retain(|k, _| self.features.contains(k) || self.attributes.contains(k));
        tags.keys().any(|k| self.features.contains(k))
    }
}

/// The tag filters of all element kinds.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub points: TagFilter,
    pub ways: TagFilter,
    pub relations: TagFilter,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            points: TagFilter::new(POINT_FEATURES.iter().copied(), ATTRIBUTES.iter().copied()),
            ways: TagFilter::new(WAY_FEATURES.iter().copied(), ATTRIBUTES.iter().copied()),
            relations: TagFilter::new(
                RELATION_FEATURES.iter().copied(),
                ATTRIBUTES.iter().copied(),
            ),
        }
    }
}
