//! Hierarchical LwM2M resource paths.
//!
//! A path addresses a node of the data model with up to four integer
//! segments: object, instance, resource and resource instance. The number of
//! segments is the path's arity and is encoded in [`PathKind`].
//!
//! # Invariants
//!
//! - A path always starts with the root separator `/`. The root path itself
//!   is `"/"` and has no segments.
//! - Every segment is a non-negative decimal integer that fits in `u16`.
//! - `kind.arity() == segments.len()` for every constructed path.
//! - Rendering reproduces the literal segments that were parsed, so
//!   `"/03"` renders back to `["03"]` even though its object id is `3`.

use std::{fmt, hash::Hash, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Maximum number of segments in an LwM2M path.
pub const MAX_SEGMENTS: usize = 4;

/// Node kind addressed by a path, which fixes its arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// `/`
    Root,
    /// `/oid`
    Object,
    /// `/oid/iid`
    Instance,
    /// `/oid/iid/rid`
    Resource,
    /// `/oid/iid/rid/riid`
    ResourceInstance,
}

impl PathKind {
    /// Number of segments a path of this kind carries.
    pub const fn arity(self) -> usize {
        match self {
            Self::Root => 0,
            Self::Object => 1,
            Self::Instance => 2,
            Self::Resource => 3,
            Self::ResourceInstance => 4,
        }
    }

    /// Kind for a given segment count, if one exists.
    pub const fn from_arity(arity: usize) -> Option<Self> {
        match arity {
            0 => Some(Self::Root),
            1 => Some(Self::Object),
            2 => Some(Self::Instance),
            3 => Some(Self::Resource),
            4 => Some(Self::ResourceInstance),
            _ => None,
        }
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "root",
            Self::Object => "object",
            Self::Instance => "instance",
            Self::Resource => "resource",
            Self::ResourceInstance => "resource instance",
        };
        f.write_str(name)
    }
}

/// One parsed path segment.
///
/// Keeps the literal text next to the parsed id.
#[derive(Debug, Clone)]
pub struct Segment {
    id: u16,
    literal: Box<str>,
}

impl Segment {
    fn parse(literal: &str) -> Result<Self, ProtocolError> {
        if literal.is_empty() || !literal.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidSegment { segment: literal.to_string() });
        }

        let id = literal
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidSegment { segment: literal.to_string() })?;

        Ok(Self { id, literal: literal.into() })
    }

    /// Numeric identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Literal text as it appeared in the parsed path.
    pub fn literal(&self) -> &str {
        &self.literal
    }
}

/// Immutable LwM2M path.
///
/// Equality and hashing compare the numeric identifiers only; `/03` and `/3`
/// address the same object.
#[derive(Debug, Clone)]
pub struct Path {
    kind: PathKind,
    segments: Vec<Segment>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self { kind: PathKind::Root, segments: Vec::new() }
    }

    /// Parse a path of any arity from 0 to 4.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| ProtocolError::MissingRootSeparator { text: text.to_string() })?;

        if rest.is_empty() {
            return Ok(Self::root());
        }

        let raw: Vec<&str> = rest.split('/').collect();
        if raw.len() > MAX_SEGMENTS {
            return Err(ProtocolError::TooManySegments { count: raw.len() });
        }

        let segments = raw.into_iter().map(Segment::parse).collect::<Result<Vec<_>, _>>()?;
        let kind = PathKind::from_arity(segments.len())
            .ok_or(ProtocolError::TooManySegments { count: segments.len() })?;

        Ok(Self { kind, segments })
    }

    /// Parse a path that must have exactly the arity of `kind`.
    ///
    /// This is the one validating constructor behind the typed helpers.
    pub fn with_kind(text: &str, kind: PathKind) -> Result<Self, ProtocolError> {
        let path = Self::parse(text)?;
        if path.kind != kind {
            return Err(ProtocolError::ArityMismatch { expected: kind, actual: path.kind });
        }
        Ok(path)
    }

    /// Parse an object path (`/oid`).
    pub fn object(text: &str) -> Result<Self, ProtocolError> {
        Self::with_kind(text, PathKind::Object)
    }

    /// Parse an instance path (`/oid/iid`).
    pub fn instance(text: &str) -> Result<Self, ProtocolError> {
        Self::with_kind(text, PathKind::Instance)
    }

    /// Parse a resource path (`/oid/iid/rid`).
    pub fn resource(text: &str) -> Result<Self, ProtocolError> {
        Self::with_kind(text, PathKind::Resource)
    }

    /// Parse a resource instance path (`/oid/iid/rid/riid`).
    pub fn resource_instance(text: &str) -> Result<Self, ProtocolError> {
        Self::with_kind(text, PathKind::ResourceInstance)
    }

    /// Build a path from numeric identifiers using canonical decimal
    /// literals.
    pub fn from_ids(ids: &[u16]) -> Result<Self, ProtocolError> {
        let kind = PathKind::from_arity(ids.len())
            .ok_or(ProtocolError::TooManySegments { count: ids.len() })?;
        Ok(Self::from_known(kind, ids))
    }

    fn from_known(kind: PathKind, ids: &[u16]) -> Self {
        let segments =
            ids.iter().map(|id| Segment { id: *id, literal: id.to_string().into() }).collect();
        Self { kind, segments }
    }

    /// `/oid`
    pub fn for_object(oid: u16) -> Self {
        Self::from_known(PathKind::Object, &[oid])
    }

    /// `/oid/iid`
    pub fn for_instance(oid: u16, iid: u16) -> Self {
        Self::from_known(PathKind::Instance, &[oid, iid])
    }

    /// `/oid/iid/rid`
    pub fn for_resource(oid: u16, iid: u16, rid: u16) -> Self {
        Self::from_known(PathKind::Resource, &[oid, iid, rid])
    }

    /// Kind (and therefore arity) of this path.
    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// True for `/`.
    pub fn is_root(&self) -> bool {
        self.kind == PathKind::Root
    }

    /// Parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Literal segment strings, the exact inverse of [`Path::parse`].
    pub fn render(&self) -> Vec<&str> {
        self.segments.iter().map(Segment::literal).collect()
    }

    fn id_at(&self, index: usize) -> Option<u16> {
        self.segments.get(index).map(Segment::id)
    }

    /// Object id, if present.
    pub fn object_id(&self) -> Option<u16> {
        self.id_at(0)
    }

    /// Instance id, if present.
    pub fn instance_id(&self) -> Option<u16> {
        self.id_at(1)
    }

    /// Resource id, if present.
    pub fn resource_id(&self) -> Option<u16> {
        self.id_at(2)
    }

    /// Resource instance id, if present.
    pub fn resource_instance_id(&self) -> Option<u16> {
        self.id_at(3)
    }

    /// True if `self` addresses `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a.id == b.id)
    }

    fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.segments.iter().map(Segment::id)
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.ids().eq(other.ids())
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        for id in self.ids() {
            id.hash(state);
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment.literal)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
