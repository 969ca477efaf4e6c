//! Semantic revision tags (`v<major>.<minor>`).
//!
//! Every revision of a blueprint is a git tag in its repository. Tags are
//! ordered by their `(major, minor)` ordinal, never by string comparison:
//! `v10.0` sorts after `v9.3`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+)(?:\.(\d+))?$").expect("static tag pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("invalid version tag {0:?}: expected v<major>[.<minor>]")]
    Invalid(String),
    #[error("no version after {0}: the {1} number is exhausted")]
    Exhausted(Tag, &'static str),
}

/// A decoded revision tag.
///
/// Field order matters: the derived `Ord` compares `major` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub major: u32,
    pub minor: u32,
}

impl Tag {
    /// The tag given to the first revision of any blueprint.
    pub const FIRST: Tag = Tag { major: 1, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode `"v1.1"` into `(1, 1)`. A missing minor defaults to 0.
    pub fn decode(s: &str) -> Result<Self, TagError> {
        let caps = TAG_PATTERN
            .captures(s)
            .ok_or_else(|| TagError::Invalid(s.to_string()))?;
        let major = caps[1]
            .parse()
            .map_err(|_| TagError::Invalid(s.to_string()))?;
        let minor = match caps.get(2) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| TagError::Invalid(s.to_string()))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }

    /// Canonical string form, always with an explicit minor.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl From<(u32, u32)> for Tag {
    fn from((major, minor): (u32, u32)) -> Self {
        Self { major, minor }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Tag::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Decode and sort a list of tag names ascending by ordinal.
///
/// Names that are not version tags are ignored; repositories may carry
/// unrelated tags pushed by hand.
pub fn parse_tags<I, S>(names: I) -> Vec<Tag>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tags: Vec<Tag> = names
        .into_iter()
        .filter_map(|n| Tag::decode(n.as_ref()).ok())
        .collect();
    tags.sort_unstable();
    tags.dedup();
    tags
}

/// `(max_major + 1, 0)`, or `v1.0` for an empty repository.
pub fn next_major(tags: &[Tag]) -> Result<Tag, TagError> {
    let Some(last) = tags.iter().max_by_key(|t| t.major) else {
        return Ok(Tag::FIRST);
    };
    let major = last
        .major
        .checked_add(1)
        .ok_or(TagError::Exhausted(*last, "major"))?;
    Ok(Tag::new(major, 0))
}

/// Next revision on the minor line of `reference`.
///
/// An empty repository always starts at `v1.0`. A reference that is not a
/// known tag is reused verbatim, which opens a new minor line.
pub fn next_minor(tags: &[Tag], reference: Tag) -> Result<Tag, TagError> {
    if tags.is_empty() {
        return Ok(Tag::FIRST);
    }
    if !tags.contains(&reference) {
        return Ok(reference);
    }
    let last = tags
        .iter()
        .filter(|t| t.major == reference.major)
        .max()
        .copied()
        .unwrap_or(reference);
    let minor = last
        .minor
        .checked_add(1)
        .ok_or(TagError::Exhausted(last, "minor"))?;
    Ok(Tag::new(reference.major, minor))
}
