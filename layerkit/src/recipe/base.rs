//! Base environment references (`python:3.11-slim`, `python@sha256:...`).

use crate::layers::Digest;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a base reference is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasePin {
    Tag(String),
    Digest(Digest),
    /// No tag given at all.
    Untagged,
}

/// Reference to a base environment: a runtime plus an OS variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseRef {
    pub name: String,
    pub pin: BasePin,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | ':')
                })
        })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl BaseRef {
    pub fn parse(s: &str) -> LayerkitResult<Self> {
        let s = s.trim();
        let (name, pin) = if let Some((name, digest)) = s.split_once('@') {
            let digest: Digest = digest.parse().map_err(|_| {
                LayerkitError::Resolution(format!("invalid digest in base reference '{}'", s))
            })?;
            (name, BasePin::Digest(digest))
        } else {
            // The tag separator is the last ':' after the last '/', so a
            // registry port (`host:5000/python`) is not mistaken for a tag.
            let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
            match s[last_slash..].rfind(':') {
                Some(i) => {
                    let split = last_slash + i;
                    let tag = &s[split + 1..];
                    if !valid_tag(tag) {
                        return Err(LayerkitError::Resolution(format!(
                            "invalid tag in base reference '{}'",
                            s
                        )));
                    }
                    (&s[..split], BasePin::Tag(tag.to_string()))
                }
                None => (s, BasePin::Untagged),
            }
        };

        if !valid_name(name) {
            return Err(LayerkitError::Resolution(format!(
                "invalid base environment name '{}'",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            pin,
        })
    }

    /// Runtime version part of the tag (`3.11` in `3.11-slim`).
    pub fn version(&self) -> Option<&str> {
        match &self.pin {
            BasePin::Tag(tag) => tag.split('-').next(),
            _ => None,
        }
    }

    /// OS variant part of the tag (`slim` in `3.11-slim`).
    pub fn variant(&self) -> Option<&str> {
        match &self.pin {
            BasePin::Tag(tag) => tag.split_once('-').map(|(_, variant)| variant),
            _ => None,
        }
    }

    /// Whether the reference names one fixed environment.
    ///
    /// Digests are always pinned. Tags are pinned when their version part
    /// has at least `major.minor` numeric components; floating tags such as
    /// `latest`, `3` or `slim` are not.
    pub fn is_pinned(&self) -> bool {
        match &self.pin {
            BasePin::Digest(_) => true,
            BasePin::Untagged => false,
            BasePin::Tag(_) => self.version().is_some_and(|version| {
                let parts: Vec<&str> = version.split('.').collect();
                parts.len() >= 2
                    && parts
                        .iter()
                        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            }),
        }
    }

    pub fn ensure_pinned(&self) -> LayerkitResult<()> {
        if self.is_pinned() {
            Ok(())
        } else {
            Err(LayerkitError::Resolution(format!(
                "base environment '{}' is not pinned; use an explicit major.minor version tag or a digest",
                self
            )))
        }
    }
}

impl FromStr for BaseRef {
    type Err = LayerkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pin {
            BasePin::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            BasePin::Digest(digest) => write!(f, "{}@{}", self.name, digest),
            BasePin::Untagged => f.write_str(&self.name),
        }
    }
}
