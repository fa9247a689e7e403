//! Image reference parsing.
//!
//! References come in two shapes: a plain *named* reference
//! (`registry.example.com/project/image`) and a *named-tagged* reference
//! (`project/image:1.2`). Only named-tagged references may be used as image
//! targets; parsing rejects a bare name wherever a target is required.

use crate::error::{Error, Result};

/// Maximum image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_REFERENCE_LEN: usize = 512;

/// A validated image name without a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamedRef {
    name: String,
}

/// A validated image name with a tag. Required for image targets and pulls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedRef {
    name: String,
    tag: String,
}

/// Either reference shape, as produced by [`parse_reference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Named(NamedRef),
    Tagged(TaggedRef),
}

impl NamedRef {
    /// Parses a plain named reference. A trailing `:tag` is rejected here;
    /// use [`TaggedRef::parse`] or [`parse_reference`] for tagged input.
    pub fn parse(s: &str) -> Result<NamedRef> {
        validate_charset(s)?;
        if split_tag(s).is_some() {
            return Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: "unexpected tag on named reference".to_string(),
            });
        }
        validate_name(s)?;
        Ok(NamedRef {
            name: s.to_string(),
        })
    }

    /// The image name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TaggedRef {
    /// Parses a named-tagged reference, rejecting bare names.
    pub fn parse(s: &str) -> Result<TaggedRef> {
        match parse_reference(s)? {
            ImageRef::Tagged(t) => Ok(t),
            ImageRef::Named(_) => Err(Error::InvalidReference {
                reference: s.to_string(),
                reason: "reference must contain name and tag".to_string(),
            }),
        }
    }

    /// The image name, without the tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl std::fmt::Display for NamedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl std::fmt::Display for TaggedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Named(n) => n.fmt(f),
            ImageRef::Tagged(t) => t.fmt(f),
        }
    }
}

/// Parses a reference into either shape.
pub fn parse_reference(s: &str) -> Result<ImageRef> {
    validate_charset(s)?;
    match split_tag(s) {
        Some((name, tag)) => {
            validate_name(name)?;
            validate_tag(s, tag)?;
            Ok(ImageRef::Tagged(TaggedRef {
                name: name.to_string(),
                tag: tag.to_string(),
            }))
        }
        None => {
            validate_name(s)?;
            Ok(ImageRef::Named(NamedRef {
                name: s.to_string(),
            }))
        }
    }
}

/// Splits `name:tag`, leaving registry ports (`host:5000/image`) alone.
fn split_tag(s: &str) -> Option<(&str, &str)> {
    let idx = s.rfind(':')?;
    // A colon before the last path separator is a registry port.
    if s[idx..].contains('/') {
        return None;
    }
    Some((&s[..idx], &s[idx + 1..]))
}

fn validate_charset(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidReference {
            reference: s.to_string(),
            reason: "empty reference".to_string(),
        });
    }
    if s.len() > MAX_REFERENCE_LEN {
        return Err(Error::InvalidReference {
            reference: s.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds {} bytes", MAX_REFERENCE_LEN),
        });
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_".contains(c))
    {
        return Err(Error::InvalidReference {
            reference: s.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidReference {
        reference: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(invalid("empty name component"));
        }
        if !component
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
            || !component
                .chars()
                .last()
                .is_some_and(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid("name component must start and end alphanumeric"));
        }
    }
    // Uppercase is only permitted in the registry host component.
    let body = match name.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') => rest,
        _ => name,
    };
    if body.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid("repository name must be lowercase"));
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };
    if tag.is_empty() {
        return Err(invalid("empty tag"));
    }
    if tag.len() > 128 {
        return Err(invalid("tag exceeds 128 characters"));
    }
    if !tag
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid("tag must start with a letter, digit, or underscore"));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
    {
        return Err(invalid("tag contains invalid characters"));
    }
    Ok(())
}

/// Normalises an image name into an environment variable prefix:
/// slashes, dashes, dots, and colons become underscores, then uppercase.
pub fn name_to_env(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '-' | ':' | '/' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}
