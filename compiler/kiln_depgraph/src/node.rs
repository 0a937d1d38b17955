//! Graph Nodes
//!
//! A node pairs a [`DependencyKey`] with an optional fingerprint and an
//! optional owning source. Nodes are immutable; the finder replaces them
//! wholesale when integration learns something new.

use std::fmt;

use crate::key::DependencyKey;
use crate::paths::SourcePath;

/// Opaque hash of a declaration body.
///
/// Two nodes with the same key but different fingerprints are semantically
/// different declarations. The engine never interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A vertex of the module dependency graph.
///
/// A node without a source is an *expat*: a placeholder for a declaration
/// referenced from this build but not (yet) provided by any known file.
/// Expats can be the def side of arcs but never the use side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    key: DependencyKey,
    fingerprint: Option<Fingerprint>,
    source: Option<SourcePath>,
}

impl Node {
    #[must_use]
    pub fn new(
        key: DependencyKey,
        fingerprint: Option<Fingerprint>,
        source: Option<SourcePath>,
    ) -> Self {
        Node {
            key,
            fingerprint,
            source,
        }
    }

    /// A placeholder for an externally referenced key.
    #[must_use]
    pub fn expat(key: DependencyKey) -> Self {
        Node {
            key,
            fingerprint: None,
            source: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &DependencyKey {
        &self.key
    }

    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn source(&self) -> Option<&SourcePath> {
        self.source.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn is_expat(&self) -> bool {
        self.source.is_none()
    }

    /// Whether the node provides its key, rather than merely referencing it.
    #[must_use]
    pub fn is_provider(&self) -> bool {
        self.fingerprint.is_some() || self.source.is_some()
    }

    /// Sort key for deterministic emission: source first, then key.
    ///
    /// Expats order before owned nodes because `None < Some`.
    #[must_use]
    pub fn stable_order(&self) -> (Option<&SourcePath>, &DependencyKey) {
        (self.source.as_ref(), &self.key)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(fp) = &self.fingerprint {
            write!(f, " @{fp}")?;
        }
        match &self.source {
            Some(source) => write!(f, " in {source}"),
            None => write!(f, " (expat)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{DeclAspect, Designator};

    fn key(name: &str) -> DependencyKey {
        DependencyKey::new(
            DeclAspect::Interface,
            Designator::TopLevel {
                name: name.to_owned(),
            },
        )
    }

    #[test]
    fn test_expat_has_no_source() {
        let node = Node::expat(key("a"));
        assert!(node.is_expat());
        assert!(!node.is_provider());
    }

    #[test]
    fn test_provider_with_source() {
        let node = Node::new(key("a"), None, Some(SourcePath::from("j0.kdeps")));
        assert!(!node.is_expat());
        assert!(node.is_provider());
    }

    #[test]
    fn test_equality_is_three_way() {
        let base = Node::new(key("a"), None, Some(SourcePath::from("j0.kdeps")));
        let with_fp = Node::new(
            key("a"),
            Some(Fingerprint::new("1")),
            Some(SourcePath::from("j0.kdeps")),
        );
        let elsewhere = Node::new(key("a"), None, Some(SourcePath::from("j1.kdeps")));
        assert_ne!(base, with_fp);
        assert_ne!(base, elsewhere);
        assert_eq!(base, base.clone());
    }
}
