//! Dependency Keys
//!
//! A [`DependencyKey`] identifies one thing a source file can provide or
//! depend upon: a global name, a named type, a member, a dynamic-dispatch
//! site, an external file, or a whole source file's own dependency record.
//! Keys are hashable and totally ordered (aspect first, then designator in
//! declaration order) so traces and serialized output are deterministic.

use std::fmt;

/// Which half of a declaration a key refers to.
///
/// Interface changes cascade to users of the declaration; implementation
/// changes stay within the declaring file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeclAspect {
    Interface,
    Implementation,
}

impl DeclAspect {
    /// Stable serialization code: interface = 0, implementation = 1.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            DeclAspect::Interface => 0,
            DeclAspect::Implementation => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeclAspect::Interface),
            1 => Some(DeclAspect::Implementation),
            _ => None,
        }
    }
}

impl fmt::Display for DeclAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclAspect::Interface => f.write_str("interface"),
            DeclAspect::Implementation => f.write_str("implementation"),
        }
    }
}

/// What a dependency key designates.
///
/// The cases are closed and their declaration order fixes both the total
/// order and the stable serialization codes 0–6. Cases that do not carry a
/// `context` must serialize it as the empty identifier, and likewise for
/// `name`; [`Designator::from_code`] rejects violations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Designator {
    /// A global declaration.
    TopLevel { name: String },
    /// A named type; `context` is the mangled type name.
    Nominal { context: String },
    /// Any member of a type, for open-ended member lookups.
    PotentialMember { context: String },
    /// A specific member of a type.
    Member { context: String, name: String },
    /// A dynamic-dispatch site.
    DynamicLookup { name: String },
    /// A file outside this build.
    ExternalDepend { path: String },
    /// The marker for an entire source file's dependency record.
    SourceFileProvide { name: String },
}

impl Designator {
    /// Stable serialization code in `0..=6`.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Designator::TopLevel { .. } => 0,
            Designator::Nominal { .. } => 1,
            Designator::PotentialMember { .. } => 2,
            Designator::Member { .. } => 3,
            Designator::DynamicLookup { .. } => 4,
            Designator::ExternalDepend { .. } => 5,
            Designator::SourceFileProvide { .. } => 6,
        }
    }

    /// The mangled type context, or `""` for cases without one.
    #[must_use]
    pub fn context(&self) -> &str {
        match self {
            Designator::Nominal { context }
            | Designator::PotentialMember { context }
            | Designator::Member { context, .. } => context,
            _ => "",
        }
    }

    /// The name field, or `""` for cases without one.
    ///
    /// `ExternalDepend` and `SourceFileProvide` carry their path here.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Designator::TopLevel { name }
            | Designator::Member { name, .. }
            | Designator::DynamicLookup { name }
            | Designator::SourceFileProvide { name } => name,
            Designator::ExternalDepend { path } => path,
            _ => "",
        }
    }

    /// Rebuild a designator from its serialized parts, enforcing the
    /// per-case emptiness constraints.
    pub fn from_code(code: u8, context: String, name: String) -> Result<Self, KeyFormatError> {
        let designator = match code {
            0 if context.is_empty() => Designator::TopLevel { name },
            1 if name.is_empty() => Designator::Nominal { context },
            2 if name.is_empty() => Designator::PotentialMember { context },
            3 => Designator::Member { context, name },
            4 if context.is_empty() => Designator::DynamicLookup { name },
            5 if context.is_empty() => Designator::ExternalDepend { path: name },
            6 if context.is_empty() => Designator::SourceFileProvide { name },
            0..=6 => return Err(KeyFormatError::BogusNameOrContext { code }),
            _ => return Err(KeyFormatError::UnknownDesignatorKind { code }),
        };
        Ok(designator)
    }
}

impl fmt::Display for Designator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Designator::TopLevel { name } => write!(f, "top-level {name}"),
            Designator::Nominal { context } => write!(f, "type {context}"),
            Designator::PotentialMember { context } => write!(f, "potential member of {context}"),
            Designator::Member { context, name } => write!(f, "member {context}.{name}"),
            Designator::DynamicLookup { name } => write!(f, "dynamic lookup {name}"),
            Designator::ExternalDepend { path } => write!(f, "external {path}"),
            Designator::SourceFileProvide { name } => write!(f, "source file {name}"),
        }
    }
}

/// Error rebuilding a designator from serialized parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFormatError {
    /// The designator code is outside `0..=6`.
    UnknownDesignatorKind { code: u8 },
    /// A context or name was present where the case requires it empty.
    BogusNameOrContext { code: u8 },
}

impl fmt::Display for KeyFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFormatError::UnknownDesignatorKind { code } => {
                write!(f, "unknown designator kind: {code}")
            }
            KeyFormatError::BogusNameOrContext { code } => {
                write!(f, "bogus name or context for designator kind {code}")
            }
        }
    }
}

impl std::error::Error for KeyFormatError {}

/// An aspect plus a designator; the identity of a def or use in the graph.
///
/// The derived order compares aspect first, then designator, which is the
/// order the tracer and serializer rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyKey {
    pub aspect: DeclAspect,
    pub designator: Designator,
}

impl DependencyKey {
    #[must_use]
    pub fn new(aspect: DeclAspect, designator: Designator) -> Self {
        DependencyKey { aspect, designator }
    }

    /// The implementation-aspect twin of an interface key.
    ///
    /// Returns `None` for implementation keys; there is nothing below them.
    #[must_use]
    pub fn corresponding_implementation(&self) -> Option<DependencyKey> {
        match self.aspect {
            DeclAspect::Interface => Some(DependencyKey {
                aspect: DeclAspect::Implementation,
                designator: self.designator.clone(),
            }),
            DeclAspect::Implementation => None,
        }
    }

    /// Interface key for an external dependency path.
    #[must_use]
    pub fn interface_for_external_depend(path: impl Into<String>) -> Self {
        DependencyKey {
            aspect: DeclAspect::Interface,
            designator: Designator::ExternalDepend { path: path.into() },
        }
    }

    /// The file-level provide key for a dependency artifact, per aspect.
    #[must_use]
    pub fn source_file_provide(aspect: DeclAspect, source: impl Into<String>) -> Self {
        DependencyKey {
            aspect,
            designator: Designator::SourceFileProvide {
                name: source.into(),
            },
        }
    }

    /// Whether this key designates a whole source file.
    #[must_use]
    pub fn is_source_file_provide(&self) -> bool {
        matches!(self.designator, Designator::SourceFileProvide { .. })
    }

    /// Whether this key designates an external dependency.
    #[must_use]
    pub fn is_external_depend(&self) -> bool {
        matches!(self.designator, Designator::ExternalDepend { .. })
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.aspect, self.designator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top(name: &str) -> DependencyKey {
        DependencyKey::new(
            DeclAspect::Interface,
            Designator::TopLevel {
                name: name.to_owned(),
            },
        )
    }

    #[test]
    fn test_aspect_orders_before_designator() {
        let iface = top("z");
        let impl_a = DependencyKey::new(
            DeclAspect::Implementation,
            Designator::TopLevel {
                name: "a".to_owned(),
            },
        );
        // All interface keys sort before all implementation keys.
        assert!(iface < impl_a);
    }

    #[test]
    fn test_designator_case_order_matches_codes() {
        let cases = [
            Designator::TopLevel {
                name: "n".to_owned(),
            },
            Designator::Nominal {
                context: "c".to_owned(),
            },
            Designator::PotentialMember {
                context: "c".to_owned(),
            },
            Designator::Member {
                context: "c".to_owned(),
                name: "n".to_owned(),
            },
            Designator::DynamicLookup {
                name: "n".to_owned(),
            },
            Designator::ExternalDepend {
                path: "/p".to_owned(),
            },
            Designator::SourceFileProvide {
                name: "f".to_owned(),
            },
        ];
        for (expected, case) in cases.iter().enumerate() {
            assert_eq!(case.code() as usize, expected);
        }
        let mut sorted = cases.to_vec();
        sorted.sort();
        assert_eq!(sorted, cases);
    }

    #[test]
    fn test_corresponding_implementation() {
        let iface = top("a");
        let implementation = iface.corresponding_implementation().unwrap();
        assert_eq!(implementation.aspect, DeclAspect::Implementation);
        assert_eq!(implementation.designator, iface.designator);
        assert!(implementation.corresponding_implementation().is_none());
    }

    #[test]
    fn test_from_code_roundtrip() {
        let cases = [
            Designator::TopLevel {
                name: "n".to_owned(),
            },
            Designator::Member {
                context: "c".to_owned(),
                name: "n".to_owned(),
            },
            Designator::ExternalDepend {
                path: "/usr/lib/libm".to_owned(),
            },
            Designator::SourceFileProvide {
                name: "f.kdeps".to_owned(),
            },
        ];
        for case in cases {
            let rebuilt = Designator::from_code(
                case.code(),
                case.context().to_owned(),
                case.name().to_owned(),
            )
            .unwrap();
            assert_eq!(rebuilt, case);
        }
    }

    #[test]
    fn test_from_code_rejects_unknown_kind() {
        assert_eq!(
            Designator::from_code(7, String::new(), String::new()),
            Err(KeyFormatError::UnknownDesignatorKind { code: 7 })
        );
    }

    #[test]
    fn test_from_code_rejects_bogus_context() {
        // topLevel must have an empty context.
        assert_eq!(
            Designator::from_code(0, "ctx".to_owned(), "n".to_owned()),
            Err(KeyFormatError::BogusNameOrContext { code: 0 })
        );
        // nominal must have an empty name.
        assert_eq!(
            Designator::from_code(1, "ctx".to_owned(), "n".to_owned()),
            Err(KeyFormatError::BogusNameOrContext { code: 1 })
        );
    }
}
