//! Runtime type descriptors for task fields.
//!
//! Field types are data here, not Rust generics: the same workflow graph can
//! be assembled from specifications loaded at runtime, so compatibility
//! between a producing and a consuming field is decided by inspecting
//! [`TypeSpec`] values. The semantic type system for content-addressable
//! values plugs in through [`crate::value::ContentValue`], which reports its
//! own `TypeSpec`.

use serde::{Deserialize, Serialize};

/// Declared type of a task field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeSpec {
    /// Matches anything. The default for undeclared parameters.
    Any,
    Bool,
    Int,
    Float,
    Str,
    /// A file-like value tagged with a format identifier, e.g. `"video/mp4"`.
    File(String),
    /// An ordered sequence with a homogeneous element type.
    List(Box<TypeSpec>),
    /// A fixed-arity heterogeneous sequence.
    Tuple(Vec<TypeSpec>),
    /// Any member type is acceptable.
    Union(Vec<TypeSpec>),
    /// A wrapped callable (function or workflow constructor).
    Callable,
}

impl TypeSpec {
    /// Shorthand for `List(Box::new(element))`.
    pub fn list(element: TypeSpec) -> Self {
        TypeSpec::List(Box::new(element))
    }

    /// Shorthand for a union over the given members.
    pub fn union(members: impl IntoIterator<Item = TypeSpec>) -> Self {
        TypeSpec::Union(members.into_iter().collect())
    }

    /// Checks whether a value of this (producing) type can be bound to a
    /// field declared with the `consumer` type.
    ///
    /// A union-typed consumer accepts any producer that is a member of (or
    /// equal to) the union; a union-typed producer is acceptable only if all
    /// of its members are. Sequences are covariant in their element type.
    pub fn is_compatible_with(&self, consumer: &TypeSpec) -> bool {
        match (self, consumer) {
            (_, TypeSpec::Any) | (TypeSpec::Any, _) => true,
            (TypeSpec::Union(members), _) => {
                members.iter().all(|m| m.is_compatible_with(consumer))
            }
            (_, TypeSpec::Union(members)) => {
                members.iter().any(|m| self.is_compatible_with(m))
            }
            (TypeSpec::List(a), TypeSpec::List(b)) => a.is_compatible_with(b),
            (TypeSpec::Tuple(a), TypeSpec::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_compatible_with(y))
            }
            (a, b) => a == b,
        }
    }

    /// The element type, if this is a sequence type.
    ///
    /// Used by the splitter algebra to decide whether a consuming field
    /// absorbs an upstream axis as one aggregate list.
    pub fn element(&self) -> Option<&TypeSpec> {
        match self {
            TypeSpec::List(element) => Some(element),
            _ => None,
        }
    }
}

impl std::fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeSpec::Any => write!(f, "any"),
            TypeSpec::Bool => write!(f, "bool"),
            TypeSpec::Int => write!(f, "int"),
            TypeSpec::Float => write!(f, "float"),
            TypeSpec::Str => write!(f, "str"),
            TypeSpec::File(format) => write!(f, "file[{format}]"),
            TypeSpec::List(element) => write!(f, "list[{element}]"),
            TypeSpec::Tuple(items) => {
                write!(f, "tuple[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            TypeSpec::Union(members) => {
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{member}")?;
                }
                Ok(())
            }
            TypeSpec::Callable => write!(f, "callable"),
        }
    }
}
