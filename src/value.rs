//! The value model for task inputs and outputs.
//!
//! Everything a task consumes or produces is a [`Value`]. Callables (wrapped
//! functions and workflow constructors) are values too, so that they take
//! part in content hashing like any other field: they carry a reproducible
//! *fingerprint* identifying their semantic content, because a closure has
//! no inspectable source at runtime. Redefining an identical function with
//! the same fingerprint therefore preserves its hash.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::HashError;
use crate::hash::Hash32;
use crate::lazy::LazyField;
use crate::types::TypeSpec;

/// The collaborator seam for semantic, content-addressable values such as
/// file-like objects. The core only ever asks for a content hash, a type
/// descriptor, and equality.
pub trait ContentValue: Send + Sync + std::fmt::Debug {
    /// Deterministic digest of the value's content. Failures are fatal to
    /// the surrounding hash computation and surfaced verbatim.
    fn content_hash(&self) -> Result<Hash32, HashError>;

    /// The semantic type of this value.
    fn type_spec(&self) -> TypeSpec;

    /// Equality against another content value.
    fn eq_dyn(&self, other: &dyn ContentValue) -> bool;
}

/// Signature of a wrapped function's run body.
pub type RunFn = dyn Fn(&BTreeMap<String, Value>) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A wrapped function, identified by a reproducible fingerprint.
///
/// The fingerprint stands in for normalized source: two definitions of the
/// same function must carry the same fingerprint and therefore hash
/// identically, regardless of when or where they were created.
#[derive(Clone)]
pub struct Callable {
    fingerprint: Arc<str>,
    run: Option<Arc<RunFn>>,
}

impl Callable {
    pub fn new<F>(fingerprint: impl Into<Arc<str>>, run: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            fingerprint: fingerprint.into(),
            run: Some(Arc::new(run)),
        }
    }

    /// A hashing-only reference to a callable, with no run function.
    ///
    /// Used where only the identity matters, e.g. the implicit `constructor`
    /// field of a workflow-backed specification.
    pub fn reference(fingerprint: impl Into<Arc<str>>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            run: None,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The run function, for the execution backend. `None` for references.
    pub fn run_fn(&self) -> Option<&Arc<RunFn>> {
        self.run.as_ref()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callable({})", self.fingerprint)
    }
}

/// Signature of a workflow constructor's graph-building body.
pub type BuildFn = dyn Fn(&mut crate::engine::WorkflowBuilder) -> anyhow::Result<Vec<Binding>>
    + Send
    + Sync;

/// The constructor of a workflow-backed task: a callable that assembles the
/// node graph when invoked by [`Workflow::construct`](crate::Workflow::construct).
///
/// Compared and hashed by fingerprint equality rather than content, since a
/// graph-building closure has no reproducible serialized form.
#[derive(Clone)]
pub struct Constructor {
    fingerprint: Arc<str>,
    build: Arc<BuildFn>,
}

impl Constructor {
    pub fn new<F>(fingerprint: impl Into<Arc<str>>, build: F) -> Self
    where
        F: Fn(&mut crate::engine::WorkflowBuilder) -> anyhow::Result<Vec<Binding>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            fingerprint: fingerprint.into(),
            build: Arc::new(build),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn build_fn(&self) -> &Arc<BuildFn> {
        &self.build
    }
}

impl PartialEq for Constructor {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl std::fmt::Debug for Constructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Constructor({})", self.fingerprint)
    }
}

/// A concrete value bound to a task field.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// The absent value for optional fields.
    #[default]
    Nothing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Callable(Callable),
    /// A semantic value supplied by the content-type collaborator.
    Custom(Arc<dyn ContentValue>),
}

impl Value {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Best-effort inferred type, for diagnostics. Declared field types are
    /// authoritative for compatibility checks.
    pub fn inferred_type(&self) -> TypeSpec {
        match self {
            Value::Nothing => TypeSpec::Any,
            Value::Bool(_) => TypeSpec::Bool,
            Value::Int(_) => TypeSpec::Int,
            Value::Float(_) => TypeSpec::Float,
            Value::Str(_) => TypeSpec::Str,
            Value::List(items) => TypeSpec::list(
                items.first().map(Value::inferred_type).unwrap_or(TypeSpec::Any),
            ),
            Value::Tuple(items) => TypeSpec::Tuple(items.iter().map(Value::inferred_type).collect()),
            Value::Callable(_) => TypeSpec::Callable,
            Value::Custom(custom) => custom.type_spec(),
        }
    }

    /// A JSON rendition for diagnostics and logging. Callables and custom
    /// values render as tagged strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nothing => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Value::from(*x),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
            Value::List(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Callable(c) => serde_json::Value::from(format!("callable:{}", c.fingerprint())),
            Value::Custom(c) => serde_json::Value::from(format!("{c:?}")),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => a.eq_dyn(b.as_ref()),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::List(values.into_iter().map(Into::into).collect())
    }
}

/// What a task field is currently bound to: a concrete value, or a lazy
/// reference to a value that has not been produced yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Concrete(Value),
    Lazy(LazyField),
}

impl Binding {
    pub fn is_lazy(&self) -> bool {
        matches!(self, Binding::Lazy(_))
    }

    pub fn as_concrete(&self) -> Option<&Value> {
        match self {
            Binding::Concrete(value) => Some(value),
            Binding::Lazy(_) => None,
        }
    }

    pub fn as_lazy(&self) -> Option<&LazyField> {
        match self {
            Binding::Concrete(_) => None,
            Binding::Lazy(lazy) => Some(lazy),
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Concrete(value)
    }
}

impl From<LazyField> for Binding {
    fn from(lazy: LazyField) -> Self {
        Binding::Lazy(lazy)
    }
}

impl From<bool> for Binding {
    fn from(value: bool) -> Self {
        Binding::Concrete(value.into())
    }
}

impl From<i64> for Binding {
    fn from(value: i64) -> Self {
        Binding::Concrete(value.into())
    }
}

impl From<i32> for Binding {
    fn from(value: i32) -> Self {
        Binding::Concrete(value.into())
    }
}

impl From<f64> for Binding {
    fn from(value: f64) -> Self {
        Binding::Concrete(value.into())
    }
}

impl From<&str> for Binding {
    fn from(value: &str) -> Self {
        Binding::Concrete(value.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Binding {
    fn from(values: Vec<T>) -> Self {
        Binding::Concrete(values.into())
    }
}
