//! Field schema for task inputs and outputs.

use std::sync::Arc;

use crate::types::TypeSpec;
use crate::value::Value;

/// How a field's value participates in the instance content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashPolicy {
    /// Hash the value's content (canonical encoding). The default.
    #[default]
    ByValue,
    /// Hash a stable identity token instead. Used where reproducible content
    /// hashing is impractical, e.g. a workflow constructor closure.
    ByEquality,
}

type ConvertFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;

/// A named input or output slot of a task specification.
///
/// Immutable once declared; a specification's field list never changes after
/// the specification is built.
#[derive(Clone)]
pub struct Field {
    name: String,
    ty: TypeSpec,
    default: Option<Value>,
    converter: Option<Arc<ConvertFn>>,
    required: bool,
    policy: HashPolicy,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            converter: None,
            required: true,
            policy: HashPolicy::ByValue,
        }
    }

    /// Declares a default value; fields with a default need not be bound
    /// explicitly at instantiation.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Attaches a converter applied to concrete values at bind time.
    pub fn converter<F>(mut self, convert: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(convert));
        self
    }

    /// Opts into equality-based hashing for this field.
    pub fn hash_eq(mut self) -> Self {
        self.policy = HashPolicy::ByEquality;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TypeSpec {
        &self.ty
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn policy(&self) -> HashPolicy {
        self.policy
    }

    /// Runs the field's converter over a concrete value, if one is attached.
    pub fn convert(&self, value: Value) -> anyhow::Result<Value> {
        match (&self.converter, value) {
            // The absent value passes through untouched.
            (_, Value::Nothing) => Ok(Value::Nothing),
            (Some(convert), value) => convert(value),
            (None, value) => Ok(value),
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        let converters = match (&self.converter, &other.converter) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        self.name == other.name
            && self.ty == other.ty
            && self.default == other.default
            && self.required == other.required
            && self.policy == other.policy
            && converters
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("default", &self.default)
            .field("required", &self.required)
            .field("policy", &self.policy)
            .field("converter", &self.converter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
