//! Typed placeholders for not-yet-produced values.
//!
//! A [`LazyField`] is a lightweight token referencing the future output of a
//! node, or an unresolved input of the enclosing workflow. It carries no
//! value and never executes anything; binding one to a consuming field only
//! performs a one-time type compatibility check.

use crate::types::TypeSpec;

/// The producing entity a lazy field points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazySource {
    /// An unresolved input of the enclosing workflow.
    WorkflowInput,
    /// The named node's not-yet-computed output.
    NodeOutput(String),
}

/// A read-only reference to a value that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyField {
    pub source: LazySource,
    pub field: String,
    pub ty: TypeSpec,
    /// Stamped once compatibility with a consuming field has been verified.
    pub type_checked: bool,
}

impl LazyField {
    pub fn workflow_input(field: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            source: LazySource::WorkflowInput,
            field: field.into(),
            ty,
            type_checked: false,
        }
    }

    pub fn node_output(node: impl Into<String>, field: impl Into<String>, ty: TypeSpec) -> Self {
        Self {
            source: LazySource::NodeOutput(node.into()),
            field: field.into(),
            ty,
            type_checked: false,
        }
    }

    /// The producing node's name, if this references a node output.
    pub fn producer(&self) -> Option<&str> {
        match &self.source {
            LazySource::WorkflowInput => None,
            LazySource::NodeOutput(node) => Some(node),
        }
    }

    /// Verifies that this lazy field may be bound to a field declared with
    /// the `consumer` type, returning a stamped copy on success.
    pub fn checked_against(&self, consumer: &TypeSpec) -> Option<LazyField> {
        if self.ty.is_compatible_with(consumer) {
            let mut checked = self.clone();
            checked.type_checked = true;
            Some(checked)
        } else {
            None
        }
    }
}

impl std::fmt::Display for LazyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            LazySource::WorkflowInput => write!(f, "<workflow>.{}", self.field),
            LazySource::NodeOutput(node) => write!(f, "{node}.{}", self.field),
        }
    }
}
