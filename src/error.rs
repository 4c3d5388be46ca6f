use thiserror::Error;

/// Errors raised while declaring a task specification.
///
/// These are static definition errors: they are raised immediately when the
/// specification is built and are never retried.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Unrecognised input names: {names} (the wrapped callable accepts: {accepts})")]
    UnrecognisedInputs { names: String, accepts: String },

    #[error("The argument '{0}' is reserved and cannot be declared as an input")]
    Reserved(String),

    #[error("Duplicate field '{0}' in task specification")]
    DuplicateField(String),

    #[error(
        "Malformed output declaration: {names} output names declared, \
         but the return type has {types} elements"
    )]
    OutputArityMismatch { names: usize, types: usize },

    #[error("Task '{spec}' has no input field named '{field}'")]
    UnknownField { spec: String, field: String },

    #[error("Failed to convert the value bound to field '{field}':\n{source}")]
    Conversion {
        field: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised while computing content hashes.
///
/// Unhashable values are fatal and surfaced verbatim, never skipped.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Unhashable value in field '{field}': {reason}")]
    Unhashable { field: String, reason: String },

    #[error("Failed to encode value for hashing: {0}")]
    Encode(String),

    #[error("Content hash failed: {0}")]
    Content(#[source] anyhow::Error),
}

/// Errors raised while constructing a workflow graph.
///
/// Any of these aborts construction synchronously; partial graphs are never
/// exposed to the caller.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("Task '{0}' is not workflow-backed and cannot be constructed as a graph")]
    NotAWorkflow(String),

    #[error("Workflow '{workflow}' has no input named '{field}'")]
    UnknownInput { workflow: String, field: String },

    #[error("Node '{node}' references undeclared node '{target}' through field '{field}'")]
    UndeclaredNode {
        node: String,
        field: String,
        target: String,
    },

    #[error(
        "Node '{node}' cannot bind field '{field}' to the output of '{target}', \
         which is not strictly earlier in the workflow"
    )]
    ForwardReference {
        node: String,
        field: String,
        target: String,
    },

    #[error("A node named '{0}' has already been added to the workflow")]
    DuplicateNodeName(String),

    #[error(
        "Incompatible lazy field for '{node}.{field}': produces {found}, \
         but the consuming field is declared as {expected}"
    )]
    TypeMismatch {
        node: String,
        field: String,
        expected: String,
        found: String,
    },

    #[error("Unknown axis '{axis}' in combiner of node '{node}' (open axes: {available})")]
    UnknownAxis {
        node: String,
        axis: String,
        available: String,
    },

    #[error(
        "Outputs of node '{node}' have already been accessed and therefore cannot set \
         '{field}' to a value with a different state"
    )]
    AlreadyObserved { node: String, field: String },

    #[error("Workflow output '{0}' is already bound and cannot be assigned again")]
    OutputBoundTwice(String),

    #[error("Workflow output '{0}' was never bound by the constructor")]
    OutputUnbound(String),

    #[error("Constructor returned {found} output values, but {expected} output fields remain unbound")]
    OutputCount { expected: usize, found: usize },

    #[error("Node '{0}' does not exist in this workflow")]
    NoSuchNode(String),

    #[error("Node '{node}' has no output field named '{field}'")]
    NoSuchOutput { node: String, field: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("Workflow constructor failed:\n{0}")]
    Constructor(#[source] anyhow::Error),
}
