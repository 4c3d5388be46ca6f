//! Task specifications and task instances.
//!
//! A [`TaskSpec`] is the immutable schema of a unit of work: an ordered set
//! of input [`Field`]s, an ordered set of output fields, and one of three
//! backings — a wrapped function, an external command, or a workflow
//! constructor. Building a specification reconciles three independent
//! sources of field information: explicit declarations, the wrapped
//! callable's parameter list, and the output declaration surface.
//!
//! A [`TaskInstance`] is a specification with a concrete or lazy value bound
//! to every input field. Instances own their values until consumed by a
//! node, and carry the split/combine requests that feed the state algebra.

use std::collections::BTreeSet;
use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{DefinitionError, HashError};
use crate::field::{Field, HashPolicy};
use crate::hash::{Hash32, fold_fields, hash_identity, hash_value};
use crate::types::TypeSpec;
use crate::value::{Binding, Callable, Constructor, Value};

/// The backing of a task specification.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Wraps a callable; inputs map to parameters, outputs to return values.
    Function { callable: Callable },
    /// Wraps an external command template, parsed into fields by the
    /// process-command front end.
    Process { executable: String },
    /// Wraps a constructor that builds a nested workflow graph.
    Graph { constructor: Constructor },
}

impl TaskKind {
    /// The input name reserved for the backing itself.
    fn reserved_name(&self) -> &'static str {
        match self {
            TaskKind::Function { .. } => "function",
            TaskKind::Process { .. } => "executable",
            TaskKind::Graph { .. } => "constructor",
        }
    }

    /// The implicit input field carrying the backing, so that it takes part
    /// in content hashing like any other field.
    fn implicit_field(&self) -> Field {
        match self {
            TaskKind::Function { callable } => Field::new("function", TypeSpec::Callable)
                .with_default(Value::Callable(callable.clone())),
            TaskKind::Process { executable } => {
                Field::new("executable", TypeSpec::Str).with_default(executable.as_str())
            }
            // Constructor closures have no reproducible serialized form, so
            // the implicit field opts into equality-based hashing.
            TaskKind::Graph { constructor } => Field::new("constructor", TypeSpec::Callable)
                .with_default(Value::Callable(Callable::reference(constructor.fingerprint())))
                .hash_eq(),
        }
    }
}

/// Schema describing a unit of work's named inputs and outputs.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    name: String,
    inputs: Vec<Field>,
    outputs: Vec<Field>,
    kind: TaskKind,
}

impl TaskSpec {
    /// Starts a function-backed specification. `params` is the wrapped
    /// callable's own parameter list, in order; explicitly declared inputs
    /// are reconciled against it.
    pub fn function<S: Into<String>>(
        name: impl Into<String>,
        callable: Callable,
        params: impl IntoIterator<Item = S>,
    ) -> TaskSpecBuilder {
        TaskSpecBuilder::new(
            name.into(),
            TaskKind::Function { callable },
            Some(params.into_iter().map(Into::into).collect()),
        )
    }

    /// Starts a process-backed specification. Input and output fields come
    /// pre-parsed from the command-template front end.
    pub fn process(name: impl Into<String>, executable: impl Into<String>) -> TaskSpecBuilder {
        TaskSpecBuilder::new(
            name.into(),
            TaskKind::Process {
                executable: executable.into(),
            },
            None,
        )
    }

    /// Starts a workflow-backed specification around a graph constructor.
    pub fn workflow(name: impl Into<String>, constructor: Constructor) -> TaskSpecBuilder {
        TaskSpecBuilder::new(name.into(), TaskKind::Graph { constructor }, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Field] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Field] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&Field> {
        self.inputs.iter().find(|field| field.name() == name)
    }

    pub fn output(&self, name: &str) -> Option<&Field> {
        self.outputs.iter().find(|field| field.name() == name)
    }

    /// Digest identifying this specification in the construction cache:
    /// name, backing identity, and the full field schema.
    pub fn identity_hash(&self) -> Hash32 {
        let mut hasher = crate::hash::Blake3Hasher::default();

        let tag = match &self.kind {
            TaskKind::Function { callable } => format!("function:{}", callable.fingerprint()),
            TaskKind::Process { executable } => format!("process:{executable}"),
            TaskKind::Graph { constructor } => format!("graph:{}", constructor.fingerprint()),
        };

        hasher.update(tag.as_bytes()).update([0u8]);
        hasher.update(self.name.as_bytes()).update([0u8]);

        for field in self.inputs.iter().chain(&self.outputs) {
            hasher.update(field.name().as_bytes()).update([0u8]);
            hasher.update(field.ty().to_string().as_bytes()).update([0u8]);
        }

        hasher.into()
    }

    /// Binds values to input fields, producing a task instance.
    ///
    /// Fields not named fall back to their default, or to the absent value.
    /// Converters run on concrete values at bind time.
    pub fn instantiate<I, S, B>(self: &Arc<Self>, values: I) -> Result<TaskInstance, DefinitionError>
    where
        I: IntoIterator<Item = (S, B)>,
        S: Into<String>,
        B: Into<Binding>,
    {
        let mut instance = TaskInstance {
            values: self
                .inputs
                .iter()
                .map(|field| Binding::Concrete(field.default().cloned().unwrap_or_default()))
                .collect(),
            spec: Arc::clone(self),
            split_fields: Vec::new(),
            combines: Vec::new(),
        };

        for (name, binding) in values {
            instance.set(name.into().as_str(), binding)?;
        }

        Ok(instance)
    }
}

/// Output declaration surface: an ordered name list, a name→type mapping,
/// or nothing (inferred from the return type).
#[derive(Debug, Clone, Default)]
enum OutputDecl {
    #[default]
    Inferred,
    Names(Vec<String>),
    Typed(Vec<(String, TypeSpec)>),
}

/// Builder reconciling the three sources of field information into a
/// [`TaskSpec`].
pub struct TaskSpecBuilder {
    name: String,
    kind: TaskKind,
    params: Option<Vec<String>>,
    inputs: Vec<Field>,
    outputs: OutputDecl,
    returns: Option<TypeSpec>,
}

impl TaskSpecBuilder {
    fn new(name: String, kind: TaskKind, params: Option<Vec<String>>) -> Self {
        Self {
            name,
            kind,
            params,
            inputs: Vec::new(),
            outputs: OutputDecl::Inferred,
            returns: None,
        }
    }

    /// Declares an input field explicitly.
    pub fn input(mut self, field: Field) -> Self {
        self.inputs.push(field);
        self
    }

    /// Declares outputs as an ordered name list; types come from the return
    /// annotation, or default to `Any`.
    pub fn outputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.outputs = OutputDecl::Names(names.into_iter().map(Into::into).collect());
        self
    }

    /// Declares outputs as an ordered name→type mapping.
    pub fn outputs_typed<S: Into<String>>(
        mut self,
        pairs: impl IntoIterator<Item = (S, TypeSpec)>,
    ) -> Self {
        self.outputs = OutputDecl::Typed(
            pairs
                .into_iter()
                .map(|(name, ty)| (name.into(), ty))
                .collect(),
        );
        self
    }

    /// Declares the wrapped callable's return type annotation. A
    /// tuple-shaped annotation describes one output per element.
    pub fn returns(mut self, ty: TypeSpec) -> Self {
        self.returns = Some(ty);
        self
    }

    pub fn build(self) -> Result<Arc<TaskSpec>, DefinitionError> {
        let reserved = self.kind.reserved_name();

        for field in &self.inputs {
            if field.name() == reserved {
                return Err(DefinitionError::Reserved(reserved.to_string()));
            }
        }

        for (i, field) in self.inputs.iter().enumerate() {
            if self.inputs[..i].iter().any(|f| f.name() == field.name()) {
                return Err(DefinitionError::DuplicateField(field.name().to_string()));
            }
        }

        let mut inputs = match &self.params {
            // Reconcile explicit declarations against the wrapped callable's
            // parameter list: order follows the parameters, every explicit
            // name must have a counterpart.
            Some(params) => {
                let unknown: Vec<&str> = self
                    .inputs
                    .iter()
                    .map(Field::name)
                    .filter(|name| !params.iter().any(|p| p == name))
                    .collect();

                if !unknown.is_empty() {
                    return Err(DefinitionError::UnrecognisedInputs {
                        names: unknown.join(", "),
                        accepts: params.join(", "),
                    });
                }

                params
                    .iter()
                    .map(|param| {
                        self.inputs
                            .iter()
                            .find(|field| field.name() == param)
                            .cloned()
                            .unwrap_or_else(|| Field::new(param, TypeSpec::Any))
                    })
                    .collect()
            }
            None => self.inputs.clone(),
        };

        inputs.push(self.kind.implicit_field());

        let outputs = normalize_outputs(self.outputs, self.returns)?;

        Ok(Arc::new(TaskSpec {
            name: self.name,
            inputs,
            outputs,
            kind: self.kind,
        }))
    }
}

/// Normalizes the three output declaration surfaces into one ordered field
/// set. Semantically equal declarations must produce identical fields; this
/// equivalence is a hard contract of the specification model.
fn normalize_outputs(
    decl: OutputDecl,
    returns: Option<TypeSpec>,
) -> Result<Vec<Field>, DefinitionError> {
    let fields = match (decl, returns) {
        (OutputDecl::Typed(pairs), _) => pairs
            .into_iter()
            .map(|(name, ty)| Field::new(name, ty))
            .collect(),

        (OutputDecl::Names(names), Some(TypeSpec::Tuple(types))) => {
            if names.len() != types.len() {
                return Err(DefinitionError::OutputArityMismatch {
                    names: names.len(),
                    types: types.len(),
                });
            }
            names
                .into_iter()
                .zip(types)
                .map(|(name, ty)| Field::new(name, ty))
                .collect()
        }

        (OutputDecl::Names(names), Some(ty)) => {
            if names.len() != 1 {
                return Err(DefinitionError::OutputArityMismatch {
                    names: names.len(),
                    types: 1,
                });
            }
            vec![Field::new(names.into_iter().next().unwrap(), ty)]
        }

        (OutputDecl::Names(names), None) => names
            .into_iter()
            .map(|name| Field::new(name, TypeSpec::Any))
            .collect(),

        // Inferred from a tuple-shaped return annotation: one output per
        // element, named out1..outN.
        (OutputDecl::Inferred, Some(TypeSpec::Tuple(types))) => types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| Field::new(format!("out{}", i + 1), ty))
            .collect(),

        (OutputDecl::Inferred, Some(ty)) => vec![Field::new("out", ty)],

        (OutputDecl::Inferred, None) => vec![Field::new("out", TypeSpec::Any)],
    };

    Ok(fields)
}

/// A task specification with a value bound to every input field.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    spec: Arc<TaskSpec>,
    /// Parallel to `spec.inputs()`.
    values: Vec<Binding>,
    /// Fields replicated over by this instance's split request.
    split_fields: Vec<String>,
    /// Axis names (bare or dotted) requested for reduction.
    combines: Vec<String>,
}

impl TaskInstance {
    pub fn spec(&self) -> &Arc<TaskSpec> {
        &self.spec
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        let index = self.index_of(name)?;
        Some(&self.values[index])
    }

    /// Rebinds an input field. Converters run on concrete values.
    pub fn set(&mut self, name: &str, binding: impl Into<Binding>) -> Result<(), DefinitionError> {
        let index = self.index_of(name).ok_or_else(|| DefinitionError::UnknownField {
            spec: self.spec.name().to_string(),
            field: name.to_string(),
        })?;

        self.values[index] = match binding.into() {
            Binding::Concrete(value) => {
                let field = &self.spec.inputs()[index];
                let converted = field.convert(value).map_err(|source| {
                    DefinitionError::Conversion {
                        field: name.to_string(),
                        source,
                    }
                })?;
                Binding::Concrete(converted)
            }
            lazy => lazy,
        };

        Ok(())
    }

    /// Requests replication over the given fields. Each field becomes one
    /// axis; fields split together combine by full Cartesian product.
    pub fn split<I, S, B>(mut self, fields: I) -> Result<Self, DefinitionError>
    where
        I: IntoIterator<Item = (S, B)>,
        S: Into<String>,
        B: Into<Binding>,
    {
        for (name, binding) in fields {
            let name = name.into();
            self.set(&name, binding)?;
            if !self.split_fields.contains(&name) {
                self.split_fields.push(name);
            }
        }

        Ok(self)
    }

    /// Requests reduction of the named axes after execution. Bare names
    /// resolve against this instance's own split axes; dotted names may
    /// address inherited upstream axes. Validation happens when the
    /// instance is added to a workflow.
    pub fn combine<S: Into<String>>(mut self, axes: impl IntoIterator<Item = S>) -> Self {
        self.combines.extend(axes.into_iter().map(Into::into));
        self
    }

    pub fn split_fields(&self) -> &[String] {
        &self.split_fields
    }

    pub fn combines(&self) -> &[String] {
        &self.combines
    }

    /// Names of input fields currently holding lazy values, sorted.
    pub fn lazy_names(&self) -> BTreeSet<String> {
        self.spec
            .inputs()
            .iter()
            .zip(&self.values)
            .filter(|(_, binding)| binding.is_lazy())
            .map(|(field, _)| field.name().to_string())
            .collect()
    }

    /// Iterates `(field, binding)` pairs in field order.
    pub fn bindings(&self) -> impl Iterator<Item = (&Field, &Binding)> {
        self.spec.inputs().iter().zip(&self.values)
    }

    /// Computes one content hash per concretely-valued field, honoring each
    /// field's hashing policy, plus the folded instance digest.
    ///
    /// Lazy fields carry no value and are excluded; they are keyed by name
    /// in the construction cache instead.
    pub fn compute_hashes(&self) -> Result<(Hash32, Vec<(String, Hash32)>), HashError> {
        let concrete: Vec<(&Field, &Value)> = self
            .bindings()
            .filter_map(|(field, binding)| binding.as_concrete().map(|value| (field, value)))
            .collect();

        let hashes: Vec<(String, Hash32)> = concrete
            .par_iter()
            .map(|(field, value)| {
                let hash = match field.policy() {
                    HashPolicy::ByValue => hash_value(field.name(), value)?,
                    HashPolicy::ByEquality => hash_identity(field.name(), value)?,
                };
                Ok((field.name().to_string(), hash))
            })
            .collect::<Result<_, HashError>>()?;

        let folded = fold_fields(hashes.iter().map(|(name, hash)| (name.as_str(), *hash)));

        Ok((folded, hashes))
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.spec.inputs().iter().position(|field| field.name() == name)
    }
}
