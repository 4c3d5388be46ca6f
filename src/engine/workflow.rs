//! Workflow graph construction.
//!
//! A workflow-backed task is turned into a [`Workflow`] by invoking its
//! constructor against a [`WorkflowBuilder`]. Inside the constructor, adding
//! a node registers it in the ordered graph, derives its replication state
//! from its bound inputs, and hands back a [`NodeHandle`] exposing each
//! declared output as a lazy reference — wiring without execution.
//!
//! Construction is single-pass and synchronous. A node may reference only
//! strictly earlier nodes or the workflow's own inputs, so the graph is
//! acyclic by construction and needs no cycle check.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::engine::cache::ConstructionCache;
use crate::engine::node::Node;
use crate::error::ConstructionError;
use crate::field::Field;
use crate::lazy::{LazyField, LazySource};
use crate::spec::{TaskInstance, TaskKind, TaskSpec};
use crate::state::{AbsorptionPolicy, Axis, State};
use crate::types::TypeSpec;
use crate::value::Binding;

/// A fully constructed workflow: the ordered node graph, the resolved
/// inputs, and the bound outputs. Immutable once built; a mutated task
/// instance triggers a fresh construction rather than an in-place edit.
#[derive(Debug)]
pub struct Workflow {
    spec: Arc<TaskSpec>,
    graph: Graph<Node, ()>,
    order: Vec<NodeIndex>,
    inputs: Vec<(String, Binding)>,
    outputs: Vec<(String, Binding)>,
}

impl Workflow {
    /// Builds (or fetches from `cache`) the workflow graph for a
    /// workflow-backed task instance, with the default absorption policy.
    pub fn construct(
        task: &TaskInstance,
        cache: &ConstructionCache,
    ) -> Result<Arc<Workflow>, ConstructionError> {
        Self::construct_with(task, cache, AbsorptionPolicy::default())
    }

    /// Like [`Workflow::construct`], with an explicit policy for whether
    /// sequence-typed consumers absorb upstream open axes.
    pub fn construct_with(
        task: &TaskInstance,
        cache: &ConstructionCache,
        policy: AbsorptionPolicy,
    ) -> Result<Arc<Workflow>, ConstructionError> {
        let TaskKind::Graph { constructor } = task.spec().kind() else {
            return Err(ConstructionError::NotAWorkflow(
                task.spec().name().to_string(),
            ));
        };

        cache.get_or_construct(task, || {
            let span = tracing::debug_span!("construct", workflow = %task.spec().name());
            let _guard = span.enter();

            // Lazy instance values become references to the workflow's own
            // unresolved inputs; concrete values pass through.
            let inputs = task
                .bindings()
                .map(|(field, binding)| {
                    let resolved = match binding {
                        Binding::Lazy(_) => Binding::Lazy(LazyField::workflow_input(
                            field.name(),
                            field.ty().clone(),
                        )),
                        concrete => concrete.clone(),
                    };
                    (field.name().to_string(), resolved)
                })
                .collect();

            let mut builder = WorkflowBuilder::new(Arc::clone(task.spec()), inputs, policy);

            let build: &crate::value::BuildFn = &**constructor.build_fn();
            let returned = build(&mut builder).map_err(|err| {
                // Builder errors travel through the userland closure as
                // `anyhow`; unwrap them back into their own variants.
                match err.downcast::<ConstructionError>() {
                    Ok(inner) => inner,
                    Err(other) => ConstructionError::Constructor(other),
                }
            })?;

            builder.finish(returned)
        })
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn spec(&self) -> &Arc<TaskSpec> {
        &self.spec
    }

    /// Nodes in insertion order, which is also a valid dependency order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().map(|&index| &self.graph[index])
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes().map(Node::name).collect()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes().find(|node| node.name() == name)
    }

    /// The workflow's resolved input bindings, in field order.
    pub fn inputs(&self) -> &[(String, Binding)] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Binding> {
        self.inputs
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, binding)| binding)
    }

    /// The workflow's bound outputs, in declared order. Each binding is
    /// either a lazy reference to a node output or a concrete value.
    pub fn outputs(&self) -> &[(String, Binding)] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&Binding> {
        self.outputs
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, binding)| binding)
    }
}

impl std::ops::Index<&str> for Workflow {
    type Output = Node;

    fn index(&self, name: &str) -> &Node {
        self.node(name)
            .unwrap_or_else(|| panic!("workflow '{}' has no node named '{name}'", self.name()))
    }
}

/// Handle returned by [`WorkflowBuilder::add`]: exposes each of the node's
/// declared output fields as a lazy reference for further wiring.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    name: String,
    spec: Arc<TaskSpec>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A lazy reference to the named output field of this node.
    pub fn output(&self, field: &str) -> Result<LazyField, ConstructionError> {
        let declared =
            self.spec
                .output(field)
                .ok_or_else(|| ConstructionError::NoSuchOutput {
                    node: self.name.clone(),
                    field: field.to_string(),
                })?;

        Ok(LazyField::node_output(
            &self.name,
            field,
            declared.ty().clone(),
        ))
    }

    /// The first declared output, for the common single-output case.
    pub fn out(&self) -> LazyField {
        let field = &self.spec.outputs()[0];
        LazyField::node_output(&self.name, field.name(), field.ty().clone())
    }
}

/// The mutable assembly surface handed to a workflow constructor.
pub struct WorkflowBuilder {
    spec: Arc<TaskSpec>,
    graph: Graph<Node, ()>,
    order: Vec<NodeIndex>,
    by_name: HashMap<String, NodeIndex>,
    inputs: Vec<(String, Binding)>,
    outputs_direct: Vec<(String, Binding)>,
    policy: AbsorptionPolicy,
}

impl WorkflowBuilder {
    fn new(spec: Arc<TaskSpec>, inputs: Vec<(String, Binding)>, policy: AbsorptionPolicy) -> Self {
        Self {
            spec,
            graph: Graph::new(),
            order: Vec::new(),
            by_name: HashMap::new(),
            inputs,
            outputs_direct: Vec::new(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// The workflow's resolved value for an input field: a concrete value,
    /// or a lazy reference to the workflow's own unresolved input.
    pub fn input(&self, name: &str) -> Result<Binding, ConstructionError> {
        self.inputs
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, binding)| binding.clone())
            .ok_or_else(|| ConstructionError::UnknownInput {
                workflow: self.spec.name().to_string(),
                field: name.to_string(),
            })
    }

    /// Registers a node under a name derived from its task specification,
    /// disambiguated with a numeric suffix on collision.
    pub fn add(&mut self, task: TaskInstance) -> Result<NodeHandle, ConstructionError> {
        let base = task.spec().name().to_string();

        let name = if self.by_name.contains_key(&base) {
            let mut i = 1;
            loop {
                let candidate = format!("{base}{i}");
                if !self.by_name.contains_key(&candidate) {
                    break candidate;
                }
                i += 1;
            }
        } else {
            base
        };

        self.insert(task, name)
    }

    /// Registers a node under an explicit name. Explicit duplicates are an
    /// error rather than being disambiguated.
    pub fn add_named(
        &mut self,
        task: TaskInstance,
        name: impl Into<String>,
    ) -> Result<NodeHandle, ConstructionError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(ConstructionError::DuplicateNodeName(name));
        }
        self.insert(task, name)
    }

    /// A handle to an already-added node, for wiring via lookup.
    pub fn handle(&self, name: &str) -> Result<NodeHandle, ConstructionError> {
        let index = self
            .by_name
            .get(name)
            .ok_or_else(|| ConstructionError::NoSuchNode(name.to_string()))?;

        Ok(NodeHandle {
            name: name.to_string(),
            spec: Arc::clone(self.graph[*index].task().spec()),
        })
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|&index| &self.graph[index])
    }

    /// Rebinds an input of an already-added node.
    ///
    /// Unobserved nodes may be mutated freely. Once a node's outputs have
    /// been bound downstream, a mutation that would change its derived
    /// state is rejected, because downstream bindings already fixed it.
    pub fn set_input(
        &mut self,
        node: &str,
        field: &str,
        binding: impl Into<Binding>,
    ) -> Result<(), ConstructionError> {
        let index = *self
            .by_name
            .get(node)
            .ok_or_else(|| ConstructionError::NoSuchNode(node.to_string()))?;
        let position = self.position(index);

        let mut task = self.graph[index].task().clone();

        let binding = match binding.into() {
            Binding::Lazy(lazy) => {
                if let Some(target) = lazy.producer() {
                    let earlier = self
                        .by_name
                        .get(target)
                        .map(|&t| self.position(t) < position)
                        .unwrap_or(false);

                    if !earlier {
                        return Err(ConstructionError::ForwardReference {
                            node: node.to_string(),
                            field: field.to_string(),
                            target: target.to_string(),
                        });
                    }
                }

                let consumer = task.spec().input(field).ok_or_else(|| {
                    ConstructionError::UnknownInput {
                        workflow: node.to_string(),
                        field: field.to_string(),
                    }
                })?;
                let split = task.split_fields().iter().any(|f| f == field);

                let (stamped, _) = self.stamp(node, consumer, split, &lazy)?;
                Binding::Lazy(stamped)
            }
            concrete => concrete,
        };

        task.set(field, binding.clone())?;
        let state = self.derive_state(node, &task)?;

        let current = &self.graph[index];
        if current.observed() && state != *current.state() {
            return Err(ConstructionError::AlreadyObserved {
                node: node.to_string(),
                field: field.to_string(),
            });
        }

        if let Binding::Lazy(lazy) = &binding
            && let Some(target) = lazy.producer()
        {
            let upstream = self.by_name[target];
            self.graph[upstream].mark_observed();
            self.graph.update_edge(upstream, index, ());
        }

        self.graph[index].replace(task, state);

        Ok(())
    }

    /// Binds a workflow output field directly, instead of returning it from
    /// the constructor.
    pub fn set_output(
        &mut self,
        name: &str,
        binding: impl Into<Binding>,
    ) -> Result<(), ConstructionError> {
        let declared = self
            .spec
            .output(name)
            .ok_or_else(|| ConstructionError::NoSuchOutput {
                node: self.spec.name().to_string(),
                field: name.to_string(),
            })?
            .clone();

        if self.outputs_direct.iter().any(|(field, _)| field == name) {
            return Err(ConstructionError::OutputBoundTwice(name.to_string()));
        }

        let bound = self.bind_output(&declared, binding.into())?;
        self.outputs_direct.push((name.to_string(), bound));

        Ok(())
    }

    fn insert(
        &mut self,
        mut task: TaskInstance,
        name: String,
    ) -> Result<NodeHandle, ConstructionError> {
        // Stamp every lazy input with its one-time type check, and collect
        // the upstream nodes this node depends on.
        let mut stamped: Vec<(String, LazyField)> = Vec::new();
        let mut upstream: Vec<NodeIndex> = Vec::new();

        for (field, binding) in task.bindings() {
            let Binding::Lazy(lazy) = binding else {
                continue;
            };

            let split = task.split_fields().iter().any(|f| f == field.name());
            let (checked, producer) = self.stamp(&name, field, split, lazy)?;

            if let Some(index) = producer {
                upstream.push(index);
            }
            stamped.push((field.name().to_string(), checked));
        }

        for (field, checked) in stamped {
            task.set(&field, Binding::Lazy(checked))?;
        }

        let state = self.derive_state(&name, &task)?;

        tracing::debug!(node = %name, axes = ?state.open_ids(), "add node");

        let spec = Arc::clone(task.spec());
        let index = self.graph.add_node(Node::new(name.clone(), task, state));

        for dependency in upstream {
            // Binding an output downstream is what makes a node observed.
            self.graph[dependency].mark_observed();
            self.graph.update_edge(dependency, index, ());
        }

        self.order.push(index);
        self.by_name.insert(name.clone(), index);

        Ok(NodeHandle { name, spec })
    }

    /// Performs the one-time compatibility check for binding `lazy` into
    /// the consuming field, returning the stamped reference and the
    /// producing node's index (if it references a node output).
    ///
    /// The producer's declared field type is authoritative; the check is
    /// against the consuming field's declared type, lifted to a sequence
    /// type when the field is split over.
    fn stamp(
        &self,
        node: &str,
        consumer: &Field,
        split: bool,
        lazy: &LazyField,
    ) -> Result<(LazyField, Option<NodeIndex>), ConstructionError> {
        let (produced, producer) = match &lazy.source {
            LazySource::WorkflowInput => {
                let declared = self.spec.input(&lazy.field).ok_or_else(|| {
                    ConstructionError::UnknownInput {
                        workflow: self.spec.name().to_string(),
                        field: lazy.field.clone(),
                    }
                })?;
                (
                    LazyField::workflow_input(&lazy.field, declared.ty().clone()),
                    None,
                )
            }
            LazySource::NodeOutput(target) => {
                let index = *self.by_name.get(target).ok_or_else(|| {
                    ConstructionError::UndeclaredNode {
                        node: node.to_string(),
                        field: consumer.name().to_string(),
                        target: target.clone(),
                    }
                })?;

                let declared = self.graph[index]
                    .task()
                    .spec()
                    .output(&lazy.field)
                    .ok_or_else(|| ConstructionError::NoSuchOutput {
                        node: target.clone(),
                        field: lazy.field.clone(),
                    })?;

                (
                    LazyField::node_output(target, &lazy.field, declared.ty().clone()),
                    Some(index),
                )
            }
        };

        let expected = if split {
            TypeSpec::list(consumer.ty().clone())
        } else {
            consumer.ty().clone()
        };

        let checked = match produced.checked_against(&expected) {
            Some(checked) => Some(checked),
            // A replicated producer delivers one element per combination, so
            // a sequence-typed consumer may collect them: the producer only
            // has to match the consumer's element type.
            None => {
                let replicated = producer
                    .is_some_and(|index| self.graph[index].state().open().next().is_some());
                let collects = !split
                    && consumer
                        .ty()
                        .element()
                        .is_some_and(|element| produced.ty.is_compatible_with(element));

                (replicated && collects).then(|| {
                    let mut checked = produced.clone();
                    checked.type_checked = true;
                    checked
                })
            }
        };

        let checked = checked.ok_or_else(|| ConstructionError::TypeMismatch {
            node: node.to_string(),
            field: consumer.name().to_string(),
            expected: expected.to_string(),
            found: produced.ty.to_string(),
        })?;

        Ok((checked, producer))
    }

    /// Computes a node's replication state from its task instance: its own
    /// split axes, plus every open axis inherited across lazy inputs, minus
    /// the axes its combiner closes.
    fn derive_state(&self, node: &str, task: &TaskInstance) -> Result<State, ConstructionError> {
        let mut state = State::new();

        for field in task.split_fields() {
            let len = match task.get(field) {
                Some(Binding::Concrete(crate::value::Value::List(items))) => Some(items.len()),
                _ => None,
            };
            state.declare(Axis::new(node, field, len));
        }

        for (field, binding) in task.bindings() {
            let Binding::Lazy(lazy) = binding else {
                continue;
            };
            let Some(target) = lazy.producer() else {
                continue;
            };

            let upstream = &self.graph[self.by_name[target]];
            let open: Vec<Axis> = upstream.state().open().cloned().collect();

            if open.is_empty() {
                continue;
            }

            // A sequence-typed consumer may take the replicated results as
            // one aggregate list, ending axis propagation on this edge.
            if self.policy.absorbs(&lazy.ty, field.ty()) {
                continue;
            }

            for axis in open {
                state.inherit(axis, target);
            }
        }

        for axis in task.combines() {
            state
                .combine(node, axis)
                .map_err(|(id, open)| ConstructionError::UnknownAxis {
                    node: node.to_string(),
                    axis: id,
                    available: open.join(", "),
                })?;
        }

        Ok(state)
    }

    /// Checks and stamps one output binding against its declared field, and
    /// marks the producing node observed.
    fn bind_output(
        &mut self,
        declared: &Field,
        binding: Binding,
    ) -> Result<Binding, ConstructionError> {
        match binding {
            Binding::Lazy(lazy) => {
                let name = self.spec.name().to_string();
                let (checked, producer) = self.stamp(&name, declared, false, &lazy)?;

                if let Some(index) = producer {
                    self.graph[index].mark_observed();
                }

                Ok(Binding::Lazy(checked))
            }
            concrete => Ok(concrete),
        }
    }

    /// Finalizes the workflow after the constructor has returned, binding
    /// each declared output field exactly once: positionally from the
    /// returned values, or from a prior direct assignment.
    fn finish(mut self, returned: Vec<Binding>) -> Result<Workflow, ConstructionError> {
        let declared: Vec<Field> = self.spec.outputs().to_vec();

        let unbound: Vec<&Field> = declared
            .iter()
            .filter(|field| {
                !self
                    .outputs_direct
                    .iter()
                    .any(|(name, _)| name == field.name())
            })
            .collect();

        if returned.len() != unbound.len() {
            if returned.is_empty() {
                return Err(ConstructionError::OutputUnbound(
                    unbound[0].name().to_string(),
                ));
            }
            return Err(ConstructionError::OutputCount {
                expected: unbound.len(),
                found: returned.len(),
            });
        }

        let mut positional: Vec<(String, Binding)> = Vec::with_capacity(returned.len());
        for (field, binding) in unbound.iter().zip(returned) {
            let bound = self.bind_output(field, binding)?;
            positional.push((field.name().to_string(), bound));
        }

        // Declared order, regardless of how each output was bound.
        let outputs = declared
            .iter()
            .map(|field| {
                let name = field.name();
                let binding = self
                    .outputs_direct
                    .iter()
                    .chain(&positional)
                    .find(|(bound, _)| bound == name)
                    .map(|(_, binding)| binding.clone())
                    .expect("every output field was bound above");
                (name.to_string(), binding)
            })
            .collect();

        Ok(Workflow {
            spec: self.spec,
            graph: self.graph,
            order: self.order,
            inputs: self.inputs,
            outputs,
        })
    }

    fn position(&self, index: NodeIndex) -> usize {
        self.order
            .iter()
            .position(|&i| i == index)
            .expect("node index is always registered in insertion order")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::field::Field;
    use crate::state::Splitter;
    use crate::value::{Callable, Constructor, Value};

    fn add_task() -> Arc<TaskSpec> {
        TaskSpec::function(
            "Add",
            Callable::new("add/v1", |_| Ok(vec![Value::Nothing])),
            ["x", "y"],
        )
        .returns(TypeSpec::union([TypeSpec::Int, TypeSpec::Float]))
        .build()
        .unwrap()
    }

    fn mul_task() -> Arc<TaskSpec> {
        TaskSpec::function(
            "Mul",
            Callable::new("mul/v1", |_| Ok(vec![Value::Nothing])),
            ["x", "y"],
        )
        .returns(TypeSpec::Float)
        .build()
        .unwrap()
    }

    fn sum_task() -> Arc<TaskSpec> {
        TaskSpec::function(
            "Sum",
            Callable::new("sum/v1", |_| Ok(vec![Value::Nothing])),
            ["x"],
        )
        .input(Field::new("x", TypeSpec::list(TypeSpec::Float)))
        .returns(TypeSpec::Float)
        .build()
        .unwrap()
    }

    #[test]
    fn constructs_a_linear_graph() {
        let cache = ConstructionCache::new();
        let (add, mul) = (add_task(), mul_task());

        let constructor = Constructor::new("linear/v1", move |wf| {
            let sum = wf.add(add.instantiate([("x", wf.input("a")?), ("y", wf.input("b")?)])?)?;
            let product = wf.add(mul.instantiate([
                ("x", Binding::from(sum.output("out")?)),
                ("y", wf.input("b")?),
            ])?)?;
            Ok(vec![product.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("MyTestWorkflow", constructor)
            .input(Field::new("a", TypeSpec::Int))
            .input(Field::new("b", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec
            .instantiate([("a", Binding::from(1)), ("b", Binding::from(2.0))])
            .unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        assert_eq!(wf.node_names(), ["Add", "Mul"]);
        assert_eq!(wf.input("a"), Some(&Binding::Concrete(Value::Int(1))));

        let bound = wf["Mul"].task().get("x").unwrap().as_lazy().unwrap();
        assert_eq!(bound.producer(), Some("Add"));
        assert!(bound.type_checked);

        let out = wf.output("out").unwrap().as_lazy().unwrap();
        assert_eq!(out.to_string(), "Mul.out");
        assert!(out.type_checked);

        // Both nodes have had their outputs bound downstream.
        assert!(wf["Add"].observed());
        assert!(wf["Mul"].observed());
    }

    #[test]
    fn lazy_instance_inputs_become_workflow_references() {
        let cache = ConstructionCache::new();
        let add = add_task();

        let constructor = Constructor::new("pass/v1", move |wf| {
            let sum = wf.add(add.instantiate([("x", wf.input("a")?), ("y", wf.input("b")?)])?)?;
            Ok(vec![sum.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Pass", constructor)
            .input(Field::new("a", TypeSpec::Int))
            .input(Field::new("b", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec
            .instantiate([(
                "a",
                LazyField::node_output("outer", "value", TypeSpec::Int),
            )])
            .unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        let bound = wf["Add"].task().get("x").unwrap().as_lazy().unwrap();
        assert_eq!(bound.source, LazySource::WorkflowInput);
        assert_eq!(bound.field, "a");
        assert!(bound.type_checked);

        // The concrete instance value passed straight through.
        assert_eq!(
            wf["Add"].task().get("y"),
            Some(&Binding::Concrete(Value::Nothing)),
        );
    }

    #[test]
    fn derived_node_names_disambiguate() {
        let cache = ConstructionCache::new();
        let add = add_task();

        let constructor = Constructor::new("twice/v1", move |wf| {
            let first = wf.add(add.instantiate([("x", wf.input("a")?)])?)?;
            let second = wf.add(add.instantiate([("x", first.output("out")?)])?)?;
            Ok(vec![second.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Twice", constructor)
            .input(Field::new("a", TypeSpec::Int))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();
        assert_eq!(wf.node_names(), ["Add", "Add1"]);
    }

    #[test]
    fn explicit_duplicate_names_fail() {
        let cache = ConstructionCache::new();
        let add = add_task();

        let constructor = Constructor::new("clash/v1", move |wf| {
            wf.add_named(add.instantiate([("x", wf.input("a")?)])?, "node")?;
            let second = wf.add_named(add.instantiate([("x", wf.input("a")?)])?, "node")?;
            Ok(vec![second.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Clash", constructor)
            .input(Field::new("a", TypeSpec::Int))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1)]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("has already been added"));
    }

    #[test]
    fn split_and_combine_axes() {
        let cache = ConstructionCache::new();
        let (mul, sum) = (mul_task(), sum_task());

        let constructor = Constructor::new("split_combine/v1", move |wf| {
            let product = wf.add(
                mul.instantiate::<_, &str, Binding>([])?
                    .split([
                        ("x", vec![1.0, 2.0, 3.0]),
                        ("y", vec![10.0, 100.0, 1000.0]),
                    ])?
                    .combine(["x"]),
            )?;
            let total = wf.add(sum.instantiate([("x", product.output("out")?)])?)?;
            Ok(vec![total.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("SplitCombine", constructor)
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate::<_, &str, Binding>([]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        assert_eq!(wf["Mul"].splitter(), Splitter::axes(["Mul.x", "Mul.y"]));
        assert_eq!(wf["Mul"].combiner(), ["Mul.x"]);
        assert_eq!(wf["Mul"].state().open_ids(), ["Mul.y"]);
        assert_eq!(wf["Mul"].state().combinations(), Some(3));

        // The sequence-typed consumer takes the replicated results as one
        // aggregate list, so no axis propagates to it.
        assert_eq!(wf["Sum"].splitter(), Splitter::None);
    }

    #[test]
    fn inherit_policy_propagates_axes_to_sequence_consumers() {
        let cache = ConstructionCache::new();
        let (mul, sum) = (mul_task(), sum_task());

        let constructor = Constructor::new("inherit_all/v1", move |wf| {
            let product = wf.add(
                mul.instantiate::<_, &str, Binding>([])?
                    .split([("x", vec![1.0, 2.0, 3.0])])?,
            )?;
            let total = wf.add(sum.instantiate([("x", product.output("out")?)])?)?;
            Ok(vec![total.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("InheritAll", constructor)
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate::<_, &str, Binding>([]).unwrap();
        let wf =
            Workflow::construct_with(&task, &cache, AbsorptionPolicy::Inherit).unwrap();

        assert_eq!(wf["Sum"].splitter(), Splitter::inherited(["Mul"]));
        assert_eq!(wf["Sum"].state().open_ids(), ["Mul.x"]);
    }

    #[test]
    fn downstream_nodes_inherit_open_axes() {
        let cache = ConstructionCache::new();
        let (mul, add) = (mul_task(), add_task());

        let constructor = Constructor::new("inherited/v1", move |wf| {
            let product = wf.add(
                mul.instantiate::<_, &str, Binding>([])?
                    .split([("x", vec![1.0, 2.0, 3.0]), ("y", vec![4.0, 5.0, 6.0])])?,
            )?;
            let sum = wf.add(
                add.instantiate([("x", Binding::from(product.output("out")?)), ("y", wf.input("c")?)])?
                    .combine(["Mul.x"]),
            )?;
            Ok(vec![sum.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Inherited", constructor)
            .input(Field::new("c", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("c", 2.0)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        assert_eq!(wf["Mul"].splitter(), Splitter::axes(["Mul.x", "Mul.y"]));
        assert_eq!(wf["Mul"].combiner(), Vec::<String>::new());

        // The downstream node is replicated purely by inheritance and may
        // combine the upstream axis by its dotted name.
        assert_eq!(wf["Add"].splitter(), Splitter::inherited(["Mul"]));
        assert_eq!(wf["Add"].combiner(), ["Mul.x"]);
        assert_eq!(wf["Add"].state().open_ids(), ["Mul.y"]);
    }

    #[test]
    fn combining_an_unknown_axis_fails() {
        let cache = ConstructionCache::new();
        let mul = mul_task();

        let constructor = Constructor::new("bad_combine/v1", move |wf| {
            let product = wf.add(
                mul.instantiate::<_, &str, Binding>([])?
                    .split([("x", vec![1.0, 2.0])])?
                    .combine(["z"]),
            )?;
            Ok(vec![product.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("BadCombine", constructor)
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate::<_, &str, Binding>([]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("Unknown axis 'Mul.z'"));
    }

    #[test]
    fn observed_nodes_reject_state_changing_mutation() {
        let cache = ConstructionCache::new();
        let (add, mul) = (add_task(), mul_task());

        let constructor = Constructor::new("frozen/v1", move |wf| {
            let plain = wf.add_named(
                add.instantiate([("x", wf.input("a")?), ("y", wf.input("b")?)])?,
                "add1",
            )?;
            let fanned = wf.add_named(
                add.instantiate([("x", wf.input("a")?)])?
                    .split([("y", vec![1.0, 2.0])])?,
                "add2",
            )?;
            let first = wf.add_named(
                mul.instantiate([
                    ("x", Binding::from(plain.output("out")?)),
                    ("y", wf.input("b")?),
                ])?,
                "mul1",
            )?;
            let second = wf.add_named(
                mul.instantiate([
                    ("x", Binding::from(first.output("out")?)),
                    ("y", wf.input("b")?),
                ])?,
                "mul2",
            )?;

            // mul1's output is already bound into mul2; rebinding its input
            // to a split producer would change its state.
            let err = wf
                .set_input("mul1", "x", fanned.output("out")?)
                .unwrap_err();
            assert!(
                err.to_string()
                    .contains("have already been accessed and therefore cannot set"),
            );

            Ok(vec![second.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Frozen", constructor)
            .input(Field::new("a", TypeSpec::Float))
            .input(Field::new("b", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1.0), ("b", 2.0)]).unwrap();
        Workflow::construct(&task, &cache).unwrap();
    }

    #[test]
    fn state_preserving_mutation_of_observed_nodes_is_allowed() {
        let cache = ConstructionCache::new();
        let (add, mul) = (add_task(), mul_task());

        let constructor = Constructor::new("retune/v1", move |wf| {
            let sum = wf.add(add.instantiate([("x", wf.input("a")?), ("y", wf.input("b")?)])?)?;
            let product = wf.add(mul.instantiate([("x", sum.output("out")?)])?)?;

            // Observed, but a concrete rebind leaves the state untouched.
            wf.set_input("Add", "y", 3.0)?;

            Ok(vec![product.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Retune", constructor)
            .input(Field::new("a", TypeSpec::Float))
            .input(Field::new("b", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1.0), ("b", 2.0)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();
        assert_eq!(
            wf["Add"].task().get("y"),
            Some(&Binding::Concrete(Value::Float(3.0))),
        );
    }

    #[test]
    fn forward_references_fail() {
        let cache = ConstructionCache::new();
        let (add, mul) = (add_task(), mul_task());

        let constructor = Constructor::new("forward/v1", move |wf| {
            let sum = wf.add(add.instantiate([("x", wf.input("a")?)])?)?;
            let product = wf.add(mul.instantiate([("x", sum.output("out")?)])?)?;

            let err = wf
                .set_input("Add", "y", product.output("out")?)
                .unwrap_err();
            assert!(err.to_string().contains("not strictly earlier"));

            Ok(vec![product.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Forward", constructor)
            .input(Field::new("a", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1.0)]).unwrap();
        Workflow::construct(&task, &cache).unwrap();
    }

    #[test]
    fn incompatible_lazy_bindings_fail() {
        let cache = ConstructionCache::new();
        let sum = sum_task();

        let name = TaskSpec::function(
            "Name",
            Callable::new("name/v1", |_| Ok(vec![Value::Nothing])),
            ["s"],
        )
        .returns(TypeSpec::Str)
        .build()
        .unwrap();

        let constructor = Constructor::new("mismatch/v1", move |wf| {
            let label = wf.add(name.instantiate([("s", wf.input("s")?)])?)?;
            let total = wf.add(sum.instantiate([("x", label.output("out")?)])?)?;
            Ok(vec![total.output("out")?.into()])
        });

        let spec = TaskSpec::workflow("Mismatch", constructor)
            .input(Field::new("s", TypeSpec::Str))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("s", "label")]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("Incompatible lazy field"));
    }

    #[test]
    fn outputs_can_be_assigned_directly() {
        let cache = ConstructionCache::new();
        let add = add_task();

        let constructor = Constructor::new("direct/v1", move |wf| {
            let sum = wf.add(add.instantiate([("x", wf.input("a")?)])?)?;
            wf.set_output("out", sum.output("out")?)?;

            let err = wf.set_output("out", sum.output("out")?).unwrap_err();
            assert!(err.to_string().contains("already bound"));

            Ok(vec![])
        });

        let spec = TaskSpec::workflow("Direct", constructor)
            .input(Field::new("a", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1.0)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        let out = wf.output("out").unwrap().as_lazy().unwrap();
        assert_eq!(out.to_string(), "Add.out");
        assert!(wf["Add"].observed());
    }

    #[test]
    fn unbound_and_miscounted_outputs_fail() {
        let cache = ConstructionCache::new();

        let silent = Constructor::new("silent/v1", |_| Ok(vec![]));
        let spec = TaskSpec::workflow("Silent", silent)
            .outputs(["out"])
            .build()
            .unwrap();
        let task = spec.instantiate::<_, &str, Binding>([]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("was never bound"));

        let noisy = Constructor::new("noisy/v1", |_| {
            Ok(vec![Binding::from(1), Binding::from(2)])
        });
        let spec = TaskSpec::workflow("Noisy", noisy)
            .outputs(["out"])
            .build()
            .unwrap();
        let task = spec.instantiate::<_, &str, Binding>([]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("returned 2 output values"));
    }

    #[test]
    fn process_backed_nodes_wire_like_functions() {
        let cache = ConstructionCache::new();

        let convert = TaskSpec::process("ConvertAudio", "ffmpeg")
            .input(Field::new("in_file", TypeSpec::File("audio/wav".into())))
            .outputs_typed([("out_file", TypeSpec::File("audio/mp3".into()))])
            .build()
            .unwrap();

        let trim = TaskSpec::process("TrimAudio", "trim-audio")
            .input(Field::new("in_audio", TypeSpec::File("audio/mp3".into())))
            .input(Field::new("duration", TypeSpec::Float).with_default(30.0))
            .outputs_typed([("out_audio", TypeSpec::File("audio/mp3".into()))])
            .build()
            .unwrap();

        let constructor = Constructor::new("mp3_pipeline/v1", move |wf| {
            let converted =
                wf.add(convert.instantiate([("in_file", wf.input("recording")?)])?)?;
            let trimmed =
                wf.add(trim.instantiate([("in_audio", converted.output("out_file")?)])?)?;
            Ok(vec![trimmed.output("out_audio")?.into()])
        });

        let spec = TaskSpec::workflow("Mp3Pipeline", constructor)
            .input(Field::new("recording", TypeSpec::File("audio/wav".into())))
            .outputs_typed([("out", TypeSpec::File("audio/mp3".into()))])
            .build()
            .unwrap();

        let task = spec
            .instantiate([(
                "recording",
                LazyField::node_output("mic", "audio", TypeSpec::File("audio/wav".into())),
            )])
            .unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        assert_eq!(wf.node_names(), ["ConvertAudio", "TrimAudio"]);

        // The command template rides along as an ordinary concrete field,
        // and undeclared fields fall back to their defaults.
        let node = &wf["TrimAudio"];
        assert_eq!(
            node.task().get("executable"),
            Some(&Binding::Concrete(Value::Str("trim-audio".into()))),
        );
        assert_eq!(
            node.task().get("duration"),
            Some(&Binding::Concrete(Value::Float(30.0))),
        );

        let bound = node.task().get("in_audio").unwrap().as_lazy().unwrap();
        assert_eq!(bound.producer(), Some("ConvertAudio"));
        assert!(bound.type_checked);
    }

    #[test]
    fn nested_workflows_are_constructed_on_demand() {
        let cache = ConstructionCache::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let add = add_task();
        let counted = Arc::clone(&builds);
        let inner_ctor = Constructor::new("inner/v1", move |wf| {
            counted.fetch_add(1, Ordering::SeqCst);
            let sum = wf.add(add.instantiate([("x", wf.input("a")?)])?)?;
            Ok(vec![sum.output("out")?.into()])
        });
        let inner = TaskSpec::workflow("Inner", inner_ctor)
            .input(Field::new("a", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let nested_spec = Arc::clone(&inner);
        let outer_ctor = Constructor::new("outer/v1", move |wf| {
            let nested = wf.add(nested_spec.instantiate([("a", wf.input("a")?)])?)?;
            Ok(vec![nested.output("out")?.into()])
        });
        let outer = TaskSpec::workflow("Outer", outer_ctor)
            .input(Field::new("a", TypeSpec::Float))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = outer.instantiate([("a", 1.0)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        // Adding a workflow-backed node does not run its constructor.
        assert_eq!(wf.node_names(), ["Inner"]);
        assert!(wf["Inner"].is_subgraph());
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let nested = Workflow::construct(wf["Inner"].task(), &cache).unwrap();
        assert_eq!(nested.node_names(), ["Add"]);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    fn countdown_spec() -> Arc<TaskSpec> {
        let constructor = Constructor::new("countdown/v1", |wf: &mut WorkflowBuilder| {
            let decrement = TaskSpec::function(
                "Decrement",
                Callable::new("decrement/v1", |_| Ok(vec![Value::Nothing])),
                ["x"],
            )
            .returns(TypeSpec::Int)
            .build()?;

            let depth = wf.input("depth")?;
            let step = wf.add(decrement.instantiate([("x", depth.clone())])?)?;

            if let Binding::Concrete(Value::Int(d)) = depth
                && d > 0
            {
                let nested =
                    wf.add(countdown_spec().instantiate([("depth", step.output("out")?)])?)?;
                Ok(vec![nested.output("out")?.into()])
            } else {
                Ok(vec![step.output("out")?.into()])
            }
        });

        TaskSpec::workflow("Countdown", constructor)
            .input(Field::new("depth", TypeSpec::Int))
            .outputs(["out"])
            .build()
            .unwrap()
    }

    #[test]
    fn recursive_workflows_terminate() {
        let cache = ConstructionCache::new();

        let task = countdown_spec().instantiate([("depth", 3)]).unwrap();
        let wf = Workflow::construct(&task, &cache).unwrap();

        // The nested instance's depth is lazy, so recursion stops after one
        // level of eager construction.
        assert_eq!(wf.node_names(), ["Decrement", "Countdown"]);

        let nested = Workflow::construct(wf["Countdown"].task(), &cache).unwrap();
        assert_eq!(nested.node_names(), ["Decrement"]);
    }

    #[test]
    fn unknown_workflow_inputs_fail() {
        let cache = ConstructionCache::new();

        let constructor = Constructor::new("typo/v1", |wf: &mut WorkflowBuilder| {
            wf.input("nope")?;
            Ok(vec![])
        });
        let spec = TaskSpec::workflow("Typo", constructor)
            .input(Field::new("a", TypeSpec::Int))
            .outputs(["out"])
            .build()
            .unwrap();

        let task = spec.instantiate([("a", 1)]).unwrap();
        let err = Workflow::construct(&task, &cache).unwrap_err();
        assert!(err.to_string().contains("has no input named 'nope'"));
    }
}
