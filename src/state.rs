//! The splitter/combiner state algebra.
//!
//! A node's *state* is the ordered set of axes over which its task will be
//! replicated, one execution per element combination. Splitting a node over
//! fields `{x, y}` opens one axis per field, named `"<node>.<field>"`, and
//! axes declared together combine by full Cartesian product. Combining an
//! axis reduces the per-element results back into one ordered sequence and
//! closes the axis.
//!
//! Axes are explicit `(origin, field)` descriptors with open/combined flags;
//! inheritance across graph edges is set algebra over these descriptors, not
//! a string-prefix convention. A node that binds an input to an upstream
//! output inherits every axis the upstream left open, and may combine any
//! inherited axis by its original dotted name.

use crate::types::TypeSpec;

/// Policy for the open design question of sequence-typed consumers: does a
/// field declared as `list[T]` absorb an upstream open axis over `T` as one
/// aggregate value, ending propagation, or inherit it per element?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsorptionPolicy {
    /// A sequence-typed consumer absorbs compatible upstream axes. The
    /// observed behavior of the system this engine models.
    #[default]
    AbsorbSequences,
    /// Upstream open axes always propagate.
    Inherit,
}

impl AbsorptionPolicy {
    /// Whether an edge from a producer field typed `producer` into a
    /// consumer field typed `consumer` absorbs the producer's open axes.
    pub(crate) fn absorbs(self, producer: &TypeSpec, consumer: &TypeSpec) -> bool {
        match self {
            AbsorptionPolicy::Inherit => false,
            AbsorptionPolicy::AbsorbSequences => consumer
                .element()
                .is_some_and(|element| producer.is_compatible_with(element)),
        }
    }
}

/// One replication axis: the splitting node, the split field, and the
/// element count when the split sequence is concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    pub origin: String,
    pub field: String,
    pub len: Option<usize>,
}

impl Axis {
    pub fn new(origin: impl Into<String>, field: impl Into<String>, len: Option<usize>) -> Self {
        Self {
            origin: origin.into(),
            field: field.into(),
            len,
        }
    }

    /// The dotted name, `"<origin>.<field>"`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.origin, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    axis: Axis,
    combined: bool,
    inherited: bool,
}

/// The derived replication state of a node: every axis it has opened or
/// inherited, with open/combined flags, plus the upstream nodes whose state
/// flowed in.
#[derive(Debug, Clone, Default)]
pub struct State {
    slots: Vec<Slot>,
    inherited_from: Vec<String>,
    combine_order: Vec<String>,
}

/// How a node came to be replicated, as reported by [`Node::splitter`](crate::Node::splitter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Splitter {
    /// Runs exactly once.
    None,
    /// Axes the node declared itself, dotted names in declaration order.
    Axes(Vec<String>),
    /// All axes flow in from the referenced upstream nodes.
    Inherited(Vec<String>),
    /// Both declared and inherited axes.
    Mixed {
        inherited: Vec<String>,
        axes: Vec<String>,
    },
}

impl Splitter {
    pub fn axes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Splitter::Axes(names.into_iter().map(Into::into).collect())
    }

    pub fn inherited<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Splitter::Inherited(nodes.into_iter().map(Into::into).collect())
    }
}

impl State {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens an axis declared by the node itself.
    pub(crate) fn declare(&mut self, axis: Axis) {
        self.slots.push(Slot {
            axis,
            combined: false,
            inherited: false,
        });
    }

    /// Inherits an upstream open axis across an edge from `from`.
    ///
    /// Re-inheriting an axis already present (e.g. two inputs bound to the
    /// same upstream node) is a no-op for the axis set.
    pub(crate) fn inherit(&mut self, axis: Axis, from: &str) {
        if !self.inherited_from.iter().any(|n| n == from) {
            self.inherited_from.push(from.to_string());
        }

        let id = axis.id();
        if self.slots.iter().any(|slot| slot.axis.id() == id) {
            return;
        }

        self.slots.push(Slot {
            axis,
            combined: false,
            inherited: true,
        });
    }

    /// Marks an open axis as combined.
    ///
    /// `name` is either a bare field name, resolved against axes the node
    /// (`node`) declared itself, or a full dotted axis name. Returns the
    /// resolved dotted name; on failure, the resolved name together with
    /// the currently open axes, so the error can identify the axis in its
    /// dotted form.
    pub(crate) fn combine(
        &mut self,
        node: &str,
        name: &str,
    ) -> Result<String, (String, Vec<String>)> {
        let id = if name.contains('.') {
            name.to_string()
        } else {
            format!("{node}.{name}")
        };

        let slot = self
            .slots
            .iter_mut()
            .find(|slot| !slot.combined && slot.axis.id() == id);

        match slot {
            Some(slot) => {
                slot.combined = true;
                self.combine_order.push(id.clone());
                Ok(id)
            }
            None => {
                let open = self.open_ids();
                Err((id, open))
            }
        }
    }

    /// Axes still open after the node's combiner has been applied.
    pub fn open(&self) -> impl Iterator<Item = &Axis> {
        self.slots
            .iter()
            .filter(|slot| !slot.combined)
            .map(|slot| &slot.axis)
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.open().map(Axis::id).collect()
    }

    /// Dotted names of the axes combined at this node, in combine order.
    pub fn combined_ids(&self) -> &[String] {
        &self.combine_order
    }

    /// Upstream nodes whose open axes flowed into this state.
    pub fn inherited_from(&self) -> &[String] {
        &self.inherited_from
    }

    /// Number of effective executions: the product of open axis lengths.
    /// `None` when any open axis has an unknown (lazy) length.
    pub fn combinations(&self) -> Option<usize> {
        self.open().map(|axis| axis.len).product()
    }

    /// The splitter view of this state.
    pub fn splitter(&self) -> Splitter {
        let own: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| !slot.inherited)
            .map(|slot| slot.axis.id())
            .collect();

        match (own.is_empty(), self.inherited_from.is_empty()) {
            (true, true) => Splitter::None,
            (false, true) => Splitter::Axes(own),
            (true, false) => Splitter::Inherited(self.inherited_from.clone()),
            (false, false) => Splitter::Mixed {
                inherited: self.inherited_from.clone(),
                axes: own,
            },
        }
    }
}

// Two states are equal when they cover the same axes with the same flags;
// the order in which axes were encountered does not matter.
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        let key = |state: &State| {
            let mut pairs: Vec<(String, bool)> = state
                .slots
                .iter()
                .map(|slot| (slot.axis.id(), slot.combined))
                .collect();
            pairs.sort();
            pairs
        };

        key(self) == key(other)
    }
}

impl Eq for State {}
