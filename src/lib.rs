#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod engine;
mod error;
mod field;
mod hash;
mod lazy;
mod spec;
mod state;
mod types;
mod value;

pub use crate::engine::{ConstructionCache, Node, NodeHandle, Workflow, WorkflowBuilder};
pub use crate::error::{ConstructionError, DefinitionError, HashError};
pub use crate::field::{Field, HashPolicy};
pub use crate::hash::{Hash32, fold_fields, hash_identity, hash_value};
pub use crate::lazy::{LazyField, LazySource};
pub use crate::spec::{TaskInstance, TaskKind, TaskSpec, TaskSpecBuilder};
pub use crate::state::{AbsorptionPolicy, Axis, Splitter, State};
pub use crate::types::TypeSpec;
pub use crate::value::{Binding, Callable, Constructor, ContentValue, Value};

/// Installs a global `tracing` subscriber reading its filter from the
/// `WEFT_LOG` environment variable. Intended for binaries and tests; library
/// users wiring their own subscriber should skip this.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_env("WEFT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
