//! Graph construction: nodes, the workflow builder, and the memoizing
//! construction cache.

mod cache;
mod node;
mod workflow;

pub use cache::ConstructionCache;
pub use node::Node;
pub use workflow::{NodeHandle, Workflow, WorkflowBuilder};
