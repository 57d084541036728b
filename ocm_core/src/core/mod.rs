//! Core building blocks: the node contract, the node registry, and the
//! atomic snapshot handle.

pub mod handle;
pub mod node;
pub mod node_map;

pub use handle::AtomicHandle;
pub use node::{Node, NodeHandle, NodeState};
pub use node_map::NodeMap;
