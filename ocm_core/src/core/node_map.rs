//! Name → node registry.
//!
//! Insert-once, look-up-many. The map exclusively owns the nodes; tasks
//! and the orchestrator hold `Arc` references into it. Membership is fixed
//! after boot: there is no removal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::node::{Node, NodeHandle};
use crate::error::{OcmError, OcmResult};

#[derive(Debug, Default)]
pub struct NodeMap {
    nodes: HashMap<String, Arc<NodeHandle>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under `name`.
    ///
    /// An empty name is a configuration error. A duplicate insert is
    /// ignored (and logged): the first registration wins.
    pub fn add(&mut self, name: &str, node: Box<dyn Node>) -> OcmResult<()> {
        if name.is_empty() {
            return Err(OcmError::config("node name must not be empty"));
        }
        if self.nodes.contains_key(name) {
            log::warn!("[NodeMap] node '{name}' already registered, ignoring duplicate");
            return Ok(());
        }
        self.nodes
            .insert(name.to_string(), Arc::new(NodeHandle::new(name, node)));
        log::info!("[NodeMap] node '{name}' added");
        Ok(())
    }

    /// Look up a node by name.
    pub fn get(&self, name: &str) -> OcmResult<&Arc<NodeHandle>> {
        self.nodes
            .get(name)
            .ok_or_else(|| OcmError::NotFound(format!("node '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<NodeHandle>)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeState;

    struct NoopNode;

    impl Node for NoopNode {
        fn execute(&mut self) -> OcmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn add_and_get() {
        let mut map = NodeMap::new();
        map.add("imu", Box::new(NoopNode)).unwrap();
        let handle = map.get("imu").unwrap();
        assert_eq!(handle.name(), "imu");
        assert_eq!(handle.state(), NodeState::Init);
    }

    #[test]
    fn duplicate_insert_keeps_first() {
        let mut map = NodeMap::new();
        map.add("imu", Box::new(NoopNode)).unwrap();
        let first = Arc::as_ptr(map.get("imu").unwrap());
        map.add("imu", Box::new(NoopNode)).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(Arc::as_ptr(map.get("imu").unwrap()), first);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let map = NodeMap::new();
        assert!(matches!(map.get("ghost"), Err(OcmError::NotFound(_))));
    }

    #[test]
    fn empty_name_is_config_error() {
        let mut map = NodeMap::new();
        assert!(matches!(
            map.add("", Box::new(NoopNode)),
            Err(OcmError::Config(_))
        ));
    }
}
