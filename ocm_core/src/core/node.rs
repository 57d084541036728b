//! The node contract: the unit of computation the runtime schedules.
//!
//! A node is user code implementing the seven lifecycle methods of
//! [`Node`]. The framework drives them in a fixed pattern:
//!
//! - `construct`: once in the node's lifetime, the first time any task
//!   runs it.
//! - `init`: once per (re)activation; a node can be re-initialized every
//!   time its group becomes active.
//! - `execute` then `output`: every wake of the owning task, in the
//!   task's declared node order.
//! - `try_enter` / `try_exit`: non-destructive probes the orchestrator
//!   repeats each tick during a group transition until the node agrees.
//! - `after_exit`: once, after the node's outgoing tasks have drained.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::OcmResult;

/// Lifecycle state of a node. Driven only by the task runtime (RUNNING at
/// the end of a successful tick) and the orchestrator (STANDBY after
/// `after_exit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Init = 0,
    Running = 1,
    Standby = 2,
}

impl NodeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeState::Running,
            2 => NodeState::Standby,
            _ => NodeState::Init,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Init => write!(f, "INIT"),
            NodeState::Running => write!(f, "RUNNING"),
            NodeState::Standby => write!(f, "STANDBY"),
        }
    }
}

/// User-implemented computational unit.
///
/// Only [`Node::execute`] is mandatory; the other methods default to
/// no-ops that always succeed, so a minimal node is a single function.
/// `try_enter`/`try_exit` returning `false` is not an error: it tells the
/// orchestrator "not yet, ask again next tick".
pub trait Node: Send {
    /// One-time construction, before the first `init`.
    fn construct(&mut self) -> OcmResult<()> {
        Ok(())
    }

    /// Per-activation initialization.
    fn init(&mut self) -> OcmResult<()> {
        Ok(())
    }

    /// Main computation, once per wake of the owning task.
    fn execute(&mut self) -> OcmResult<()>;

    /// Publish results; only called when the task config enables output
    /// for this node.
    fn output(&mut self) -> OcmResult<()> {
        Ok(())
    }

    /// May this node become active now?
    fn try_enter(&mut self) -> bool {
        true
    }

    /// May this node become inactive now?
    fn try_exit(&mut self) -> bool {
        true
    }

    /// Cleanup after the owning tasks stopped; the node is moved to
    /// STANDBY right after this returns.
    fn after_exit(&mut self) {}
}

/// A registered node: the boxed user implementation plus the bookkeeping
/// the framework owns.
///
/// State and the one-shot `constructed` flag are atomics: they are read
/// across threads (orchestrator readiness checks, tests). The node body
/// itself sits behind a mutex; by construction the owning task and the
/// orchestrator never contend for it (a transitioning node's task is
/// stopped or not yet started), the lock makes that invariant sound
/// rather than assumed.
pub struct NodeHandle {
    name: String,
    state: AtomicU8,
    constructed: AtomicBool,
    node: Mutex<Box<dyn Node>>,
}

impl NodeHandle {
    pub fn new(name: impl Into<String>, node: Box<dyn Node>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(NodeState::Init as u8),
            constructed: AtomicBool::new(false),
            node: Mutex::new(node),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether `construct` already ran (it runs at most once, ever).
    pub fn is_constructed(&self) -> bool {
        self.constructed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_constructed(&self) {
        self.constructed.store(true, Ordering::Release);
    }

    /// Exclusive access to the user node for a lifecycle call.
    pub fn node(&self) -> parking_lot::MutexGuard<'_, Box<dyn Node>> {
        self.node.lock()
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("constructed", &self.is_constructed())
            .finish()
    }
}
