//! # OCM Core
//!
//! The operations-control runtime for a robot: user-defined computational
//! units ("nodes") bound into real-time tasks, tasks bound into activation
//! groups, and an orchestrator that switches the live group atomically on
//! external command.
//!
//! The building blocks:
//!
//! - **Nodes**: user code behind the seven-method [`Node`] contract
//!   (construct/init/execute/output plus the enter/exit handshake)
//! - **Tasks**: one RT thread each, woken by an internal periodic clock,
//!   an external ticker, or an event trigger
//! - **Groups**: mutually-exclusive bags of tasks; the [`Executer`]
//!   switches them with a lossless two-phase handshake
//! - **IPC**: named shared-memory topics with latest-value-wins delivery
//! - **Debug**: lock-free fan-out of tagged samples over UDP multicast
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ocm_core::{Executer, ExecuterConfig, Node, NodeMap, OcmResult};
//!
//! struct Imu;
//!
//! impl Node for Imu {
//!     fn execute(&mut self) -> OcmResult<()> {
//!         // read the sensor
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> OcmResult<()> {
//!     let mut nodes = NodeMap::new();
//!     nodes.add("imu", Box::new(Imu))?;
//!
//!     let config = ExecuterConfig::from_file("ocm.yaml".as_ref())?;
//!     let executer = Executer::new(config, Arc::new(nodes), "ocm_desired_group")?;
//!     executer.create_task()?;
//!     executer.init_task();
//!     // ... run until shutdown ...
//!     executer.exit_all();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod debug;
pub mod error;
pub mod executer;
pub mod ipc;
pub mod scheduling;

// Re-export the types an embedding application touches.
pub use config::{
    ExecuterConfig, ExecuterSetting, GroupSetting, GroupTaskSetting, LaunchSetting, NodeConfig,
    SystemSetting, TaskList, TaskSetting, TimerSetting, TimerType,
};
pub use self::core::{AtomicHandle, Node, NodeHandle, NodeMap, NodeState};
pub use debug::{DebugHub, DebugHubConfig};
pub use error::{OcmError, OcmResult};
pub use executer::{DesiredGroupData, Executer, EMPTY_INIT};
pub use ipc::{NamedSemaphore, SharedBuffer, SharedMemoryTopic, TopicMessage, NAME_PREFIX};
pub use scheduling::{NodeTask, SleepStrategy, TaskRunner, TaskState};
