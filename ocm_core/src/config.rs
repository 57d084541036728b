//! Typed configuration for the runtime.
//!
//! The core consumes these values: it does not own configuration loading.
//! The serde derives plus [`ExecuterConfig::from_yaml`]/
//! [`ExecuterConfig::from_file`] exist for embedders and tests; an
//! application is equally free to build the structs in code.
//!
//! # Example YAML
//!
//! ```yaml
//! executer_setting:
//!   package_name: ocm
//!   timer_setting: { timer_type: INTERNAL_TIMER, period: 0.002 }
//!   system_setting: { priority: 90, cpu_affinity: [2] }
//!   idle_system_setting: { priority: 0, cpu_affinity: [] }
//!   all_priority_enable: true
//!   all_cpu_affinity_enable: true
//! task_list:
//!   resident_group:
//!     state_estimator:
//!       task_name: state_estimator
//!       node_list:
//!         - { node_name: imu, output_enable: true }
//!       timer_setting: { timer_type: INTERNAL_TIMER, period: 0.001 }
//!       system_setting: { priority: 95, cpu_affinity: [3] }
//!       launch_setting: { pre_node: [], delay: 0.0 }
//!   standby_group:
//!     leg_control:
//!       task_name: leg_control
//!       node_list:
//!         - { node_name: pd_controller, output_enable: true }
//!       timer_setting: { timer_type: EXTERNAL_TIMER, period: 0.002 }
//!       system_setting: { priority: 95, cpu_affinity: [4] }
//! exclusive_task_group:
//!   pdstand:
//!     group_name: pdstand
//!     task_list:
//!       leg_control:
//!         task_name: leg_control
//!         force_init_node: [pd_controller]
//!         pre_node: [imu]
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OcmResult;

/// Wake-up source of a task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimerType {
    /// Self-clocked periodic loop on the monotonic clock.
    #[default]
    #[serde(rename = "INTERNAL_TIMER")]
    Internal,
    /// Counts ticks posted by an external periodic ticker.
    #[serde(rename = "EXTERNAL_TIMER")]
    External,
    /// One wake per external post; event-driven tasks.
    #[serde(rename = "TRIGGER")]
    Trigger,
}

/// A node's membership in a task, with its output switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,
    #[serde(default)]
    pub output_enable: bool,
}

/// Timer source and period of a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimerSetting {
    pub timer_type: TimerType,
    /// Period in seconds. Ignored by [`TimerType::Trigger`].
    pub period: f64,
}

/// RT scheduling parameters applied to a task thread.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemSetting {
    /// SCHED_FIFO priority; 0 leaves the policy untouched.
    pub priority: i32,
    /// CPU cores to pin to; empty inherits the parent mask.
    pub cpu_affinity: Vec<usize>,
}

/// Boot behavior of a resident task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LaunchSetting {
    /// Nodes that must be RUNNING before this task starts.
    pub pre_node: Vec<String>,
    /// Delay in seconds between the start signal and the first wake.
    pub delay: f64,
}

/// Complete definition of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSetting {
    pub task_name: String,
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub timer_setting: TimerSetting,
    #[serde(default)]
    pub system_setting: SystemSetting,
    #[serde(default)]
    pub launch_setting: LaunchSetting,
}

/// A task's role inside an exclusive group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GroupTaskSetting {
    pub task_name: String,
    /// Nodes re-initialized on every activation of the group, even when
    /// they stayed running through the transition.
    pub force_init_node: Vec<String>,
    /// Nodes that must be RUNNING before this task starts during a
    /// transition.
    pub pre_node: Vec<String>,
}

/// One exclusive group: a named bag of standby tasks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GroupSetting {
    pub group_name: String,
    pub task_list: HashMap<String, GroupTaskSetting>,
}

/// All defined tasks, split by role.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskList {
    /// Started once at boot, never stopped by a transition.
    pub resident_group: HashMap<String, TaskSetting>,
    /// Run only while their owning exclusive group is active.
    pub standby_group: HashMap<String, TaskSetting>,
}

/// Settings of the orchestrator's own task thread.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecuterSetting {
    pub package_name: String,
    pub timer_setting: TimerSetting,
    pub system_setting: SystemSetting,
    /// Applied to stopping/stopped task threads.
    pub idle_system_setting: SystemSetting,
    /// Global gate for every priority application.
    pub all_priority_enable: bool,
    /// Global gate for every affinity application.
    pub all_cpu_affinity_enable: bool,
}

/// Root configuration consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecuterConfig {
    pub executer_setting: ExecuterSetting,
    pub task_list: TaskList,
    pub exclusive_task_group: HashMap<String, GroupSetting>,
}

impl ExecuterConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(content: &str) -> OcmResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse a configuration from a YAML file.
    pub fn from_file(path: &Path) -> OcmResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}
