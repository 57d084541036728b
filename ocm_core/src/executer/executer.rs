//! The group orchestrator.
//!
//! The executer is itself a periodic task. Each tick it polls the command
//! topic for a new desired group, and when the desired group differs from
//! the current one it drives the transition state machine:
//!
//! 1. probe `try_exit` on every node leaving and `try_enter` on every node
//!    entering, every tick, until both conjunctions hold;
//! 2. stop the outgoing tasks (one-shot) and wait for them to drain to
//!    STANDBY;
//! 3. run `after_exit` on the leaving nodes and park them in STANDBY;
//! 4. start the incoming tasks in pre-node dependency order, marking
//!    `force_init_node ∪ enter_nodes` for re-initialization;
//! 5. flip `current_group` and log the `{exit, enter, init, running}` sets.
//!
//! Resident tasks are started once at boot by [`Executer::init_task`] and
//! are never touched by a transition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use parking_lot::Mutex;

use crate::config::{ExecuterConfig, GroupTaskSetting};
use crate::core::{AtomicHandle, NodeMap, NodeState};
use crate::error::{OcmError, OcmResult};
use crate::executer::desired_group::DesiredGroupData;
use crate::ipc::SharedMemoryTopic;
use crate::scheduling::{NodeTask, TaskRunner, TaskState};

/// Sentinel group name meaning "no group has ever been activated".
pub const EMPTY_INIT: &str = "empty_init";

/// A task waiting to start: its pre-node dependencies plus what to mark
/// for initialization (`None` marks the whole sequence).
struct PendingStart {
    task: Arc<NodeTask>,
    pre_nodes: Vec<String>,
    init_set: Option<BTreeSet<String>>,
}

/// Per-transition scratch state. Only the orchestrator tick touches it.
struct TransitionState {
    in_transition: bool,
    all_exit_ok: bool,
    all_enter_ok: bool,
    stop_issued: bool,
    all_stopped: bool,
    target_group: String,
    /// Last rejected desired value, so a bad command logs once, not at
    /// tick rate.
    desired_history: String,
    target_tasks: Vec<Arc<NodeTask>>,
    current_tasks: Vec<Arc<NodeTask>>,
    target_nodes: BTreeSet<String>,
    current_nodes: BTreeSet<String>,
    enter_nodes: BTreeSet<String>,
    exit_nodes: BTreeSet<String>,
}

impl Default for TransitionState {
    fn default() -> Self {
        Self {
            in_transition: false,
            all_exit_ok: false,
            all_enter_ok: false,
            stop_issued: false,
            all_stopped: false,
            target_group: EMPTY_INIT.to_string(),
            desired_history: EMPTY_INIT.to_string(),
            target_tasks: Vec::new(),
            current_tasks: Vec::new(),
            target_nodes: BTreeSet::new(),
            current_nodes: BTreeSet::new(),
            enter_nodes: BTreeSet::new(),
            exit_nodes: BTreeSet::new(),
        }
    }
}

struct ExecuterInner {
    config: ExecuterConfig,
    node_map: Arc<NodeMap>,
    desired_topic: String,
    topic: Mutex<SharedMemoryTopic>,
    resident: Mutex<HashMap<String, Arc<NodeTask>>>,
    standby: Mutex<HashMap<String, Arc<NodeTask>>>,
    exclusive: Mutex<BTreeSet<String>>,
    current_group: AtomicHandle<String>,
    desired_group: AtomicHandle<String>,
    transition: Mutex<TransitionState>,
}

/// Orchestrates the task groups of one process.
pub struct Executer {
    inner: Arc<ExecuterInner>,
    runner: TaskRunner,
}

impl std::fmt::Debug for Executer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executer").finish_non_exhaustive()
    }
}

impl Executer {
    /// Build the orchestrator and start its own periodic task thread.
    ///
    /// The thread ticks immediately but does nothing useful until
    /// [`create_task`](Self::create_task) and
    /// [`init_task`](Self::init_task) have run.
    pub fn new(
        config: ExecuterConfig,
        node_map: Arc<NodeMap>,
        desired_topic: &str,
    ) -> OcmResult<Self> {
        let setting = config.executer_setting.clone();
        if setting.package_name.is_empty() {
            return Err(OcmError::config("executer package_name must not be empty"));
        }

        let inner = Arc::new(ExecuterInner {
            config,
            node_map,
            desired_topic: desired_topic.to_string(),
            topic: Mutex::new(SharedMemoryTopic::new()),
            resident: Mutex::new(HashMap::new()),
            standby: Mutex::new(HashMap::new()),
            exclusive: Mutex::new(BTreeSet::new()),
            current_group: AtomicHandle::new(EMPTY_INIT.to_string()),
            desired_group: AtomicHandle::new(EMPTY_INIT.to_string()),
            transition: Mutex::new(TransitionState::default()),
        });

        let runner = {
            let inner = Arc::clone(&inner);
            TaskRunner::spawn(
                &setting.package_name,
                setting.timer_setting.timer_type,
                0.0,
                setting.all_priority_enable,
                setting.all_cpu_affinity_enable,
                move || inner.tick(),
            )?
        };
        runner.set_period(setting.timer_setting.period);
        runner.start(&setting.system_setting);

        Ok(Self { inner, runner })
    }

    /// Instantiate every configured task and register the exclusive
    /// groups. Unknown node names, in node lists or pre-node lists,
    /// fail here, before anything starts.
    pub fn create_task(&self) -> OcmResult<()> {
        let inner = &self.inner;
        let flags = &inner.config.executer_setting;

        for (name, setting) in &inner.config.task_list.resident_group {
            self.check_pre_nodes(&setting.launch_setting.pre_node, name)?;
            let task = NodeTask::new(
                setting.clone(),
                &inner.node_map,
                flags.all_priority_enable,
                flags.all_cpu_affinity_enable,
            )?;
            inner.resident.lock().insert(name.clone(), Arc::new(task));
            log::info!("[Executer] task '{name}' added (resident)");
        }

        for (name, setting) in &inner.config.task_list.standby_group {
            let task = NodeTask::new(
                setting.clone(),
                &inner.node_map,
                flags.all_priority_enable,
                flags.all_cpu_affinity_enable,
            )?;
            inner.standby.lock().insert(name.clone(), Arc::new(task));
            log::info!("[Executer] task '{name}' added (standby)");
        }

        for (name, group) in &inner.config.exclusive_task_group {
            for group_task in group.task_list.values() {
                self.check_pre_nodes(&group_task.pre_node, &group_task.task_name)?;
            }
            inner.exclusive.lock().insert(group.group_name.clone());
            log::info!("[Executer] exclusive group '{name}' added");
        }
        Ok(())
    }

    fn check_pre_nodes(&self, pre_nodes: &[String], task_name: &str) -> OcmResult<()> {
        for pre_node in pre_nodes {
            self.inner.node_map.get(pre_node).map_err(|_| {
                OcmError::Config(format!(
                    "task '{task_name}' references unknown pre-node '{pre_node}'"
                ))
            })?;
        }
        Ok(())
    }

    /// Start every resident task, honoring pre-node dependencies.
    ///
    /// Blocks the caller until all resident tasks are started; a pre-node
    /// that never reaches RUNNING stalls here by design (with a warning
    /// once per second). Every node is marked for initialization.
    pub fn init_task(&self) {
        let pending: Vec<PendingStart> = self
            .inner
            .resident
            .lock()
            .values()
            .map(|task| PendingStart {
                task: Arc::clone(task),
                pre_nodes: task.setting().launch_setting.pre_node.clone(),
                init_set: None,
            })
            .collect();
        self.inner.start_when_ready(pending);
    }

    /// Stop and join every task, resident and standby, then give the
    /// system a grace second to settle.
    pub fn exit_all(&self) {
        let idle = self.inner.config.executer_setting.idle_system_setting.clone();
        for task in self.inner.resident.lock().values() {
            task.stop(&idle);
            task.destroy();
        }
        for task in self.inner.standby.lock().values() {
            task.stop(&idle);
            task.destroy();
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    /// Name of the group currently active (`empty_init` before the first
    /// activation).
    pub fn current_group(&self) -> String {
        self.inner.current_group.get()
    }

    /// Most recently commanded group.
    pub fn desired_group(&self) -> String {
        self.inner.desired_group.get()
    }

    pub fn state(&self) -> TaskState {
        self.runner.state()
    }

    /// Stop the orchestrator's own tick thread. Tasks are not touched;
    /// call [`exit_all`](Self::exit_all) first for a full teardown.
    pub fn destroy(&self) {
        self.runner
            .stop(&self.inner.config.executer_setting.idle_system_setting);
        self.runner.destroy();
    }
}

impl ExecuterInner {
    /// One orchestrator tick.
    fn tick(&self) {
        let result = self.topic.lock().subscribe_no_wait(
            &self.desired_topic,
            &self.desired_topic,
            |msg: DesiredGroupData| {
                self.desired_group.store(msg.desired_group);
            },
        );
        if let Err(err) = result {
            log::error!("[Executer] desired-group poll failed: {err}");
        }

        self.transition_check();

        if self.transition.lock().in_transition {
            self.transition_step();
        }
    }

    /// Detect a newly requested switch and set up the scratch sets.
    fn transition_check(&self) {
        let mut guard = self.transition.lock();
        let ts = &mut *guard;
        if ts.in_transition {
            return;
        }
        let desired = self.desired_group.get();
        let current = self.current_group.get();
        if desired == current {
            return;
        }

        if !self.exclusive.lock().contains(&desired) {
            // Log a bad command once per distinct value, then ignore it.
            if ts.desired_history != desired {
                ts.desired_history = desired.clone();
                log::error!(
                    "[Executer] target group {} is not an exclusive group",
                    desired.red()
                );
            }
            return;
        }

        ts.target_tasks.clear();
        ts.current_tasks.clear();
        ts.target_nodes.clear();
        ts.current_nodes.clear();
        ts.enter_nodes.clear();
        ts.exit_nodes.clear();

        self.collect_group(&desired, &mut ts.target_tasks, &mut ts.target_nodes);
        if current != EMPTY_INIT {
            self.collect_group(&current, &mut ts.current_tasks, &mut ts.current_nodes);
        }

        ts.exit_nodes = ts.current_nodes.difference(&ts.target_nodes).cloned().collect();
        ts.enter_nodes = ts.target_nodes.difference(&ts.current_nodes).cloned().collect();

        ts.all_exit_ok = false;
        ts.all_enter_ok = false;
        ts.stop_issued = false;
        ts.all_stopped = false;
        ts.in_transition = true;
        ts.target_group = desired.clone();

        log::info!(
            "[Executer] transition from group {} to group {}",
            current.yellow(),
            desired.yellow()
        );
    }

    /// Resolve a group name to its standby tasks and their node-name set.
    fn collect_group(
        &self,
        group: &str,
        tasks: &mut Vec<Arc<NodeTask>>,
        nodes: &mut BTreeSet<String>,
    ) {
        let Some(group_setting) = self.config.exclusive_task_group.get(group) else {
            return;
        };
        let standby = self.standby.lock();
        for task_name in group_setting.task_list.keys() {
            if let Some(task) = standby.get(task_name) {
                tasks.push(Arc::clone(task));
            }
            if let Some(setting) = self.config.task_list.standby_group.get(task_name) {
                for node in &setting.node_list {
                    nodes.insert(node.node_name.clone());
                }
            }
        }
    }

    /// Advance an in-flight transition by one tick.
    fn transition_step(&self) {
        let mut guard = self.transition.lock();
        let ts = &mut *guard;

        if !(ts.all_exit_ok && ts.all_enter_ok) {
            // Non-destructive probes, repeated every tick until both
            // conjunctions hold. Stopping begins on the following tick.
            ts.all_exit_ok = self.probe_all(&ts.exit_nodes, |node| node.try_exit());
            ts.all_enter_ok = self.probe_all(&ts.enter_nodes, |node| node.try_enter());
            return;
        }

        if !ts.stop_issued {
            ts.stop_issued = true;
            let idle = &self.config.executer_setting.idle_system_setting;
            for task in &ts.current_tasks {
                task.stop(idle);
            }
            return;
        }

        if !ts.all_stopped {
            // Poll, never block: the orchestrator keeps ticking while the
            // outgoing tasks drain.
            ts.all_stopped = ts
                .current_tasks
                .iter()
                .all(|task| task.state() == TaskState::Standby);
            if !ts.all_stopped {
                return;
            }
        }

        self.finish_transition(ts);
    }

    fn probe_all<F>(&self, nodes: &BTreeSet<String>, mut probe: F) -> bool
    where
        F: FnMut(&mut dyn crate::core::Node) -> bool,
    {
        nodes.iter().all(|name| match self.node_map.get(name) {
            Ok(handle) => {
                let mut node = handle.node();
                probe(&mut **node)
            }
            Err(err) => {
                log::error!("[Executer] probe of unknown node '{name}': {err}");
                false
            }
        })
    }

    /// Handshakes passed and the outgoing tasks drained: retire the exit
    /// nodes, start the target tasks, flip the current group.
    fn finish_transition(&self, ts: &mut TransitionState) {
        for name in &ts.exit_nodes {
            if let Ok(handle) = self.node_map.get(name) {
                handle.node().after_exit();
                handle.set_state(NodeState::Standby);
            }
        }

        let group_tasks: HashMap<String, GroupTaskSetting> = self
            .config
            .exclusive_task_group
            .get(&ts.target_group)
            .map(|group| group.task_list.clone())
            .unwrap_or_default();

        let pending: Vec<PendingStart> = ts
            .target_tasks
            .iter()
            .map(|task| {
                let group_task = group_tasks.get(task.name()).cloned().unwrap_or_default();
                let init_set: BTreeSet<String> = group_task
                    .force_init_node
                    .iter()
                    .cloned()
                    .chain(ts.enter_nodes.iter().cloned())
                    .collect();
                PendingStart {
                    task: Arc::clone(task),
                    pre_nodes: group_task.pre_node,
                    init_set: Some(init_set),
                }
            })
            .collect();

        let initialized = self.start_when_ready(pending);

        let mut running_nodes = BTreeSet::new();
        for task in &ts.target_tasks {
            for node in &task.setting().node_list {
                running_nodes.insert(node.node_name.clone());
            }
        }

        log::info!(
            "[Executer] transition from {} to group {} finished\n      node state:\n        - exit:    {}\n        - enter:   {}\n        - init:    {}\n        - running: {}",
            self.current_group.get().yellow(),
            ts.target_group.yellow(),
            join_set(&ts.exit_nodes).blue(),
            join_set(&ts.enter_nodes).green(),
            join_set(&initialized).yellow(),
            join_set(&running_nodes).green()
        );

        self.current_group.store(ts.target_group.clone());
        ts.in_transition = false;
    }

    /// Start tasks as their pre-nodes come up: a fixpoint sweep with a
    /// 1 ms pause between rounds and a warning at most once per second
    /// while blocked. Returns every node name marked for initialization
    /// via a subset (whole-task marks are boot-time and not reported).
    fn start_when_ready(&self, mut pending: Vec<PendingStart>) -> BTreeSet<String> {
        let mut initialized = BTreeSet::new();
        let mut last_warn = Instant::now();

        while !pending.is_empty() {
            let mut unmet: BTreeSet<String> = BTreeSet::new();
            pending.retain(|entry| {
                let ready = entry.pre_nodes.iter().all(|name| {
                    let running = self
                        .node_map
                        .get(name)
                        .map(|handle| handle.state() == NodeState::Running)
                        .unwrap_or(false);
                    if !running {
                        unmet.insert(name.clone());
                    }
                    running
                });
                if !ready {
                    return true;
                }

                match &entry.init_set {
                    None => entry.task.init_all(),
                    Some(set) => {
                        initialized.extend(entry.task.init_subset(set));
                    }
                }
                entry.task.start(&entry.task.setting().system_setting);
                log::info!("[Executer] task '{}' start", entry.task.name());
                false
            });

            if pending.is_empty() {
                break;
            }
            if last_warn.elapsed() >= Duration::from_secs(1) {
                last_warn = Instant::now();
                log::warn!(
                    "[Executer] waiting for pre-nodes to reach RUNNING: {}",
                    join_set(&unmet)
                );
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        initialized
    }
}

fn join_set(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "-".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecuterSetting, TimerSetting, TimerType};

    fn minimal_config(name: &str) -> ExecuterConfig {
        ExecuterConfig {
            executer_setting: ExecuterSetting {
                package_name: name.to_string(),
                timer_setting: TimerSetting {
                    timer_type: TimerType::Internal,
                    period: 0.002,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn boots_with_no_tasks_and_no_groups() {
        let name = unique_name("exec_empty");
        let executer = Executer::new(
            minimal_config(&name),
            Arc::new(NodeMap::new()),
            &unique_name("cmd_empty"),
        )
        .unwrap();
        executer.create_task().unwrap();
        executer.init_task();
        assert_eq!(executer.current_group(), EMPTY_INIT);
        executer.destroy();
    }

    #[test]
    fn empty_package_name_is_config_error() {
        let err = Executer::new(
            minimal_config(""),
            Arc::new(NodeMap::new()),
            &unique_name("cmd_noname"),
        )
        .unwrap_err();
        assert!(matches!(err, OcmError::Config(_)));
    }

    #[test]
    fn join_set_renders_dash_for_empty() {
        assert_eq!(join_set(&BTreeSet::new()), "-");
        let set: BTreeSet<String> = ["b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(join_set(&set), "a,b");
    }
}
