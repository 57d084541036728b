//! The task runtime: one real-time thread per task.
//!
//! [`TaskRunner`] owns the thread and its lifecycle state machine; the
//! work done per wake is an injected closure. [`NodeTask`] is the runner
//! every ordinary task uses: it executes an ordered node sequence each
//! wake and carries the per-node construct/init/output bookkeeping.
//!
//! Thread state machine (one thread per runner, created eagerly, joined
//! exactly once by `destroy`):
//!
//! ```text
//!   STANDBY ──start()──▶ apply start RT config, sleep launch delay
//!      ▲                        │
//!      │                        ▼
//!      │             RUNNING: sleep → body → measure, repeat
//!      │                        │
//!      └──────stop()────────────┘   (cooperative: the current wake
//!                                    finishes, nothing is interrupted)
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::{SystemSetting, TaskSetting, TimerType};
use crate::core::node::{NodeHandle, NodeState};
use crate::core::node_map::NodeMap;
use crate::error::{OcmError, OcmResult};
use crate::scheduling::rt::{self, SchedPolicy};
use crate::scheduling::sleep::{self, SleepStrategy};
use crate::scheduling::timer::Stopwatch;

/// Lifecycle state of a task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Init = 0,
    Running = 1,
    Standby = 2,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskState::Running,
            2 => TaskState::Standby,
            _ => TaskState::Init,
        }
    }
}

fn store_ms(cell: &AtomicU64, ms: f64) {
    cell.store(ms.to_bits(), Ordering::Release);
}

fn load_ms(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

struct TaskShared {
    name: String,
    alive: AtomicBool,
    loop_run: AtomicBool,
    run_flag: AtomicBool,
    state: AtomicU8,
    run_duration_ms: AtomicU64,
    loop_duration_ms: AtomicU64,
    sleeper: Arc<dyn SleepStrategy>,
    start_setting: Mutex<SystemSetting>,
    stop_setting: Mutex<SystemSetting>,
    start_delay_s: f64,
    priority_enable: bool,
    affinity_enable: bool,
}

impl TaskShared {
    /// Apply priority/affinity from `setting`, gated by the global enable
    /// flags. Failures are logged, never fatal: a dev machine without RT
    /// privileges still runs the task graph.
    fn apply_rt(&self, setting: &SystemSetting) {
        if self.priority_enable && setting.priority != 0 {
            if let Err(err) = rt::set_thread_priority(0, setting.priority, SchedPolicy::Fifo) {
                log::warn!("[Task] {}: priority not applied: {err}", self.name);
            }
        }
        if self.affinity_enable && !setting.cpu_affinity.is_empty() {
            if let Err(err) = rt::set_thread_cpu_affinity(0, &setting.cpu_affinity) {
                log::warn!("[Task] {}: affinity not applied: {err}", self.name);
            }
        }
    }
}

/// An RT worker thread with the STANDBY/RUNNING lifecycle.
pub struct TaskRunner {
    shared: Arc<TaskShared>,
    start_tx: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Create the worker thread. It parks in STANDBY until [`start`].
    ///
    /// `body` runs once per wake while the task is started.
    ///
    /// [`start`]: TaskRunner::start
    pub fn spawn<F>(
        name: &str,
        timer_type: TimerType,
        start_delay_s: f64,
        priority_enable: bool,
        affinity_enable: bool,
        body: F,
    ) -> OcmResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if name.is_empty() {
            return Err(OcmError::config("task name must not be empty"));
        }
        let sleeper = sleep::for_timer(timer_type, name)?;
        let (start_tx, start_rx) = bounded::<()>(1);

        let shared = Arc::new(TaskShared {
            name: name.to_string(),
            alive: AtomicBool::new(true),
            loop_run: AtomicBool::new(false),
            run_flag: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Init as u8),
            run_duration_ms: AtomicU64::new(0f64.to_bits()),
            loop_duration_ms: AtomicU64::new(0f64.to_bits()),
            sleeper,
            start_setting: Mutex::new(SystemSetting::default()),
            stop_setting: Mutex::new(SystemSetting::default()),
            start_delay_s,
            priority_enable,
            affinity_enable,
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || task_loop(shared, start_rx, body))?
        };
        log::info!("[Task] {name}: thread created");

        Ok(Self {
            shared,
            start_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Release the thread into its run loop with the given RT settings.
    ///
    /// Idempotent by intent: the start token is bounded at one, and the
    /// loop re-enters the gate between runs, so redundant calls are
    /// harmless.
    pub fn start(&self, setting: &SystemSetting) {
        *self.shared.start_setting.lock() = setting.clone();
        self.shared.run_flag.store(true, Ordering::Release);
        self.shared.loop_run.store(true, Ordering::Release);
        let _ = self.start_tx.try_send(());
        log::info!("[Task] {}: ready to run", self.shared.name);
    }

    /// Ask the thread to leave its run loop and drain to STANDBY.
    ///
    /// Cooperative: a wake in progress finishes its body first. The sleep
    /// strategy is nudged so a blocked wait returns.
    pub fn stop(&self, setting: &SystemSetting) {
        *self.shared.stop_setting.lock() = setting.clone();
        self.shared.run_flag.store(false, Ordering::Release);
        self.shared.loop_run.store(false, Ordering::Release);
        self.shared.sleeper.resume();
        log::info!("[Task] {}: ready to stop", self.shared.name);
    }

    /// Terminate and join the thread. Idempotent.
    pub fn destroy(&self) {
        self.shared.alive.store(false, Ordering::Release);
        self.shared.loop_run.store(false, Ordering::Release);
        let _ = self.start_tx.try_send(());
        self.shared.sleeper.resume();

        if let Some(handle) = self.thread.lock().take() {
            match handle.join() {
                Ok(()) => log::info!("[Task] {}: thread destroyed", self.shared.name),
                Err(_) => log::error!("[Task] {}: thread panicked", self.shared.name),
            }
        }
    }

    pub fn set_period(&self, period_secs: f64) {
        self.shared.sleeper.set_period(period_secs);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Wall time of the last body run, in milliseconds.
    pub fn run_duration_ms(&self) -> f64 {
        load_ms(&self.shared.run_duration_ms)
    }

    /// Wall time between the two most recent wakes, in milliseconds.
    pub fn loop_duration_ms(&self) -> f64 {
        load_ms(&self.shared.loop_duration_ms)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn task_loop<F>(shared: Arc<TaskShared>, start_rx: Receiver<()>, mut body: F)
where
    F: FnMut(),
{
    rt::set_thread_name(&shared.name);
    let mut loop_timer = Stopwatch::new();
    let mut run_timer = Stopwatch::new();

    while shared.alive.load(Ordering::Acquire) {
        shared.apply_rt(&shared.stop_setting.lock().clone());
        shared.state.store(TaskState::Standby as u8, Ordering::Release);
        if start_rx.recv().is_err() {
            // Runner dropped without destroy; nothing left to wait for.
            break;
        }
        shared.apply_rt(&shared.start_setting.lock().clone());

        if shared.start_delay_s > 0.0 {
            std::thread::sleep(std::time::Duration::from_micros(
                (shared.start_delay_s * 1.0e6) as u64,
            ));
        }

        while shared.loop_run.load(Ordering::Acquire) {
            shared.sleeper.sleep(load_ms(&shared.run_duration_ms));
            store_ms(&shared.loop_duration_ms, loop_timer.elapsed_ms());

            run_timer.start();
            if shared.run_flag.load(Ordering::Acquire) {
                body();
                shared.state.store(TaskState::Running as u8, Ordering::Release);
            }
            store_ms(&shared.run_duration_ms, run_timer.elapsed_ms());
        }
    }
}

struct SequenceEntry {
    handle: Arc<NodeHandle>,
    output_enable: bool,
    init_pending: AtomicBool,
}

/// A task that runs an ordered node sequence on every wake.
pub struct NodeTask {
    runner: TaskRunner,
    sequence: Arc<Vec<SequenceEntry>>,
    setting: TaskSetting,
}

impl std::fmt::Debug for NodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTask")
            .field("setting", &self.setting)
            .finish_non_exhaustive()
    }
}

impl NodeTask {
    /// Build the task from its configuration, resolving every node name
    /// against the registry. Unknown names fail here, at boot, not at the
    /// first tick.
    pub fn new(
        setting: TaskSetting,
        node_map: &NodeMap,
        priority_enable: bool,
        affinity_enable: bool,
    ) -> OcmResult<Self> {
        let mut entries = Vec::with_capacity(setting.node_list.len());
        for node_config in &setting.node_list {
            entries.push(SequenceEntry {
                handle: Arc::clone(node_map.get(&node_config.node_name)?),
                output_enable: node_config.output_enable,
                init_pending: AtomicBool::new(false),
            });
        }
        let sequence = Arc::new(entries);

        let runner = {
            let sequence = Arc::clone(&sequence);
            let task_name = setting.task_name.clone();
            TaskRunner::spawn(
                &setting.task_name,
                setting.timer_setting.timer_type,
                setting.launch_setting.delay,
                priority_enable,
                affinity_enable,
                move || run_sequence(&task_name, &sequence),
            )?
        };
        runner.set_period(setting.timer_setting.period);

        Ok(Self {
            runner,
            sequence,
            setting,
        })
    }

    /// Mark every node for (re)initialization on its next run.
    pub fn init_all(&self) {
        for entry in self.sequence.iter() {
            entry.init_pending.store(true, Ordering::Release);
        }
    }

    /// Mark the named nodes that belong to this task; returns the subset
    /// actually marked.
    pub fn init_subset(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        let mut marked = BTreeSet::new();
        for entry in self.sequence.iter() {
            if names.contains(entry.handle.name()) {
                entry.init_pending.store(true, Ordering::Release);
                marked.insert(entry.handle.name().to_string());
            }
        }
        marked
    }

    pub fn setting(&self) -> &TaskSetting {
        &self.setting
    }

    pub fn start(&self, setting: &SystemSetting) {
        self.runner.start(setting);
    }

    pub fn stop(&self, setting: &SystemSetting) {
        self.runner.stop(setting);
    }

    pub fn destroy(&self) {
        self.runner.destroy();
    }

    pub fn state(&self) -> TaskState {
        self.runner.state()
    }

    pub fn name(&self) -> &str {
        self.runner.name()
    }

    pub fn set_period(&self, period_secs: f64) {
        self.runner.set_period(period_secs);
    }

    pub fn run_duration_ms(&self) -> f64 {
        self.runner.run_duration_ms()
    }

    pub fn loop_duration_ms(&self) -> f64 {
        self.runner.loop_duration_ms()
    }
}

/// One wake of the node sequence.
///
/// A failure from user code is logged with the task and node names and
/// abandons the rest of this wake; the failing node's state is left
/// untouched so observers can see it never (re)reached RUNNING.
fn run_sequence(task_name: &str, sequence: &[SequenceEntry]) {
    for entry in sequence {
        if let Err(err) = run_node(entry) {
            log::error!(
                "[Task] {task_name}: node '{}' failed: {err}",
                entry.handle.name()
            );
            return;
        }
    }
}

fn run_node(entry: &SequenceEntry) -> OcmResult<()> {
    let handle = &entry.handle;
    let mut node = handle.node();

    if !handle.is_constructed() {
        node.construct()?;
        handle.mark_constructed();
    }
    if entry.init_pending.load(Ordering::Acquire) {
        node.init()?;
        entry.init_pending.store(false, Ordering::Release);
    }
    node.execute()?;
    if entry.output_enable {
        node.output()?;
    }
    handle.set_state(NodeState::Running);
    Ok(())
}
