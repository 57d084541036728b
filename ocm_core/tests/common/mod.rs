//! Shared helpers for the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ocm_core::{Node, NodeMap, OcmResult};

/// Unique name for any OS-visible resource, so parallel test runs never
/// collide in /dev/shm.
pub fn unique_name(prefix: &str) -> String {
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

/// Poll `cond` until it holds or `timeout_ms` elapses.
pub fn wait_for<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Counters and gates shared between a [`ProbeNode`] and the test body.
#[derive(Clone)]
pub struct Probe {
    pub constructs: Arc<AtomicU32>,
    pub inits: Arc<AtomicU32>,
    pub executes: Arc<AtomicU32>,
    pub outputs: Arc<AtomicU32>,
    pub after_exits: Arc<AtomicU32>,
    pub allow_enter: Arc<AtomicBool>,
    pub allow_exit: Arc<AtomicBool>,
}

impl Probe {
    pub fn executes(&self) -> u32 {
        self.executes.load(Ordering::Relaxed)
    }

    pub fn inits(&self) -> u32 {
        self.inits.load(Ordering::Relaxed)
    }

    pub fn after_exits(&self) -> u32 {
        self.after_exits.load(Ordering::Relaxed)
    }
}

/// A node whose whole behavior is observable from the test.
pub struct ProbeNode {
    probe: Probe,
}

impl Node for ProbeNode {
    fn construct(&mut self) -> OcmResult<()> {
        self.probe.constructs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn init(&mut self) -> OcmResult<()> {
        self.probe.inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute(&mut self) -> OcmResult<()> {
        self.probe.executes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn output(&mut self) -> OcmResult<()> {
        self.probe.outputs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn try_enter(&mut self) -> bool {
        self.probe.allow_enter.load(Ordering::Relaxed)
    }

    fn try_exit(&mut self) -> bool {
        self.probe.allow_exit.load(Ordering::Relaxed)
    }

    fn after_exit(&mut self) {
        self.probe.after_exits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Register a probe node and hand back its counters.
pub fn add_probe_node(map: &mut NodeMap, name: &str) -> Probe {
    let probe = Probe {
        constructs: Arc::new(AtomicU32::new(0)),
        inits: Arc::new(AtomicU32::new(0)),
        executes: Arc::new(AtomicU32::new(0)),
        outputs: Arc::new(AtomicU32::new(0)),
        after_exits: Arc::new(AtomicU32::new(0)),
        allow_enter: Arc::new(AtomicBool::new(true)),
        allow_exit: Arc::new(AtomicBool::new(true)),
    };
    map.add(
        name,
        Box::new(ProbeNode {
            probe: probe.clone(),
        }),
    )
    .unwrap();
    probe
}
