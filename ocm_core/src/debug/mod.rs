//! Debug sample fan-out over UDP multicast.
//!
//! RT task code hands `(channel, f64 samples)` records to [`DebugHub`];
//! a dedicated worker thread forwards them to the multicast group
//! `239.255.76.67` so off-board tooling can plot live signals. The hand-off
//! is a bounded lock-free queue: the hot path never blocks and never
//! allocates past the queue capacity: when the drain falls behind,
//! samples are dropped, not queued without bound.
//!
//! The channel name on the wire is `{channel}_{8-hex of the local IPv4}`,
//! so plots from several robots on one network stay distinguishable.
//!
//! Built once at boot by the embedding application and torn down after
//! the tasks join; [`DebugHub::init_global`] installs the thin ambient
//! accessor leaf code uses.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::config::SystemSetting;
use crate::error::OcmResult;
use crate::scheduling::rt::{self, SchedPolicy};

const MULTICAST_GROUP: &str = "239.255.76.67";

// Layout fingerprint of the sample frame, mirrored by the plotting side.
const DEBUG_DATA_HASH: u64 = 0x8f3a_91c4_27d6_50b9;

/// Configuration of the fan-out worker.
#[derive(Debug, Clone)]
pub struct DebugHubConfig {
    /// Local IPv4 identity; only used to suffix channel names.
    pub ip: String,
    /// Multicast UDP port.
    pub port: u16,
    /// Multicast TTL.
    pub ttl: u32,
    /// Master switch; a disabled hub drops every sample at the call site.
    pub enable: bool,
    /// When on, only whitelisted channels pass.
    pub white_list_enable: bool,
    pub white_list: Vec<String>,
    /// Capacity of the lock-free hand-off queue.
    pub queue_size: usize,
    /// RT settings of the worker thread, gated like task threads.
    pub system_setting: SystemSetting,
    pub all_priority_enable: bool,
    pub all_cpu_affinity_enable: bool,
}

impl Default for DebugHubConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 7667,
            ttl: 1,
            enable: false,
            white_list_enable: false,
            white_list: Vec::new(),
            queue_size: 1024,
            system_setting: SystemSetting::default(),
            all_priority_enable: false,
            all_cpu_affinity_enable: false,
        }
    }
}

struct DebugSample {
    channel: String,
    data: Vec<f64>,
}

/// Fan-out hub: bounded queue in, multicast datagrams out.
pub struct DebugHub {
    config: DebugHubConfig,
    queue: Arc<ArrayQueue<DebugSample>>,
    wake_tx: Sender<()>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static GLOBAL_HUB: OnceLock<Arc<DebugHub>> = OnceLock::new();

impl DebugHub {
    /// Build the hub and start its worker thread.
    pub fn new(config: DebugHubConfig) -> Arc<Self> {
        let queue = Arc::new(ArrayQueue::new(config.queue_size.max(1)));
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let config = config.clone();
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("debug_hub".to_string())
                .spawn(move || worker_loop(config, queue, running, wake_rx))
                .expect("spawning the debug hub worker cannot fail at boot")
        };

        Arc::new(Self {
            config,
            queue,
            wake_tx,
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Install `config` as the process-wide hub. Later calls return the
    /// already-installed instance; the hub is init-once by contract.
    pub fn init_global(config: DebugHubConfig) -> Arc<Self> {
        Arc::clone(GLOBAL_HUB.get_or_init(|| Self::new(config)))
    }

    /// The process-wide hub, when one was installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_HUB.get().cloned()
    }

    /// Queue one record for forwarding.
    ///
    /// Drops silently when the hub is disabled, the channel is filtered
    /// out, or the queue is full: the RT caller never blocks on debug
    /// output.
    pub fn publish(&self, channel: &str, data: &[f64]) {
        if !self.accepts(channel) {
            return;
        }
        let sample = DebugSample {
            channel: channel.to_string(),
            data: data.to_vec(),
        };
        if self.queue.push(sample).is_ok() {
            let _ = self.wake_tx.try_send(());
        }
    }

    fn accepts(&self, channel: &str) -> bool {
        if !self.config.enable {
            return false;
        }
        if self.config.white_list_enable
            && !self.config.white_list.iter().any(|allowed| allowed == channel)
        {
            return false;
        }
        true
    }

    /// Stop and join the worker. Idempotent; also run by `Drop`.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DebugHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    config: DebugHubConfig,
    queue: Arc<ArrayQueue<DebugSample>>,
    running: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
) {
    rt::set_thread_name("debug_hub");
    if config.all_priority_enable && config.system_setting.priority != 0 {
        if let Err(err) = rt::set_thread_priority(0, config.system_setting.priority, SchedPolicy::Fifo)
        {
            log::warn!("[DebugHub] priority not applied: {err}");
        }
    }
    if config.all_cpu_affinity_enable && !config.system_setting.cpu_affinity.is_empty() {
        if let Err(err) = rt::set_thread_cpu_affinity(0, &config.system_setting.cpu_affinity) {
            log::warn!("[DebugHub] affinity not applied: {err}");
        }
    }

    let socket = match open_socket(config.ttl) {
        Ok(socket) => socket,
        Err(err) => {
            log::error!("[DebugHub] socket setup failed, fan-out disabled: {err}");
            return;
        }
    };
    let destination = format!("{MULTICAST_GROUP}:{}", config.port);
    let ip_suffix = ipv4_hex(&config.ip);

    while running.load(Ordering::Acquire) {
        while let Some(sample) = queue.pop() {
            let wire_channel = format!("{}_{}", sample.channel, ip_suffix);
            let frame = encode_frame(&wire_channel, &sample.data);
            if let Err(err) = socket.send_to(&frame, &destination) {
                log::warn!("[DebugHub] send on '{wire_channel}' failed: {err}");
            }
        }
        if wake_rx.recv().is_err() {
            break;
        }
    }
}

fn open_socket(ttl: u32) -> OcmResult<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_multicast_ttl_v4(ttl)?;
    Ok(socket)
}

/// `{channel}\0` followed by the type hash, an `i8` count, and the
/// big-endian samples.
fn encode_frame(channel: &str, data: &[f64]) -> Vec<u8> {
    let count = data.len().min(i8::MAX as usize);
    let mut frame = Vec::with_capacity(channel.len() + 1 + 8 + 1 + count * 8);
    frame.extend(channel.as_bytes());
    frame.push(0);
    frame.extend(DEBUG_DATA_HASH.to_be_bytes());
    frame.push(count as u8);
    for value in &data[..count] {
        frame.extend(value.to_be_bytes());
    }
    frame
}

/// Host-order hex of a dotted IPv4 address; unparsable input hashes to
/// all-zero so the channel name stays well-formed.
fn ipv4_hex(ip: &str) -> String {
    match ip.parse::<std::net::Ipv4Addr>() {
        Ok(addr) => format!("{:08x}", u32::from(addr)),
        Err(_) => {
            log::warn!("[DebugHub] '{ip}' is not an IPv4 address");
            "00000000".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_hex_is_host_order() {
        assert_eq!(ipv4_hex("192.168.1.5"), "c0a80105");
        assert_eq!(ipv4_hex("127.0.0.1"), "7f000001");
        assert_eq!(ipv4_hex("not-an-ip"), "00000000");
    }

    #[test]
    fn frame_layout_matches_contract() {
        let frame = encode_frame("joint_pos_7f000001", &[1.0, -2.5]);
        let name_len = "joint_pos_7f000001".len();
        assert_eq!(frame[name_len], 0, "channel is NUL-terminated");
        assert_eq!(
            frame[name_len + 1..name_len + 9],
            DEBUG_DATA_HASH.to_be_bytes()
        );
        assert_eq!(frame[name_len + 9], 2, "sample count");
        assert_eq!(frame.len(), name_len + 1 + 8 + 1 + 16);
        assert_eq!(
            frame[name_len + 10..name_len + 18],
            1.0f64.to_be_bytes()
        );
    }

    #[test]
    fn disabled_hub_drops_at_call_site() {
        let hub = DebugHub::new(DebugHubConfig::default());
        hub.publish("anything", &[1.0]);
        assert_eq!(hub.queue.len(), 0);
        hub.shutdown();
    }

    #[test]
    fn whitelist_filters_channels() {
        let hub = DebugHub::new(DebugHubConfig {
            enable: true,
            white_list_enable: true,
            white_list: vec!["allowed".to_string()],
            ..Default::default()
        });
        assert!(hub.accepts("allowed"));
        assert!(!hub.accepts("blocked"));
        hub.shutdown();
    }

    #[test]
    fn enabled_hub_forwards_without_blocking() {
        let hub = DebugHub::new(DebugHubConfig {
            enable: true,
            ..Default::default()
        });
        for i in 0..32 {
            hub.publish("smoke", &[f64::from(i)]);
        }
        std::thread::sleep(std::time::Duration::from_millis(30));
        hub.shutdown();
    }
}
