//! Stall detection for blocked channel operations
//!
//! Every port wrapper records when it enters a blocking send/recv in an atomic
//! timestamp. A monitor thread scans those timestamps once per second and warns
//! about any operation that has been blocked longer than the threshold. A
//! stalled stage in the interrogator shows up here long before the reader's
//! sample-clock windows would reveal anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Default blocking time after which an operation is reported.
pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);

#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

struct PortState {
    /// Start of the current operation in ms since the epoch, 0 when idle.
    started_at: AtomicU64,
    reported: AtomicBool,
    node: String,
    port: String,
    operation: &'static str,
}

/// Per-port handle held by `Sender` / `Receiver` wrappers
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<PortState>,
}

impl WatchdogHandle {
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.started_at.store(now_millis(), Ordering::Relaxed);
        self.state.reported.store(false, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.reported.swap(false, Ordering::Relaxed) {
            info!(
                "[{}] {} on port '{}' unblocked",
                self.state.node, self.state.operation, self.state.port
            );
        }
        self.state.started_at.store(0, Ordering::Relaxed);
    }

    /// Whether an operation is in progress on this port
    pub fn is_busy(&self) -> bool {
        self.state.started_at.load(Ordering::Relaxed) != 0
    }
}

/// Shared registry of monitored ports
#[derive(Clone)]
pub struct Watchdog {
    ports: Arc<Mutex<Vec<Weak<PortState>>>>,
    running: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            ports: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Register a port; `operation` is "send" or "recv".
    pub fn register_port(
        &self,
        node: &str,
        operation: &'static str,
        port: &str,
    ) -> WatchdogHandle {
        let state = Arc::new(PortState {
            started_at: AtomicU64::new(0),
            reported: AtomicBool::new(false),
            node: node.to_string(),
            port: port.to_string(),
            operation,
        });

        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Report operations blocked longer than the threshold, once each.
    /// Returns the number of newly reported operations.
    pub fn check_for_blocked(&self) -> usize {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;
        let mut newly_reported = 0;

        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.started_at.load(Ordering::Relaxed);
            if start > 0 {
                let blocked_ms = now.saturating_sub(start);
                if blocked_ms > threshold_ms && !state.reported.swap(true, Ordering::Relaxed) {
                    newly_reported += 1;
                    warn!(
                        "[{}] {} on port '{}' blocked for {:.1}s",
                        state.node,
                        state.operation,
                        state.port,
                        blocked_ms as f64 / 1000.0
                    );
                }
            }
            true
        });
        newly_reported
    }

    pub fn start_monitoring_thread(&self) -> std::thread::JoinHandle<()> {
        let watchdog = self.clone();
        std::thread::spawn(move || {
            while watchdog.running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                watchdog.check_for_blocked();
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a port busy for the guard's lifetime
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_marks_port_busy_until_dropped() {
        let watchdog = Watchdog::new();
        let handle = watchdog.register_port("gate", "recv", "samples");
        assert!(!handle.is_busy());
        {
            let _guard = OperationGuard::new(&handle);
            assert!(handle.is_busy());
        }
        assert!(!handle.is_busy());
    }

    #[test]
    fn blocked_operation_reported_once() {
        let watchdog = Watchdog::with_threshold(Duration::from_millis(20));
        let handle = watchdog.register_port("reader", "send", "tx");
        let _guard = OperationGuard::new(&handle);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(watchdog.check_for_blocked(), 1);
        assert_eq!(watchdog.check_for_blocked(), 0);
    }

    #[test]
    fn dropped_ports_are_forgotten() {
        let watchdog = Watchdog::with_threshold(Duration::ZERO);
        {
            let handle = watchdog.register_port("decoder", "recv", "bursts");
            handle.start_operation();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(watchdog.check_for_blocked(), 0);
        assert!(watchdog.ports.lock().unwrap().is_empty());
    }
}
