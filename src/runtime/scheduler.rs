//! Thread-per-node scheduler
//!
//! Each node gets a dedicated thread that calls `work()` until the node
//! returns an error, reports `should_stop()`, or the global stop flag is set.
//! When a node's thread ends, its ports are dropped; the disconnection is what
//! tells neighbouring nodes to wind down, so a finished reader or an exhausted
//! sample source drains the whole graph without any extra signalling.

use super::node::{ProcessNode, WorkError};
use super::ports::{InputPort, OutputPort};
use super::watchdog::Watchdog;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender, channel};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

pub struct Scheduler {
    threads: Vec<(String, JoinHandle<()>)>,
    stop_signal: Arc<AtomicBool>,
    completion_tx: StdSender<String>,
    completion_rx: StdReceiver<String>,
    watchdog: Watchdog,
    watchdog_thread: JoinHandle<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_watchdog(Watchdog::new())
    }

    /// Scheduler monitoring the ports registered with `watchdog`
    pub fn with_watchdog(watchdog: Watchdog) -> Self {
        let (completion_tx, completion_rx) = channel();
        let watchdog_thread = watchdog.start_monitoring_thread();
        info!(
            "Watchdog enabled, reporting channel operations blocked >{:?}",
            watchdog.threshold()
        );
        Self {
            threads: Vec::new(),
            stop_signal: Arc::new(AtomicBool::new(false)),
            completion_tx,
            completion_rx,
            watchdog,
            watchdog_thread,
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn start_process(
        &mut self,
        mut node: Box<dyn ProcessNode>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) {
        let stop_signal = Arc::clone(&self.stop_signal);
        let completion_tx = self.completion_tx.clone();
        let name = node.name().to_string();
        let thread_name = name.clone();

        debug!("Starting node: {}", name);

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut items_produced = 0usize;
            while !stop_signal.load(Ordering::Relaxed) && !node.should_stop() {
                match node.work(&inputs, &outputs) {
                    Ok(n) => items_produced += n,
                    Err(WorkError::Shutdown) => break,
                    Err(e) => {
                        error!("[{}] Work error: {}", thread_name, e);
                        break;
                    }
                }
            }

            info!("[{}] Shutdown. Produced {} items.", thread_name, items_produced);

            // Dropping the ports closes this node's channels.
            drop(outputs);
            drop(inputs);
            drop(node);

            let _ = completion_tx.send(thread_name);
        });

        match spawned {
            Ok(handle) => self.threads.push((name, handle)),
            Err(e) => error!("[{}] Failed to spawn node thread: {}", name, e),
        }
    }

    /// Ask every node to stop after its current activation.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    /// Handle that can request a stop from another thread (e.g. a signal handler).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Block until every node thread has finished, joining them as they complete.
    pub fn wait(self) {
        let Scheduler {
            threads,
            completion_tx,
            completion_rx,
            watchdog,
            watchdog_thread,
            ..
        } = self;
        drop(completion_tx);

        let total = threads.len();
        let mut threads_by_name: HashMap<String, JoinHandle<()>> = threads.into_iter().collect();
        let mut completed = 0;

        info!("Waiting for {} threads to complete...", total);
        while completed < total {
            let Ok(thread_name) = completion_rx.recv() else {
                break;
            };
            completed += 1;
            if let Some(handle) = threads_by_name.remove(&thread_name) {
                match handle.join() {
                    Ok(()) => debug!("[{}] Thread joined ({}/{})", thread_name, completed, total),
                    Err(e) => error!(
                        "[{}] Thread panicked ({}/{}): {:?}",
                        thread_name, completed, total, e
                    ),
                }
            }
        }

        // Threads that panicked never reported completion.
        for (thread_name, handle) in threads_by_name {
            if handle.join().is_err() {
                error!("[{}] Thread panicked", thread_name);
            }
        }

        info!("All {} threads completed", total);
        watchdog.stop();
        let _ = watchdog_thread.join();
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_names(&self) -> Vec<String> {
        self.threads.iter().map(|(name, _)| name.clone()).collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::node::WorkResult;
    use crate::runtime::sender::{ChannelMessage, Sender};
    use crossbeam_channel::bounded;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct Counter {
        next: u64,
        limit: u64,
    }

    impl ProcessNode for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn num_outputs(&self) -> usize {
            1
        }
        fn work(&mut self, _inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
            let output = outputs[0]
                .get::<u64>()
                .ok_or_else(|| WorkError::NodeError("Missing output channel".to_string()))?;
            if self.next >= self.limit {
                return Err(WorkError::Shutdown);
            }
            output.send(self.next)?;
            self.next += 1;
            Ok(1)
        }
    }

    struct Collector {
        buffer: VecDeque<u64>,
        received: Arc<Mutex<Vec<u64>>>,
    }

    impl ProcessNode for Collector {
        fn name(&self) -> &str {
            "collector"
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
            let mut input = inputs[0]
                .get::<u64>(&mut self.buffer)
                .ok_or_else(|| WorkError::NodeError("Missing input channel".to_string()))?;
            let value = input.recv()?;
            self.received.lock().unwrap().push(value);
            Ok(0)
        }
    }

    #[test]
    fn source_to_sink_runs_until_source_finishes() {
        let mut scheduler = Scheduler::new();
        let (tx, rx) = bounded::<ChannelMessage<u64>>(2);
        let received = Arc::new(Mutex::new(Vec::new()));
        let watchdog = scheduler.watchdog().clone();

        scheduler.start_process(
            Box::new(Counter { next: 0, limit: 5 }),
            vec![],
            vec![OutputPort::new_with_watchdog(Sender::new(vec![tx]), &watchdog, "counter", "out")],
        );
        scheduler.start_process(
            Box::new(Collector {
                buffer: VecDeque::new(),
                received: Arc::clone(&received),
            }),
            vec![InputPort::new_with_watchdog(rx, &watchdog, "collector", "in")],
            vec![],
        );

        let start = Instant::now();
        scheduler.wait();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn stop_signal_ends_idle_nodes() {
        let mut scheduler = Scheduler::new();
        let (tx, rx) = bounded::<ChannelMessage<u64>>(2);
        let watchdog = scheduler.watchdog().clone();
        let received = Arc::new(Mutex::new(Vec::new()));

        scheduler.start_process(
            Box::new(Counter { next: 0, limit: u64::MAX }),
            vec![],
            vec![OutputPort::new_with_watchdog(Sender::new(vec![tx]), &watchdog, "counter", "out")],
        );
        scheduler.start_process(
            Box::new(Collector {
                buffer: VecDeque::new(),
                received: Arc::clone(&received),
            }),
            vec![InputPort::new_with_watchdog(rx, &watchdog, "collector", "in")],
            vec![],
        );

        thread::sleep(Duration::from_millis(20));
        scheduler.stop();
        scheduler.wait();
        let values = received.lock().unwrap();
        assert!(values.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
