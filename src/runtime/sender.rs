//! Broadcast sender with watchdog monitoring

use crossbeam_channel::{SendError, Sender as CrossbeamSender};

use super::errors::{WorkError, WorkResult};
use super::watchdog::{OperationGuard, WatchdogHandle};

/// What actually travels through a channel.
///
/// Nodes never see this enum: `Sender::send()` wraps values in `Sample(T)`
/// and `Receiver::recv()` unwraps them. `EndOfStream` lets a node finish its
/// downstream explicitly (the reader does this when the inventory ends)
/// instead of relying on every sender handle being dropped.
#[derive(Clone, Debug)]
pub enum ChannelMessage<T> {
    Sample(T),
    EndOfStream,
}

/// Sends every value to all connected destinations, in connection order.
pub struct Sender<T> {
    destinations: Vec<CrossbeamSender<ChannelMessage<T>>>,
    watchdog_handle: Option<WatchdogHandle>,
}

impl<T: Clone> Sender<T> {
    pub fn new(destinations: Vec<CrossbeamSender<ChannelMessage<T>>>) -> Self {
        Self {
            destinations,
            watchdog_handle: None,
        }
    }

    /// Copy of this sender that reports blocked sends to the watchdog
    pub fn with_watchdog(&self, watchdog_handle: WatchdogHandle) -> Self {
        Self {
            destinations: self.destinations.clone(),
            watchdog_handle: Some(watchdog_handle),
        }
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.len()
    }

    /// Send a value to all destinations.
    ///
    /// Fails only when every destination has disconnected, so one finished
    /// consumer (a capture sink, say) does not stop the producer.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        if self.destinations.is_empty() {
            return Ok(());
        }

        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);

        let mut delivered = false;
        let mut last_error = None;
        for dest in &self.destinations {
            match dest.send(ChannelMessage::Sample(value.clone())) {
                Ok(()) => delivered = true,
                Err(SendError(ChannelMessage::Sample(v))) => last_error = Some(SendError(v)),
                Err(SendError(ChannelMessage::EndOfStream)) => {}
            }
        }

        if !delivered && let Some(e) = last_error {
            return Err(e);
        }
        Ok(())
    }

    /// `send()` for use inside `work()`: losing every consumer ends the
    /// node quietly with `WorkError::Shutdown`.
    pub fn deliver(&self, value: T) -> WorkResult<()> {
        self.send(value).map_err(|_| {
            tracing::debug!("all consumers disconnected");
            WorkError::Shutdown
        })
    }

    /// Signal end-of-stream to all destinations.
    ///
    /// Downstream receivers return `WorkError::Shutdown` from then on.
    pub fn close(&self) {
        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);
        for dest in &self.destinations {
            let _ = dest.send(ChannelMessage::EndOfStream);
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            destinations: self.destinations.clone(),
            watchdog_handle: self.watchdog_handle.clone(),
        }
    }
}
