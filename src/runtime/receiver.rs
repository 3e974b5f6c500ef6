//! Channel receiver with a putback buffer and watchdog monitoring
//!
//! [`Receiver`] wraps a `crossbeam_channel::Receiver<ChannelMessage<T>>`
//! together with a buffer owned by the node, so items that a node has looked
//! at but cannot handle yet (a burst beyond the current receive window, for
//! example) survive until the next `work()` call. End-of-stream is latched in
//! an `AtomicBool` owned by the input port so it also survives across calls.

use crossbeam_channel::{Receiver as CrossbeamReceiver, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use super::errors::{WorkError, WorkResult};
use super::sender::ChannelMessage;
use super::watchdog::{OperationGuard, WatchdogHandle};

pub struct Receiver<'a, T> {
    receiver: &'a CrossbeamReceiver<ChannelMessage<T>>,
    buffer: &'a mut VecDeque<T>,
    watchdog_handle: Option<WatchdogHandle>,
    eos: &'a AtomicBool,
}

impl<'a, T> Receiver<'a, T> {
    pub fn new(
        receiver: &'a CrossbeamReceiver<ChannelMessage<T>>,
        buffer: &'a mut VecDeque<T>,
        watchdog_handle: WatchdogHandle,
        eos: &'a AtomicBool,
    ) -> Self {
        Self {
            receiver,
            buffer,
            watchdog_handle: Some(watchdog_handle),
            eos,
        }
    }

    fn unwrap_message(&self, message: ChannelMessage<T>) -> WorkResult<T> {
        match message {
            ChannelMessage::Sample(item) => Ok(item),
            ChannelMessage::EndOfStream => {
                self.eos.store(true, Ordering::Relaxed);
                tracing::debug!("end of stream received");
                Err(WorkError::Shutdown)
            }
        }
    }

    /// Blocking receive, putback buffer first.
    ///
    /// Returns `Err(WorkError::Shutdown)` once end-of-stream was seen or every
    /// sender is gone. Buffered items are still delivered after that.
    pub fn recv(&mut self) -> WorkResult<T> {
        if let Some(item) = self.buffer.pop_front() {
            return Ok(item);
        }
        if self.eos.load(Ordering::Relaxed) {
            return Err(WorkError::Shutdown);
        }

        let _guard = self.watchdog_handle.as_ref().map(OperationGuard::new);
        match self.receiver.recv() {
            Ok(message) => self.unwrap_message(message),
            Err(_) => {
                self.eos.store(true, Ordering::Relaxed);
                tracing::debug!("channel disconnected");
                Err(WorkError::Shutdown)
            }
        }
    }

    /// Front item without consuming it; blocks if the buffer is empty.
    pub fn peek(&mut self) -> WorkResult<&T> {
        if self.buffer.is_empty() {
            let item = self.recv()?;
            self.buffer.push_back(item);
        }
        self.buffer.front().ok_or(WorkError::Shutdown)
    }

    /// Non-blocking receive.
    ///
    /// `Ok(None)` means nothing is available right now.
    pub fn try_recv(&mut self) -> WorkResult<Option<T>> {
        if let Some(item) = self.buffer.pop_front() {
            return Ok(Some(item));
        }
        if self.eos.load(Ordering::Relaxed) {
            return Err(WorkError::Shutdown);
        }
        match self.receiver.try_recv() {
            Ok(message) => self.unwrap_message(message).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.eos.store(true, Ordering::Relaxed);
                Err(WorkError::Shutdown)
            }
        }
    }

    /// Make `item` the next one returned.
    pub fn put_back(&mut self, item: T) {
        self.buffer.push_front(item);
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Watchdog;
    use crossbeam_channel::bounded;

    #[test]
    fn buffer_is_drained_before_channel() {
        let (tx, rx) = bounded::<ChannelMessage<u64>>(10);
        let mut buf = VecDeque::from([42]);
        let wd = Watchdog::new();
        let eos = AtomicBool::new(false);
        let mut r = Receiver::new(&rx, &mut buf, wd.register_port("t", "recv", "in"), &eos);

        tx.send(ChannelMessage::Sample(99)).unwrap();
        assert_eq!(r.recv().unwrap(), 42);
        assert_eq!(r.recv().unwrap(), 99);
    }

    #[test]
    fn put_back_then_peek() {
        let (_tx, rx) = bounded::<ChannelMessage<u64>>(10);
        let mut buf = VecDeque::new();
        let wd = Watchdog::new();
        let eos = AtomicBool::new(false);
        let mut r = Receiver::new(&rx, &mut buf, wd.register_port("t", "recv", "in"), &eos);

        assert!(!r.has_buffered());
        r.put_back(77);
        assert_eq!(*r.peek().unwrap(), 77);
        assert_eq!(r.recv().unwrap(), 77);
        assert!(!r.has_buffered());
    }

    #[test]
    fn try_recv_distinguishes_empty_from_closed() {
        let (tx, rx) = bounded::<ChannelMessage<u64>>(10);
        let mut buf = VecDeque::new();
        let wd = Watchdog::new();
        let eos = AtomicBool::new(false);
        let mut r = Receiver::new(&rx, &mut buf, wd.register_port("t", "recv", "in"), &eos);

        assert!(matches!(r.try_recv(), Ok(None)));
        tx.send(ChannelMessage::Sample(5)).unwrap();
        assert!(matches!(r.try_recv(), Ok(Some(5))));
        drop(tx);
        assert!(matches!(r.try_recv(), Err(WorkError::Shutdown)));
    }

    #[test]
    fn end_of_stream_is_latched_across_receivers() {
        let (tx, rx) = bounded::<ChannelMessage<u64>>(10);
        let mut buf = VecDeque::new();
        let wd = Watchdog::new();
        let eos = AtomicBool::new(false);

        tx.send(ChannelMessage::Sample(1)).unwrap();
        tx.send(ChannelMessage::EndOfStream).unwrap();
        {
            let mut r = Receiver::new(&rx, &mut buf, wd.register_port("t", "recv", "in"), &eos);
            assert_eq!(r.recv().unwrap(), 1);
            assert!(matches!(r.recv(), Err(WorkError::Shutdown)));
        }
        // The sender is still alive, but the next work() call must not block.
        let mut r = Receiver::new(&rx, &mut buf, wd.register_port("t", "recv", "in"), &eos);
        assert!(matches!(r.recv(), Err(WorkError::Shutdown)));
        assert!(matches!(r.peek(), Err(WorkError::Shutdown)));
        drop(tx);
    }
}
