//! Typed port descriptions and the type-erased channel endpoints handed to nodes

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::Receiver as CrossbeamReceiver;

use super::receiver::Receiver;
use super::sender::{ChannelMessage, Sender};
use super::watchdog::{Watchdog, WatchdogHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Name, item type and position of one node port
#[derive(Debug, Clone)]
pub struct PortSchema {
    pub name: String,
    pub type_id: TypeId,
    pub index: usize,
    pub direction: PortDirection,
}

impl PortSchema {
    pub fn new<T: 'static>(name: impl Into<String>, index: usize, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            index,
            direction,
        }
    }

    pub fn input<T: 'static>(name: impl Into<String>, index: usize) -> Self {
        Self::new::<T>(name, index, PortDirection::Input)
    }

    pub fn output<T: 'static>(name: impl Into<String>, index: usize) -> Self {
        Self::new::<T>(name, index, PortDirection::Output)
    }
}

/// Input end of a connection.
///
/// Holds a `CrossbeamReceiver<ChannelMessage<T>>` behind `dyn Any`, or `()`
/// when the input was left unconnected.
pub struct InputPort {
    channel: Box<dyn Any + Send>,
    watchdog_handle: Option<WatchdogHandle>,
    eos: AtomicBool,
}

impl InputPort {
    pub(crate) fn from_type_erased(channel: Box<dyn Any + Send>) -> Self {
        Self {
            channel,
            watchdog_handle: None,
            eos: AtomicBool::new(false),
        }
    }

    /// Wrap a raw channel end, for driving nodes by hand in tests.
    pub fn new_with_watchdog<T: Send + 'static>(
        receiver: CrossbeamReceiver<ChannelMessage<T>>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self {
            channel: Box::new(receiver),
            watchdog_handle: Some(watchdog.register_port(node_name, "recv", port_name)),
            eos: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_watchdog(mut self, watchdog: &Watchdog, node_name: &str, port_name: &str) -> Self {
        self.watchdog_handle = Some(watchdog.register_port(node_name, "recv", port_name));
        self
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is::<()>()
    }

    /// Typed receiver over this port using the node's putback `buffer`.
    ///
    /// `None` if the port is unconnected, carries another item type, or has
    /// no watchdog attached.
    pub fn get<'a, T: Send + 'static>(&'a self, buffer: &'a mut VecDeque<T>) -> Option<Receiver<'a, T>> {
        let receiver = self.channel.downcast_ref::<CrossbeamReceiver<ChannelMessage<T>>>()?;
        let handle = self.watchdog_handle.clone()?;
        Some(Receiver::new(receiver, buffer, handle, &self.eos))
    }
}

impl fmt::Debug for InputPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InputPort(connected={})", self.is_connected())
    }
}

/// Output end of one or more connections (broadcast).
pub struct OutputPort {
    channel: Box<dyn Any + Send>,
    watchdog_handle: Option<WatchdogHandle>,
}

impl OutputPort {
    pub(crate) fn from_type_erased(channel: Box<dyn Any + Send>) -> Self {
        Self {
            channel,
            watchdog_handle: None,
        }
    }

    /// Wrap a sender, for driving nodes by hand in tests.
    pub fn new_with_watchdog<T: Send + Clone + 'static>(
        sender: Sender<T>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self {
            channel: Box::new(sender),
            watchdog_handle: Some(watchdog.register_port(node_name, "send", port_name)),
        }
    }

    pub(crate) fn with_watchdog(mut self, watchdog: &Watchdog, node_name: &str, port_name: &str) -> Self {
        self.watchdog_handle = Some(watchdog.register_port(node_name, "send", port_name));
        self
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is::<()>()
    }

    /// Typed sender for this port; `None` when unconnected or of another type.
    /// Nodes treat `None` on an optional output as "nobody is listening".
    pub fn get<T: Send + Clone + 'static>(&self) -> Option<Sender<T>> {
        let sender = self.channel.downcast_ref::<Sender<T>>()?;
        Some(match &self.watchdog_handle {
            Some(handle) => sender.with_watchdog(handle.clone()),
            None => sender.clone(),
        })
    }
}

impl fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OutputPort(connected={})", self.is_connected())
    }
}
