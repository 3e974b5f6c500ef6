//! Error types for the node runtime

use crossbeam_channel::{RecvError, SendError};
use std::any::TypeId;

/// Rejected `Pipeline::connect` calls
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("cannot connect {from_node}.{from_port} ({from_type:?}) to {to_node}.{to_port} ({to_type:?}): item types differ")]
    TypeMismatch {
        from_node: String,
        from_port: String,
        from_type: TypeId,
        to_node: String,
        to_port: String,
        to_type: TypeId,
    },

    #[error("no node named '{0}'")]
    NodeNotFound(String),

    #[error("node '{node}' has no port '{port}'")]
    PortNotFound { node: String, port: String },

    #[error("input '{port}' on node '{node}' is already connected")]
    AlreadyConnected { node: String, port: String },
}

/// Errors raised while adding nodes or building the scheduler
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a node named '{0}' already exists")]
    DuplicateNode(String),

    #[error("item type {0:?} is not registered; call register_type::<T>() before build()")]
    UnregisteredType(TypeId),

    #[error("output wiring for {node}.{port} failed: {reason}")]
    OutputWiring {
        node: String,
        port: String,
        reason: String,
    },
}

/// Error type for work function operations
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("receive failed: {0}")]
    RecvError(#[from] RecvError),

    #[error("send failed: {0}")]
    SendError(String),

    #[error("{0}")]
    NodeError(String),

    /// Normal end of a node's life: upstream closed or the node is done.
    #[error("shutdown")]
    Shutdown,
}

impl<T> From<SendError<T>> for WorkError {
    fn from(e: SendError<T>) -> Self {
        WorkError::SendError(e.to_string())
    }
}

/// Result type for work functions
pub type WorkResult<T = ()> = Result<T, WorkError>;
