//! Thread-per-node streaming runtime

pub mod errors;
pub mod node;
pub mod pipeline;
pub mod ports;
pub mod receiver;
pub mod sample;
pub mod scheduler;
pub mod sender;
pub mod type_registry;
pub mod watchdog;

pub use errors::{BuildError, ConnectionError, WorkError, WorkResult};
pub use node::ProcessNode;
pub use pipeline::Pipeline;
pub use ports::{InputPort, OutputPort, PortDirection, PortSchema};
pub use receiver::Receiver;
pub use sample::{SampleBlock, into_blocks};
pub use scheduler::Scheduler;
pub use sender::{ChannelMessage, Sender};
pub use type_registry::register_type;
pub use watchdog::Watchdog;
