//! The node trait driven by the scheduler

pub use super::errors::{WorkError, WorkResult};
pub use super::ports::{InputPort, OutputPort, PortSchema};

/// A processing stage running on its own thread.
///
/// Sources have no inputs, sinks have no outputs. The scheduler calls
/// `work()` in a loop until it returns an error or `should_stop()` is true;
/// returning `Err(WorkError::Shutdown)` is the normal way to finish.
pub trait ProcessNode: Send {
    fn name(&self) -> &str;

    fn should_stop(&self) -> bool {
        false
    }

    fn num_inputs(&self) -> usize {
        self.input_schema().len()
    }

    fn num_outputs(&self) -> usize {
        self.output_schema().len()
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        Vec::new()
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        Vec::new()
    }

    /// Read from inputs, process, write to outputs.
    /// Returns the number of items produced.
    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize>;
}
