//! `cf32_le` capture writer for diagnostic and transmit streams

use num_complex::Complex32;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::reader::Transmission;
use crate::protocol::Burst;
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::PortSchema;

/// Items that can be written as interleaved little-endian f32 I/Q.
pub trait CaptureSamples: Clone + Send + 'static {
    /// Write the item's samples, returning how many were written.
    fn write_cf32<W: Write>(&self, out: &mut W) -> io::Result<usize>;
}

fn write_sample<W: Write>(out: &mut W, sample: Complex32) -> io::Result<()> {
    out.write_all(&sample.re.to_le_bytes())?;
    out.write_all(&sample.im.to_le_bytes())
}

impl CaptureSamples for Burst {
    fn write_cf32<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        for &s in self.samples.iter() {
            write_sample(out, s)?;
        }
        Ok(self.len())
    }
}

/// The real-valued command envelope goes on I, Q stays zero.
impl CaptureSamples for Transmission {
    fn write_cf32<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        for &level in self.waveform.iter() {
            write_sample(out, Complex32::new(level, 0.0))?;
        }
        Ok(self.waveform.len())
    }
}

/// Appends every received item to a `cf32_le` file.
///
/// Bursts are written back to back (the file loses their spacing);
/// transmissions are contiguous by construction, so the transmit capture is
/// the exact DAC stream.
pub struct CaptureSink<T> {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
    items: u64,
    samples: u64,
    input_buffer: VecDeque<T>,
}

impl<T: CaptureSamples> CaptureSink<T> {
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            name: "capture_sink".to_string(),
            path,
            writer: BufWriter::new(file),
            items: 0,
            samples: 0,
            input_buffer: VecDeque::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn write(&mut self, item: &T) -> io::Result<()> {
        self.samples += item.write_cf32(&mut self.writer)? as u64;
        self.items += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }
}

impl<T: CaptureSamples> ProcessNode for CaptureSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::input::<T>("in", 0)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let received = {
            let mut input = inputs
                .first()
                .and_then(|p| p.get::<T>(&mut self.input_buffer))
                .ok_or_else(|| WorkError::NodeError("Missing capture input".into()))?;
            input.recv()
        };

        let item = match received {
            Ok(item) => item,
            Err(WorkError::Shutdown) => {
                self.flush()
                    .map_err(|e| WorkError::NodeError(format!("Capture flush error: {}", e)))?;
                info!(
                    "[{}] Wrote {} items ({} samples) to {}",
                    self.name,
                    self.items,
                    self.samples,
                    self.path.display()
                );
                return Err(WorkError::Shutdown);
            }
            Err(e) => return Err(e),
        };

        self.write(&item)
            .map_err(|e| WorkError::NodeError(format!("Capture write error: {}", e)))?;
        Ok(1)
    }
}

impl<T> Drop for CaptureSink<T> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::ReceiveWindow;
    use crate::protocol::Command;
    use std::sync::Arc;

    fn read_cf32(path: &Path) -> Vec<Complex32> {
        std::fs::read(path)
            .unwrap()
            .chunks_exact(8)
            .map(|c| {
                Complex32::new(
                    f32::from_le_bytes(c[..4].try_into().unwrap()),
                    f32::from_le_bytes(c[4..].try_into().unwrap()),
                )
            })
            .collect()
    }

    #[test]
    fn bursts_are_written_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.cf32");
        let mut sink = CaptureSink::<Burst>::create(&path).unwrap();
        sink.write(&Burst::new(10, vec![Complex32::new(1.0, 2.0); 3])).unwrap();
        sink.write(&Burst::new(90, vec![Complex32::new(-0.5, 0.25)])).unwrap();
        sink.flush().unwrap();

        let samples = read_cf32(&path);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[2], Complex32::new(1.0, 2.0));
        assert_eq!(samples[3], Complex32::new(-0.5, 0.25));
        assert_eq!(sink.samples_written(), 4);
    }

    #[test]
    fn transmissions_go_on_the_in_phase_rail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.cf32");
        let transmission = Transmission {
            command: Command::Ack { rn16: 1 },
            start_index: 0,
            end_index: 2,
            window: ReceiveWindow { start: 3, end: 4 },
            dac_start_index: 0,
            waveform: Arc::from(vec![0.5f32, 0.0, 0.5, 0.5]),
        };
        {
            let mut sink = CaptureSink::<Transmission>::create(&path).unwrap();
            sink.write(&transmission).unwrap();
        }

        let samples = read_cf32(&path);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], Complex32::new(0.5, 0.0));
        assert_eq!(samples[1], Complex32::new(0.0, 0.0));
    }
}
