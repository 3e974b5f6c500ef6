//! Capture file source
//!
//! `FileSource` memory-maps a `cf32_le` capture (interleaved little-endian
//! f32 I/Q pairs) and emits it as consecutive `SampleBlock`s. The file stands
//! in for the receive chain: downstream nodes see the same blocking behaviour
//! as with a live stream, and the source stops at the end of the file.

use memmap2::Mmap;
use num_complex::Complex32;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::{PortSchema, SampleBlock};
use crate::{Result, RfidError};

/// Bytes per complex sample
const CF32_BYTES: usize = 8;

pub struct FileSource {
    name: String,
    data: Mmap,
    block_len: usize,
    position: usize,
    limit: usize,
    blocks_sent: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, block_len: usize) -> Result<Self> {
        let path = path.as_ref();
        if block_len == 0 {
            return Err(RfidError::ConfigurationInvalid("block length must be positive".into()));
        }
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the capture is not expected to
        // change while it is being replayed.
        let data = unsafe { Mmap::map(&file)? };
        if data.len() % CF32_BYTES != 0 {
            return Err(RfidError::Capture(format!(
                "{}: {} bytes is not a whole number of cf32 samples",
                path.display(),
                data.len()
            )));
        }
        let samples = data.len() / CF32_BYTES;
        info!("Mapped {} ({} samples)", path.display(), samples);
        Ok(Self {
            name: "file_source".to_string(),
            data,
            block_len,
            position: 0,
            limit: samples,
            blocks_sent: 0,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stop after `max_samples` samples.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.limit = self.limit.min(max_samples);
        self
    }

    pub fn num_samples(&self) -> usize {
        self.limit
    }

    /// Next block, or `None` once the capture is exhausted.
    pub fn next_block(&mut self) -> Option<SampleBlock> {
        if self.position >= self.limit {
            return None;
        }
        let end = (self.position + self.block_len).min(self.limit);
        let bytes = &self.data[self.position * CF32_BYTES..end * CF32_BYTES];
        let samples: Vec<Complex32> = bytes
            .chunks_exact(CF32_BYTES)
            .map(|c| {
                Complex32::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect();
        let block = SampleBlock::new(self.position as u64, samples);
        self.position = end;
        self.blocks_sent += 1;
        Some(block)
    }
}

impl ProcessNode for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::output::<SampleBlock>("samples", 0)]
    }

    fn work(&mut self, _inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        let output = outputs
            .first()
            .and_then(|p| p.get::<SampleBlock>())
            .ok_or_else(|| WorkError::NodeError("Missing samples output".into()))?;

        match self.next_block() {
            Some(block) => {
                let len = block.len();
                output.deliver(block)?;
                Ok(len)
            }
            None => {
                debug!("[{}] End of capture after {} blocks", self.name, self.blocks_sent);
                output.close();
                Err(WorkError::Shutdown)
            }
        }
    }
}
