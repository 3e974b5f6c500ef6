//! Sink for singulated tags
//!
//! Logs every identity, counts re-reads of the same EPC and optionally
//! appends one CSV row per read.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::protocol::TagIdentity;
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::PortSchema;

const CSV_HEADER: &str = "Round,Sample,PC,EPC,CRC";

pub struct TagLog {
    name: String,
    csv: Option<BufWriter<File>>,
    reads: HashMap<Vec<u8>, u64>,
    count: usize,
    max_reads: usize,
    input_buffer: VecDeque<TagIdentity>,
}

impl TagLog {
    pub fn new() -> Self {
        Self {
            name: "tag_log".to_string(),
            csv: None,
            reads: HashMap::new(),
            count: 0,
            max_reads: 0,
            input_buffer: VecDeque::new(),
        }
    }

    /// Also write every read to a CSV file at `path`.
    pub fn with_csv<P: AsRef<Path>>(mut self, path: P) -> crate::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        self.csv = Some(writer);
        Ok(self)
    }

    /// Stop after `max_reads` identities (0 = unlimited).
    pub fn with_max_reads(mut self, max_reads: usize) -> Self {
        self.max_reads = max_reads;
        self
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Distinct EPCs seen so far
    pub fn unique(&self) -> usize {
        self.reads.len()
    }

    /// Times `epc` has been read
    pub fn reads_of(&self, epc: &[u8]) -> u64 {
        self.reads.get(epc).copied().unwrap_or(0)
    }

    pub fn record(&mut self, identity: &TagIdentity) -> std::io::Result<()> {
        self.count += 1;
        let reads = self.reads.entry(identity.epc.clone()).or_insert(0);
        *reads += 1;
        if *reads == 1 {
            info!("[{}] New tag {} in round {}", self.name, identity, identity.round);
        } else {
            debug!("[{}] {} read {} times", self.name, identity, reads);
        }

        if let Some(csv) = &mut self.csv {
            writeln!(
                csv,
                "{},{},{:04X},{},{}",
                identity.round,
                identity.start_index,
                identity.pc,
                identity.epc_hex(),
                if identity.crc_valid { "ok" } else { "bad" }
            )?;
        }
        Ok(())
    }
}

impl Default for TagLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNode for TagLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.max_reads > 0 && self.count >= self.max_reads
    }

    fn input_schema(&self) -> Vec<PortSchema> {
        vec![PortSchema::input::<TagIdentity>("identities", 0)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let identity = {
            let mut input = inputs
                .first()
                .and_then(|p| p.get::<TagIdentity>(&mut self.input_buffer))
                .ok_or_else(|| WorkError::NodeError("Missing identities input".into()))?;
            input.recv()?
        };

        self.record(&identity)
            .map_err(|e| WorkError::NodeError(format!("CSV write error: {}", e)))?;

        if self.should_stop() {
            info!("[{}] Read limit ({}) reached, shutting down", self.name, self.max_reads);
            return Err(WorkError::Shutdown);
        }
        Ok(1)
    }
}

impl Drop for TagLog {
    fn drop(&mut self) {
        if let Some(csv) = &mut self.csv {
            let _ = csv.flush();
        }
        info!("[{}] {} reads of {} distinct tags", self.name, self.count, self.reads.len());
    }
}
