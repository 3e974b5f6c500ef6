//! Complex baseband sample blocks

use num_complex::Complex32;
use std::fmt;
use std::sync::Arc;

/// A contiguous run of receive-side baseband samples.
///
/// `start_index` is the position of `samples[0]` on the receive sample clock,
/// which starts at 0 and increases by one per sample for the whole session.
/// Every timing decision in the interrogator is made against this clock.
/// Blocks are shared through an `Arc` so broadcasting one to several
/// consumers never copies the samples.
#[derive(Clone, Debug)]
pub struct SampleBlock {
    pub start_index: u64,
    pub samples: Arc<[Complex32]>,
}

impl SampleBlock {
    pub fn new(start_index: u64, samples: impl Into<Arc<[Complex32]>>) -> Self {
        Self {
            start_index,
            samples: samples.into(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample index one past the last sample of this block
    #[inline]
    pub fn end_index(&self) -> u64 {
        self.start_index + self.samples.len() as u64
    }

    /// Samples paired with their absolute index
    pub fn indexed(&self) -> impl Iterator<Item = (u64, Complex32)> + '_ {
        (self.start_index..).zip(self.samples.iter().copied())
    }
}

impl fmt::Display for SampleBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SampleBlock[{}..{}]", self.start_index, self.end_index())
    }
}

/// Cut a sample buffer into consecutive blocks of at most `block_len` samples.
pub fn into_blocks(samples: &[Complex32], block_len: usize, first_index: u64) -> Vec<SampleBlock> {
    let block_len = block_len.max(1);
    samples
        .chunks(block_len)
        .enumerate()
        .map(|(i, chunk)| SampleBlock::new(first_index + (i * block_len) as u64, chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_tile_the_sample_clock() {
        let samples: Vec<Complex32> = (0..10).map(|i| Complex32::new(i as f32, 0.0)).collect();
        let blocks = into_blocks(&samples, 4, 100);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].start_index, 100);
        assert_eq!(blocks[1].start_index, blocks[0].end_index());
        assert_eq!(blocks[2].len(), 2);
        assert_eq!(blocks[2].end_index(), 110);
        let (index, sample) = blocks[1].indexed().next().unwrap();
        assert_eq!(index, 104);
        assert_eq!(sample.re, 4.0);
    }
}
