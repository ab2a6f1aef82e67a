//! Lock-free ring buffer between the audio callbacks and the processing thread.
//!
//! One producer half and one consumer half share a fixed-capacity queue of
//! [`AudioBlock`]s. Neither half locks on the hot path; a full ring rejects
//! the write (overrun) and an empty ring returns short reads (underrun). Both
//! conditions are counted.
//!
//! Sample buffers travel back from the consumer through a pool of spares, so
//! a producer that calls [`RingProducer::preallocate`] before its stream starts
//! and takes buffers with [`RingProducer::take_buffer`] does not allocate.

use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

use crate::error::{ModemError, Result};

/// A fixed-length run of mono samples from one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    samples: Vec<f32>,
    sample_rate: u32,
    sequence: u64,
    timestamp: Duration,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
            timestamp,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time relative to stream start.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

struct Shared {
    queue: ArrayQueue<AudioBlock>,
    /// Incremented after a push and decremented after a pop, so it never
    /// overstates what the consumer can read. May dip below zero briefly.
    buffered_samples: AtomicIsize,
    overruns: AtomicU64,
    underruns: AtomicU64,
    /// Emptied buffers handed back by the consumer.
    spares: ArrayQueue<Vec<f32>>,
}

/// Buffers in flight outside the queue: one being filled, one being read.
const SPARE_SLACK: usize = 2;

impl Shared {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            spares: ArrayQueue::new(capacity.max(1) + SPARE_SLACK),
            buffered_samples: AtomicIsize::new(0),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        })
    }
}

/// Snapshot of ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub capacity_blocks: usize,
    pub buffered_blocks: usize,
    pub buffered_samples: usize,
    pub overruns: u64,
    pub underruns: u64,
}

pub struct AudioRing;

impl AudioRing {
    /// Create a ring holding up to `capacity` blocks and split it.
    pub fn with_capacity(capacity: usize) -> (RingProducer, RingConsumer) {
        let shared = Shared::new(capacity);
        (
            RingProducer {
                shared: shared.clone(),
            },
            RingConsumer {
                shared,
                partial: None,
            },
        )
    }

    /// Replace the ring behind both halves with an empty one of a new capacity.
    ///
    /// Needs exclusive access to both halves, so the streams using them must be
    /// stopped. Returns the number of blocks discarded.
    pub fn resize(producer: &mut RingProducer, consumer: &mut RingConsumer, capacity: usize) -> usize {
        let dropped = consumer.resync();
        let shared = Shared::new(capacity);
        producer.shared = shared.clone();
        consumer.shared = shared;
        dropped
    }
}

pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Non-blocking write. A full ring drops the block and reports `Overrun`.
    pub fn write(&self, block: AudioBlock) -> Result<()> {
        let len = block.len();
        match self.shared.queue.push(block) {
            Ok(()) => {
                self.shared.buffered_samples.fetch_add(len as isize, Ordering::AcqRel);
                Ok(())
            }
            Err(rejected) => {
                self.shared.overruns.fetch_add(1, Ordering::Relaxed);
                self.keep_buffer(rejected);
                Err(ModemError::Overrun)
            }
        }
    }

    /// Blocking write for producers that are not real-time callbacks.
    pub fn write_timeout(&self, block: AudioBlock, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        let mut block = block;
        loop {
            let len = block.len();
            match self.shared.queue.push(block) {
                Ok(()) => {
                    self.shared.buffered_samples.fetch_add(len as isize, Ordering::AcqRel);
                    return Ok(());
                }
                Err(rejected) => {
                    if Instant::now() >= deadline {
                        self.shared.overruns.fetch_add(1, Ordering::Relaxed);
                        self.keep_buffer(rejected);
                        return Err(ModemError::Overrun);
                    }
                    block = rejected;
                    if backoff.is_completed() {
                        std::thread::sleep(Duration::from_micros(200));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Fill the spare pool with empty buffers of `block_len` samples. Call
    /// before the stream starts; allocates.
    pub fn preallocate(&self, block_len: usize) {
        while self.shared.spares.push(Vec::with_capacity(block_len)).is_ok() {}
    }

    /// An empty buffer for the next block. Allocates only when the pool is dry.
    pub fn take_buffer(&self, block_len: usize) -> Vec<f32> {
        match self.shared.spares.pop() {
            Some(mut buffer) if buffer.capacity() >= block_len => {
                buffer.clear();
                buffer
            }
            _ => Vec::with_capacity(block_len),
        }
    }

    pub fn spare_buffers(&self) -> usize {
        self.shared.spares.len()
    }

    fn keep_buffer(&self, block: AudioBlock) {
        let mut samples = block.into_samples();
        samples.clear();
        let _ = self.shared.spares.push(samples);
    }

    pub fn has_room(&self) -> bool {
        !self.shared.queue.is_full()
    }

    pub fn free_blocks(&self) -> usize {
        self.shared.queue.capacity() - self.shared.queue.len()
    }

    pub fn stats(&self) -> RingStats {
        stats_of(&self.shared)
    }
}

pub struct RingConsumer {
    shared: Arc<Shared>,
    /// Block being drained by `read`/`fill`, with the next unread offset.
    partial: Option<(AudioBlock, usize)>,
}

impl RingConsumer {
    /// Take the next whole block. Unread samples of a partially read block are
    /// returned first, as a block of their own.
    pub fn pop_block(&mut self) -> Option<AudioBlock> {
        if let Some((block, offset)) = self.partial.take() {
            let rest = block.samples[offset..].to_vec();
            self.shared.buffered_samples.fetch_sub(rest.len() as isize, Ordering::AcqRel);
            return Some(AudioBlock::new(
                rest,
                block.sample_rate,
                block.sequence,
                block.timestamp,
            ));
        }
        let block = self.shared.queue.pop()?;
        self.shared.buffered_samples.fetch_sub(block.len() as isize, Ordering::AcqRel);
        Some(block)
    }

    /// Hand the buffer of a consumed block back to the producer.
    pub fn recycle(&self, block: AudioBlock) {
        let mut samples = block.into_samples();
        samples.clear();
        let _ = self.shared.spares.push(samples);
    }

    /// Read exactly `max_samples` samples, or report `Underrun` and consume
    /// nothing when fewer are buffered. Never blocks.
    pub fn read(&mut self, max_samples: usize) -> Result<Vec<f32>> {
        if self.available() < max_samples {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            return Err(ModemError::Underrun);
        }
        let mut out = vec![0.0; max_samples];
        let copied = self.copy_into(&mut out);
        debug_assert_eq!(copied, max_samples);
        Ok(out)
    }

    /// Real-time read: copy what is buffered into `out` and return the count.
    /// A short fill is counted as an underrun; the caller pads the rest.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let copied = self.copy_into(out);
        if copied < out.len() {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        copied
    }

    /// Buffered samples, including the unread part of a partial block.
    pub fn available(&self) -> usize {
        self.shared.buffered_samples.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Drop everything buffered. Returns the number of blocks dropped.
    pub fn resync(&mut self) -> usize {
        let mut dropped = 0;
        if let Some((block, offset)) = self.partial.take() {
            self.shared
                .buffered_samples
                .fetch_sub((block.len() - offset) as isize, Ordering::AcqRel);
            self.recycle(block);
            dropped += 1;
        }
        while let Some(block) = self.shared.queue.pop() {
            self.shared.buffered_samples.fetch_sub(block.len() as isize, Ordering::AcqRel);
            self.recycle(block);
            dropped += 1;
        }
        dropped
    }

    pub fn stats(&self) -> RingStats {
        stats_of(&self.shared)
    }

    fn copy_into(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let (block, offset) = match self.partial.take() {
                Some(partial) => partial,
                None => match self.shared.queue.pop() {
                    Some(block) => (block, 0),
                    None => break,
                },
            };
            let take = (block.len() - offset).min(out.len() - written);
            out[written..written + take].copy_from_slice(&block.samples[offset..offset + take]);
            written += take;
            self.shared.buffered_samples.fetch_sub(take as isize, Ordering::AcqRel);
            if offset + take < block.len() {
                self.partial = Some((block, offset + take));
            } else {
                self.recycle(block);
            }
        }
        written
    }
}

fn stats_of(shared: &Shared) -> RingStats {
    RingStats {
        capacity_blocks: shared.queue.capacity(),
        buffered_blocks: shared.queue.len(),
        buffered_samples: shared.buffered_samples.load(Ordering::Acquire).max(0) as usize,
        overruns: shared.overruns.load(Ordering::Relaxed),
        underruns: shared.underruns.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(seq: u64, len: usize) -> AudioBlock {
        let samples = (0..len).map(|i| (seq as usize * len + i) as f32).collect();
        AudioBlock::new(samples, 8000, seq, Duration::ZERO)
    }

    #[test]
    fn test_overrun_at_capacity() {
        let (producer, _consumer) = AudioRing::with_capacity(4);
        for seq in 0..4 {
            producer.write(block(seq, 16)).unwrap();
        }
        assert!(matches!(producer.write(block(4, 16)), Err(ModemError::Overrun)));
        assert_eq!(producer.stats().overruns, 1);
        assert_eq!(producer.stats().buffered_samples, 64);
    }

    #[test]
    fn test_underrun_on_empty_read() {
        let (_producer, mut consumer) = AudioRing::with_capacity(4);
        assert!(matches!(consumer.read(1), Err(ModemError::Underrun)));
        assert_eq!(consumer.stats().underruns, 1);
    }

    #[test]
    fn test_read_spans_blocks_and_keeps_remainder() {
        let (producer, mut consumer) = AudioRing::with_capacity(4);
        producer.write(block(0, 10)).unwrap();
        producer.write(block(1, 10)).unwrap();

        let first = consumer.read(15).unwrap();
        assert_eq!(first, (0..15).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(consumer.available(), 5);

        // Not enough left for a full read: nothing is consumed.
        assert!(consumer.read(6).is_err());
        assert_eq!(consumer.available(), 5);

        let rest = consumer.read(5).unwrap();
        assert_eq!(rest, (15..20).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_fill_pads_short_reads() {
        let (producer, mut consumer) = AudioRing::with_capacity(2);
        producer.write(block(0, 4)).unwrap();
        let mut out = [9.0f32; 6];
        assert_eq!(consumer.fill(&mut out), 4);
        assert_eq!(consumer.stats().underruns, 1);
    }

    #[test]
    fn test_pop_block_returns_partial_first() {
        let (producer, mut consumer) = AudioRing::with_capacity(2);
        producer.write(block(7, 8)).unwrap();
        consumer.read(3).unwrap();
        let rest = consumer.pop_block().unwrap();
        assert_eq!(rest.sequence(), 7);
        assert_eq!(rest.len(), 5);
        assert!(consumer.pop_block().is_none());
        assert_eq!(consumer.available(), 0);
    }

    #[test]
    fn test_resync_and_resize() {
        let (mut producer, mut consumer) = AudioRing::with_capacity(2);
        producer.write(block(0, 8)).unwrap();
        producer.write(block(1, 8)).unwrap();
        consumer.read(2).unwrap();

        let dropped = AudioRing::resize(&mut producer, &mut consumer, 8);
        assert_eq!(dropped, 2);
        assert_eq!(producer.stats().capacity_blocks, 8);
        assert!(consumer.is_empty());
        for seq in 0..8 {
            producer.write(block(seq, 1)).unwrap();
        }
        assert!(producer.write(block(8, 1)).is_err());
    }

    #[test]
    fn test_buffers_are_recycled_without_allocating() {
        let (producer, mut consumer) = AudioRing::with_capacity(2);
        producer.preallocate(16);
        assert_eq!(producer.spare_buffers(), 2 + SPARE_SLACK);

        let mut buffer = producer.take_buffer(16);
        let pointer = buffer.as_ptr();
        buffer.extend((0..16).map(|i| i as f32));
        producer
            .write(AudioBlock::new(buffer, 8000, 0, Duration::ZERO))
            .unwrap();
        assert_eq!(producer.spare_buffers(), 1 + SPARE_SLACK);

        let block = consumer.pop_block().unwrap();
        consumer.recycle(block);
        assert_eq!(producer.spare_buffers(), 2 + SPARE_SLACK);

        // FIFO pool: the recycled buffer is the last one out.
        let reused: Vec<_> = (0..2 + SPARE_SLACK).map(|_| producer.take_buffer(16)).collect();
        assert!(reused.iter().all(|b| b.is_empty() && b.capacity() >= 16));
        assert!(reused.iter().any(|b| b.as_ptr() == pointer));
    }

    #[test]
    fn test_overrun_keeps_the_rejected_buffer() {
        let (producer, _consumer) = AudioRing::with_capacity(1);
        producer.write(block(0, 4)).unwrap();
        assert!(producer.write(block(1, 4)).is_err());
        assert_eq!(producer.spare_buffers(), 1);
        assert!(producer.take_buffer(4).is_empty());
    }

    #[test]
    fn test_write_timeout_gives_up() {
        let (producer, _consumer) = AudioRing::with_capacity(1);
        producer.write(block(0, 1)).unwrap();
        let result = producer.write_timeout(block(1, 1), Duration::from_millis(5));
        assert!(matches!(result, Err(ModemError::Overrun)));
    }
}
