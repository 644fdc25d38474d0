//! Bounded FIFO of sample blocks shared between a streaming thread and
//! application callers.
//!
//! Capacity is counted in blocks. A push into a full FIFO waits for space up
//! to its timeout; a pop from an empty FIFO waits for data up to its timeout.
//! Consumers may take less than a whole block; the remainder stays at the
//! front with its timestamp advanced accordingly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use num_complex::Complex;
use parking_lot::{Condvar, Mutex};

use super::StreamMetadata;

/// Samples plus the metadata of their first sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBlock {
    /// Timestamp and flags.
    pub meta: StreamMetadata,
    /// Canonical 12-bit samples.
    pub samples: Vec<Complex<i16>>,
}

impl SampleBlock {
    /// Block starting at `timestamp`.
    pub fn new(timestamp: u64, samples: Vec<Complex<i16>>) -> Self {
        Self {
            meta: StreamMetadata {
                timestamp,
                ..StreamMetadata::default()
            },
            samples,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the block holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp one past the last sample.
    pub fn end_timestamp(&self) -> u64 {
        self.meta.timestamp.wrapping_add(self.samples.len() as u64)
    }
}

/// Why a FIFO operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// Deadline passed while full (push) or empty (pop).
    Timeout,
    /// The FIFO was closed.
    Closed,
}

#[derive(Debug, Default)]
struct FifoState {
    blocks: VecDeque<SampleBlock>,
    // Samples already consumed from the front block.
    head_offset: usize,
    samples: usize,
    closed: bool,
}

/// Bounded, blocking-with-timeout block queue.
#[derive(Debug)]
pub struct SampleFifo {
    capacity: usize,
    state: Mutex<FifoState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl SampleFifo {
    /// FIFO holding at most `capacity` blocks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(FifoState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Capacity in blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued blocks.
    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().blocks.is_empty()
    }

    /// Queued samples not yet consumed.
    pub fn buffered_samples(&self) -> usize {
        self.state.lock().samples
    }

    /// Enqueue `block`, waiting up to `timeout` for space.
    pub fn push(&self, block: SampleBlock, timeout: Duration) -> Result<(), FifoError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(FifoError::Closed);
            }
            if state.blocks.len() < self.capacity {
                break;
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && state.blocks.len() >= self.capacity
                && !state.closed
            {
                return Err(FifoError::Timeout);
            }
        }
        state.samples += block.len();
        state.blocks.push_back(block);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue up to `max` samples from the front block, waiting up to
    /// `timeout` for data.
    ///
    /// Never spans two blocks, so the returned metadata is exact.
    pub fn pop_samples(&self, max: usize, timeout: Duration) -> Result<SampleBlock, FifoError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.blocks.is_empty() {
                break;
            }
            if state.closed {
                return Err(FifoError::Closed);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out()
                && state.blocks.is_empty()
                && !state.closed
            {
                return Err(FifoError::Timeout);
            }
        }

        let offset = state.head_offset;
        let Some(front) = state.blocks.front() else {
            return Err(FifoError::Timeout);
        };
        let available = front.len() - offset;
        let take = available.min(max.max(1));
        let finishes_block = take == available;

        let mut meta = front.meta;
        meta.timestamp = meta.timestamp.wrapping_add(offset as u64);
        if offset > 0 {
            meta.dropped = false;
        }
        if !finishes_block {
            meta.end_of_burst = false;
        }
        let samples = front.samples[offset..offset + take].to_vec();

        state.samples -= take;
        if finishes_block {
            state.blocks.pop_front();
            state.head_offset = 0;
            drop(state);
            self.not_full.notify_one();
        } else {
            state.head_offset += take;
        }
        Ok(SampleBlock { meta, samples })
    }

    /// Drop queued samples whose timestamp is before `timestamp`.
    ///
    /// Returns the number of samples discarded. Order is never changed.
    pub fn discard_before(&self, timestamp: u64) -> usize {
        let mut state = self.state.lock();
        let mut discarded = 0;
        let mut freed = false;
        loop {
            let offset = state.head_offset;
            let Some(front) = state.blocks.front() else {
                break;
            };
            let start = front.meta.timestamp.wrapping_add(offset as u64);
            if start >= timestamp {
                break;
            }
            let remaining = front.len() - offset;
            let skip = usize::try_from(timestamp - start).map_or(remaining, |n| n.min(remaining));
            discarded += skip;
            state.samples -= skip;
            if skip == remaining {
                state.blocks.pop_front();
                state.head_offset = 0;
                freed = true;
            } else {
                state.head_offset += skip;
                break;
            }
        }
        drop(state);
        if freed {
            self.not_full.notify_all();
        }
        discarded
    }

    /// Timestamp of the next sample to be popped.
    pub fn front_timestamp(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .blocks
            .front()
            .map(|b| b.meta.timestamp.wrapping_add(state.head_offset as u64))
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.blocks.clear();
        state.head_offset = 0;
        state.samples = 0;
        drop(state);
        self.not_full.notify_all();
    }

    /// Close the FIFO and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Reopen a closed FIFO.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Whether the FIFO is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn block(ts: u64, n: usize) -> SampleBlock {
        SampleBlock::new(ts, (0..n as i16).map(|i| Complex::new(i, -i)).collect())
    }

    #[test]
    fn test_push_beyond_depth_times_out() {
        let fifo = SampleFifo::new(3);
        for i in 0..3 {
            fifo.push(block(i * 10, 10), Duration::ZERO).unwrap();
        }
        let start = Instant::now();
        assert_eq!(
            fifo.push(block(30, 10), Duration::from_millis(20)),
            Err(FifoError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(fifo.len(), 3);
    }

    #[test]
    fn test_blocked_push_resumes_after_pop() {
        let fifo = Arc::new(SampleFifo::new(1));
        fifo.push(block(0, 4), Duration::ZERO).unwrap();

        let producer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.push(block(4, 4), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let first = fifo.pop_samples(4, Duration::from_secs(1)).unwrap();
        assert_eq!(first.meta.timestamp, 0);
        producer.join().unwrap().unwrap();
        assert_eq!(fifo.pop_samples(4, Duration::ZERO).unwrap().meta.timestamp, 4);
    }

    #[test]
    fn test_partial_pop_advances_timestamp_and_keeps_flags_on_the_right_piece() {
        let fifo = SampleFifo::new(4);
        let mut b = block(100, 10);
        b.meta.dropped = true;
        b.meta.end_of_burst = true;
        fifo.push(b, Duration::ZERO).unwrap();

        let head = fifo.pop_samples(4, Duration::ZERO).unwrap();
        assert_eq!(head.meta.timestamp, 100);
        assert!(head.meta.dropped);
        assert!(!head.meta.end_of_burst);
        assert_eq!(fifo.buffered_samples(), 6);

        let tail = fifo.pop_samples(100, Duration::ZERO).unwrap();
        assert_eq!(tail.meta.timestamp, 104);
        assert_eq!(tail.len(), 6);
        assert!(!tail.meta.dropped);
        assert!(tail.meta.end_of_burst);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_pop_empty_times_out() {
        let fifo = SampleFifo::new(2);
        assert_eq!(
            fifo.pop_samples(1, Duration::from_millis(5)),
            Err(FifoError::Timeout)
        );
    }

    #[test]
    fn test_close_wakes_waiters() {
        let fifo = Arc::new(SampleFifo::new(1));
        let consumer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.pop_samples(1, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        fifo.close();
        assert_eq!(consumer.join().unwrap(), Err(FifoError::Closed));
        assert_eq!(fifo.push(block(0, 1), Duration::ZERO), Err(FifoError::Closed));
    }

    #[test]
    fn test_discard_before_never_reorders() {
        let fifo = SampleFifo::new(4);
        fifo.push(block(0, 10), Duration::ZERO).unwrap();
        fifo.push(block(10, 10), Duration::ZERO).unwrap();
        assert_eq!(fifo.discard_before(15), 15);
        assert_eq!(fifo.front_timestamp(), Some(15));
        let next = fifo.pop_samples(100, Duration::ZERO).unwrap();
        assert_eq!(next.meta.timestamp, 15);
        assert_eq!(next.samples[0], Complex::new(5, -5));
        assert_eq!(fifo.discard_before(1000), 0);
    }
}
