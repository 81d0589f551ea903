//! Real-time capture tap.
//!
//! [`WaveProcessor`] runs inside the engine's render callback. It quantises
//! float input to 16-bit samples, collects them into fixed-size chunks and
//! hands each full chunk to the control thread over an `rtrb` queue. The
//! render side never waits on the consumer: a full queue drops the chunk.
//!
//! Chunk buffers circulate. The control thread returns each drained chunk
//! over a second ring and the processor refills it, so steady-state capture
//! does not allocate on the audio thread.

use std::fmt;

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::util::to_int;

/// Chunk buffers allocated up front for every recorder.
pub const PREALLOCATED_CHUNKS: usize = 4;

/// One chunk of captured samples on its way to the waveform writer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Vec<i16>,
    /// Position of this chunk in the producer's output sequence.
    pub index: u64,
    /// Generation of the recorder instance that produced the chunk.
    pub tap: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Creates a recorder tap and the port its chunks are drained from.
/// `capacity` bounds how many chunks may wait in the queue.
pub fn recorder_channel(chunk_len: usize, capacity: usize, tap: u64) -> (WaveProcessor, RecorderPort) {
    let chunk_len = chunk_len.max(1);
    let capacity = capacity.max(1);
    let (producer, consumer) = RingBuffer::new(capacity);
    let (mut returns, free) = RingBuffer::new(capacity + PREALLOCATED_CHUNKS + 1);
    for _ in 0..PREALLOCATED_CHUNKS {
        let _ = returns.push(vec![0; chunk_len]);
    }

    let processor = WaveProcessor {
        buffer: vec![0; chunk_len],
        offset: 0,
        producer,
        free,
        spare: None,
        tap,
        emitted: 0,
        overflowed: 0,
        allocated: 0,
    };
    let port = RecorderPort {
        consumer,
        returns,
        chunk_len,
        tap,
    };
    (processor, port)
}

/// Consumer end of a recorder queue, drained on the control thread.
pub struct RecorderPort {
    consumer: Consumer<Batch>,
    returns: Producer<Vec<i16>>,
    chunk_len: usize,
    tap: u64,
}

impl RecorderPort {
    pub fn tap(&self) -> u64 {
        self.tap
    }

    /// Pops every batch currently queued.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut batches = Vec::with_capacity(self.consumer.slots());
        while let Ok(batch) = self.consumer.pop() {
            batches.push(batch);
        }
        batches
    }

    /// Hands a consumed batch's buffer back to the processor for reuse.
    pub fn recycle(&mut self, batch: Batch) {
        if batch.data.len() == self.chunk_len {
            let _ = self.returns.push(batch.data);
        }
    }

    /// Whether the producing tap has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

/// Float-to-16-bit chunking processor.
pub struct WaveProcessor {
    buffer: Vec<i16>,
    offset: usize,
    producer: Producer<Batch>,
    free: Consumer<Vec<i16>>,
    /// Buffer of a chunk the full queue refused, reused for the next one.
    spare: Option<Vec<i16>>,
    tap: u64,
    emitted: u64,
    overflowed: u64,
    allocated: u64,
}

impl WaveProcessor {
    /// Consumes one render block. Returns `true` to keep the node alive, also
    /// when no input is connected for this block.
    pub fn process(&mut self, input: Option<&[f32]>) -> bool {
        let Some(mut input) = input else {
            return true;
        };

        while !input.is_empty() {
            let room = self.buffer.len() - self.offset;
            let take = room.min(input.len());
            for (slot, &sample) in self.buffer[self.offset..self.offset + take]
                .iter_mut()
                .zip(input)
            {
                *slot = to_int(sample);
            }
            self.offset += take;
            input = &input[take..];

            if self.offset == self.buffer.len() {
                self.emit();
            }
        }

        true
    }

    fn emit(&mut self) {
        let fresh = match self.spare.take().or_else(|| self.free.pop().ok()) {
            Some(buffer) => buffer,
            None => {
                self.allocated += 1;
                vec![0; self.buffer.len()]
            }
        };
        let batch = Batch {
            data: std::mem::replace(&mut self.buffer, fresh),
            index: self.emitted,
            tap: self.tap,
        };
        self.emitted += 1;
        self.offset = 0;
        if let Err(PushError::Full(batch)) = self.producer.push(batch) {
            self.overflowed += 1;
            self.spare = Some(batch.data);
        }
    }

    pub fn chunk_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn tap(&self) -> u64 {
        self.tap
    }

    /// Chunks emitted so far, including any that were dropped.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Chunks dropped because the queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Chunk buffers allocated because none were free for reuse.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }
}

impl fmt::Debug for RecorderPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderPort")
            .field("tap", &self.tap)
            .field("queued", &self.consumer.slots())
            .finish()
    }
}

impl fmt::Debug for WaveProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveProcessor")
            .field("chunk_len", &self.buffer.len())
            .field("offset", &self.offset)
            .field("tap", &self.tap)
            .field("emitted", &self.emitted)
            .field("overflowed", &self.overflowed)
            .field("allocated", &self.allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(chunk_len: usize, capacity: usize) -> (WaveProcessor, RecorderPort) {
        recorder_channel(chunk_len, capacity, 7)
    }

    #[test]
    fn emits_full_chunks_only() {
        let (mut processor, mut port) = processor(256, 4);
        assert!(processor.process(Some(&[0.5; 128])));
        assert!(port.drain().is_empty());

        assert!(processor.process(Some(&[-0.5; 128])));
        let batches = port.drain();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 256);
        assert_eq!(batch.tap, 7);
        assert_eq!(batch.index, 0);
        assert!(batch.data[..128].iter().all(|&v| v == 16_383));
        assert!(batch.data[128..].iter().all(|&v| v == -16_384));
    }

    #[test]
    fn missing_input_keeps_processing() {
        let (mut processor, mut port) = processor(128, 4);
        assert!(processor.process(None));
        assert!(port.drain().is_empty());
        assert!(processor.process(Some(&[0.0; 128])));
        assert_eq!(port.drain().len(), 1);
    }

    #[test]
    fn splits_blocks_across_chunks() {
        let (mut processor, mut port) = processor(100, 8);
        let block: Vec<f32> = (0..250).map(|i| if i < 100 { 1.0 } else { -1.0 }).collect();
        processor.process(Some(&block));
        let batches = port.drain();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].data.iter().all(|&v| v == i16::MAX));
        assert!(batches[1].data.iter().all(|&v| v == i16::MIN));
        assert_eq!(batches[1].index, 1);
        processor.process(Some(&[0.0; 50]));
        assert_eq!(port.drain().len(), 1);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (mut processor, mut port) = processor(16, 1);
        processor.process(Some(&[0.1; 48]));
        assert_eq!(processor.emitted(), 3);
        assert_eq!(processor.overflowed(), 2);
        assert_eq!(port.drain().len(), 1);
        assert_eq!(processor.allocated(), 0);
    }

    #[test]
    fn recycled_buffers_keep_capture_allocation_free() {
        let (mut processor, mut port) = processor(64, 2);
        let mut received = 0;
        for round in 0..50 {
            let value = if round % 2 == 0 { 0.5 } else { -0.5 };
            processor.process(Some(&[value; 64]));
            for batch in port.drain() {
                // a reused buffer carries no samples from an earlier chunk
                assert!(batch.data.iter().all(|&v| v == to_int(value)));
                received += 1;
                port.recycle(batch);
            }
        }
        assert_eq!(received, 50);
        assert_eq!(processor.allocated(), 0);
    }

    #[test]
    fn exhausted_pool_falls_back_to_allocating() {
        let (mut processor, mut port) = processor(8, 16);
        processor.process(Some(&[0.0; 8 * (PREALLOCATED_CHUNKS + 2)]));
        assert_eq!(port.drain().len(), PREALLOCATED_CHUNKS + 2);
        assert_eq!(processor.allocated(), 2);
    }

    #[test]
    fn port_notices_dropped_producer() {
        let (processor, port) = processor(16, 1);
        assert!(!port.is_abandoned());
        drop(processor);
        assert!(port.is_abandoned());
    }
}
