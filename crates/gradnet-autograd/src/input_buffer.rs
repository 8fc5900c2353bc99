//! Input Buffer - Per-Node Gradient Accumulation
//!
//! Collects the gradients produced for one node before it runs. Each slot
//! starts undefined; the first contribution is stored, later ones are added
//! in. When producer and consumer live on different streams of an
//! accelerator, the consumer is made to wait on an event recorded on the
//! producer before the addition is issued.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use gradnet_core::{Device, Error, Event, Result, Stream, StreamGuard};
use gradnet_tensor::Tensor;

// =============================================================================
// Accumulation Plan
// =============================================================================

/// How a contribution was ordered against other work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationPlan {
    /// The value is not on a stream-capable device.
    Synchronous,
    /// Accumulated on one stream; no cross-stream barrier was needed.
    OnStream(Stream),
    /// Consumer waited on an event recorded on the producer first.
    CrossStream {
        /// Stream the gradient was produced on.
        producer: Stream,
        /// Stream the accumulation ran on.
        consumer: Stream,
        /// Event the consumer waited on.
        event: Event,
    },
}

// =============================================================================
// Input Buffer
// =============================================================================

/// Fixed-size buffer of gradients awaiting a node.
#[derive(Debug, Clone, Default)]
pub struct InputBuffer {
    buffer: Vec<Option<Tensor>>,
}

impl InputBuffer {
    /// Creates a buffer with `size` undefined slots.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![None; size],
        }
    }

    /// Wraps already-computed inputs.
    #[must_use]
    pub fn from_inputs(inputs: Vec<Option<Tensor>>) -> Self {
        Self { buffer: inputs }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current value of slot `pos`.
    #[must_use]
    pub fn get(&self, pos: usize) -> Option<&Tensor> {
        self.buffer.get(pos).and_then(Option::as_ref)
    }

    /// Adds `value` into slot `pos`.
    ///
    /// `producer` is the stream the value was computed on, `consumer` the
    /// stream of the node that will read it. Streams on a different device
    /// than `value` are ignored. An undefined `value` leaves the slot alone.
    pub fn add(
        &mut self,
        pos: usize,
        value: Option<Tensor>,
        producer: Option<Stream>,
        consumer: Option<Stream>,
    ) -> Result<AccumulationPlan> {
        let len = self.buffer.len();
        let slot = self.buffer.get_mut(pos).ok_or_else(|| {
            Error::structural(format!(
                "input buffer position {pos} out of range for {len} slots"
            ))
        })?;
        let Some(value) = value else {
            return Ok(AccumulationPlan::Synchronous);
        };

        let device = value.device();
        let plan = if device.supports_streams() {
            let producer = producer.filter(|s| s.device() == device);
            let consumer = consumer.filter(|s| s.device() == device);
            match (producer, consumer) {
                (Some(producer), Some(consumer)) if producer != consumer => {
                    let event = producer.record_event();
                    consumer.wait_event(&event);
                    AccumulationPlan::CrossStream {
                        producer,
                        consumer,
                        event,
                    }
                }
                (_, Some(stream)) | (Some(stream), None) => AccumulationPlan::OnStream(stream),
                (None, None) => AccumulationPlan::Synchronous,
            }
        } else {
            AccumulationPlan::Synchronous
        };

        let _guard = match plan {
            AccumulationPlan::OnStream(stream)
            | AccumulationPlan::CrossStream {
                consumer: stream, ..
            } => Some(StreamGuard::new(stream)),
            AccumulationPlan::Synchronous => None,
        };
        *slot = Some(match slot.take() {
            Some(existing) => existing.add(&value)?,
            None => value,
        });
        Ok(plan)
    }

    /// Device of the first defined slot; CPU if none is defined.
    ///
    /// Chooses the ready queue the owning node is scheduled on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.buffer
            .iter()
            .flatten()
            .map(Tensor::device)
            .find(|d| !d.is_cpu())
            .unwrap_or(Device::Cpu)
    }

    /// Consumes the buffer, yielding its slots.
    #[must_use]
    pub fn into_inputs(self) -> Vec<Option<Tensor>> {
        self.buffer
    }
}

// =============================================================================
// Tests
// =============================================================================
