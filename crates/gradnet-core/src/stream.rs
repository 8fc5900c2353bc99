//! Streams - Asynchronous Execution Ordering
//!
//! Accelerator devices execute work on streams. Work on one stream runs in
//! order; ordering across streams is expressed with events: record an event
//! on the producer stream, make the consumer stream wait on it. Waiting is a
//! barrier inserted into the consumer's queue, never a blocking host wait.
//!
//! Streams here are lightweight handles. The synchronization log kept per
//! stream lets callers observe which barriers were inserted.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::device::Device;

// =============================================================================
// Stream
// =============================================================================

/// An ordered asynchronous work queue on an accelerator device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    device: Device,
    id: u32,
}

/// Per-stream synchronization bookkeeping.
#[derive(Debug, Default)]
struct StreamState {
    recorded: u64,
    waits: Vec<Event>,
}

fn stream_states() -> &'static Mutex<HashMap<Stream, StreamState>> {
    static STATES: OnceLock<Mutex<HashMap<Stream, StreamState>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Stream {
    /// Creates a handle to stream `id` on `device`.
    ///
    /// Returns `None` for devices without asynchronous streams.
    #[must_use]
    pub fn new(device: Device, id: u32) -> Option<Self> {
        device.supports_streams().then_some(Self { device, id })
    }

    /// Returns the default stream (id 0) of `device`, if it has streams.
    #[must_use]
    pub fn default_for(device: Device) -> Option<Self> {
        Self::new(device, 0)
    }

    /// Returns the device this stream belongs to.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Returns the stream id on its device.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Records an event marking all work enqueued on this stream so far.
    #[must_use]
    pub fn record_event(&self) -> Event {
        let mut states = stream_states().lock();
        let state = states.entry(*self).or_default();
        state.recorded += 1;
        Event {
            stream: *self,
            sequence: state.recorded,
        }
    }

    /// Makes future work on this stream wait until `event` has completed.
    pub fn wait_event(&self, event: &Event) {
        if event.stream == *self {
            return;
        }
        stream_states()
            .lock()
            .entry(*self)
            .or_default()
            .waits
            .push(*event);
    }

    /// Returns the events this stream has been made to wait on.
    #[must_use]
    pub fn waited_events(&self) -> Vec<Event> {
        stream_states()
            .lock()
            .get(self)
            .map(|s| s.waits.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Event
// =============================================================================

/// A marker recorded on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    stream: Stream,
    sequence: u64,
}

impl Event {
    /// The stream this event was recorded on.
    #[must_use]
    pub const fn stream(&self) -> Stream {
        self.stream
    }

    /// Position of this event in the recording stream's history.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

// =============================================================================
// Current Stream
// =============================================================================

thread_local! {
    /// Streams made current on this thread, per device.
    static CURRENT_STREAMS: RefCell<HashMap<Device, Stream>> = RefCell::new(HashMap::new());
}

/// Returns the stream current on this thread for `device`.
///
/// Falls back to the device's default stream; `None` for CPU.
#[must_use]
pub fn current_stream(device: Device) -> Option<Stream> {
    CURRENT_STREAMS
        .with(|s| s.borrow().get(&device).copied())
        .or_else(|| Stream::default_for(device))
}

fn set_current_stream(device: Device, stream: Option<Stream>) {
    CURRENT_STREAMS.with(|s| {
        let mut map = s.borrow_mut();
        match stream {
            Some(stream) => {
                map.insert(device, stream);
            }
            None => {
                map.remove(&device);
            }
        }
    });
}

/// RAII guard that makes a stream current for its device.
///
/// The previous current stream is restored on drop.
pub struct StreamGuard {
    device: Device,
    prev: Option<Stream>,
}

impl StreamGuard {
    /// Makes `stream` current on this thread.
    #[must_use]
    pub fn new(stream: Stream) -> Self {
        let device = stream.device();
        let prev = CURRENT_STREAMS.with(|s| s.borrow().get(&device).copied());
        set_current_stream(device, Some(stream));
        Self { device, prev }
    }

    /// Makes every given stream current; guards restore in reverse order.
    #[must_use]
    pub fn multi(streams: impl IntoIterator<Item = Stream>) -> Vec<Self> {
        streams.into_iter().map(Self::new).collect()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        set_current_stream(self.device, self.prev);
    }
}

// =============================================================================
// Tests
// =============================================================================
