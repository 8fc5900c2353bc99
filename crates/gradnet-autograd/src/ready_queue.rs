//! Ready Queue - Per-Device Priority Queue of Runnable Nodes
//!
//! Ordered so that shutdown requests come first, then work from deeper
//! reentrant passes, then nodes with larger sequence numbers (created later
//! in the forward pass).
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use gradnet_core::Device;
use parking_lot::{Condvar, Mutex};

use crate::graph_task::GraphTask;
use crate::input_buffer::InputBuffer;
use crate::node::NodeRef;

// =============================================================================
// Ready Task
// =============================================================================

pub(crate) enum ReadyTask {
    Shutdown,
    Node {
        graph_task: Arc<GraphTask>,
        node: NodeRef,
        inputs: InputBuffer,
    },
}

impl ReadyTask {
    pub(crate) fn node(graph_task: Arc<GraphTask>, node: NodeRef, inputs: InputBuffer) -> Self {
        Self::Node {
            graph_task,
            node,
            inputs,
        }
    }

    fn priority(&self) -> (bool, usize, u64) {
        match self {
            Self::Shutdown => (true, 0, 0),
            Self::Node {
                graph_task, node, ..
            } => (false, graph_task.reentrant_depth(), node.sequence_nr()),
        }
    }
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority()
    }
}

impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

// =============================================================================
// Ready Queue
// =============================================================================

pub(crate) struct ReadyQueue {
    device: Device,
    heap: Mutex<BinaryHeap<ReadyTask>>,
    available: Condvar,
}

impl ReadyQueue {
    pub(crate) fn new(device: Device) -> Self {
        Self {
            device,
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
        }
    }

    pub(crate) fn device(&self) -> Device {
        self.device
    }

    pub(crate) fn push(&self, task: ReadyTask) {
        self.heap.lock().push(task);
        self.available.notify_one();
    }

    pub(crate) fn push_shutdown(&self) {
        self.push(ReadyTask::Shutdown);
    }

    /// Pops the highest-priority task, blocking while the queue is empty.
    ///
    /// Returns `None` once `stop` holds; it is checked under the queue lock
    /// so a concurrent [`ReadyQueue::wake_all`] is never missed.
    pub(crate) fn pop_until(&self, stop: &dyn Fn() -> bool) -> Option<ReadyTask> {
        let mut heap = self.heap.lock();
        loop {
            if stop() {
                if !heap.is_empty() {
                    self.available.notify_one();
                }
                return None;
            }
            if let Some(task) = heap.pop() {
                return Some(task);
            }
            self.available.wait(&mut heap);
        }
    }

    /// Wakes every waiter so it re-checks its stop condition.
    pub(crate) fn wake_all(&self) {
        let _heap = self.heap.lock();
        self.available.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::Identity;

    fn task_at(depth: usize) -> (Arc<GraphTask>, NodeRef) {
        let node: NodeRef = Arc::new(Identity::new(vec![], vec![]));
        (Arc::new(GraphTask::new(false, false, depth)), node)
    }

    fn seq(task: &ReadyTask) -> Option<u64> {
        match task {
            ReadyTask::Node { node, .. } => Some(node.sequence_nr()),
            ReadyTask::Shutdown => None,
        }
    }

    #[test]
    fn test_later_nodes_first() {
        let queue = ReadyQueue::new(Device::Cpu);
        let (t, early) = task_at(0);
        let (_, late) = task_at(0);
        let late_seq = late.sequence_nr();
        queue.push(ReadyTask::node(Arc::clone(&t), early, InputBuffer::new(0)));
        queue.push(ReadyTask::node(t, late, InputBuffer::new(0)));
        assert_eq!(seq(&queue.pop_until(&|| false).unwrap()), Some(late_seq));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_depth_then_shutdown_priority() {
        let queue = ReadyQueue::new(Device::Cpu);
        let (shallow, n1) = task_at(0);
        let (deep, n0) = task_at(3);
        let deep_seq = n0.sequence_nr();
        queue.push(ReadyTask::node(deep, n0, InputBuffer::new(0)));
        queue.push(ReadyTask::node(shallow, n1, InputBuffer::new(0)));
        queue.push_shutdown();

        assert!(matches!(queue.pop_until(&|| false), Some(ReadyTask::Shutdown)));
        assert_eq!(seq(&queue.pop_until(&|| false).unwrap()), Some(deep_seq));
    }

    #[test]
    fn test_stop_condition() {
        let queue = ReadyQueue::new(Device::Cpu);
        queue.push_shutdown();
        assert!(queue.pop_until(&|| true).is_none());
        assert_eq!(queue.device(), Device::Cpu);
    }
}
