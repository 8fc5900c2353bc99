//! Graph Nodes - Differentiable Operation Interface
//!
//! Defines the interface every unit of the backward graph implements. A node
//! consumes one gradient per declared input, produces one gradient per
//! outgoing edge, and declares those edges up front. Nodes are shared
//! (`Arc`) by every edge that points at them; a node lives as long as the
//! last edge or variable holding it.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gradnet_core::{current_stream, Device, Result, Stream};
use gradnet_tensor::{zeros_on, Tensor};
use parking_lot::RwLock;

// =============================================================================
// Identity and Ordering
// =============================================================================

/// Shared handle to a graph node.
pub type NodeRef = Arc<dyn Node>;

/// Stable identity of a node, derived from its allocation.
///
/// Survives cloning of the `Arc`, so it can key per-pass bookkeeping.
pub type NodeId = usize;

/// Returns the identity of `node`.
#[must_use]
pub fn node_id(node: &NodeRef) -> NodeId {
    Arc::as_ptr(node).cast::<()>() as NodeId
}

static NEXT_SEQUENCE_NR: AtomicU64 = AtomicU64::new(0);

/// Allocates the next sequence number.
///
/// Nodes created later in the forward pass get larger numbers and run first
/// among simultaneously ready nodes.
pub fn next_sequence_nr() -> u64 {
    NEXT_SEQUENCE_NR.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Input Metadata
// =============================================================================

/// Shape and placement recorded for one input slot of a node.
///
/// Used to synthesize zero gradients for slots nobody produced and to pick
/// the stream the node runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMetadata {
    shape: Vec<usize>,
    device: Device,
    stream: Option<Stream>,
    defined: bool,
}

impl InputMetadata {
    /// Records a slot of the given shape on `device`, on the current stream.
    #[must_use]
    pub fn new(shape: &[usize], device: Device) -> Self {
        Self {
            shape: shape.to_vec(),
            device,
            stream: current_stream(device),
            defined: true,
        }
    }

    /// Records a slot matching `tensor`.
    #[must_use]
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self::new(tensor.shape(), tensor.device())
    }

    /// A slot with no shape information; it never gets a zero fill.
    #[must_use]
    pub fn undefined() -> Self {
        Self {
            shape: Vec::new(),
            device: Device::Cpu,
            stream: None,
            defined: false,
        }
    }

    /// Overrides the recorded stream.
    #[must_use]
    pub fn with_stream(mut self, stream: Option<Stream>) -> Self {
        self.stream = stream;
        self
    }

    /// Recorded shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Recorded device.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Stream current on the device when the slot was recorded.
    #[must_use]
    pub fn stream(&self) -> Option<Stream> {
        self.stream
    }

    /// Whether shape information is available.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Zero gradient shaped and placed like this slot.
    #[must_use]
    pub fn zeros_like(&self) -> Option<Tensor> {
        self.defined.then(|| zeros_on(&self.shape, self.device))
    }
}

// =============================================================================
// Edge
// =============================================================================

/// Where a gradient output is consumed: a node and one of its input slots.
///
/// An edge without a node means "no gradient consumer".
#[derive(Clone, Default)]
pub struct Edge {
    /// The consuming node.
    pub function: Option<NodeRef>,
    /// Input slot on the consuming node.
    pub input_nr: usize,
}

impl Edge {
    /// Creates an edge to `input_nr` of `function`.
    #[must_use]
    pub fn new(function: NodeRef, input_nr: usize) -> Self {
        Self {
            function: Some(function),
            input_nr,
        }
    }

    /// The edge that discards its gradient.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the edge leads to a node.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.function.is_some()
    }
}

impl Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(node) => write!(f, "Edge({}, {})", node.name(), self.input_nr),
            None => write!(f, "Edge(None)"),
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Runs before a node and may rewrite the gradients it receives.
pub type PreHook = Box<dyn Fn(Vec<Option<Tensor>>) -> Vec<Option<Tensor>> + Send + Sync>;

/// Runs after a node with its inputs and outputs.
pub type PostHook = Box<dyn Fn(&[Option<Tensor>], &[Option<Tensor>]) + Send + Sync>;

// =============================================================================
// Node Base
// =============================================================================

/// State every node carries: edges, input metadata, sequence number, hooks.
pub struct NodeBase {
    sequence_nr: u64,
    next_edges: Vec<Edge>,
    input_metadata: Vec<InputMetadata>,
    pre_hooks: RwLock<Vec<PreHook>>,
    post_hooks: RwLock<Vec<PostHook>>,
}

impl NodeBase {
    /// Creates the base for a node with the given edges and input slots.
    #[must_use]
    pub fn new(next_edges: Vec<Edge>, input_metadata: Vec<InputMetadata>) -> Self {
        Self {
            sequence_nr: next_sequence_nr(),
            next_edges,
            input_metadata,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Outgoing edges, one per gradient output.
    #[must_use]
    pub fn next_edges(&self) -> &[Edge] {
        &self.next_edges
    }

    /// Metadata for each input slot.
    #[must_use]
    pub fn input_metadata(&self) -> &[InputMetadata] {
        &self.input_metadata
    }

    /// Sequence number assigned at construction.
    #[must_use]
    pub fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    /// Registers a hook run before the node.
    pub fn add_pre_hook(&self, hook: PreHook) {
        self.pre_hooks.write().push(hook);
    }

    /// Registers a hook run after the node.
    pub fn add_post_hook(&self, hook: PostHook) {
        self.post_hooks.write().push(hook);
    }

    pub(crate) fn has_post_hooks(&self) -> bool {
        !self.post_hooks.read().is_empty()
    }

    pub(crate) fn call_pre_hooks(&self, mut inputs: Vec<Option<Tensor>>) -> Vec<Option<Tensor>> {
        for hook in self.pre_hooks.read().iter() {
            inputs = hook(inputs);
        }
        inputs
    }

    pub(crate) fn call_post_hooks(&self, inputs: &[Option<Tensor>], outputs: &[Option<Tensor>]) {
        for hook in self.post_hooks.read().iter() {
            hook(inputs, outputs);
        }
    }
}

// =============================================================================
// Node Trait
// =============================================================================

/// A unit of the backward graph.
///
/// `apply` is invoked once all of the node's inputs have been accumulated.
/// Undefined input slots are zero-filled beforehand unless the node opts out
/// through [`Node::accepts_undefined_inputs`].
pub trait Node: Send + Sync {
    /// Computes output gradients from input gradients.
    ///
    /// Returns one entry per outgoing edge; `None` means no gradient.
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>>;

    /// Name of this node for diagnostics.
    fn name(&self) -> &'static str;

    /// Shared node state.
    fn base(&self) -> &NodeBase;

    /// Allows downcasting to concrete types.
    fn as_any(&self) -> &dyn Any;

    /// Frees state saved for the backward pass.
    ///
    /// Called after `apply` unless the graph is kept.
    fn release_variables(&self) {}

    /// Whether undefined input slots reach `apply` as `None`.
    fn accepts_undefined_inputs(&self) -> bool {
        false
    }

    /// Number of declared inputs. Fixed at construction.
    fn num_inputs(&self) -> usize {
        self.base().input_metadata().len()
    }

    /// Number of gradient outputs.
    fn num_outputs(&self) -> usize {
        self.base().next_edges().len()
    }

    /// Outgoing edges.
    fn next_edges(&self) -> &[Edge] {
        self.base().next_edges()
    }

    /// Metadata for input slot `index`.
    fn input_metadata(&self, index: usize) -> Option<&InputMetadata> {
        self.base().input_metadata().get(index)
    }

    /// Sequence number used to order ready nodes.
    fn sequence_nr(&self) -> u64 {
        self.base().sequence_nr()
    }

    /// Stream this node runs on for `device`, taken from its input metadata.
    fn stream(&self, device: Device) -> Option<Stream> {
        self.base()
            .input_metadata()
            .iter()
            .filter(|m| m.is_defined() && m.device() == device)
            .find_map(InputMetadata::stream)
    }
}

impl Debug for dyn Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(seq={})", self.name(), self.sequence_nr())
    }
}

// =============================================================================
// Tests
// =============================================================================
