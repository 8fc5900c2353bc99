//! Functions - RPC Boundary Nodes
//!
//! The pair of nodes that splice a remote subgraph into the local one:
//! [`SendRpcBackward`] on the forward sender, [`RecvRpcBackward`] on the
//! forward receiver.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

mod recv_rpc_backward;
mod send_rpc_backward;

pub use recv_rpc_backward::*;
pub use send_rpc_backward::*;
