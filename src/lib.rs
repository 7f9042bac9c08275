//! Declarative dataflow graph.
//!
//! Authors build trees of [`InputNode`]s and [`DataNode`]s inside a
//! [`Graph`], attach filter and compute strings, and pull named results
//! through a [`ComputeRequest`]. Subtrees marked as protos can be
//! instantiated many times with different bound inputs; identical
//! instantiations share their channels and process nodes.
//!
//! Evaluation is single-threaded and pull-driven: structural edits discard
//! cached state up the tree, value edits only dirty the process nodes that
//! read them, and the next [`Graph::get_result`] recomputes what is stale.
#![forbid(unsafe_code)]

pub mod channel;
pub mod channel_node;
pub mod config;
pub mod data;
pub mod dsl;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod mapping;
pub mod operator;
mod ops;
pub mod plan;
pub mod process;
pub mod request;
pub mod substitution_node;

pub use channel::{ChannelId, DataSlot, Substitution};
pub use config::GraphConfig;
pub use data::{BufferValue, DataEntry, DataType, EntryId, ImageHandle, SamplerConfig, TextureEntry};
pub use dsl::{DataTreeBuilder, DslError, NodeHandle};
pub use error::{GraphError, XflowError, XflowResult};
pub use graph::{DataNode, Graph, InputNode, NodeId};
pub use mapping::{Compute, Filter, FilterType, Mapping};
pub use operator::{Arg, EvalInfo, OutArg, Operator, OperatorDescriptor, OperatorRegistry, SequenceAccess};
pub use process::{ProcessNodeId, ProcessState};
pub use request::{ComputeRequest, ComputeResult, RequestId, RequestStatus, ResultState};
