//! The declarative node tree.
//!
//! A [`Graph`] is an arena owning every authored node (input leaves and
//! data nodes), every data entry and channel, and every derived cache node.
//! Relations between nodes (children, source, proto, parents) are ids into
//! that arena, so multi-parent trees need no shared ownership.

use crate::channel::{DataStore, Listener};
use crate::channel_node::ChannelNode;
use crate::config::GraphConfig;
use crate::data::{BufferValue, DataEntry, DataType, EntryId, ImageHandle, TextureEntry};
use crate::error::{GraphError, XflowError, XflowResult};
use crate::invariant_ppt::{assert_invariant, DATA_CHANGE_KEEPS_STRUCTURE, GRAPH_ACYCLIC};
use crate::mapping::{Compute, Filter};
use crate::operator::OperatorRegistry;
use crate::plan::IterationPlan;
use crate::process::{ProcessNode, ProcessNodeId};
use crate::request::{RequestEntry, RequestId, RequestNode, RequestNodeId, ResultState};
use crate::substitution_node::{SubNodeId, SubstitutionNode};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for an authored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Leaf holding one named, keyed value.
#[derive(Debug, Clone, PartialEq)]
pub struct InputNode {
    name: String,
    key: f32,
    param: bool,
    data: Option<EntryId>,
}

impl InputNode {
    /// Channel name this value feeds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence key.
    pub fn key(&self) -> f32 {
        self.key
    }

    /// Whether the value is a placeholder a substitution may replace.
    pub fn is_param(&self) -> bool {
        self.param
    }

    /// Bound entry.
    pub fn data(&self) -> Option<EntryId> {
        self.data
    }
}

/// Internal node aggregating children or forwarding a source.
#[derive(Debug)]
pub struct DataNode {
    children: Vec<NodeId>,
    source: Option<NodeId>,
    proto: Option<NodeId>,
    is_proto: bool,
    filter: Option<Filter>,
    compute: Option<Compute>,
    pub(crate) channel_node: ChannelNode,
    pub(crate) request_nodes: HashMap<String, RequestNodeId>,
}

impl DataNode {
    /// Children in order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Node this one forwards from.
    pub fn source_node(&self) -> Option<NodeId> {
        self.source
    }

    /// Template subtree.
    pub fn proto_node(&self) -> Option<NodeId> {
        self.proto
    }

    /// Created as a template.
    pub fn is_proto(&self) -> bool {
        self.is_proto
    }

    /// Output filter.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Bound computation.
    pub fn compute(&self) -> Option<&Compute> {
        self.compute.as_ref()
    }

    /// Structural cache.
    pub fn channel_node(&self) -> &ChannelNode {
        &self.channel_node
    }
}

/// Either kind of authored node.
#[derive(Debug)]
pub enum NodeKind {
    /// Value leaf.
    Input(InputNode),
    /// Aggregating node.
    Data(DataNode),
}

/// A node in the arena.
#[derive(Debug)]
pub struct NodeData {
    /// The unique ID of this node.
    pub id: NodeId,
    parents: Vec<NodeId>,
    kind: NodeKind,
}

impl NodeData {
    /// Node payload.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Input payload, if this is an input node.
    pub fn as_input(&self) -> Option<&InputNode> {
        match &self.kind {
            NodeKind::Input(n) => Some(n),
            NodeKind::Data(_) => None,
        }
    }

    /// Data payload, if this is a data node.
    pub fn as_data(&self) -> Option<&DataNode> {
        match &self.kind {
            NodeKind::Data(n) => Some(n),
            NodeKind::Input(_) => None,
        }
    }
}

/// The dataflow graph arena.
pub struct Graph {
    pub(crate) nodes: Vec<Option<NodeData>>,
    pub(crate) store: DataStore,
    pub(crate) sub_nodes: HashMap<SubNodeId, SubstitutionNode>,
    pub(crate) process_nodes: HashMap<ProcessNodeId, ProcessNode>,
    pub(crate) request_nodes: HashMap<RequestNodeId, RequestNode>,
    pub(crate) requests: HashMap<RequestId, RequestEntry>,
    pub(crate) plan_cache: HashMap<String, Arc<IterationPlan>>,
    pub(crate) config: GraphConfig,
    pub(crate) registry: Arc<OperatorRegistry>,
    next_id: u64,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.iter().flatten().count())
            .field("channels", &self.store.channel_count())
            .field("substitution_nodes", &self.sub_nodes.len())
            .field("process_nodes", &self.process_nodes.len())
            .field("request_nodes", &self.request_nodes.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Graph with the built-in operators and default options.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(OperatorRegistry::with_builtins()))
    }

    /// Graph resolving operators through `registry`.
    pub fn with_registry(registry: Arc<OperatorRegistry>) -> Self {
        Self::with_config(registry, GraphConfig::default())
    }

    /// Graph with explicit options.
    pub fn with_config(registry: Arc<OperatorRegistry>, config: GraphConfig) -> Self {
        Self {
            nodes: Vec::new(),
            store: DataStore::new(config.sequence_epsilon),
            sub_nodes: HashMap::new(),
            process_nodes: HashMap::new(),
            request_nodes: HashMap::new(),
            requests: HashMap::new(),
            plan_cache: HashMap::new(),
            config,
            registry,
            next_id: 0,
        }
    }

    /// Operators visible to this graph.
    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Options.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(NodeData {
            id,
            parents: Vec::new(),
            kind,
        }));
        id
    }

    /// Add an input leaf with no name, key 0 and no data.
    pub fn create_input_node(&mut self) -> NodeId {
        self.add_node(NodeKind::Input(InputNode {
            name: String::new(),
            key: 0.0,
            param: false,
            data: None,
        }))
    }

    /// Add an empty data node.
    pub fn create_data_node(&mut self, is_proto: bool) -> NodeId {
        let channel_node = ChannelNode::new(&mut self.store);
        self.add_node(NodeKind::Data(DataNode {
            children: Vec::new(),
            source: None,
            proto: None,
            is_proto,
            filter: None,
            compute: None,
            channel_node,
            request_nodes: HashMap::new(),
        }))
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id.0)?.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.nodes.get_mut(id.0)?.as_mut()
    }

    /// Input payload of `id`.
    pub fn input_node(&self, id: NodeId) -> Option<&InputNode> {
        self.node(id)?.as_input()
    }

    fn input_node_mut(&mut self, id: NodeId) -> Result<&mut InputNode, GraphError> {
        match &mut self.node_mut(id).ok_or(GraphError::InvalidNode)?.kind {
            NodeKind::Input(n) => Ok(n),
            NodeKind::Data(_) => Err(GraphError::InvalidNode),
        }
    }

    /// Data payload of `id`.
    pub fn data_node(&self, id: NodeId) -> Option<&DataNode> {
        self.node(id)?.as_data()
    }

    pub(crate) fn data_node_mut(&mut self, id: NodeId) -> Option<&mut DataNode> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Data(n) => Some(n),
            NodeKind::Input(_) => None,
        }
    }

    /// Run `f` on a data node's channel node with the store borrowed alongside.
    pub(crate) fn with_channel_node<R, F>(&mut self, id: NodeId, f: F) -> Option<R>
    where
        F: FnOnce(&mut ChannelNode, &mut DataStore) -> R,
    {
        let Graph { nodes, store, .. } = self;
        match &mut nodes.get_mut(id.0)?.as_mut()?.kind {
            NodeKind::Data(data) => Some(f(&mut data.channel_node, store)),
            NodeKind::Input(_) => None,
        }
    }

    fn require_data_mut(&mut self, id: NodeId) -> Result<&mut DataNode, GraphError> {
        match &mut self.node_mut(id).ok_or(GraphError::InvalidNode)?.kind {
            NodeKind::Data(n) => Ok(n),
            NodeKind::Input(_) => Err(GraphError::NotADataNode),
        }
    }

    /// Distinct nodes referencing `id` as child, source or proto.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        self.node(id)
            .map(|n| n.parents.iter().copied().filter(|p| seen.insert(*p)).collect())
            .unwrap_or_default()
    }

    /// Nodes `id` reads from: children, source and proto.
    pub(crate) fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        match self.data_node(id) {
            Some(d) => d
                .children
                .iter()
                .copied()
                .chain(d.source)
                .chain(d.proto)
                .collect(),
            None => Vec::new(),
        }
    }

    fn would_create_cycle(&self, parent: NodeId, child: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        self.dfs(child, parent, &mut visited)
    }

    fn dfs(&self, current: NodeId, target: NodeId, visited: &mut [bool]) -> bool {
        if current == target {
            return true;
        }
        if visited[current.0] {
            return false;
        }
        visited[current.0] = true;
        self.dependencies(current)
            .into_iter()
            .any(|next| self.dfs(next, target, visited))
    }

    /// Validate a new `parent -> child` reference.
    fn check_edge(&self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        self.node(child).ok_or(GraphError::InvalidNode)?;
        if self.would_create_cycle(parent, child) {
            return Err(GraphError::CycleDetected);
        }
        assert_invariant(
            GRAPH_ACYCLIC,
            parent != child,
            "accepted edge keeps the graph acyclic",
            Some("check_edge"),
        );
        Ok(())
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(child) {
            node.parents.push(parent);
        }
    }

    fn unlink(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(child) {
            if let Some(pos) = node.parents.iter().position(|p| *p == parent) {
                node.parents.remove(pos);
            }
        }
    }

    /// Append `child` to `parent`'s children.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        self.child_insert_guard(parent, child)?;
        self.require_data_mut(parent)?.children.push(child);
        self.link(parent, child);
        self.notify_structure(parent);
        Ok(())
    }

    /// Insert `child` before the existing child `before`.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        before: NodeId,
    ) -> Result<(), GraphError> {
        self.child_insert_guard(parent, child)?;
        let data = self.require_data_mut(parent)?;
        let pos = data
            .children
            .iter()
            .position(|c| *c == before)
            .ok_or(GraphError::NotAChild)?;
        data.children.insert(pos, child);
        self.link(parent, child);
        self.notify_structure(parent);
        Ok(())
    }

    fn child_insert_guard(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        let data = self.require_data_mut(parent)?;
        if data.source.is_some() {
            return Err(GraphError::SourceAndChildren);
        }
        self.check_edge(parent, child)
    }

    /// Remove the first occurrence of `child`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        let data = self.require_data_mut(parent)?;
        let pos = data
            .children
            .iter()
            .position(|c| *c == child)
            .ok_or(GraphError::NotAChild)?;
        data.children.remove(pos);
        self.unlink(parent, child);
        self.notify_structure(parent);
        Ok(())
    }

    /// Remove every child.
    pub fn clear_children(&mut self, parent: NodeId) -> Result<(), GraphError> {
        let children = std::mem::take(&mut self.require_data_mut(parent)?.children);
        for child in children {
            self.unlink(parent, child);
        }
        self.notify_structure(parent);
        Ok(())
    }

    /// Drop every reference any parent holds to `node`. The node stays addressable.
    pub fn detach_from_parents(&mut self, node: NodeId) -> Result<(), GraphError> {
        let parents = self.parents(node);
        self.node(node).ok_or(GraphError::InvalidNode)?;
        for parent in parents {
            if let Some(data) = self.data_node_mut(parent) {
                data.children.retain(|c| *c != node);
                if data.source == Some(node) {
                    data.source = None;
                }
                if data.proto == Some(node) {
                    data.proto = None;
                }
            }
            if let Some(n) = self.node_mut(node) {
                n.parents.retain(|p| *p != parent);
            }
            self.notify_structure(parent);
        }
        Ok(())
    }

    /// Forward every output of `source` instead of aggregating children.
    pub fn set_source_node(&mut self, node: NodeId, source: Option<NodeId>) -> Result<(), GraphError> {
        let has_children = !self.require_data_mut(node)?.children.is_empty();
        if let Some(src) = source {
            if has_children {
                return Err(GraphError::SourceAndChildren);
            }
            self.data_node(src).ok_or(GraphError::NotADataNode)?;
            self.check_edge(node, src)?;
        }
        let data = self.require_data_mut(node)?;
        let old = std::mem::replace(&mut data.source, source);
        if let Some(old) = old {
            self.unlink(node, old);
        }
        if let Some(src) = source {
            self.link(node, src);
        }
        self.notify_structure(node);
        Ok(())
    }

    /// Use `proto` as this node's template.
    pub fn set_proto_node(&mut self, node: NodeId, proto: Option<NodeId>) -> Result<(), GraphError> {
        self.require_data_mut(node)?;
        if let Some(p) = proto {
            self.data_node(p).ok_or(GraphError::NotADataNode)?;
            self.check_edge(node, p)?;
        }
        let data = self.require_data_mut(node)?;
        let old = std::mem::replace(&mut data.proto, proto);
        if let Some(old) = old {
            self.unlink(node, old);
        }
        if let Some(p) = proto {
            self.link(node, p);
        }
        self.notify_structure(node);
        Ok(())
    }

    /// Parse and set the filter. Unparseable text logs an error and passes everything through.
    pub fn set_filter(&mut self, node: NodeId, text: &str) -> Result<(), GraphError> {
        let filter = match Filter::parse(text) {
            Ok(filter) => filter,
            Err(err) => {
                tracing::error!(node = node.0, %err, "invalid filter, using identity");
                Some(Filter::identity())
            }
        };
        self.require_data_mut(node)?.filter = filter;
        self.notify_structure(node);
        Ok(())
    }

    /// Parse and set the computation. Unparseable text logs an error and clears it.
    pub fn set_compute(&mut self, node: NodeId, text: &str) -> Result<(), GraphError> {
        let compute = match Compute::parse(text) {
            Ok(compute) => compute,
            Err(err) => {
                tracing::error!(node = node.0, %err, "invalid compute, clearing operator");
                None
            }
        };
        self.require_data_mut(node)?.compute = compute;
        self.notify_structure(node);
        Ok(())
    }

    fn update_input<F>(&mut self, node: NodeId, f: F) -> Result<(), GraphError>
    where
        F: FnOnce(&mut InputNode),
    {
        f(self.input_node_mut(node)?);
        self.notify_structure(node);
        Ok(())
    }

    /// Rename an input leaf.
    pub fn set_name(&mut self, node: NodeId, name: &str) -> Result<(), GraphError> {
        self.update_input(node, |n| n.name = name.to_string())
    }

    /// Set an input leaf's sequence key.
    pub fn set_key(&mut self, node: NodeId, key: f32) -> Result<(), GraphError> {
        self.update_input(node, |n| n.key = key)
    }

    /// Mark an input leaf as a substitutable placeholder.
    pub fn set_param(&mut self, node: NodeId, param: bool) -> Result<(), GraphError> {
        self.update_input(node, |n| n.param = param)
    }

    /// Bind an entry to an input leaf.
    pub fn set_data(&mut self, node: NodeId, data: Option<EntryId>) -> Result<(), GraphError> {
        self.update_input(node, |n| n.data = data)
    }

    /// Detach `node` from its parents and everything it references, then free it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.detach_from_parents(node)?;
        for dep in self.dependencies(node) {
            self.unlink(node, dep);
        }
        if self.data_node(node).is_some() {
            self.reset_channel_node(node);
            for request in self.invalidate_request_structure(node) {
                self.requests.remove(&request);
            }
            let request_nodes: Vec<RequestNodeId> = self
                .data_node_mut(node)
                .map(|d| d.request_nodes.drain().map(|(_, id)| id).collect())
                .unwrap_or_default();
            for rn in request_nodes {
                self.request_nodes.remove(&rn);
            }
        }
        self.nodes[node.0] = None;
        Ok(())
    }

    /// Store a new entry.
    pub fn create_entry(&mut self, entry: DataEntry) -> EntryId {
        self.store.insert_entry(entry)
    }

    /// Store a new buffer entry, checking the payload against the type.
    pub fn create_buffer_entry(&mut self, ty: DataType, value: BufferValue) -> XflowResult<EntryId> {
        let entry = DataEntry::Buffer(crate::data::BufferEntry::new(ty, value)?);
        Ok(self.store.insert_entry(entry))
    }

    /// Store a new texture entry.
    pub fn create_texture_entry(&mut self, texture: TextureEntry) -> EntryId {
        self.store.insert_entry(DataEntry::Texture(texture))
    }

    /// Entry by id.
    pub fn entry(&self, id: EntryId) -> Option<&DataEntry> {
        self.store.entry(id)
    }

    /// Replace a buffer's payload and notify a data change.
    pub fn set_buffer_value(&mut self, id: EntryId, value: BufferValue) -> XflowResult<()> {
        match self.store.entry_mut(id) {
            Some(DataEntry::Buffer(buffer)) => buffer.set_value(value)?,
            Some(other) => {
                return Err(XflowError::TypeMismatch {
                    expected: other.data_type().to_string(),
                    actual: format!("{:?}", value.storage()),
                })
            }
            None => return Err(XflowError::UnknownEntry(id.0)),
        }
        self.notify_data_change(id);
        Ok(())
    }

    fn texture_mut(&mut self, id: EntryId) -> XflowResult<&mut TextureEntry> {
        match self.store.entry_mut(id) {
            Some(DataEntry::Texture(texture)) => Ok(texture),
            Some(other) => Err(XflowError::TypeMismatch {
                expected: DataType::Texture.to_string(),
                actual: other.data_type().to_string(),
            }),
            None => Err(XflowError::UnknownEntry(id.0)),
        }
    }

    /// Swap a texture's image and notify a data change.
    pub fn set_texture_image(&mut self, id: EntryId, image: Option<ImageHandle>) -> XflowResult<()> {
        self.texture_mut(id)?.image = image;
        self.notify_data_change(id);
        Ok(())
    }

    /// Flag a texture as loading and notify a data change.
    pub fn set_texture_loading(&mut self, id: EntryId, loading: bool) -> XflowResult<()> {
        self.texture_mut(id)?.loading = loading;
        self.notify_data_change(id);
        Ok(())
    }

    /// Whether a texture anywhere below `node` is still loading.
    pub fn is_loading(&self, node: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            match self.node(id).map(NodeData::kind) {
                Some(NodeKind::Input(input)) => {
                    if input
                        .data
                        .and_then(|e| self.store.entry(e))
                        .is_some_and(DataEntry::is_loading)
                    {
                        return true;
                    }
                }
                Some(NodeKind::Data(_)) => stack.extend(self.dependencies(id)),
                None => {}
            }
        }
        false
    }

    /// Invalidate `node` and every ancestor: cached channels, substitution
    /// nodes and process nodes are discarded and requests must re-resolve.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_structure_out_of_sync(&mut self, node: NodeId) {
        self.notify_structure(node);
    }

    pub(crate) fn notify_structure(&mut self, start: NodeId) {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        let mut requests = Vec::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.node(id) else {
                continue;
            };
            stack.extend(node.parents.iter().copied());
            if node.as_data().is_some() {
                self.reset_channel_node(id);
                requests.extend(self.invalidate_request_structure(id));
            }
        }
        self.fire_callbacks(requests, ResultState::ChangedStructure);
    }

    fn out_of_sync_nodes(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .filter_map(NodeData::as_data)
            .filter(|d| d.channel_node.is_out_of_sync())
            .count()
    }

    /// Dirty every process node and request downstream of `entry`.
    pub(crate) fn notify_data_change(&mut self, entry: EntryId) {
        let before = self.out_of_sync_nodes();
        let mut visited = HashSet::new();
        let mut dirty_requests = BTreeSet::new();
        let mut pending = vec![entry];
        while let Some(current) = pending.pop() {
            for channel in self.store.entry_channels(current) {
                let listeners = self
                    .store
                    .channel(channel)
                    .map(|c| c.listeners().to_vec())
                    .unwrap_or_default();
                for listener in listeners {
                    match listener {
                        Listener::Process(p) => {
                            if !visited.insert(p) {
                                continue;
                            }
                            if let Some(process) = self.process_nodes.get_mut(&p) {
                                process.mark_dirty();
                                pending.extend(process.output_entries());
                            }
                        }
                        Listener::Request(r) => {
                            dirty_requests.insert(r);
                        }
                    }
                }
            }
        }
        let requests = self.invalidate_request_data(dirty_requests);
        assert_invariant(
            DATA_CHANGE_KEEPS_STRUCTURE,
            self.out_of_sync_nodes() == before,
            "data change left channel nodes in sync",
            Some("notify_data_change"),
        );
        self.fire_callbacks(requests, ResultState::ChangedData);
    }
}
