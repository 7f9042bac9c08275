//! Request API: the consumer-facing handles onto computed data.
//!
//! A [`RequestNode`] is cached per `(data node, filter)`; it holds the empty
//! substitution node of its owner, listens on the selected final channels
//! and owns the [`ComputeResult`]. Consumers hold a [`ComputeRequest`],
//! pull with [`Graph::get_result`] and are told about invalidation through
//! an optional callback. Invalidation never recomputes; the next pull does.

use crate::channel::{ChannelId, Listener, SequenceValue, Substitution};
use crate::data::{DataEntry, EntryId};
use crate::error::GraphError;
use crate::graph::{Graph, NodeId};
use crate::invariant_ppt::{assert_invariant, REQUEST_RESULT_RESOLVED};
use crate::operator::SequenceAccess;
use crate::substitution_node::SubNodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Unique identifier for a request node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestNodeId(pub u64);

/// Unique identifier for a consumer request. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Kind of change reported to request callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    /// The node tree changed; the result's channel set may differ.
    ChangedStructure,
    /// Only values changed.
    ChangedData,
}

/// What the next pull has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Re-acquire the substitution node and re-subscribe.
    NeedsStructure,
    /// Re-run dirty process nodes.
    NeedsData,
    /// The result is current.
    Ready,
}

/// Named output entries of one data node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeResult {
    outputs: BTreeMap<String, EntryId>,
    loading: bool,
    valid: bool,
}

impl ComputeResult {
    /// Entry published under `name`.
    pub fn get_output_data(&self, name: &str) -> Option<EntryId> {
        self.outputs.get(name).copied()
    }

    /// Published names, sorted.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// An upstream texture is still loading.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// False once a change was reported and before the next pull.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Callback invoked when a request's result is invalidated.
pub type RequestCallback = Box<dyn FnMut(RequestId, ResultState) + Send>;

/// One consumer's subscription.
pub struct RequestEntry {
    node: NodeId,
    request_node: RequestNodeId,
    callback: Option<RequestCallback>,
}

impl fmt::Debug for RequestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEntry")
            .field("node", &self.node)
            .field("request_node", &self.request_node)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Handle held by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeRequest(pub RequestId);

impl ComputeRequest {
    /// Request id.
    pub fn id(&self) -> RequestId {
        self.0
    }
}

/// Cached terminal for one `(data node, filter)` pair.
#[derive(Debug)]
pub struct RequestNode {
    owner: NodeId,
    filter: Vec<String>,
    sub_node: Option<SubNodeId>,
    channels: BTreeMap<String, ChannelId>,
    status: RequestStatus,
    result: ComputeResult,
    requests: BTreeSet<RequestId>,
    pinned: bool,
}

impl RequestNode {
    /// Data node this reads.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Selected channel names; empty selects everything.
    pub fn filter(&self) -> &[String] {
        &self.filter
    }

    /// Subscribed final channels.
    pub fn channels(&self) -> &BTreeMap<String, ChannelId> {
        &self.channels
    }

    /// Current status.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Last resolved result.
    pub fn result(&self) -> &ComputeResult {
        &self.result
    }
}

fn filter_key(filter: &[String]) -> String {
    filter.join(",")
}

impl Graph {
    /// Subscribe to the outputs of `node` named in `filter` (all outputs when
    /// `filter` is empty).
    pub fn compute_request(&mut self, node: NodeId, filter: &[&str]) -> Result<ComputeRequest, GraphError> {
        let rn = self.request_node_for(node, filter)?;
        let id = RequestId(self.next_id());
        self.requests.insert(
            id,
            RequestEntry {
                node,
                request_node: rn,
                callback: None,
            },
        );
        if let Some(request_node) = self.request_nodes.get_mut(&rn) {
            request_node.requests.insert(id);
        }
        tracing::debug!(node = node.0, request = id.0, "compute request created");
        Ok(ComputeRequest(id))
    }

    fn request_node_for(&mut self, node: NodeId, filter: &[&str]) -> Result<RequestNodeId, GraphError> {
        let names: BTreeSet<String> = filter.iter().map(|s| s.to_string()).collect();
        let names: Vec<String> = names.into_iter().collect();
        let key = filter_key(&names);
        let data = self.node(node).ok_or(GraphError::InvalidNode)?;
        let data = data.as_data().ok_or(GraphError::NotADataNode)?;
        if let Some(rn) = data.request_nodes.get(&key).copied() {
            if self.request_nodes.contains_key(&rn) {
                return Ok(rn);
            }
        }
        let rn = RequestNodeId(self.next_id());
        self.request_nodes.insert(
            rn,
            RequestNode {
                owner: node,
                filter: names,
                sub_node: None,
                channels: BTreeMap::new(),
                status: RequestStatus::NeedsStructure,
                result: ComputeResult::default(),
                requests: BTreeSet::new(),
                pinned: false,
            },
        );
        if let Some(data) = self.data_node_mut(node) {
            data.request_nodes.insert(key, rn);
        }
        Ok(rn)
    }

    /// Install the invalidation callback of `request`.
    pub fn set_request_callback<F>(&mut self, request: ComputeRequest, callback: F)
    where
        F: FnMut(RequestId, ResultState) + Send + 'static,
    {
        if let Some(entry) = self.requests.get_mut(&request.0) {
            entry.callback = Some(Box::new(callback));
        }
    }

    /// Pull the current result, recomputing what changed since the last pull.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_result(&mut self, request: ComputeRequest) -> Option<&ComputeResult> {
        let rn = self.requests.get(&request.0)?.request_node;
        self.resolve(rn);
        self.request_nodes.get(&rn).map(|n| &n.result)
    }

    /// Entry published under `name` by the last pull of `request`.
    pub fn result_output(&self, request: ComputeRequest, name: &str) -> Option<&DataEntry> {
        let rn = self.requests.get(&request.0)?.request_node;
        let entry = self.request_nodes.get(&rn)?.result.get_output_data(name)?;
        self.store.entry(entry)
    }

    /// What the next pull of `request` has to do.
    pub fn request_status(&self, request: ComputeRequest) -> Option<RequestStatus> {
        let rn = self.requests.get(&request.0)?.request_node;
        self.request_nodes.get(&rn).map(RequestNode::status)
    }

    /// Request node by id.
    pub fn request_node(&self, id: RequestNodeId) -> Option<&RequestNode> {
        self.request_nodes.get(&id)
    }

    /// Drop `request`. The request node goes away with its last request.
    pub fn release_request(&mut self, request: ComputeRequest) {
        let Some(entry) = self.requests.remove(&request.0) else {
            return;
        };
        let rn = entry.request_node;
        let unused = match self.request_nodes.get_mut(&rn) {
            Some(node) => {
                node.requests.remove(&request.0);
                node.requests.is_empty() && !node.pinned
            }
            None => false,
        };
        if unused {
            self.drop_request_node(rn);
        }
        tracing::debug!(request = request.0 .0, "compute request released");
    }

    fn drop_request_node(&mut self, rn: RequestNodeId) {
        self.unsubscribe(rn);
        let Some(node) = self.request_nodes.remove(&rn) else {
            return;
        };
        if let Some(sub) = node.sub_node {
            self.release_substitution_node(sub);
        }
        if let Some(data) = self.data_node_mut(node.owner) {
            data.request_nodes.remove(&filter_key(&node.filter));
        }
    }

    /// Result of `node` for `filter` without a consumer handle. The request
    /// node stays cached for the node's lifetime.
    pub fn get_compute_result(&mut self, node: NodeId, filter: &[&str]) -> Option<&ComputeResult> {
        let rn = self.request_node_for(node, filter).ok()?;
        if let Some(request_node) = self.request_nodes.get_mut(&rn) {
            request_node.pinned = true;
        }
        self.resolve(rn);
        self.request_nodes.get(&rn).map(|n| &n.result)
    }

    fn unsubscribe(&mut self, rn: RequestNodeId) {
        let channels = match self.request_nodes.get_mut(&rn) {
            Some(node) => std::mem::take(&mut node.channels),
            None => return,
        };
        for channel in channels.into_values() {
            self.store.remove_listener(channel, Listener::Request(rn));
        }
    }

    fn resolve(&mut self, rn: RequestNodeId) {
        let Some(node) = self.request_nodes.get(&rn) else {
            return;
        };
        let (owner, status) = (node.owner, node.status);
        if status == RequestStatus::Ready {
            return;
        }

        if status == RequestStatus::NeedsStructure {
            self.unsubscribe(rn);
            let stale = self.request_nodes.get_mut(&rn).and_then(|n| n.sub_node.take());
            if let Some(sub) = stale {
                self.release_substitution_node(sub);
            }
            let sub_node = self.get_substitution_node(owner, &Substitution::empty());
            let filter = self
                .request_nodes
                .get(&rn)
                .map(|n| n.filter.clone())
                .unwrap_or_default();
            let channels: BTreeMap<String, ChannelId> = self
                .final_channels(owner, &Substitution::empty())
                .into_iter()
                .filter(|(name, _)| filter.is_empty() || filter.contains(name))
                .collect();
            for channel in channels.values() {
                self.store.add_listener(*channel, Listener::Request(rn));
            }
            if let Some(node) = self.request_nodes.get_mut(&rn) {
                node.sub_node = sub_node;
                node.channels = channels;
            }
        }

        let channels = self
            .request_nodes
            .get(&rn)
            .map(|n| n.channels.clone())
            .unwrap_or_default();
        let roots: Vec<_> = channels
            .values()
            .filter_map(|c| self.store.channel(*c))
            .flat_map(|c| c.creators().collect::<Vec<_>>())
            .collect();
        self.process_all(&roots);

        let outputs: BTreeMap<String, EntryId> = channels
            .into_iter()
            .filter_map(|(name, channel)| {
                match self.store.get_data_entry(channel, SequenceAccess::NoAccess, 0.0)? {
                    SequenceValue::Entry(entry) => Some((name, entry)),
                    SequenceValue::Weight(_) => None,
                }
            })
            .collect();
        let loading = self.is_loading(owner)
            || outputs
                .values()
                .filter_map(|e| self.store.entry(*e))
                .any(DataEntry::is_loading);
        assert_invariant(
            REQUEST_RESULT_RESOLVED,
            outputs.values().all(|e| self.store.entry(*e).is_some()),
            "every published output resolves to a live entry",
            Some("get_result"),
        );
        if let Some(node) = self.request_nodes.get_mut(&rn) {
            node.result = ComputeResult {
                outputs,
                loading,
                valid: true,
            };
            node.status = RequestStatus::Ready;
        }
        tracing::trace!(request_node = rn.0, "request resolved");
    }

    /// Mark every request node of `node` for re-subscription. The owner's
    /// substitution nodes are already discarded.
    pub(crate) fn invalidate_request_structure(&mut self, node: NodeId) -> Vec<RequestId> {
        let request_nodes: Vec<RequestNodeId> = self
            .data_node(node)
            .map(|d| d.request_nodes.values().copied().collect())
            .unwrap_or_default();
        let mut fired = Vec::new();
        for rn in request_nodes {
            self.unsubscribe(rn);
            if let Some(request_node) = self.request_nodes.get_mut(&rn) {
                request_node.sub_node = None;
                request_node.status = RequestStatus::NeedsStructure;
                request_node.result.valid = false;
                fired.extend(request_node.requests.iter().copied());
            }
        }
        fired
    }

    /// Mark request nodes for re-execution.
    pub(crate) fn invalidate_request_data(&mut self, request_nodes: BTreeSet<RequestNodeId>) -> Vec<RequestId> {
        let mut fired = Vec::new();
        for rn in request_nodes {
            let Some(request_node) = self.request_nodes.get_mut(&rn) else {
                continue;
            };
            if request_node.status == RequestStatus::Ready {
                request_node.status = RequestStatus::NeedsData;
            }
            request_node.result.valid = false;
            fired.extend(request_node.requests.iter().copied());
        }
        fired
    }

    pub(crate) fn fire_callbacks(&mut self, requests: Vec<RequestId>, state: ResultState) {
        let unique: BTreeSet<RequestId> = requests.into_iter().collect();
        for id in unique {
            let Some(mut callback) = self.requests.get_mut(&id).and_then(|r| r.callback.take()) else {
                continue;
            };
            callback(id, state);
            if let Some(entry) = self.requests.get_mut(&id) {
                entry.callback.get_or_insert(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BufferValue, DataType};
    use std::sync::{Arc, Mutex};

    fn normalize_tree(graph: &mut Graph) -> (NodeId, EntryId) {
        let node = graph.create_data_node(false);
        let leaf = graph.create_input_node();
        let entry = graph
            .create_buffer_entry(DataType::Float3, BufferValue::Float(vec![3.0, 0.0, 0.0, 0.0, 4.0, 0.0]))
            .unwrap();
        graph.set_name(leaf, "value").unwrap();
        graph.set_data(leaf, Some(entry)).unwrap();
        graph.append_child(node, leaf).unwrap();
        graph.set_compute(node, "result(xflow.normalize)(value)").unwrap();
        (node, entry)
    }

    #[test]
    fn filter_selects_outputs() {
        let mut graph = Graph::new();
        let (node, _) = normalize_tree(&mut graph);
        let all = graph.compute_request(node, &[]).unwrap();
        let names: Vec<String> = graph
            .get_result(all)
            .unwrap()
            .output_names()
            .map(str::to_string)
            .collect();
        assert_eq!(names, vec!["result".to_string(), "value".to_string()]);

        let only = graph.compute_request(node, &["result"]).unwrap();
        let result = graph.get_result(only).unwrap();
        assert_eq!(result.output_names().count(), 1);
        assert!(result.is_valid());
        assert!(!result.is_loading());
    }

    #[test]
    fn requests_share_request_nodes_per_filter() {
        let mut graph = Graph::new();
        let (node, _) = normalize_tree(&mut graph);
        let a = graph.compute_request(node, &["result", "value"]).unwrap();
        let b = graph.compute_request(node, &["value", "result"]).unwrap();
        assert_eq!(graph.data_node(node).unwrap().request_nodes.len(), 1);
        graph.release_request(a);
        assert_eq!(graph.request_nodes.len(), 1);
        graph.release_request(b);
        assert!(graph.request_nodes.is_empty());
        assert!(graph.sub_nodes.is_empty());
    }

    #[test]
    fn data_change_fires_changed_data() {
        let mut graph = Graph::new();
        let (node, entry) = normalize_tree(&mut graph);
        let request = graph.compute_request(node, &["result"]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        graph.set_request_callback(request, move |_, state| log.lock().unwrap().push(state));
        graph.get_result(request).unwrap();

        graph
            .set_buffer_value(entry, BufferValue::Float(vec![0.0, 0.0, 2.0]))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ResultState::ChangedData]);
        assert_eq!(graph.request_status(request), Some(RequestStatus::NeedsData));

        graph.get_result(request).unwrap();
        assert_eq!(
            graph.result_output(request, "result").unwrap().float_values().unwrap(),
            &[0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn structure_change_fires_changed_structure() {
        let mut graph = Graph::new();
        let (node, _) = normalize_tree(&mut graph);
        let request = graph.compute_request(node, &[]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        graph.set_request_callback(request, move |_, state| log.lock().unwrap().push(state));
        graph.get_result(request).unwrap();

        graph.set_filter(node, "keep(result)").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ResultState::ChangedStructure]);
        let names: Vec<String> = graph
            .get_result(request)
            .unwrap()
            .output_names()
            .map(str::to_string)
            .collect();
        assert_eq!(names, vec!["result".to_string()]);
    }

    #[test]
    fn loading_texture_marks_result() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        let leaf = graph.create_input_node();
        let texture = graph.create_texture_entry(Default::default());
        graph.set_name(leaf, "diffuse").unwrap();
        graph.set_data(leaf, Some(texture)).unwrap();
        graph.append_child(node, leaf).unwrap();

        let request = graph.compute_request(node, &[]).unwrap();
        assert!(!graph.get_result(request).unwrap().is_loading());
        graph.set_texture_loading(texture, true).unwrap();
        assert!(graph.get_result(request).unwrap().is_loading());
    }
}
