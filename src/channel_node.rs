//! Per data node structural synchronization.
//!
//! A [`ChannelNode`] knows which proto names flow through which output
//! name, independent of any concrete substitution. Its maps also hold the
//! channels materialized by the node's substitution nodes, keyed per
//! substitution.

use crate::channel::{ChannelMap, DataStore};
use crate::graph::{Graph, NodeData, NodeId, NodeKind};
use crate::invariant_ppt::{assert_invariant, STRUCTURE_SYNC};
use crate::operator::Operator;
use crate::process::ProcessNodeId;
use crate::substitution_node::SubNodeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

type ProtoTable = BTreeMap<String, BTreeSet<String>>;

/// Structural cache of one data node.
#[derive(Debug)]
pub struct ChannelNode {
    out_of_sync: bool,
    pub(crate) input: ChannelMap,
    pub(crate) proto_input: ChannelMap,
    pub(crate) final_output: ChannelMap,
    pub(crate) operator: Option<Arc<Operator>>,
    pub(crate) operator_proto_names: BTreeSet<String>,
    pub(crate) proto_names: BTreeSet<String>,
    pub(crate) sub_nodes: HashMap<String, SubNodeId>,
    pub(crate) empty_sub_node: Option<SubNodeId>,
    pub(crate) process_nodes: HashMap<String, ProcessNodeId>,
}

impl ChannelNode {
    pub(crate) fn new(store: &mut DataStore) -> Self {
        Self {
            out_of_sync: true,
            input: store.new_map(),
            proto_input: store.new_map(),
            final_output: store.new_map(),
            operator: None,
            operator_proto_names: BTreeSet::new(),
            proto_names: BTreeSet::new(),
            sub_nodes: HashMap::new(),
            empty_sub_node: None,
            process_nodes: HashMap::new(),
        }
    }

    /// Needs [`Graph::synchronize`] before use.
    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    /// Channels gathered from children or the source.
    pub fn input_channels(&self) -> &ChannelMap {
        &self.input
    }

    /// Inputs plus operator outputs.
    pub fn proto_input_channels(&self) -> &ChannelMap {
        &self.proto_input
    }

    /// What the node exposes to its parents.
    pub fn final_output_channels(&self) -> &ChannelMap {
        &self.final_output
    }

    /// Resolved operator.
    pub fn operator(&self) -> Option<&Arc<Operator>> {
        self.operator.as_ref()
    }

    /// Proto names feeding the operator's mapped inputs.
    pub fn operator_proto_names(&self) -> &BTreeSet<String> {
        &self.operator_proto_names
    }

    /// Proto names feeding any input.
    pub fn proto_names(&self) -> &BTreeSet<String> {
        &self.proto_names
    }

    /// Live substitution nodes, including the empty one.
    pub fn substitution_node_count(&self) -> usize {
        self.sub_nodes.len() + usize::from(self.empty_sub_node.is_some())
    }

    pub(crate) fn memo(&self, key: &str) -> Option<SubNodeId> {
        if key.is_empty() {
            self.empty_sub_node
        } else {
            self.sub_nodes.get(key).copied()
        }
    }

    pub(crate) fn remember(&mut self, key: &str, id: SubNodeId) {
        if key.is_empty() {
            self.empty_sub_node = Some(id);
        } else {
            self.sub_nodes.insert(key.to_string(), id);
        }
    }

    pub(crate) fn forget(&mut self, key: &str, id: SubNodeId) {
        if key.is_empty() {
            if self.empty_sub_node == Some(id) {
                self.empty_sub_node = None;
            }
        } else if self.sub_nodes.get(key) == Some(&id) {
            self.sub_nodes.remove(key);
        }
    }

    pub(crate) fn clear_maps(&mut self, store: &mut DataStore) {
        self.input.clear_all(store);
        self.proto_input.clear_all(store);
        self.final_output.clear_all(store);
    }
}

fn merge_table(into: &mut ProtoTable, from: ProtoTable) {
    for (name, names) in from {
        into.entry(name).or_default().extend(names);
    }
}

impl Graph {
    /// Recompute the proto-name tables of `node` and everything below it.
    /// Does nothing on input nodes or nodes already in sync.
    pub fn synchronize(&mut self, node: NodeId) {
        let Some(data) = self.data_node(node) else {
            return;
        };
        if !data.channel_node.out_of_sync {
            return;
        }
        let children = data.children().to_vec();
        let source = data.source_node();
        let proto = data.proto_node();
        let compute = data.compute().cloned();
        let filter = data.filter().cloned();

        for dep in children.iter().copied().chain(source).chain(proto) {
            self.synchronize(dep);
        }

        let final_table = |graph: &Graph, id: NodeId| {
            graph
                .data_node(id)
                .map(|d| d.channel_node.final_output.proto_name_table())
                .unwrap_or_default()
        };

        let mut inputs = ProtoTable::new();
        match source {
            Some(src) => merge_table(&mut inputs, final_table(self, src)),
            None => {
                for child in &children {
                    match self.node(*child).map(NodeData::kind) {
                        Some(NodeKind::Input(leaf)) => {
                            let names = inputs.entry(leaf.name().to_string()).or_default();
                            if leaf.is_param() {
                                names.insert(leaf.name().to_string());
                            }
                        }
                        Some(NodeKind::Data(_)) => merge_table(&mut inputs, final_table(self, *child)),
                        None => {}
                    }
                }
            }
        }

        let operator = compute.as_ref().and_then(|c| {
            let op = self.registry.get(&c.operator);
            if op.is_none() {
                tracing::error!(node = node.0, operator = %c.operator, "unknown operator");
            }
            op
        });

        let mut operator_proto_names = BTreeSet::new();
        let mut proto_input = inputs.clone();
        if let (Some(op), Some(compute)) = (&operator, &compute) {
            for (i, param) in op.params().iter().enumerate() {
                if let Some(names) = inputs.get(&compute.inputs.input_name(i, &param.source)) {
                    operator_proto_names.extend(names.iter().cloned());
                }
            }
            for (i, output) in op.outputs().iter().enumerate() {
                proto_input
                    .entry(compute.outputs.output_name(i, &output.name))
                    .or_default()
                    .extend(operator_proto_names.iter().cloned());
            }
        }

        // Proto outputs depend on whatever this node binds to the proto's names.
        let mut pre_filter = proto_input.clone();
        if let Some(p) = proto {
            for (name, names) in final_table(self, p) {
                let mapped = names
                    .iter()
                    .filter_map(|n| proto_input.get(n))
                    .flatten()
                    .cloned()
                    .collect();
                pre_filter.insert(name, mapped);
            }
        }

        let available: Vec<&String> = pre_filter.keys().collect();
        let pairs: Vec<(String, String)> = match &filter {
            Some(filter) => filter.apply(&available),
            None => available.iter().map(|n| ((*n).clone(), (*n).clone())).collect(),
        };
        let mut final_output = ProtoTable::new();
        for (dest, src) in pairs {
            if let Some(names) = pre_filter.get(&src) {
                final_output.entry(dest).or_default().extend(names.iter().cloned());
            }
        }

        let proto_names: BTreeSet<String> = inputs.values().flatten().cloned().collect();
        tracing::trace!(
            node = node.0,
            outputs = final_output.len(),
            proto_names = proto_names.len(),
            "channel node synchronized"
        );

        self.with_channel_node(node, |cn, store| {
            cn.clear_maps(store);
            for (name, names) in inputs {
                cn.input.add_proto_names(&name, names);
            }
            for (name, names) in proto_input {
                cn.proto_input.add_proto_names(&name, names);
            }
            for (name, names) in final_output {
                cn.final_output.add_proto_names(&name, names);
            }
            cn.operator = operator;
            cn.operator_proto_names = operator_proto_names;
            cn.proto_names = proto_names;
            cn.out_of_sync = false;
            assert_invariant(
                STRUCTURE_SYNC,
                !cn.out_of_sync && cn.substitution_node_count() == 0,
                "synchronized channel node starts without materializations",
                Some("synchronize"),
            );
        });
    }

    /// Discard everything cached on `node`'s channel node and mark it out of sync.
    pub(crate) fn reset_channel_node(&mut self, node: NodeId) {
        let Some(data) = self.data_node_mut(node) else {
            return;
        };
        let cn = &mut data.channel_node;
        let sub_nodes: Vec<SubNodeId> = cn
            .sub_nodes
            .drain()
            .map(|(_, id)| id)
            .chain(cn.empty_sub_node.take())
            .collect();
        let process_nodes: Vec<ProcessNodeId> = cn.process_nodes.drain().map(|(_, id)| id).collect();
        cn.operator = None;
        cn.operator_proto_names.clear();
        cn.proto_names.clear();
        cn.out_of_sync = true;

        for id in process_nodes {
            self.destroy_process_node(id);
        }
        for id in sub_nodes {
            self.discard_substitution_node(id);
        }
        self.with_channel_node(node, |cn, store| cn.clear_maps(store));
        tracing::trace!(node = node.0, "channel node reset");
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{BufferValue, DataType};
    use crate::graph::{Graph, NodeId};
    use std::collections::BTreeSet;

    fn leaf(graph: &mut Graph, name: &str, param: bool) -> NodeId {
        let node = graph.create_input_node();
        let entry = graph
            .create_buffer_entry(DataType::Float3, BufferValue::Float(vec![1.0, 2.0, 3.0]))
            .unwrap();
        graph.set_name(node, name).unwrap();
        graph.set_param(node, param).unwrap();
        graph.set_data(node, Some(entry)).unwrap();
        node
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn param_leaves_become_proto_names() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(true);
        let pos = leaf(&mut graph, "position", true);
        let idx = leaf(&mut graph, "index", false);
        graph.append_child(node, pos).unwrap();
        graph.append_child(node, idx).unwrap();
        graph.synchronize(node);

        let cn = graph.data_node(node).unwrap().channel_node();
        assert!(!cn.is_out_of_sync());
        assert_eq!(cn.proto_names(), &names(&["position"]));
        let out = cn.final_output_channels();
        assert_eq!(out.proto_names("position"), Some(&names(&["position"])));
        assert_eq!(out.proto_names("index"), Some(&BTreeSet::new()));
    }

    #[test]
    fn operator_outputs_inherit_mapped_proto_names() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        let v = leaf(&mut graph, "value", true);
        let w = leaf(&mut graph, "other", true);
        graph.append_child(node, v).unwrap();
        graph.append_child(node, w).unwrap();
        graph.set_compute(node, "result = xflow.normalize(value)").unwrap();
        graph.synchronize(node);

        let cn = graph.data_node(node).unwrap().channel_node();
        assert_eq!(cn.operator().map(|op| op.name()), Some("xflow.normalize"));
        assert_eq!(cn.operator_proto_names(), &names(&["value"]));
        assert_eq!(
            cn.proto_input_channels().proto_names("result"),
            Some(&names(&["value"]))
        );
    }

    #[test]
    fn unknown_operator_forwards_data() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        let v = leaf(&mut graph, "value", false);
        graph.append_child(node, v).unwrap();
        graph.set_compute(node, "result = nope.missing(value)").unwrap();
        graph.synchronize(node);

        let cn = graph.data_node(node).unwrap().channel_node();
        assert!(cn.operator().is_none());
        let out: Vec<&String> = cn.final_output_channels().names().collect();
        assert_eq!(out, vec!["value"]);
    }

    #[test]
    fn proto_outputs_map_through_instance_inputs() {
        let mut graph = Graph::new();
        let proto = graph.create_data_node(true);
        let p = leaf(&mut graph, "value", true);
        graph.append_child(proto, p).unwrap();
        graph.set_compute(proto, "result = xflow.normalize(value)").unwrap();

        let instance = graph.create_data_node(false);
        let bound = leaf(&mut graph, "value", true);
        graph.append_child(instance, bound).unwrap();
        graph.set_proto_node(instance, Some(proto)).unwrap();
        graph.synchronize(instance);

        let out = graph
            .data_node(instance)
            .unwrap()
            .channel_node()
            .final_output_channels();
        assert_eq!(out.proto_names("result"), Some(&names(&["value"])));
    }
}
