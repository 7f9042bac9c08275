//! Concrete materialization of a channel node under one substitution.

use crate::channel::{ChannelId, Substitution};
use crate::graph::{Graph, NodeId};
use crate::invariant_ppt::{assert_invariant, SUBSTITUTION_MEMOIZED, TEARDOWN_SYMMETRIC};
use crate::process::ProcessNodeId;
use std::collections::BTreeMap;

/// Unique identifier for a substitution node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubNodeId(pub u64);

/// What one `(channel node, substitution key)` pair acquired while being built.
#[derive(Debug, Clone)]
pub struct SubstitutionNode {
    owner: NodeId,
    key: String,
    substitution: Substitution,
    use_count: usize,
    process_node: Option<ProcessNodeId>,
    children: Vec<SubNodeId>,
    proto: Option<SubNodeId>,
}

impl SubstitutionNode {
    /// Data node this materializes.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Memo key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bindings restricted to the owner's proto names.
    pub fn substitution(&self) -> &Substitution {
        &self.substitution
    }

    /// Number of holders.
    pub fn use_count(&self) -> usize {
        self.use_count
    }

    /// Operator execution unit, if the owner computes.
    pub fn process_node(&self) -> Option<ProcessNodeId> {
        self.process_node
    }

    /// Substitution nodes of the children or source.
    pub fn children(&self) -> &[SubNodeId] {
        &self.children
    }

    /// Substitution node of the proto subtree.
    pub fn proto(&self) -> Option<SubNodeId> {
        self.proto
    }
}

impl Graph {
    /// Substitution node by id.
    pub fn substitution_node(&self, id: SubNodeId) -> Option<&SubstitutionNode> {
        self.sub_nodes.get(&id)
    }

    /// Final output channels of `node` under `sub`.
    pub fn final_channels(&self, node: NodeId, sub: &Substitution) -> Vec<(String, ChannelId)> {
        self.data_node(node)
            .map(|d| {
                d.channel_node
                    .final_output
                    .resolve_all(sub)
                    .into_iter()
                    .filter_map(|(name, channel)| channel.map(|c| (name, c)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Acquire the memoized substitution node of `node` under `sub`,
    /// building it on a miss. Each call must be paired with
    /// [`release_substitution_node`](Self::release_substitution_node).
    pub fn get_substitution_node(&mut self, node: NodeId, sub: &Substitution) -> Option<SubNodeId> {
        self.synchronize(node);
        let cn = &self.data_node(node)?.channel_node;
        let substitution = sub.restrict(&cn.proto_names);
        let key = substitution.full_key();

        if let Some(id) = cn.memo(&key) {
            if let Some(existing) = self.sub_nodes.get_mut(&id) {
                existing.use_count += 1;
                assert_invariant(
                    SUBSTITUTION_MEMOIZED,
                    existing.owner == node && existing.key == key,
                    "memo hit returns the node built for this key",
                    Some("get_substitution_node"),
                );
                tracing::trace!(node = node.0, key = %key, "substitution node reused");
                return Some(id);
            }
        }

        let id = SubNodeId(self.next_id());
        let built = self.construct_substitution_node(node, &substitution, &key);
        self.sub_nodes.insert(id, built);
        self.with_channel_node(node, |cn, _| cn.remember(&key, id));
        tracing::debug!(node = node.0, key = %key, "substitution node built");
        Some(id)
    }

    fn construct_substitution_node(
        &mut self,
        node: NodeId,
        sub: &Substitution,
        key: &str,
    ) -> SubstitutionNode {
        let mut built = SubstitutionNode {
            owner: node,
            key: key.to_string(),
            substitution: sub.clone(),
            use_count: 1,
            process_node: None,
            children: Vec::new(),
            proto: None,
        };
        let Some(data) = self.data_node(node) else {
            return built;
        };
        let children = data.children().to_vec();
        let source = data.source_node();
        let proto = data.proto_node();
        let filter = data.filter().cloned();
        let computes = data.channel_node.operator.is_some();

        // Inputs: the source's outputs, or every child merged in order.
        match source {
            Some(src) => self.merge_child_outputs(node, src, sub, &mut built),
            None => {
                for child in children {
                    match self.input_node(child).cloned() {
                        Some(leaf) => {
                            let bound = if leaf.is_param() { sub.get(leaf.name()) } else { None };
                            self.with_channel_node(node, |cn, store| match (bound, leaf.data()) {
                                (Some(channel), _) => cn.input.add_channel(store, leaf.name(), channel, sub),
                                (None, Some(entry)) => {
                                    cn.input.add_data_entry(store, leaf.name(), entry, leaf.key(), sub)
                                }
                                (None, None) => {}
                            });
                        }
                        None => self.merge_child_outputs(node, child, sub, &mut built),
                    }
                }
            }
        }

        if computes {
            built.process_node = self.acquire_process_node(node, sub);
        }
        let output_slots = built
            .process_node
            .and_then(|p| self.process_nodes.get(&p).map(|pn| pn.output_slots(p)))
            .unwrap_or_default();

        let mut pre_filter: BTreeMap<String, ChannelId> = BTreeMap::new();
        let mut derived = Substitution::empty();
        self.with_channel_node(node, |cn, store| {
            for (name, channel) in cn.input.resolve_all(sub) {
                if let Some(channel) = channel {
                    cn.proto_input.add_channel(store, &name, channel, sub);
                }
            }
            for (name, slot) in output_slots {
                cn.proto_input.add_output_data_slot(store, &name, slot, sub);
            }
            pre_filter.extend(
                cn.proto_input
                    .resolve_all(sub)
                    .into_iter()
                    .filter_map(|(name, channel)| channel.map(|c| (name, c))),
            );
            derived = Substitution::from_channel_map(&cn.proto_input, sub);
        });

        if let Some(p) = proto {
            built.proto = self.get_substitution_node(p, &derived);
            if built.proto.is_some() {
                pre_filter.extend(self.final_channels(p, &derived));
            }
        }

        let available: Vec<&String> = pre_filter.keys().collect();
        let pairs: Vec<(String, String)> = match &filter {
            Some(filter) => filter.apply(&available),
            None => available.iter().map(|n| ((*n).clone(), (*n).clone())).collect(),
        };
        self.with_channel_node(node, |cn, store| {
            for (dest, src) in pairs {
                if let Some(channel) = pre_filter.get(&src) {
                    cn.final_output.add_channel(store, &dest, *channel, sub);
                }
            }
            cn.input.mark_done(sub);
            cn.proto_input.mark_done(sub);
            cn.final_output.mark_done(sub);
        });
        built
    }

    fn merge_child_outputs(
        &mut self,
        node: NodeId,
        child: NodeId,
        sub: &Substitution,
        built: &mut SubstitutionNode,
    ) {
        let Some(child_sub) = self.get_substitution_node(child, sub) else {
            return;
        };
        built.children.push(child_sub);
        let channels = self.final_channels(child, sub);
        self.with_channel_node(node, |cn, store| {
            for (name, channel) in channels {
                cn.input.add_channel(store, &name, channel, sub);
            }
        });
    }

    /// Drop one use of a substitution node; the last use undoes its construction.
    pub fn release_substitution_node(&mut self, id: SubNodeId) {
        let Some(node) = self.sub_nodes.get_mut(&id) else {
            return;
        };
        node.use_count = node.use_count.saturating_sub(1);
        if node.use_count > 0 {
            return;
        }
        let Some(node) = self.sub_nodes.remove(&id) else {
            return;
        };
        self.with_channel_node(node.owner, |cn, store| {
            cn.final_output.clear_substitution(store, &node.substitution);
            cn.proto_input.clear_substitution(store, &node.substitution);
            cn.input.clear_substitution(store, &node.substitution);
            cn.forget(&node.key, id);
        });
        if let Some(process) = node.process_node {
            self.release_process_node(process);
        }
        self.release_dependencies(&node);
        assert_invariant(
            TEARDOWN_SYMMETRIC,
            self.data_node(node.owner)
                .map_or(true, |d| d.channel_node.memo(&node.key) != Some(id)),
            "released substitution node is no longer memoized",
            Some("release_substitution_node"),
        );
        tracing::trace!(owner = node.owner.0, key = %node.key, "substitution node released");
    }

    /// Remove a substitution node regardless of its use count. Its owner's
    /// maps and process nodes are cleared by the caller.
    pub(crate) fn discard_substitution_node(&mut self, id: SubNodeId) {
        if let Some(node) = self.sub_nodes.remove(&id) {
            self.release_dependencies(&node);
        }
    }

    fn release_dependencies(&mut self, node: &SubstitutionNode) {
        if let Some(proto) = node.proto {
            self.release_substitution_node(proto);
        }
        for child in &node.children {
            self.release_substitution_node(*child);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::Substitution;
    use crate::data::{BufferValue, DataType};
    use crate::graph::{Graph, NodeId};

    fn leaf(graph: &mut Graph, name: &str, values: Vec<f32>, param: bool) -> NodeId {
        let node = graph.create_input_node();
        let entry = graph
            .create_buffer_entry(DataType::Float3, BufferValue::Float(values))
            .unwrap();
        graph.set_name(node, name).unwrap();
        graph.set_param(node, param).unwrap();
        graph.set_data(node, Some(entry)).unwrap();
        node
    }

    fn bound_channel(graph: &mut Graph, name: &str) -> crate::channel::ChannelId {
        let holder = graph.create_data_node(false);
        let l = leaf(graph, name, vec![0.0, 1.0, 0.0], false);
        graph.append_child(holder, l).unwrap();
        let empty = Substitution::empty();
        graph.get_substitution_node(holder, &empty).unwrap();
        graph.final_channels(holder, &empty)[0].1
    }

    #[test]
    fn equal_keys_share_one_node() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(true);
        let p = leaf(&mut graph, "value", vec![1.0, 0.0, 0.0], true);
        graph.append_child(node, p).unwrap();
        let ch = bound_channel(&mut graph, "value");
        let other = bound_channel(&mut graph, "value");

        let a = Substitution::from_bindings([("value", ch)]);
        let b = Substitution::from_bindings([("value", ch), ("unrelated", other)]);
        let c = Substitution::from_bindings([("value", other)]);

        let first = graph.get_substitution_node(node, &a).unwrap();
        let second = graph.get_substitution_node(node, &b).unwrap();
        let third = graph.get_substitution_node(node, &c).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(graph.substitution_node(first).unwrap().use_count(), 2);

        let empty = Substitution::empty();
        let default = graph.get_substitution_node(node, &empty).unwrap();
        assert_eq!(graph.substitution_node(default).unwrap().key(), "");
        assert_eq!(
            graph.data_node(node).unwrap().channel_node().substitution_node_count(),
            3
        );
    }

    #[test]
    fn bound_params_replace_defaults() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(true);
        let p = leaf(&mut graph, "value", vec![1.0, 0.0, 0.0], true);
        graph.append_child(node, p).unwrap();
        let ch = bound_channel(&mut graph, "value");
        let sub = Substitution::from_bindings([("value", ch)]);
        graph.get_substitution_node(node, &sub).unwrap();
        assert_eq!(graph.final_channels(node, &sub), vec![("value".to_string(), ch)]);
        let empty = Substitution::empty();
        graph.get_substitution_node(node, &empty).unwrap();
        assert_ne!(graph.final_channels(node, &empty)[0].1, ch);
    }

    #[test]
    fn release_is_symmetric() {
        let mut graph = Graph::new();
        let root = graph.create_data_node(false);
        let child = graph.create_data_node(false);
        let l = leaf(&mut graph, "position", vec![1.0, 2.0, 3.0], false);
        graph.append_child(child, l).unwrap();
        graph.append_child(root, child).unwrap();
        graph.set_compute(root, "result = xflow.normalize(position)").unwrap();

        let empty = Substitution::empty();
        let id = graph.get_substitution_node(root, &empty).unwrap();
        assert!(graph.substitution_node(id).unwrap().process_node().is_some());
        assert!(!graph.final_channels(root, &empty).is_empty());

        graph.release_substitution_node(id);
        assert!(graph.substitution_node(id).is_none());
        assert!(graph.final_channels(root, &empty).is_empty());
        let cn = graph.data_node(child).unwrap().channel_node();
        assert_eq!(cn.substitution_node_count(), 0);
        assert!(graph.process_nodes.is_empty());
    }
}
