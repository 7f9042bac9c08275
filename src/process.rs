//! Operator execution units.
//!
//! A [`ProcessNode`] binds one operator to concrete input channels under one
//! substitution, owns its output entries and remembers whether they are
//! current. Execution validates inputs, applies the broadcast rule, sizes
//! the outputs and runs the kernel.

use crate::channel::{ChannelId, DataSlot, Listener, SequenceValue, Substitution};
use crate::data::{BufferValue, DataEntry, EntryId};
use crate::graph::{Graph, NodeId};
use crate::invariant_ppt::{assert_invariant, BROADCAST_SOUND, PROCESS_INPUT_VALIDATED};
use crate::operator::{Arg, EvalInfo, Kernel, OutArg, Operator, SequenceAccess};
use crate::plan::{self, ExecutionPlan, IterationPlan};
use std::sync::Arc;

/// Unique identifier for a process node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessNodeId(pub u64);

/// Whether a process node's outputs are current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Inputs changed since the last run.
    Unprocessed,
    /// Outputs are current.
    Processed,
    /// Inputs failed validation; outputs hold their previous values.
    InvalidInput,
}

/// One operator bound to concrete channels.
#[derive(Debug)]
pub struct ProcessNode {
    owner: NodeId,
    key: String,
    operator: Arc<Operator>,
    input_channels: Vec<Option<ChannelId>>,
    outputs: Vec<(String, EntryId)>,
    children: Vec<ProcessNodeId>,
    state: ProcessState,
    use_count: usize,
}

impl ProcessNode {
    /// Data node whose compute this runs.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Operator.
    pub fn operator(&self) -> &Arc<Operator> {
        &self.operator
    }

    /// Channel bound to each operator parameter.
    pub fn input_channels(&self) -> &[Option<ChannelId>] {
        &self.input_channels
    }

    /// `(channel name, entry)` per operator output.
    pub fn outputs(&self) -> &[(String, EntryId)] {
        &self.outputs
    }

    /// Process nodes producing this node's inputs.
    pub fn children(&self) -> &[ProcessNodeId] {
        &self.children
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Number of substitution nodes holding this node.
    pub fn use_count(&self) -> usize {
        self.use_count
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.state = ProcessState::Unprocessed;
    }

    pub(crate) fn output_entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.outputs.iter().map(|(_, entry)| *entry)
    }

    pub(crate) fn output_slots(&self, id: ProcessNodeId) -> Vec<(String, DataSlot)> {
        self.outputs
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    DataSlot {
                        entry: *entry,
                        key: 0.0,
                        creator: Some(id),
                    },
                )
            })
            .collect()
    }
}

/// Where one kernel argument comes from.
enum ArgSource {
    Entry(EntryId),
    Weight(f32),
    Absent,
}

fn arg_view(entry: &DataEntry) -> Arg<'_> {
    match entry {
        DataEntry::Buffer(buffer) => match buffer.value() {
            BufferValue::Float(v) => Arg::Float(v),
            BufferValue::Int(v) => Arg::Int(v),
            BufferValue::Bool(v) => Arg::Bool(v),
        },
        DataEntry::Texture(texture) => Arg::Texture(texture),
    }
}

fn out_view(entry: &mut DataEntry) -> OutArg<'_> {
    match entry {
        DataEntry::Buffer(buffer) => match buffer.value_mut() {
            BufferValue::Float(v) => OutArg::Float(v),
            BufferValue::Int(v) => OutArg::Int(v),
            BufferValue::Bool(v) => OutArg::Bool(v),
        },
        DataEntry::Texture(texture) => OutArg::Texture(texture),
    }
}

impl Graph {
    /// Process node by id.
    pub fn process_node(&self, id: ProcessNodeId) -> Option<&ProcessNode> {
        self.process_nodes.get(&id)
    }

    /// Acquire the memoized process node of `node` under `sub`.
    pub(crate) fn acquire_process_node(&mut self, node: NodeId, sub: &Substitution) -> Option<ProcessNodeId> {
        let (compute, operator, key, cached, input_channels) = {
            let data = self.data_node(node)?;
            let compute = data.compute()?.clone();
            let cn = &data.channel_node;
            let operator = cn.operator.clone()?;
            let key = sub.key(&cn.operator_proto_names);
            let cached = cn.process_nodes.get(&key).copied();
            let input_channels: Vec<Option<ChannelId>> = operator
                .params()
                .iter()
                .enumerate()
                .map(|(i, param)| {
                    cn.input
                        .get_channel(&compute.inputs.input_name(i, &param.source), sub)
                })
                .collect();
            (compute, operator, key, cached, input_channels)
        };

        if let Some(existing) = cached.and_then(|id| self.process_nodes.get_mut(&id)) {
            existing.use_count += 1;
            return cached;
        }

        let id = ProcessNodeId(self.next_id());
        let mut children = Vec::new();
        for channel in input_channels.iter().flatten() {
            self.store.add_listener(*channel, Listener::Process(id));
            if let Some(c) = self.store.channel(*channel) {
                for creator in c.creators() {
                    if !children.contains(&creator) {
                        children.push(creator);
                    }
                }
            }
        }
        let outputs = operator
            .outputs()
            .iter()
            .enumerate()
            .map(|(i, decl)| {
                let name = compute.outputs.output_name(i, &decl.name);
                (name, self.store.insert_entry(DataEntry::empty(decl.ty)))
            })
            .collect();

        tracing::debug!(
            node = node.0,
            operator = operator.name(),
            key = %key,
            "process node created"
        );
        self.process_nodes.insert(
            id,
            ProcessNode {
                owner: node,
                key: key.clone(),
                operator,
                input_channels,
                outputs,
                children,
                state: ProcessState::Unprocessed,
                use_count: 1,
            },
        );
        if let Some(data) = self.data_node_mut(node) {
            data.channel_node.process_nodes.insert(key, id);
        }
        Some(id)
    }

    pub(crate) fn release_process_node(&mut self, id: ProcessNodeId) {
        let Some(node) = self.process_nodes.get_mut(&id) else {
            return;
        };
        node.use_count = node.use_count.saturating_sub(1);
        if node.use_count == 0 {
            self.destroy_process_node(id);
        }
    }

    /// Unsubscribe, free outputs and forget the node.
    pub(crate) fn destroy_process_node(&mut self, id: ProcessNodeId) {
        let Some(node) = self.process_nodes.remove(&id) else {
            return;
        };
        for channel in node.input_channels.iter().flatten() {
            self.store.remove_listener(*channel, Listener::Process(id));
        }
        for (_, entry) in &node.outputs {
            self.store.free_entry(*entry);
        }
        if let Some(data) = self.data_node_mut(node.owner) {
            if data.channel_node.process_nodes.get(&node.key) == Some(&id) {
                data.channel_node.process_nodes.remove(&node.key);
            }
        }
    }

    /// Bring `id` and everything feeding it up to date.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn process(&mut self, id: ProcessNodeId) {
        self.process_all(&[id]);
    }

    pub(crate) fn process_all(&mut self, roots: &[ProcessNodeId]) {
        let plan = ExecutionPlan::compile(roots, |p| {
            self.process_nodes
                .get(&p)
                .map(|n| n.children.clone())
                .unwrap_or_default()
        });
        match plan {
            Ok(plan) => {
                for p in plan.execution_order {
                    self.process_single(p);
                }
            }
            Err(err) => tracing::error!(%err, "process nodes could not be ordered"),
        }
    }

    fn process_single(&mut self, id: ProcessNodeId) {
        match self.process_nodes.get(&id).map(ProcessNode::state) {
            Some(ProcessState::Unprocessed) => {}
            _ => return,
        }
        let state = if !self.check_input(id) {
            ProcessState::InvalidInput
        } else {
            match self.apply_operator(id) {
                Ok(()) => ProcessState::Processed,
                Err(reason) => {
                    tracing::error!(process = id.0, reason, "operator failed");
                    ProcessState::InvalidInput
                }
            }
        };
        if let Some(node) = self.process_nodes.get_mut(&id) {
            node.state = state;
        }
    }

    fn first_entry(&self, channel: Option<ChannelId>) -> Option<&DataEntry> {
        match self
            .store
            .get_data_entry(channel?, SequenceAccess::NoAccess, 0.0)?
        {
            SequenceValue::Entry(entry) => self.store.entry(entry),
            SequenceValue::Weight(_) => None,
        }
    }

    /// Every required parameter must be bound to a non-empty entry of its type.
    fn check_input(&self, id: ProcessNodeId) -> bool {
        let Some(node) = self.process_nodes.get(&id) else {
            return false;
        };
        let op = &node.operator;
        for (param, channel) in op.params().iter().zip(&node.input_channels) {
            match self.first_entry(*channel) {
                None if param.optional && channel.is_none() => {}
                None => {
                    tracing::error!(operator = op.name(), param = %param.source, "missing required input");
                    return false;
                }
                Some(entry) if entry.is_empty() => {
                    tracing::error!(operator = op.name(), param = %param.source, "input is empty");
                    return false;
                }
                Some(entry) if entry.data_type() != param.ty => {
                    tracing::error!(
                        operator = op.name(),
                        param = %param.source,
                        expected = %param.ty,
                        actual = %entry.data_type(),
                        "input type mismatch"
                    );
                    return false;
                }
                Some(_) => {}
            }
        }
        true
    }

    fn apply_operator(&mut self, id: ProcessNodeId) -> Result<(), &'static str> {
        let node = self.process_nodes.get(&id).ok_or("process node missing")?;
        let op = Arc::clone(&node.operator);
        let inputs = node.input_channels.clone();
        let output_ids: Vec<EntryId> = node.output_entries().collect();

        let sources: Vec<ArgSource> = op
            .args()
            .iter()
            .map(|arg| {
                let Some(channel) = inputs[arg.param] else {
                    return ArgSource::Absent;
                };
                let key = arg
                    .key_param
                    .and_then(|k| self.first_entry(inputs[k]))
                    .and_then(|e| e.float_values()?.first().copied())
                    .unwrap_or(0.0);
                match self.store.get_data_entry(channel, arg.sequence, key) {
                    Some(SequenceValue::Entry(entry)) => ArgSource::Entry(entry),
                    Some(SequenceValue::Weight(w)) => ArgSource::Weight(w),
                    None => ArgSource::Absent,
                }
            })
            .collect();

        let mut taken = Vec::with_capacity(output_ids.len());
        for entry in &output_ids {
            match self.store.take_entry(*entry) {
                Some(record) => taken.push((*entry, record)),
                None => {
                    for (entry, record) in taken {
                        self.store.restore_entry(entry, record);
                    }
                    return Err("output entry missing");
                }
            }
        }

        let weights: Vec<[f32; 1]> = sources
            .iter()
            .map(|s| match s {
                ArgSource::Weight(w) => [*w],
                _ => [0.0],
            })
            .collect();
        let args: Vec<Arg<'_>> = sources
            .iter()
            .zip(&weights)
            .map(|(source, weight)| match source {
                ArgSource::Entry(entry) => self.store.entry(*entry).map_or(Arg::Absent, arg_view),
                ArgSource::Weight(_) => Arg::Float(weight),
                ArgSource::Absent => Arg::Absent,
            })
            .collect();

        let tuple_sizes: Vec<usize> = (0..args.len()).map(|i| op.arg_type(i).tuple_size()).collect();
        let array: Vec<bool> = op.args().iter().map(|a| a.array).collect();
        let iteration = plan::iterate_count(&args, &tuple_sizes, &array);
        if iteration.truncated && self.config.warn_on_broadcast_truncation {
            tracing::warn!(
                operator = op.name(),
                count = iteration.count,
                "iterating inputs differ in length, truncating to the shortest"
            );
        }
        assert_invariant(
            BROADCAST_SOUND,
            args.iter()
                .zip(&tuple_sizes)
                .zip(&iteration.iterating)
                .filter(|(_, it)| **it)
                .all(|((arg, size), _)| plan::tuple_count(arg, *size) >= iteration.count),
            "iteration count fits every iterating input",
            Some(op.name()),
        );
        assert_invariant(
            PROCESS_INPUT_VALIDATED,
            op.params()
                .iter()
                .zip(&inputs)
                .all(|(p, ch)| p.optional || ch.is_some()),
            "required inputs are bound",
            Some(op.name()),
        );

        let custom_sizes = op.alloc_fn().map(|alloc| alloc(&args, iteration.count));
        for (i, decl) in op.outputs().iter().enumerate() {
            let len = if decl.custom_alloc {
                custom_sizes.as_ref().and_then(|s| s.get(i)).copied().unwrap_or(0)
            } else {
                iteration.count * decl.ty.tuple_size()
            };
            if let DataEntry::Buffer(buffer) = &mut taken[i].1.entry {
                buffer.value_mut().resize(len);
            }
        }

        let mut outs: Vec<OutArg<'_>> = taken.iter_mut().map(|(_, r)| out_view(&mut r.entry)).collect();
        let result = match op.kernel() {
            Kernel::Core(core) => {
                let out_sizes: Vec<usize> = op.outputs().iter().map(|o| o.ty.tuple_size()).collect();
                let plan = self
                    .plan_cache
                    .entry(format!("{}:{}", op.name(), iteration.key()))
                    .or_insert_with(|| {
                        Arc::new(IterationPlan::new(&tuple_sizes, &iteration.iterating, &out_sizes))
                    })
                    .clone();
                plan.run(core, &mut outs, &args, iteration.count);
                Ok(())
            }
            Kernel::Evaluate(evaluate) => evaluate(
                outs.as_mut_slice(),
                args.as_slice(),
                &EvalInfo {
                    iterate_count: iteration.count,
                    iterating: iteration.iterating.clone(),
                },
            ),
        };
        drop(outs);
        drop(args);
        for (entry, record) in taken {
            self.store.restore_entry(entry, record);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::Substitution;
    use crate::data::{BufferValue, DataType};
    use crate::graph::{Graph, NodeId};
    use crate::process::ProcessState;

    fn leaf(graph: &mut Graph, name: &str, ty: DataType, values: Vec<f32>) -> NodeId {
        let node = graph.create_input_node();
        let entry = graph.create_buffer_entry(ty, BufferValue::Float(values)).unwrap();
        graph.set_name(node, name).unwrap();
        graph.set_data(node, Some(entry)).unwrap();
        node
    }

    fn process_of(graph: &mut Graph, node: NodeId) -> crate::process::ProcessNodeId {
        let sub = graph.get_substitution_node(node, &Substitution::empty()).unwrap();
        graph.substitution_node(sub).unwrap().process_node().unwrap()
    }

    #[test]
    fn scalar_weight_broadcasts_over_vertices() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        for (name, ty, values) in [
            ("value1", DataType::Float3, vec![0.0, 0.0, 0.0, 2.0, 2.0, 2.0]),
            ("value2", DataType::Float3, vec![4.0, 0.0, 0.0, 4.0, 4.0, 4.0]),
            ("weight", DataType::Float, vec![0.5]),
        ] {
            let l = leaf(&mut graph, name, ty, values);
            graph.append_child(node, l).unwrap();
        }
        graph.set_compute(node, "result = xflow.lerp(value1, value2, weight)").unwrap();
        let p = process_of(&mut graph, node);
        graph.process(p);

        let pn = graph.process_node(p).unwrap();
        assert_eq!(pn.state(), ProcessState::Processed);
        let out = graph.entry(pn.outputs()[0].1).unwrap();
        assert_eq!(out.float_values().unwrap(), &[2.0, 0.0, 0.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn missing_input_leaves_outputs_stale() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        let l = leaf(&mut graph, "value1", DataType::Float3, vec![1.0, 1.0, 1.0]);
        graph.append_child(node, l).unwrap();
        graph.set_compute(node, "result = xflow.add(value1, value2)").unwrap();
        let p = process_of(&mut graph, node);
        graph.process(p);

        let pn = graph.process_node(p).unwrap();
        assert_eq!(pn.state(), ProcessState::InvalidInput);
        assert!(graph.entry(pn.outputs()[0].1).unwrap().is_empty());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut graph = Graph::new();
        let node = graph.create_data_node(false);
        let l = leaf(&mut graph, "value", DataType::Float4, vec![1.0, 0.0, 0.0, 0.0]);
        graph.append_child(node, l).unwrap();
        graph.set_compute(node, "result = xflow.normalize(value)").unwrap();
        let p = process_of(&mut graph, node);
        graph.process(p);
        assert_eq!(graph.process_node(p).unwrap().state(), ProcessState::InvalidInput);
    }

    #[test]
    fn chained_nodes_run_producers_first() {
        let mut graph = Graph::new();
        let inner = graph.create_data_node(false);
        let l = leaf(&mut graph, "value", DataType::Float3, vec![0.0, 3.0, 4.0]);
        graph.append_child(inner, l).unwrap();
        graph.set_compute(inner, "value = xflow.normalize(value)").unwrap();

        let outer = graph.create_data_node(false);
        graph.append_child(outer, inner).unwrap();
        let offset = leaf(&mut graph, "offset", DataType::Float3, vec![1.0, 0.0, 0.0]);
        graph.append_child(outer, offset).unwrap();
        graph.set_compute(outer, "result = xflow.add(value, offset)").unwrap();

        let p = process_of(&mut graph, outer);
        assert_eq!(graph.process_node(p).unwrap().children().len(), 1);
        graph.process(p);
        let out = graph.entry(graph.process_node(p).unwrap().outputs()[0].1).unwrap();
        let v = out.float_values().unwrap();
        assert!((v[0] - 1.0).abs() < 1e-6 && (v[1] - 0.6).abs() < 1e-6 && (v[2] - 0.8).abs() < 1e-6);
    }
}
