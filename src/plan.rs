//! Plan module: broadcast iteration plans and process-node ordering.
//!
//! [`iterate_count`] applies the broadcast rule to one operator call,
//! [`IterationPlan`] is the loop specialized for one pattern of iterating
//! arguments, and [`ExecutionPlan`] orders process nodes so every producer
//! runs before its consumers.

use crate::operator::{Arg, CoreFn, OutArg};
use crate::process::ProcessNodeId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Outcome of the broadcast rule for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
    /// Number of iterations.
    pub count: usize,
    /// Per argument: advances per iteration.
    pub iterating: Vec<bool>,
    /// Iterating arguments disagreed on length.
    pub truncated: bool,
}

impl Iteration {
    /// Pattern key: `i` for iterating arguments, `a` for broadcast ones.
    pub fn key(&self) -> String {
        self.iterating
            .iter()
            .map(|it| if *it { 'i' } else { 'a' })
            .collect()
    }
}

/// Tuples in an argument. A texture counts as one, an absent argument as none.
pub fn tuple_count(arg: &Arg<'_>, tuple_size: usize) -> usize {
    match arg {
        Arg::Texture(_) => 1,
        Arg::Absent => 0,
        other => other.len() / tuple_size.max(1),
    }
}

/// Iteration count is the minimum tuple count over arguments that are not
/// flagged `array` and hold more than one tuple; everything else broadcasts.
pub fn iterate_count(args: &[Arg<'_>], tuple_sizes: &[usize], array: &[bool]) -> Iteration {
    let counts: Vec<usize> = args
        .iter()
        .zip(tuple_sizes)
        .map(|(arg, size)| tuple_count(arg, *size))
        .collect();
    let iterating: Vec<bool> = counts
        .iter()
        .zip(array)
        .map(|(count, array)| !array && *count > 1)
        .collect();
    let lengths: Vec<usize> = counts
        .iter()
        .zip(&iterating)
        .filter(|(_, it)| **it)
        .map(|(count, _)| *count)
        .collect();
    let count = lengths.iter().copied().min().unwrap_or(1);
    let truncated = lengths.iter().any(|len| *len != count);
    Iteration {
        count,
        iterating,
        truncated,
    }
}

/// A per-element loop specialized for one iterating pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationPlan {
    key: String,
    arg_strides: Vec<usize>,
    out_strides: Vec<usize>,
}

impl IterationPlan {
    /// Plan for arguments of `tuple_sizes`, of which `iterating` advance,
    /// writing outputs of `out_tuple_sizes`.
    pub fn new(tuple_sizes: &[usize], iterating: &[bool], out_tuple_sizes: &[usize]) -> Self {
        let arg_strides = tuple_sizes
            .iter()
            .zip(iterating)
            .map(|(size, it)| if *it { *size } else { 0 })
            .collect();
        let key = iterating.iter().map(|it| if *it { 'i' } else { 'a' }).collect();
        Self {
            key,
            arg_strides,
            out_strides: out_tuple_sizes.to_vec(),
        }
    }

    /// Pattern key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Scalar offset argument `arg` is read at on iteration `i`.
    pub fn offset(&self, arg: usize, i: usize) -> usize {
        self.arg_strides[arg] * i
    }

    /// Run `core` once per iteration. Iterating arguments see one tuple at
    /// `i * tuple_size`; broadcast arguments are passed whole from index 0.
    pub fn run(&self, core: &CoreFn, outs: &mut [OutArg<'_>], args: &[Arg<'_>], count: usize) {
        let mut views: Vec<Arg<'_>> = Vec::with_capacity(args.len());
        for i in 0..count {
            views.clear();
            views.extend(args.iter().enumerate().map(|(a, arg)| {
                match self.arg_strides[a] {
                    0 => *arg,
                    stride => arg.window(self.offset(a, i), stride),
                }
            }));
            let mut out_views: Vec<OutArg<'_>> = outs
                .iter_mut()
                .zip(&self.out_strides)
                .map(|(out, stride)| out.window(i * stride, *stride))
                .collect();
            core(out_views.as_mut_slice(), views.as_slice());
        }
    }
}

/// Process nodes in dependency order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Producers first.
    pub execution_order: Vec<ProcessNodeId>,
}

impl ExecutionPlan {
    /// Order `roots` and everything they depend on. `children` yields the
    /// process nodes whose outputs feed a node.
    pub fn compile<F>(roots: &[ProcessNodeId], children: F) -> Result<Self, PlanError>
    where
        F: Fn(ProcessNodeId) -> Vec<ProcessNodeId>,
    {
        let mut edges: BTreeMap<ProcessNodeId, Vec<ProcessNodeId>> = BTreeMap::new();
        let mut stack: Vec<ProcessNodeId> = roots.to_vec();
        while let Some(node) = stack.pop() {
            if edges.contains_key(&node) {
                continue;
            }
            let deps = children(node);
            stack.extend(deps.iter().copied());
            edges.insert(node, deps);
        }
        topo_sort(&edges).map(|execution_order| Self { execution_order })
    }
}

/// Errors during plan compilation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Process nodes depend on each other.
    #[error("cycle detected between process nodes")]
    CycleDetected,
}

/// Kahn's algorithm over `node -> dependencies`.
fn topo_sort(
    edges: &BTreeMap<ProcessNodeId, Vec<ProcessNodeId>>,
) -> Result<Vec<ProcessNodeId>, PlanError> {
    let mut in_degree: BTreeMap<ProcessNodeId, usize> = BTreeMap::new();
    let mut adj: BTreeMap<ProcessNodeId, Vec<ProcessNodeId>> = BTreeMap::new();

    for (node, deps) in edges {
        let unique: BTreeSet<ProcessNodeId> = deps.iter().copied().collect();
        in_degree.insert(*node, unique.len());
        for dep in unique {
            adj.entry(dep).or_default().push(*node);
        }
    }

    let mut queue: VecDeque<ProcessNodeId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut order = Vec::with_capacity(edges.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for dependent in adj.get(&node).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if order.len() == edges.len() {
        Ok(order)
    } else {
        Err(PlanError::CycleDetected)
    }
}
