//! DSL module: builder API for data trees.
//!
//! Unlike the graph's own setters, the builder rejects unparseable filter
//! and compute strings instead of falling back to pass-through.

use crate::data::{BufferValue, DataType, TextureEntry};
use crate::error::{GraphError, XflowError};
use crate::graph::{Graph, NodeId};
use crate::mapping::{Compute, Filter};
use std::collections::HashMap;

/// Handle to a node in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub NodeId);

/// The data tree builder.
#[derive(Debug, Default)]
pub struct DataTreeBuilder {
    graph: Graph,
    node_names: HashMap<String, NodeId>,
}

impl DataTreeBuilder {
    /// Builder over a fresh graph with the built-in operators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder adding to an existing graph.
    pub fn with_graph(graph: Graph) -> Self {
        Self {
            graph,
            node_names: HashMap::new(),
        }
    }

    /// Input leaf named `name` holding a buffer.
    pub fn value(&mut self, name: &str, ty: DataType, value: BufferValue) -> Result<NodeHandle, DslError> {
        self.keyed_value(name, 0.0, ty, value)
    }

    /// Input leaf holding one keyframe of a sequence.
    pub fn keyed_value(
        &mut self,
        name: &str,
        key: f32,
        ty: DataType,
        value: BufferValue,
    ) -> Result<NodeHandle, DslError> {
        let entry = self.graph.create_buffer_entry(ty, value)?;
        let node = self.graph.create_input_node();
        self.graph.set_name(node, name)?;
        self.graph.set_key(node, key)?;
        self.graph.set_data(node, Some(entry))?;
        Ok(NodeHandle(node))
    }

    /// Input leaf holding a texture.
    pub fn texture(&mut self, name: &str, texture: TextureEntry) -> Result<NodeHandle, DslError> {
        let entry = self.graph.create_texture_entry(texture);
        let node = self.graph.create_input_node();
        self.graph.set_name(node, name)?;
        self.graph.set_data(node, Some(entry))?;
        Ok(NodeHandle(node))
    }

    /// Parameter leaf: bound by whoever instantiates the enclosing proto.
    pub fn param(&mut self, name: &str) -> Result<NodeHandle, DslError> {
        let node = self.graph.create_input_node();
        self.graph.set_name(node, name)?;
        self.graph.set_param(node, true)?;
        Ok(NodeHandle(node))
    }

    /// Data node over `children`.
    pub fn data(&mut self, children: &[NodeHandle]) -> Result<NodeHandle, DslError> {
        self.data_node(false, children)
    }

    /// Proto data node over `children`.
    pub fn proto(&mut self, children: &[NodeHandle]) -> Result<NodeHandle, DslError> {
        self.data_node(true, children)
    }

    fn data_node(&mut self, is_proto: bool, children: &[NodeHandle]) -> Result<NodeHandle, DslError> {
        let node = self.graph.create_data_node(is_proto);
        for child in children {
            self.graph.append_child(node, child.0)?;
        }
        Ok(NodeHandle(node))
    }

    /// Set the compute string.
    pub fn compute(&mut self, node: NodeHandle, text: &str) -> Result<(), DslError> {
        if let Some(compute) = Compute::parse(text)? {
            if !self.graph.registry().contains(&compute.operator) {
                return Err(DslError::UnknownOperator(compute.operator));
            }
        }
        self.graph.set_compute(node.0, text)?;
        Ok(())
    }

    /// Set the filter string.
    pub fn filter(&mut self, node: NodeHandle, text: &str) -> Result<(), DslError> {
        Filter::parse(text)?;
        self.graph.set_filter(node.0, text)?;
        Ok(())
    }

    /// Read all inputs from `source` instead of children.
    pub fn source(&mut self, node: NodeHandle, source: NodeHandle) -> Result<(), DslError> {
        self.graph.set_source_node(node.0, Some(source.0))?;
        Ok(())
    }

    /// Instantiate `proto` with this node's inputs bound to its params.
    pub fn instantiate(&mut self, node: NodeHandle, proto: NodeHandle) -> Result<(), DslError> {
        self.graph.set_proto_node(node.0, Some(proto.0))?;
        Ok(())
    }

    /// Remember `node` under `name`.
    pub fn name(&mut self, name: &str, node: NodeHandle) -> NodeHandle {
        self.node_names.insert(name.to_string(), node.0);
        node
    }

    /// Node remembered under `name`.
    pub fn lookup(&self, name: &str) -> Result<NodeHandle, DslError> {
        self.node_names
            .get(name)
            .copied()
            .map(NodeHandle)
            .ok_or_else(|| DslError::MissingNode(name.to_string()))
    }

    /// Build the graph.
    pub fn build(self) -> Graph {
        self.graph
    }
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DslError {
    /// Structural misuse.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Parse or type error.
    #[error(transparent)]
    Xflow(#[from] XflowError),
    /// Compute names an operator the registry lacks.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    /// No node registered under that name.
    #[error("no node named {0}")]
    MissingNode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsl_equivalence() {
        let mut builder = DataTreeBuilder::new();
        let value = builder
            .value("value", DataType::Float3, BufferValue::Float(vec![3.0, 0.0, 0.0]))
            .unwrap();
        let node = builder.data(&[value]).unwrap();
        builder.compute(node, "result = xflow.normalize(value)").unwrap();
        let mut dsl_graph = builder.build();

        let mut manual = Graph::new();
        let leaf = manual.create_input_node();
        let entry = manual
            .create_buffer_entry(DataType::Float3, BufferValue::Float(vec![3.0, 0.0, 0.0]))
            .unwrap();
        manual.set_name(leaf, "value").unwrap();
        manual.set_data(leaf, Some(entry)).unwrap();
        let m_node = manual.create_data_node(false);
        manual.append_child(m_node, leaf).unwrap();
        manual.set_compute(m_node, "result = xflow.normalize(value)").unwrap();

        let a = dsl_graph.get_compute_result(node.0, &["result"]).unwrap().get_output_data("result");
        let a = dsl_graph.entry(a.unwrap()).unwrap().float_values().unwrap().to_vec();
        let b = manual.get_compute_result(m_node, &["result"]).unwrap().get_output_data("result");
        let b = manual.entry(b.unwrap()).unwrap().float_values().unwrap().to_vec();
        assert_eq!(a, b);
        assert_eq!(a, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn ui_tests() {
        let mut builder = DataTreeBuilder::new();
        let node = builder.data(&[]).unwrap();
        assert!(matches!(builder.compute(node, "result = ("), Err(DslError::Xflow(_))));
        assert_eq!(
            builder.compute(node, "result = xflow.nope(value)"),
            Err(DslError::UnknownOperator("xflow.nope".to_string()))
        );
        assert!(matches!(builder.filter(node, "drop(value)"), Err(DslError::Xflow(_))));
        assert_eq!(builder.lookup("mesh"), Err(DslError::MissingNode("mesh".to_string())));

        let leaf = builder.param("value").unwrap();
        assert_eq!(
            builder.source(leaf, node),
            Err(DslError::Graph(GraphError::NotADataNode))
        );
        let named = builder.name("mesh", node);
        assert_eq!(builder.lookup("mesh"), Ok(named));
    }
}
