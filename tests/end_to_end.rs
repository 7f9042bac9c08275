//! Pull-driven evaluation through the public request API.

use std::sync::{Arc, Mutex};
use xflow::{BufferValue, DataType, EntryId, Graph, NodeId, ResultState};

fn value_leaf(graph: &mut Graph, name: &str, ty: DataType, values: Vec<f32>) -> (NodeId, EntryId) {
    let leaf = graph.create_input_node();
    let entry = graph.create_buffer_entry(ty, BufferValue::Float(values)).unwrap();
    graph.set_name(leaf, name).unwrap();
    graph.set_data(leaf, Some(entry)).unwrap();
    (leaf, entry)
}

fn normalize_node(graph: &mut Graph, values: Vec<f32>) -> (NodeId, EntryId) {
    let node = graph.create_data_node(false);
    let (leaf, entry) = value_leaf(graph, "value", DataType::Float3, values);
    graph.append_child(node, leaf).unwrap();
    graph.set_compute(node, "result(xflow.normalize)(value)").unwrap();
    (node, entry)
}

fn output(graph: &mut Graph, node: NodeId, name: &str) -> Vec<f32> {
    let entry = graph
        .get_compute_result(node, &[name])
        .and_then(|r| r.get_output_data(name))
        .expect("output published");
    graph.entry(entry).unwrap().float_values().unwrap().to_vec()
}

#[test]
fn normalize_two_vectors() {
    let mut graph = Graph::new();
    let (node, _) = normalize_node(&mut graph, vec![3.0, 0.0, 0.0, 0.0, 4.0, 0.0]);
    assert_eq!(output(&mut graph, node, "result"), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn data_change_never_desynchronizes() {
    let mut graph = Graph::new();
    let (node, entry) = normalize_node(&mut graph, vec![3.0, 0.0, 0.0]);
    let request = graph.compute_request(node, &["result"]).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    graph.set_request_callback(request, move |_, state| log.lock().unwrap().push(state));
    graph.get_result(request).unwrap();
    let cn = graph.data_node(node).unwrap().channel_node();
    assert!(!cn.is_out_of_sync());
    let materialized = cn.substitution_node_count();

    for step in 1..4 {
        graph
            .set_buffer_value(entry, BufferValue::Float(vec![0.0, step as f32, 0.0]))
            .unwrap();
        assert!(!graph.data_node(node).unwrap().channel_node().is_out_of_sync());
        graph.get_result(request).unwrap();
        let cn = graph.data_node(node).unwrap().channel_node();
        assert!(!cn.is_out_of_sync());
        assert_eq!(cn.substitution_node_count(), materialized);
        assert_eq!(
            graph.result_output(request, "result").unwrap().float_values().unwrap(),
            &[0.0, 1.0, 0.0]
        );
    }
    assert_eq!(*seen.lock().unwrap(), vec![ResultState::ChangedData; 3]);
}

#[test]
fn results_flow_through_nested_computes() {
    let mut graph = Graph::new();
    let (inner, _) = normalize_node(&mut graph, vec![0.0, 0.0, 2.0, 0.0, 5.0, 0.0]);
    let outer = graph.create_data_node(false);
    graph.append_child(outer, inner).unwrap();
    let (offset, offset_entry) = value_leaf(&mut graph, "offset", DataType::Float3, vec![1.0, 1.0, 1.0]);
    graph.append_child(outer, offset).unwrap();
    graph.set_compute(outer, "moved = xflow.add(result, offset)").unwrap();

    assert_eq!(output(&mut graph, outer, "moved"), vec![1.0, 1.0, 2.0, 1.0, 2.0, 1.0]);

    graph
        .set_buffer_value(offset_entry, BufferValue::Float(vec![0.0, 0.0, -1.0]))
        .unwrap();
    assert_eq!(output(&mut graph, outer, "moved"), vec![0.0, 0.0, 0.0, 0.0, 1.0, -1.0]);
}

#[test]
fn invalid_input_keeps_last_result() {
    let mut graph = Graph::new();
    let node = graph.create_data_node(false);
    let (a, _) = value_leaf(&mut graph, "value1", DataType::Float3, vec![1.0, 2.0, 3.0]);
    let (b, b_entry) = value_leaf(&mut graph, "value2", DataType::Float3, vec![1.0, 1.0, 1.0]);
    graph.append_child(node, a).unwrap();
    graph.append_child(node, b).unwrap();
    graph.set_compute(node, "result = xflow.sub(value1, value2)").unwrap();
    assert_eq!(output(&mut graph, node, "result"), vec![0.0, 1.0, 2.0]);

    graph.set_buffer_value(b_entry, BufferValue::Float(Vec::new())).unwrap();
    assert_eq!(output(&mut graph, node, "result"), vec![0.0, 1.0, 2.0]);
}

#[test]
fn unknown_operator_forwards_inputs() {
    let mut graph = Graph::new();
    let node = graph.create_data_node(false);
    let (leaf, _) = value_leaf(&mut graph, "value", DataType::Float3, vec![1.0, 2.0, 3.0]);
    graph.append_child(node, leaf).unwrap();
    graph.set_compute(node, "result = custom.missing(value)").unwrap();

    let result = graph.get_compute_result(node, &[]).unwrap();
    let names: Vec<&str> = result.output_names().collect();
    assert_eq!(names, vec!["value"]);
}

#[test]
fn scalar_weight_broadcasts_in_morph() {
    let mut graph = Graph::new();
    let node = graph.create_data_node(false);
    let (base, _) = value_leaf(&mut graph, "value", DataType::Float3, vec![0.0; 9]);
    let (delta, _) = value_leaf(
        &mut graph,
        "valueAdd",
        DataType::Float3,
        vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 4.0],
    );
    let (weight, weight_entry) = value_leaf(&mut graph, "weight", DataType::Float, vec![0.5]);
    for child in [base, delta, weight] {
        graph.append_child(node, child).unwrap();
    }
    graph.set_compute(node, "position = xflow.morph(value, valueAdd, weight)").unwrap();
    assert_eq!(
        output(&mut graph, node, "position"),
        vec![0.5, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0]
    );

    graph.set_buffer_value(weight_entry, BufferValue::Float(vec![1.0])).unwrap();
    assert_eq!(
        output(&mut graph, node, "position"),
        vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 4.0]
    );
}
