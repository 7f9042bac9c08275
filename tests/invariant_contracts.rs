//! Contract tests for invariant signaling.
//!
//! One deterministic scenario drives every engine path and then checks that
//! each guarantee was actually asserted along the way.

use xflow::invariant_ppt::{
    clear_invariant_log, contract_test, BROADCAST_SOUND, CHANNEL_MERGE_IDENTITY,
    DATA_CHANGE_KEEPS_STRUCTURE, GRAPH_ACYCLIC, PROCESS_INPUT_VALIDATED, REQUEST_RESULT_RESOLVED,
    SEQUENCE_ORDERED, STRUCTURE_SYNC, SUBSTITUTION_MEMOIZED, TEARDOWN_SYMMETRIC,
};
use xflow::{BufferValue, DataType, EntryId, Graph, NodeId};

fn leaf(graph: &mut Graph, name: &str, key: f32, ty: DataType, values: Vec<f32>) -> (NodeId, EntryId) {
    let node = graph.create_input_node();
    let entry = graph.create_buffer_entry(ty, BufferValue::Float(values)).unwrap();
    graph.set_name(node, name).unwrap();
    graph.set_key(node, key).unwrap();
    graph.set_data(node, Some(entry)).unwrap();
    (node, entry)
}

#[test]
fn every_invariant_is_enforced() {
    clear_invariant_log();
    let mut graph = Graph::new();

    // Keyframes plus a key feeding lerpSeq.
    let frames = graph.create_data_node(false);
    let (k0, _) = leaf(&mut graph, "sequence", 0.0, DataType::Float3, vec![0.0, 0.0, 0.0]);
    let (k1, _) = leaf(&mut graph, "sequence", 1.0, DataType::Float3, vec![2.0, 0.0, 0.0]);
    let (key, key_entry) = leaf(&mut graph, "key", 0.0, DataType::Float, vec![0.5]);
    for child in [k0, k1, key] {
        graph.append_child(frames, child).unwrap();
    }
    graph.set_compute(frames, "value = xflow.lerpSeq(sequence, key)").unwrap();

    // The same channels reach `root` twice: directly and through `alias`.
    let alias = graph.create_data_node(false);
    graph.set_source_node(alias, Some(frames)).unwrap();
    let root = graph.create_data_node(false);
    graph.append_child(root, frames).unwrap();
    graph.append_child(root, alias).unwrap();
    graph.set_compute(root, "result = xflow.normalize(value)").unwrap();

    let request = graph.compute_request(root, &["result"]).unwrap();
    let result = graph.get_result(request).unwrap().get_output_data("result").unwrap();
    assert_eq!(graph.entry(result).unwrap().float_values().unwrap(), &[1.0, 0.0, 0.0]);

    graph.set_buffer_value(key_entry, BufferValue::Float(vec![0.0])).unwrap();
    graph.get_result(request).unwrap();
    graph.release_request(request);

    contract_test(
        "every_invariant_is_enforced",
        &[
            CHANNEL_MERGE_IDENTITY,
            SUBSTITUTION_MEMOIZED,
            STRUCTURE_SYNC,
            DATA_CHANGE_KEEPS_STRUCTURE,
            BROADCAST_SOUND,
            SEQUENCE_ORDERED,
            PROCESS_INPUT_VALIDATED,
            REQUEST_RESULT_RESOLVED,
            GRAPH_ACYCLIC,
            TEARDOWN_SYMMETRIC,
        ],
    );
}
