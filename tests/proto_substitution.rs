use xflow::{BufferValue, DataType, Graph, NodeId, Substitution};

fn leaf(graph: &mut Graph, name: &str, values: Option<Vec<f32>>) -> NodeId {
    let node = graph.create_input_node();
    graph.set_name(node, name).unwrap();
    match values {
        Some(values) => {
            let entry = graph
                .create_buffer_entry(DataType::Float3, BufferValue::Float(values))
                .unwrap();
            graph.set_data(node, Some(entry)).unwrap();
        }
        None => graph.set_param(node, true).unwrap(),
    }
    node
}

/// Proto normalizing whatever is bound to `value`.
fn normalize_proto(graph: &mut Graph) -> NodeId {
    let proto = graph.create_data_node(true);
    let param = leaf(graph, "value", None);
    graph.append_child(proto, param).unwrap();
    graph.set_compute(proto, "result = xflow.normalize(value)").unwrap();
    proto
}

fn instance(graph: &mut Graph, proto: NodeId, values: Vec<f32>) -> NodeId {
    let node = graph.create_data_node(false);
    let value = leaf(graph, "value", Some(values));
    graph.append_child(node, value).unwrap();
    graph.set_proto_node(node, Some(proto)).unwrap();
    node
}

fn result(graph: &mut Graph, node: NodeId) -> Vec<f32> {
    let entry = graph
        .get_compute_result(node, &["result"])
        .and_then(|r| r.get_output_data("result"))
        .expect("result published");
    graph.entry(entry).unwrap().float_values().unwrap().to_vec()
}

#[test]
fn instances_bind_their_own_values() {
    let mut graph = Graph::new();
    let proto = normalize_proto(&mut graph);
    let a = instance(&mut graph, proto, vec![3.0, 0.0, 0.0]);
    let b = instance(&mut graph, proto, vec![0.0, 0.0, 5.0]);

    assert_eq!(result(&mut graph, a), vec![1.0, 0.0, 0.0]);
    assert_eq!(result(&mut graph, b), vec![0.0, 0.0, 1.0]);
    let cn = graph.data_node(proto).unwrap().channel_node();
    assert_eq!(cn.substitution_node_count(), 2);
}

#[test]
fn identical_bindings_share_one_materialization() {
    let mut graph = Graph::new();
    let proto = normalize_proto(&mut graph);
    let shared = graph.create_data_node(false);
    let value = leaf(&mut graph, "value", Some(vec![0.0, 4.0, 0.0]));
    graph.append_child(shared, value).unwrap();

    let mut instances = Vec::new();
    for _ in 0..3 {
        let node = graph.create_data_node(false);
        graph.set_source_node(node, Some(shared)).unwrap();
        graph.set_proto_node(node, Some(proto)).unwrap();
        instances.push(node);
    }
    let entries: Vec<_> = instances
        .iter()
        .map(|node| {
            graph
                .get_compute_result(*node, &["result"])
                .and_then(|r| r.get_output_data("result"))
                .unwrap()
        })
        .collect();

    assert!(entries.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(graph.entry(entries[0]).unwrap().float_values().unwrap(), &[0.0, 1.0, 0.0]);
    assert_eq!(graph.data_node(proto).unwrap().channel_node().substitution_node_count(), 1);
}

#[test]
fn substitution_nodes_are_memoized_by_key() {
    let mut graph = Graph::new();
    let proto = normalize_proto(&mut graph);
    let one = instance(&mut graph, proto, vec![1.0, 0.0, 0.0]);
    let two = instance(&mut graph, proto, vec![0.0, 1.0, 0.0]);
    result(&mut graph, one);
    result(&mut graph, two);
    let channel_of = |graph: &Graph, node: NodeId| {
        graph
            .final_channels(node, &Substitution::empty())
            .into_iter()
            .find(|(name, _)| name == "value")
            .map(|(_, c)| c)
            .unwrap()
    };
    let (c1, c2) = (channel_of(&graph, one), channel_of(&graph, two));

    let first = graph
        .get_substitution_node(proto, &Substitution::from_bindings([("value", c1)]))
        .unwrap();
    let again = graph
        .get_substitution_node(proto, &Substitution::from_bindings([("value", c1), ("unused", c2)]))
        .unwrap();
    let other = graph
        .get_substitution_node(proto, &Substitution::from_bindings([("value", c2)]))
        .unwrap();
    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(graph.substitution_node(first).unwrap().use_count(), 3);

    for id in [first, again, other] {
        graph.release_substitution_node(id);
    }
    assert_eq!(graph.substitution_node(first).unwrap().use_count(), 1);
}

#[test]
fn editing_the_proto_reaches_every_instance() {
    let mut graph = Graph::new();
    let proto = normalize_proto(&mut graph);
    let a = instance(&mut graph, proto, vec![2.0, 0.0, 0.0]);
    let b = instance(&mut graph, proto, vec![0.0, 2.0, 0.0]);
    let req_a = graph.compute_request(a, &[]).unwrap();
    let req_b = graph.compute_request(b, &[]).unwrap();
    graph.get_result(req_a).unwrap();
    graph.get_result(req_b).unwrap();

    graph.set_compute(proto, "result = xflow.add(value, value)").unwrap();
    assert_eq!(graph.request_status(req_a), Some(xflow::RequestStatus::NeedsStructure));
    assert_eq!(graph.request_status(req_b), Some(xflow::RequestStatus::NeedsStructure));

    graph.get_result(req_a).unwrap();
    assert_eq!(
        graph.result_output(req_a, "result").unwrap().float_values().unwrap(),
        &[4.0, 0.0, 0.0]
    );
}
