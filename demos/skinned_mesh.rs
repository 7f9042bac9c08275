// demos/skinned_mesh.rs
use glam::{Mat4, Vec3};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use xflow::{BufferValue, DataTreeBuilder, DataType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut builder = DataTreeBuilder::new();

    // Proto: skin whatever mesh and skeleton an instance binds.
    let pos = builder.param("pos")?;
    let idx = builder.param("boneIdx")?;
    let weight = builder.param("boneWeight")?;
    let parent = builder.param("parent")?;
    let xform = builder.param("xform")?;
    let skeleton = builder.proto(&[parent, xform])?;
    builder.compute(skeleton, "boneXform = xflow.forwardKinematics(parent, xform)")?;
    let skin = builder.proto(&[pos, idx, weight, skeleton])?;
    builder.compute(skin, "position = xflow.skinPosition(pos, boneIdx, boneWeight, boneXform)")?;
    builder.filter(skin, "keep(position)")?;

    // Shared mesh data, two different poses.
    let mesh_pos = builder.value(
        "pos",
        DataType::Float3,
        BufferValue::Float(vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0]),
    )?;
    let mesh_idx = builder.value(
        "boneIdx",
        DataType::Int4,
        BufferValue::Int(vec![0, 0, 0, 0, 0, 1, 0, 0, 1, 0, 0, 0]),
    )?;
    let mesh_weight = builder.value(
        "boneWeight",
        DataType::Float4,
        BufferValue::Float(vec![1.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]),
    )?;
    let parents = builder.value("parent", DataType::Int, BufferValue::Int(vec![-1, 0]))?;
    let mesh = builder.data(&[mesh_pos, mesh_idx, mesh_weight, parents])?;
    builder.name("mesh", mesh);

    let mut characters = Vec::new();
    for offset in [Vec3::X, Vec3::Z * 3.0] {
        let locals: Vec<f32> = [Mat4::from_translation(offset), Mat4::from_translation(Vec3::Y)]
            .iter()
            .flat_map(|m| m.to_cols_array())
            .collect();
        let pose = builder.value("xform", DataType::Float4x4, BufferValue::Float(locals))?;
        let mesh = builder.lookup("mesh")?;
        let character = builder.data(&[mesh, pose])?;
        builder.instantiate(character, skin)?;
        characters.push((character, pose));
    }

    let mut graph = builder.build();
    let changes = Arc::new(Mutex::new(0usize));
    for (i, (character, pose)) in characters.iter().enumerate() {
        let request = graph.compute_request(character.0, &["position"])?;
        let counter = Arc::clone(&changes);
        graph.set_request_callback(request, move |_, _| {
            if let Ok(mut n) = counter.lock() {
                *n += 1;
            }
        });
        if let Some(entry) = graph.get_result(request).and_then(|r| r.get_output_data("position")) {
            println!("character {i}: {:?}", graph.entry(entry).and_then(|e| e.float_values()));
        }

        let moved: Vec<f32> = [Mat4::from_translation(Vec3::NEG_X), Mat4::from_translation(Vec3::Y * 2.0)]
            .iter()
            .flat_map(|m| m.to_cols_array())
            .collect();
        if let Some(entry) = graph.input_node(pose.0).and_then(|l| l.data()) {
            graph.set_buffer_value(entry, BufferValue::Float(moved))?;
        }
        if let Some(entry) = graph.get_result(request).and_then(|r| r.get_output_data("position")) {
            println!("character {i} moved: {:?}", graph.entry(entry).and_then(|e| e.float_values()));
        }
    }

    println!("change notifications: {}", changes.lock().map(|n| *n).unwrap_or(0));
    Ok(())
}
