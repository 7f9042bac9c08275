//! Linear blend skinning with four influences per vertex.

use super::{mat4_at, vec3, vec4, write};
use crate::operator::{Arg, OperatorDescriptor};
use glam::{Mat4, Vec3};

fn blended(args: &[Arg<'_>]) -> Mat4 {
    let indices = args[1].ints();
    let weights = vec4(args[2].floats()).to_array();
    let bones = args[3].floats();
    let mut m = Mat4::ZERO;
    for (slot, weight) in weights.iter().enumerate() {
        if *weight == 0.0 {
            continue;
        }
        let bone = indices.get(slot).copied().unwrap_or(0).max(0) as usize;
        m += mat4_at(bones, bone) * *weight;
    }
    m
}

pub(super) fn skin_position() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "pos")
        .param("int4", "boneIdx")
        .param("float4", "boneWeight")
        .array_param("float4x4", "boneXform")
        .core(|out, args| {
            let p = blended(args).transform_point3(vec3(args[0].floats()));
            write(&mut out[0], &p.to_array());
        })
}

pub(super) fn skin_direction() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "dir")
        .param("int4", "boneIdx")
        .param("float4", "boneWeight")
        .array_param("float4x4", "boneXform")
        .core(|out, args| {
            let d: Vec3 = blended(args)
                .transform_vector3(vec3(args[0].floats()))
                .normalize_or_zero();
            write(&mut out[0], &d.to_array());
        })
}
