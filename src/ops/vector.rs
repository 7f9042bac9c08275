//! Per-vertex vector arithmetic.

use super::{vec3, write};
use crate::operator::OperatorDescriptor;

pub(super) fn add() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "value1")
        .param("float3", "value2")
        .core(|out, args| {
            let v = vec3(args[0].floats()) + vec3(args[1].floats());
            write(&mut out[0], &v.to_array());
        })
}

pub(super) fn sub() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "value1")
        .param("float3", "value2")
        .core(|out, args| {
            let v = vec3(args[0].floats()) - vec3(args[1].floats());
            write(&mut out[0], &v.to_array());
        })
}

pub(super) fn normalize() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "value")
        .core(|out, args| {
            let v = vec3(args[0].floats()).normalize_or_zero();
            write(&mut out[0], &v.to_array());
        })
}

pub(super) fn lerp() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "value1")
        .param("float3", "value2")
        .param("float", "weight")
        .core(|out, args| {
            let w = args[2].floats().first().copied().unwrap_or(0.0);
            let v = vec3(args[0].floats()).lerp(vec3(args[1].floats()), w);
            write(&mut out[0], &v.to_array());
        })
}

/// `value + valueAdd * weight`, the blend-shape step.
pub(super) fn morph() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "value")
        .param("float3", "valueAdd")
        .param("float", "weight")
        .core(|out, args| {
            let w = args[2].floats().first().copied().unwrap_or(0.0);
            let v = vec3(args[0].floats()) + vec3(args[1].floats()) * w;
            write(&mut out[0], &v.to_array());
        })
}
