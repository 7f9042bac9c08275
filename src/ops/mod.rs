//! Built-in `xflow.*` operators.
//!
//! Math goes through `glam`; the helpers here only convert between flat
//! scalar windows and glam types without panicking on short windows.

mod sequence;
mod skinning;
mod transform;
mod vector;

use crate::operator::{OperatorDescriptor, OperatorRegistry, OutArg};
use glam::{Mat4, Quat, Vec3, Vec4};

/// Register every built-in operator.
pub(crate) fn register_builtins(registry: &mut OperatorRegistry) {
    let builtins: Vec<(&str, OperatorDescriptor)> = vec![
        ("xflow.add", vector::add()),
        ("xflow.sub", vector::sub()),
        ("xflow.normalize", vector::normalize()),
        ("xflow.lerp", vector::lerp()),
        ("xflow.morph", vector::morph()),
        ("xflow.lerpSeq", sequence::lerp_seq()),
        ("xflow.slerpSeq", sequence::slerp_seq()),
        ("xflow.createTransform", transform::create_transform()),
        ("xflow.mul", transform::mul()),
        ("xflow.forwardKinematics", transform::forward_kinematics()),
        ("xflow.skinPosition", skinning::skin_position()),
        ("xflow.skinDirection", skinning::skin_direction()),
    ];
    for (name, desc) in builtins {
        if let Err(err) = registry.register(name, desc) {
            tracing::error!(operator = name, %err, "built-in operator rejected");
        }
    }
}

pub(crate) fn vec3(s: &[f32]) -> Vec3 {
    match s {
        [x, y, z, ..] => Vec3::new(*x, *y, *z),
        _ => Vec3::ZERO,
    }
}

pub(crate) fn vec4(s: &[f32]) -> Vec4 {
    match s {
        [x, y, z, w, ..] => Vec4::new(*x, *y, *z, *w),
        _ => Vec4::ZERO,
    }
}

/// Quaternion stored `x, y, z, w`. Missing data reads as identity.
pub(crate) fn quat(s: &[f32]) -> Quat {
    match s {
        [x, y, z, w, ..] => Quat::from_xyzw(*x, *y, *z, *w),
        _ => Quat::IDENTITY,
    }
}

/// Column-major matrix at tuple `index`. Missing data reads as identity.
pub(crate) fn mat4_at(s: &[f32], index: usize) -> Mat4 {
    match s.get(index * 16..index * 16 + 16) {
        Some(cols) => Mat4::from_cols_slice(cols),
        None => Mat4::IDENTITY,
    }
}

/// Copy as many scalars as fit into the output window.
pub(crate) fn write(out: &mut OutArg<'_>, values: &[f32]) {
    let dst = out.floats();
    let n = dst.len().min(values.len());
    dst[..n].copy_from_slice(&values[..n]);
}
