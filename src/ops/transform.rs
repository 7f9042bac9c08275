//! Matrix construction and composition.

use super::{mat4_at, quat, vec3, write};
use crate::operator::OperatorDescriptor;
use glam::{Mat4, Vec3};

/// `T * C * R * S * C^-1` from optional translation, rotation, scale and center.
pub(super) fn create_transform() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float4x4", "result")
        .optional_param("float3", "translation")
        .optional_param("float4", "rotation")
        .optional_param("float3", "scale")
        .optional_param("float3", "center")
        .core(|out, args| {
            let translation = vec3(args[0].floats());
            let rotation = quat(args[1].floats()).normalize();
            let scale = if args[2].is_absent() {
                Vec3::ONE
            } else {
                vec3(args[2].floats())
            };
            let center = vec3(args[3].floats());
            let m = Mat4::from_translation(translation + center)
                * Mat4::from_scale_rotation_translation(scale, rotation, Vec3::ZERO)
                * Mat4::from_translation(-center);
            write(&mut out[0], &m.to_cols_array());
        })
}

pub(super) fn mul() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float4x4", "result")
        .param("float4x4", "value1")
        .param("float4x4", "value2")
        .core(|out, args| {
            let m = mat4_at(args[0].floats(), 0) * mat4_at(args[1].floats(), 0);
            write(&mut out[0], &m.to_cols_array());
        })
}

/// Accumulates local bone transforms into global ones along a parent table.
/// Parents must come before their children; a negative parent marks a root.
pub(super) fn forward_kinematics() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .custom_output("float4x4", "result")
        .array_param("int", "parent")
        .array_param("float4x4", "xform")
        .alloc(|args, _| vec![args[1].floats().len() / 16 * 16])
        .evaluate(|out, args, _| {
            let parents = args[0].ints();
            let locals = args[1].floats();
            let bones = locals.len() / 16;
            let mut globals: Vec<Mat4> = Vec::with_capacity(bones);
            for i in 0..bones {
                let local = mat4_at(locals, i);
                let global = match parents.get(i).copied() {
                    Some(p) if p >= 0 => {
                        let p = p as usize;
                        if p >= i {
                            return Err("parent bone must precede its child");
                        }
                        globals[p] * local
                    }
                    _ => local,
                };
                globals.push(global);
            }
            let dst = out[0].floats();
            for (i, m) in globals.iter().enumerate() {
                if let Some(window) = dst.get_mut(i * 16..i * 16 + 16) {
                    window.copy_from_slice(&m.to_cols_array());
                }
            }
            Ok(())
        })
}
