//! Keyframe interpolation over keyed channels.

use super::{quat, vec3, write};
use crate::operator::{OperatorDescriptor, SequenceAccess};

pub(super) fn lerp_seq() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float3", "result")
        .param("float3", "sequence")
        .param("float", "key")
        .sequence_arg("sequence", SequenceAccess::PrevBuffer, "key")
        .sequence_arg("sequence", SequenceAccess::NextBuffer, "key")
        .sequence_arg("sequence", SequenceAccess::LinearWeight, "key")
        .core(|out, args| {
            let w = args[2].floats().first().copied().unwrap_or(0.0);
            let v = vec3(args[0].floats()).lerp(vec3(args[1].floats()), w);
            write(&mut out[0], &v.to_array());
        })
}

pub(super) fn slerp_seq() -> OperatorDescriptor {
    OperatorDescriptor::new()
        .output("float4", "result")
        .param("float4", "sequence")
        .param("float", "key")
        .sequence_arg("sequence", SequenceAccess::PrevBuffer, "key")
        .sequence_arg("sequence", SequenceAccess::NextBuffer, "key")
        .sequence_arg("sequence", SequenceAccess::LinearWeight, "key")
        .core(|out, args| {
            let w = args[2].floats().first().copied().unwrap_or(0.0);
            let q = quat(args[0].floats()).slerp(quat(args[1].floats()), w);
            write(&mut out[0], &q.to_array());
        })
}
