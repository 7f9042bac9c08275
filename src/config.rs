//! Runtime options for a [`Graph`](crate::graph::Graph).

/// Tolerance used when comparing sequence keys.
pub const SEQUENCE_EPSILON: f32 = 1e-6;

/// Options fixed at graph construction.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    /// Emit a warning when iterating operator inputs disagree on length.
    /// The iteration count is truncated to the shortest input either way.
    pub warn_on_broadcast_truncation: bool,
    /// Keys closer than this are treated as the same sequence position.
    pub sequence_epsilon: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            warn_on_broadcast_truncation: true,
            sequence_epsilon: SEQUENCE_EPSILON,
        }
    }
}
