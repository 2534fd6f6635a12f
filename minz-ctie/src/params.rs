//! Interpreter bounds.

/// Bounds for one compile-time evaluation attempt.
///
/// Both defaults are deliberately generous: a rejected candidate only
/// costs the optimization, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtieParams {
    /// Maximum executed instructions per candidate.
    pub step_budget: u64,
    /// Maximum concurrent frames per candidate.
    pub max_depth: usize,
}

impl Default for CtieParams {
    fn default() -> Self {
        Self {
            step_budget: 1_000_000,
            max_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let params = CtieParams::default();
        assert_eq!(params.step_budget, 1_000_000);
        assert_eq!(params.max_depth, 64);
    }
}
