use serde::Serialize;
use thiserror::Error;

/// Errors raised while validating a circuit or solving one of its islands.
///
/// Configuration errors are returned before any island is solved. The
/// structural and numerical variants are stored per island and never abort
/// the sibling islands.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum PowerFlowError {
    #[error("array `{field}` has length {found}, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("`{field}[{index}]` references bus {value}, but the circuit only has {n} buses")]
    BusIndexOutOfRange {
        field: &'static str,
        index: usize,
        value: usize,
        n: usize,
    },

    #[error("branch {branch} has a negative resistance or a non-positive tap module")]
    NegativeImpedance { branch: usize },

    #[error("branch {branch} connects a bus to itself")]
    SelfLoop { branch: usize },

    #[error("branch {branch} has zero impedance but is not marked reducible")]
    ZeroImpedanceBranch { branch: usize },

    #[error("island {island} has no active slack bus")]
    NoSlack { island: usize },

    #[error("singular Jacobian at iteration {iteration}")]
    SingularJacobian { iteration: usize },

    #[error("sparse factorization failed: {0}")]
    Factorization(String),

    #[error("power flow cancelled after {iterations} iterations")]
    Cancelled { iterations: usize },

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, PowerFlowError>;

impl PowerFlowError {
    pub fn length_mismatch(field: &'static str, expected: usize, found: usize) -> Self {
        PowerFlowError::LengthMismatch {
            field,
            expected,
            found,
        }
    }

    pub fn out_of_range(field: &'static str, index: usize, value: usize, n: usize) -> Self {
        PowerFlowError::BusIndexOutOfRange {
            field,
            index,
            value,
            n,
        }
    }

    /// Structural failures are fatal for an island and are not worth retrying
    /// with another algorithm.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PowerFlowError::NoSlack { .. }
                | PowerFlowError::ZeroImpedanceBranch { .. }
                | PowerFlowError::SingularJacobian { .. }
                | PowerFlowError::Factorization(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PowerFlowError::LengthMismatch { .. }
                | PowerFlowError::BusIndexOutOfRange { .. }
                | PowerFlowError::NegativeImpedance { .. }
                | PowerFlowError::SelfLoop { .. }
                | PowerFlowError::InvalidOption(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = PowerFlowError::out_of_range("branch.f", 3, 12, 5);
        assert_eq!(
            e.to_string(),
            "`branch.f[3]` references bus 12, but the circuit only has 5 buses"
        );
        assert!(e.is_configuration());
        assert!(!e.is_structural());

        let e = PowerFlowError::NoSlack { island: 2 };
        assert_eq!(e.to_string(), "island 2 has no active slack bus");
        assert!(e.is_structural());
    }
}
