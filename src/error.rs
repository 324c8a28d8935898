use thiserror::Error;

/// Errors raised by the simulation core.
///
/// A jammed lattice is not an error: the engine reports it as a terminal
/// outcome of the trajectory.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Malformed rate model or run parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Waiting time requested with a non-positive total rate.
    #[error("cannot sample waiting time with total rate {total_rate}")]
    DomainError { total_rate: f64 },

    /// A transition with zero propensity was requested, or the lattice
    /// failed an invariant audit.
    #[error("illegal transition at index {index}: {state}")]
    IllegalTransition { index: usize, state: String },
}

pub type SimResult<T> = Result<T, SimError>;
