//! Error taxonomy for grid construction, kernel compilation and stepping.

use thiserror::Error;

/// Which coordinate a field query fell outside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Lon,
    Lat,
    Depth,
    Time,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Axis::Lon => "lon",
            Axis::Lat => "lat",
            Axis::Depth => "depth",
            Axis::Time => "time",
        };
        f.write_str(name)
    }
}

/// Error a kernel stage may return while advancing a single particle.
///
/// These never abort a run: the simulation loop turns them into a particle
/// status (`OutOfBounds` deletes, `Fault` marks the particle as errored).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KernelError {
    #[error("{axis} = {value} outside field '{field}' range [{min}, {max}]")]
    OutOfBounds {
        field: String,
        axis: Axis,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("position ({lon}, {lat}) outside grid domain")]
    OutsideDomain { lon: f64, lat: f64 },
    #[error("{0}")]
    Fault(String),
}

impl KernelError {
    pub fn fault(message: impl Into<String>) -> Self {
        KernelError::Fault(message.into())
    }

    /// True for spatial/temporal domain violations, which delete rather than fault.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(
            self,
            KernelError::OutOfBounds { .. } | KernelError::OutsideDomain { .. }
        )
    }
}

/// Top-level error for building grids, kernels and executors and for running
/// a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("out of bounds: {0}")]
    OutOfBounds(KernelError),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("malformed grid: {0}")]
    MalformedGrid(String),
    #[error("kernel '{kernel}' cannot be compiled: {reason}")]
    CompilationUnsupported { kernel: String, reason: String },
    #[error("kernel fault: {0}")]
    KernelFault(String),
    #[error("kernel '{kernel}': {message}")]
    KernelSyntax { kernel: String, message: String },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("snapshot sink failed: {0}")]
    Sink(#[source] anyhow::Error),
}

impl From<KernelError> for SimulationError {
    fn from(err: KernelError) -> Self {
        if err.is_out_of_bounds() {
            SimulationError::OutOfBounds(err)
        } else {
            SimulationError::KernelFault(err.to_string())
        }
    }
}

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;
