pub mod error;
pub mod executor;
pub mod field;
pub mod grid;
pub mod kernel;
pub mod particle;
/// The `drift_core` crate is the engine behind Drift's Lagrangian particle tracking.
/// It advects particles through gridded, time-dependent velocity fields and lets users
/// add their own per-step behaviour next to the built-in integrators.
///
/// Key components:
/// - **Field / Grid**: validated rectilinear samples with bilinear/trilinear and temporal
///   interpolation.
/// - **Particle**: mutable state records owned by a `ParticleSet`.
/// - **Kernel**: composable pipeline stages (RK4/Euler advection, parsed source kernels,
///   native closures).
/// - **Executor**: interpreted (AST walking) and compiled (bytecode VM) strategies with
///   identical results.
/// - **Simulation**: the stepping loop with periodic snapshots to an external sink.
pub mod simulation;

pub use error::{KernelError, SimulationError};
pub use executor::{build_executor, Executor, ExecutorKind};
pub use field::{EdgePolicy, Field, FieldSpec};
pub use grid::{Grid, GridSettings};
pub use kernel::{Kernel, KernelAction};
pub use particle::{Particle, ParticleSchema, ParticleSet, ParticleStatus};
pub use simulation::{
    execute, execute_with, ExecutionSettings, MemorySink, RunSummary, SnapshotSink,
};
