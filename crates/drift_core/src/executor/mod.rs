//! Strategies for evaluating a kernel pipeline on one particle for one step.
//!
//! Both strategies implement [`Executor`]; the simulation loop never knows
//! which one it drives. They differ only in how stages are dispatched:
//!
//! - [`InterpretedExecutor`] walks each stage's AST and resolves variable and
//!   field names on every call, and can run opaque native stages.
//! - [`CompiledExecutor`] lowers the pipeline once to bytecode bound to the
//!   grid's field layout and the particle schema, and rejects stages it
//!   cannot see into.
//!
//! The step policy shared by both lives in [`Executor::advance`].

pub mod compiled;
pub mod interpreted;

pub use compiled::CompiledExecutor;
pub use interpreted::InterpretedExecutor;

use crate::error::{KernelError, Result, SimulationError};
use crate::grid::Grid;
use crate::kernel::{Kernel, KernelAction};
use crate::particle::{Particle, ParticleSchema};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorKind {
    Interpreted,
    #[default]
    Compiled,
}

/// Result of advancing one particle by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advanced,
    /// Deleted by a stage, or by ending the step outside the grid.
    Deleted,
    /// Restored to the pre-step state and deleted after a query outside a
    /// field's domain.
    OutOfBounds(KernelError),
    /// Restored to the pre-step state and marked as errored.
    Faulted(KernelError),
}

/// Per-worker buffers reused across particles and steps.
#[derive(Debug, Default)]
pub struct Scratch {
    pub(crate) stack: Vec<f64>,
    pub(crate) locals: Vec<f64>,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(64),
            locals: Vec::new(),
        }
    }
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails if `grid` cannot serve the pipeline this executor was built for.
    fn check_grid(&self, grid: &Grid) -> Result<()>;

    /// Fails if particles of `schema` do not carry the auxiliary variables
    /// this executor was built for.
    fn check_schema(&self, schema: &ParticleSchema) -> Result<()>;

    /// Runs every stage in order, stopping early on `Delete` or an error.
    fn run_stages(
        &self,
        particle: &mut Particle,
        grid: &Grid,
        time: f64,
        dt: f64,
        scratch: &mut Scratch,
    ) -> Result<KernelAction, KernelError>;

    /// Advances an active particle by `dt` starting at `time`.
    ///
    /// - Pipeline completes: `time += dt`; leaving the grid deletes the particle
    ///   at its exit position.
    /// - A stage requests deletion: mutations so far are kept, time is not advanced.
    /// - Out-of-bounds error: pre-step state restored, particle deleted.
    /// - Any other error: pre-step state restored, particle marked as errored.
    fn advance(
        &self,
        particle: &mut Particle,
        grid: &Grid,
        time: f64,
        dt: f64,
        scratch: &mut Scratch,
    ) -> StepOutcome {
        let before = particle.clone();
        match self.run_stages(particle, grid, time, dt, scratch) {
            Ok(KernelAction::Continue) => {
                particle.time = time + dt;
                if grid.contains(particle.lon, particle.lat) {
                    StepOutcome::Advanced
                } else {
                    particle.delete();
                    StepOutcome::Deleted
                }
            }
            Ok(KernelAction::Delete) => {
                particle.delete();
                StepOutcome::Deleted
            }
            Err(err) if err.is_out_of_bounds() => {
                *particle = before;
                particle.delete();
                StepOutcome::OutOfBounds(err)
            }
            Err(err) => {
                *particle = before;
                particle.mark_error(err.to_string());
                StepOutcome::Faulted(err)
            }
        }
    }
}

/// Compares the variables an executor was built for against a particle schema.
fn check_variables(expected: &[String], schema: &ParticleSchema) -> Result<()> {
    if expected == schema.names() {
        return Ok(());
    }
    Err(SimulationError::InvalidSettings(format!(
        "executor was built for particle variables [{}], particle set has [{}]",
        expected.join(", "),
        schema.names().join(", ")
    )))
}

/// Builds the executor selected by `kind` for `kernel` on `grid`.
pub fn build_executor(
    kind: ExecutorKind,
    kernel: &Kernel,
    grid: &Grid,
    schema: Arc<ParticleSchema>,
) -> Result<Box<dyn Executor>> {
    let executor: Box<dyn Executor> = match kind {
        ExecutorKind::Interpreted => Box::new(InterpretedExecutor::new(kernel, grid, schema)?),
        ExecutorKind::Compiled => Box::new(CompiledExecutor::compile(kernel, grid, &schema)?),
    };
    tracing::debug!(executor = executor.name(), kernel = %kernel.name(), "executor built");
    Ok(executor)
}
