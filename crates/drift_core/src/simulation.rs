//! The simulation loop: repeated executor invocation over a particle set with
//! periodic snapshots.

use crate::error::{Result, SimulationError};
use crate::executor::{build_executor, Executor, ExecutorKind, Scratch, StepOutcome};
use crate::grid::Grid;
use crate::kernel::Kernel;
use crate::particle::{Particle, ParticleSet, ParticleStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Relative tolerance used when deciding whether `runtime / dt` and
/// `elapsed / interval` land on an integer.
const STEP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Total integration time in seconds (magnitude).
    pub runtime: f64,
    /// Step in seconds; negative integrates backward in time.
    pub dt: f64,
    /// Seconds of integration between snapshots (magnitude).
    pub interval: f64,
    pub executor: ExecutorKind,
    /// Step particles concurrently when the `parallel` feature is enabled.
    pub parallel: bool,
    /// Include deleted and errored particles in snapshots.
    pub snapshot_terminal: bool,
    /// Abort the run on the first out-of-bounds query or kernel fault
    /// instead of settling it on the particle.
    pub strict: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            runtime: 86400.0,
            dt: 300.0,
            interval: 3600.0,
            executor: ExecutorKind::default(),
            parallel: true,
            snapshot_terminal: false,
            strict: false,
        }
    }
}

impl ExecutionSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.runtime.is_finite() || self.runtime < 0.0 {
            return Err(SimulationError::InvalidSettings(format!(
                "runtime must be finite and non-negative, got {}",
                self.runtime
            )));
        }
        if !self.dt.is_finite() || self.dt == 0.0 {
            return Err(SimulationError::InvalidSettings(format!(
                "dt must be finite and non-zero, got {}",
                self.dt
            )));
        }
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(SimulationError::InvalidSettings(format!(
                "interval must be finite and positive, got {}",
                self.interval
            )));
        }
        Ok(())
    }

    /// `runtime / |dt|`, rounded when within tolerance of an integer and
    /// rounded up otherwise, so the run always covers at least `runtime`.
    pub fn step_count(&self) -> usize {
        let ratio = self.runtime / self.dt.abs();
        let nearest = ratio.round();
        if (ratio - nearest).abs() <= STEP_TOLERANCE * nearest.max(1.0) {
            nearest as usize
        } else {
            ratio.ceil() as usize
        }
    }

    /// Number of whole intervals contained in `elapsed`.
    fn tick(&self, elapsed: f64) -> u64 {
        let ratio = elapsed / self.interval;
        (ratio + STEP_TOLERANCE * ratio.max(1.0)).floor() as u64
    }
}

/// One particle's state at a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: u64,
    pub lon: f64,
    pub lat: f64,
    pub depth: f64,
    pub time: f64,
    pub status: ParticleStatus,
}

impl From<&Particle> for SnapshotRecord {
    fn from(p: &Particle) -> Self {
        Self {
            id: p.id(),
            lon: p.lon,
            lat: p.lat,
            depth: p.depth,
            time: p.time,
            status: p.status,
        }
    }
}

/// All records of one interval tick, written to a sink in a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    /// 0 for the initial state, then one per interval crossed.
    pub index: u64,
    /// Integration time covered so far, in seconds (magnitude).
    pub elapsed: f64,
    pub records: Vec<SnapshotRecord>,
}

/// Append-only consumer of snapshot frames, e.g. a trajectory file writer.
pub trait SnapshotSink {
    fn write(&mut self, frame: &SnapshotFrame) -> anyhow::Result<()>;
}

/// Keeps every frame in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<SnapshotFrame>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions of one particle across all frames it appears in.
    pub fn trajectory(&self, id: u64) -> Vec<&SnapshotRecord> {
        self.frames
            .iter()
            .filter_map(|frame| frame.records.iter().find(|r| r.id == id))
            .collect()
    }
}

impl SnapshotSink for MemorySink {
    fn write(&mut self, frame: &SnapshotFrame) -> anyhow::Result<()> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

/// Cooperative cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticleFault {
    pub id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub steps: usize,
    pub elapsed: f64,
    pub frames: usize,
    pub active: usize,
    pub deleted: usize,
    pub faults: Vec<ParticleFault>,
    pub cancelled: bool,
}

/// Builds the executor named in `settings` and runs the simulation.
pub fn execute(
    set: &mut ParticleSet,
    grid: &Grid,
    kernel: &Kernel,
    settings: &ExecutionSettings,
    sink: &mut dyn SnapshotSink,
) -> Result<RunSummary> {
    settings.validate()?;
    let executor = build_executor(settings.executor, kernel, grid, set.shared_schema())?;
    execute_with(set, grid, executor.as_ref(), settings, sink, None)
}

/// Runs the simulation with a prebuilt executor.
pub fn execute_with(
    set: &mut ParticleSet,
    grid: &Grid,
    executor: &dyn Executor,
    settings: &ExecutionSettings,
    sink: &mut dyn SnapshotSink,
    cancel: Option<&CancelToken>,
) -> Result<RunSummary> {
    settings.validate()?;
    executor.check_grid(grid)?;
    executor.check_schema(set.schema())?;

    for particle in set.particles_mut().iter_mut().filter(|p| p.is_active()) {
        if !grid.contains(particle.lon, particle.lat) {
            trace!(
                id = particle.id(),
                lon = particle.lon,
                lat = particle.lat,
                "particle starts outside grid"
            );
            particle.delete();
        }
    }

    let steps = settings.step_count();
    info!(
        particles = set.len(),
        steps,
        dt = settings.dt,
        executor = executor.name(),
        "simulation started"
    );

    let mut frames = 0usize;
    emit(set, settings, sink, 0, 0.0)?;
    frames += 1;

    let mut taken = 0usize;
    let mut last_tick = 0u64;
    let mut cancelled = false;
    while taken < steps {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            cancelled = true;
            info!(taken, "simulation cancelled");
            break;
        }

        let outcomes = step_all(
            set.particles_mut(),
            grid,
            executor,
            settings.dt,
            settings.parallel,
        );
        for (id, outcome) in outcomes {
            let err = match outcome {
                StepOutcome::Advanced => continue,
                StepOutcome::Deleted => {
                    trace!(id, "particle deleted");
                    continue;
                }
                StepOutcome::OutOfBounds(err) => {
                    trace!(id, %err, "particle deleted out of bounds");
                    err
                }
                StepOutcome::Faulted(err) => {
                    warn!(id, %err, "particle faulted");
                    err
                }
            };
            if settings.strict {
                warn!(id, taken, "strict run aborted");
                return Err(err.into());
            }
        }
        taken += 1;

        let elapsed = taken as f64 * settings.dt.abs();
        let tick = settings.tick(elapsed);
        if tick > last_tick {
            last_tick = tick;
            emit(set, settings, sink, tick, elapsed)?;
            frames += 1;
        }

        if set.active_count() == 0 {
            info!(taken, "no active particles left");
            break;
        }
    }

    let faults: Vec<ParticleFault> = set
        .particles()
        .iter()
        .filter(|p| p.status == ParticleStatus::Error)
        .map(|p| ParticleFault {
            id: p.id(),
            message: p.fault.clone().unwrap_or_default(),
        })
        .collect();
    let summary = RunSummary {
        steps: taken,
        elapsed: taken as f64 * settings.dt.abs(),
        frames,
        active: set.active_count(),
        deleted: set.count(ParticleStatus::Deleted),
        faults,
        cancelled,
    };
    info!(
        steps = summary.steps,
        active = summary.active,
        deleted = summary.deleted,
        faulted = summary.faults.len(),
        "simulation finished"
    );
    Ok(summary)
}

fn emit(
    set: &ParticleSet,
    settings: &ExecutionSettings,
    sink: &mut dyn SnapshotSink,
    index: u64,
    elapsed: f64,
) -> Result<()> {
    let records = set
        .particles()
        .iter()
        .filter(|p| settings.snapshot_terminal || p.is_active())
        .map(SnapshotRecord::from)
        .collect::<Vec<_>>();
    debug!(index, elapsed, records = records.len(), "snapshot");
    let frame = SnapshotFrame {
        index,
        elapsed,
        records,
    };
    sink.write(&frame).map_err(SimulationError::Sink)
}

fn advance_one(
    executor: &dyn Executor,
    grid: &Grid,
    dt: f64,
    scratch: &mut Scratch,
    particle: &mut Particle,
) -> (u64, StepOutcome) {
    let time = particle.time;
    (particle.id(), executor.advance(particle, grid, time, dt, scratch))
}

/// Advances every active particle by one step; returns the non-trivial outcomes.
fn step_all(
    particles: &mut [Particle],
    grid: &Grid,
    executor: &dyn Executor,
    dt: f64,
    parallel: bool,
) -> Vec<(u64, StepOutcome)> {
    #[cfg(feature = "parallel")]
    if parallel {
        return particles
            .par_iter_mut()
            .filter(|p| p.is_active())
            .map_init(Scratch::new, |scratch, p| advance_one(executor, grid, dt, scratch, p))
            .filter(|(_, outcome)| *outcome != StepOutcome::Advanced)
            .collect();
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    let mut scratch = Scratch::new();
    particles
        .iter_mut()
        .filter(|p| p.is_active())
        .map(|p| advance_one(executor, grid, dt, &mut scratch, p))
        .filter(|(_, outcome)| *outcome != StepOutcome::Advanced)
        .collect()
}
