//! Composable per-step particle behaviour.
//!
//! A `Kernel` is either a primitive stage or an ordered composite of
//! kernels. `a + b` runs every stage of `a` and then every stage of `b` on
//! the same particle within one step, each stage seeing the mutations of the
//! stages before it. Executors only ever consume the flattened stage list
//! returned by [`Kernel::stages`], which makes composition associative.

pub mod advection;
pub mod lang;

use crate::error::{KernelError, Result, SimulationError};
use crate::grid::{Grid, MERIDIONAL_VELOCITY, ZONAL_VELOCITY};
use crate::particle::Particle;
use lang::Program;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

/// What the remaining pipeline should do after a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelAction {
    Continue,
    /// Stop the step and mark the particle deleted.
    Delete,
}

/// Signature of an opaque user stage: `(particle, grid, time, dt)`.
pub type KernelFn =
    dyn Fn(&mut Particle, &Grid, f64, f64) -> Result<KernelAction, KernelError> + Send + Sync;

/// A single pipeline stage.
#[derive(Clone)]
pub enum Primitive {
    AdvectionRK4,
    AdvectionEE,
    /// Parsed source; introspectable, so both executors can run it.
    Source { name: String, program: Arc<Program> },
    /// Native closure; only the interpreted executor can run it.
    Function { name: String, func: Arc<KernelFn> },
}

impl Primitive {
    pub fn name(&self) -> &str {
        match self {
            Primitive::AdvectionRK4 => "AdvectionRK4",
            Primitive::AdvectionEE => "AdvectionEE",
            Primitive::Source { name, .. } | Primitive::Function { name, .. } => name,
        }
    }

    /// Fields this stage samples. Opaque functions report none.
    pub fn field_names(&self) -> Vec<String> {
        match self {
            Primitive::AdvectionRK4 | Primitive::AdvectionEE => {
                vec![ZONAL_VELOCITY.to_string(), MERIDIONAL_VELOCITY.to_string()]
            }
            Primitive::Source { program, .. } => program.field_names(),
            Primitive::Function { .. } => Vec::new(),
        }
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::AdvectionRK4 | Primitive::AdvectionEE => f.write_str(self.name()),
            Primitive::Source { name, program } => f
                .debug_struct("Source")
                .field("name", name)
                .field("statements", &program.body.len())
                .finish(),
            Primitive::Function { name, .. } => {
                f.debug_struct("Function").field("name", name).finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Kernel {
    Primitive(Primitive),
    Composite(Vec<Kernel>),
}

impl Kernel {
    pub fn advection_rk4() -> Self {
        Kernel::Primitive(Primitive::AdvectionRK4)
    }

    pub fn advection_ee() -> Self {
        Kernel::Primitive(Primitive::AdvectionEE)
    }

    /// Parses a source kernel. See [`lang`] for the syntax.
    pub fn from_source(name: impl Into<String>, source: &str) -> Result<Self> {
        let name = name.into();
        let program = lang::parse_program(source).map_err(|message| SimulationError::KernelSyntax {
            kernel: name.clone(),
            message,
        })?;
        Ok(Kernel::Primitive(Primitive::Source {
            name,
            program: Arc::new(program),
        }))
    }

    /// Registers a native stage.
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Particle, &Grid, f64, f64) -> Result<KernelAction, KernelError>
            + Send
            + Sync
            + 'static,
    {
        Kernel::Primitive(Primitive::Function {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    /// Primitive stages in execution order.
    pub fn stages(&self) -> Vec<&Primitive> {
        let mut out = Vec::new();
        self.collect_stages(&mut out);
        out
    }

    fn collect_stages<'a>(&'a self, out: &mut Vec<&'a Primitive>) {
        match self {
            Kernel::Primitive(p) => out.push(p),
            Kernel::Composite(parts) => {
                for part in parts {
                    part.collect_stages(out);
                }
            }
        }
    }

    /// Stage names joined in execution order, e.g. `AdvectionRK4+WestVel`.
    pub fn name(&self) -> String {
        self.stages()
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Distinct fields sampled by any stage, in first-use order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for stage in self.stages() {
            for name in stage.field_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Fails with `UnknownField` for the first referenced field the grid lacks.
    pub fn check_fields(&self, grid: &Grid) -> Result<()> {
        for name in self.field_names() {
            grid.get_field(&name)?;
        }
        Ok(())
    }
}

impl Add for Kernel {
    type Output = Kernel;

    fn add(self, rhs: Kernel) -> Kernel {
        Kernel::Composite(vec![self, rhs])
    }
}
