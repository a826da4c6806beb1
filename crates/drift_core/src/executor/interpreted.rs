//! Tree-walking evaluation of kernel pipelines.

use super::{check_variables, Executor, Scratch};
use crate::error::{KernelError, Result, SimulationError};
use crate::grid::{Grid, MERIDIONAL_VELOCITY, ZONAL_VELOCITY};
use crate::kernel::advection::{advection_ee, advection_rk4};
use crate::kernel::lang::{Expr, Program, Stmt};
use crate::kernel::{Kernel, KernelAction, Primitive};
use crate::particle::{Particle, ParticleSchema};
use std::collections::HashMap;
use std::sync::Arc;

/// Evaluates stages directly against live particle and grid objects.
///
/// Variable names are resolved through the particle schema and field names
/// through [`Grid::get_field`] on every access.
pub struct InterpretedExecutor {
    stages: Vec<Primitive>,
    kernel: Kernel,
    schema: Arc<ParticleSchema>,
}

impl InterpretedExecutor {
    pub fn new(kernel: &Kernel, grid: &Grid, schema: Arc<ParticleSchema>) -> Result<Self> {
        kernel.check_fields(grid)?;
        let stages: Vec<Primitive> = kernel.stages().into_iter().cloned().collect();
        for stage in &stages {
            if let Primitive::Source { name, program } = stage {
                program
                    .check_names(&schema)
                    .map_err(|message| SimulationError::KernelSyntax {
                        kernel: name.clone(),
                        message,
                    })?;
            }
        }
        Ok(Self {
            stages,
            kernel: kernel.clone(),
            schema,
        })
    }
}

fn field_error(err: SimulationError) -> KernelError {
    KernelError::fault(err.to_string())
}

fn missing_aux(name: &str) -> KernelError {
    KernelError::fault(format!("particle has no auxiliary variable '{name}'"))
}

impl Executor for InterpretedExecutor {
    fn name(&self) -> &'static str {
        "interpreted"
    }

    fn check_grid(&self, grid: &Grid) -> Result<()> {
        self.kernel.check_fields(grid)
    }

    fn check_schema(&self, schema: &ParticleSchema) -> Result<()> {
        check_variables(self.schema.names(), schema)
    }

    fn run_stages(
        &self,
        particle: &mut Particle,
        grid: &Grid,
        time: f64,
        dt: f64,
        _scratch: &mut Scratch,
    ) -> Result<KernelAction, KernelError> {
        for stage in &self.stages {
            let action = match stage {
                Primitive::AdvectionRK4 => {
                    let u = grid.get_field(ZONAL_VELOCITY).map_err(field_error)?;
                    let v = grid.get_field(MERIDIONAL_VELOCITY).map_err(field_error)?;
                    advection_rk4(particle, grid, u, v, time, dt)?;
                    KernelAction::Continue
                }
                Primitive::AdvectionEE => {
                    let u = grid.get_field(ZONAL_VELOCITY).map_err(field_error)?;
                    let v = grid.get_field(MERIDIONAL_VELOCITY).map_err(field_error)?;
                    advection_ee(particle, grid, u, v, time, dt)?;
                    KernelAction::Continue
                }
                Primitive::Source { program, .. } => {
                    let mut frame = Frame {
                        particle: &mut *particle,
                        schema: &self.schema,
                        grid,
                        time,
                        dt,
                        locals: HashMap::new(),
                    };
                    frame.run(program)?
                }
                Primitive::Function { func, .. } => (**func)(particle, grid, time, dt)?,
            };
            if action == KernelAction::Delete {
                return Ok(KernelAction::Delete);
            }
        }
        Ok(KernelAction::Continue)
    }
}

/// Evaluation context for one source stage on one particle.
struct Frame<'a> {
    particle: &'a mut Particle,
    schema: &'a ParticleSchema,
    grid: &'a Grid,
    time: f64,
    dt: f64,
    /// Locals read before assignment are 0.0.
    locals: HashMap<&'a str, f64>,
}

impl<'a> Frame<'a> {
    fn run(&mut self, program: &'a Program) -> Result<KernelAction, KernelError> {
        self.exec(&program.body)
    }

    fn exec(&mut self, body: &'a [Stmt]) -> Result<KernelAction, KernelError> {
        for stmt in body {
            match stmt {
                Stmt::Assign { target, value } => {
                    let value = self.eval(value)?;
                    self.write(target, value)?;
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if self.eval(cond)? != 0.0 { then } else { otherwise };
                    if self.exec(branch)? == KernelAction::Delete {
                        return Ok(KernelAction::Delete);
                    }
                }
                Stmt::Delete => return Ok(KernelAction::Delete),
            }
        }
        Ok(KernelAction::Continue)
    }

    fn read(&self, name: &str) -> Result<f64, KernelError> {
        let value = match name {
            "lon" => self.particle.lon,
            "lat" => self.particle.lat,
            "depth" => self.particle.depth,
            "time" => self.time,
            "dt" => self.dt,
            "id" => self.particle.id() as f64,
            _ => match self.schema.index_of(name) {
                Some(i) => *self.particle.aux.get(i).ok_or_else(|| missing_aux(name))?,
                None => self.locals.get(name).copied().unwrap_or(0.0),
            },
        };
        Ok(value)
    }

    fn write(&mut self, name: &'a str, value: f64) -> Result<(), KernelError> {
        match name {
            "lon" => self.particle.lon = value,
            "lat" => self.particle.lat = value,
            "depth" => self.particle.depth = value,
            _ => match self.schema.index_of(name) {
                Some(i) => {
                    *self.particle.aux.get_mut(i).ok_or_else(|| missing_aux(name))? = value;
                }
                None => {
                    self.locals.insert(name, value);
                }
            },
        }
        Ok(())
    }

    fn eval(&self, expr: &Expr) -> Result<f64, KernelError> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::Name(name) => self.read(name),
            Expr::Neg(inner) => Ok(-self.eval(inner)?),
            Expr::Binary(left, op, right) => {
                let a = self.eval(left)?;
                let b = self.eval(right)?;
                Ok(op.apply(a, b))
            }
            Expr::Call(func, arg) => Ok(func.apply(self.eval(arg)?)),
            Expr::Sample {
                field,
                time,
                lon,
                lat,
                depth,
            } => {
                let time = self.eval(time)?;
                let lon = self.eval(lon)?;
                let lat = self.eval(lat)?;
                let depth = match depth {
                    Some(depth) => self.eval(depth)?,
                    None => self.particle.depth,
                };
                let field = self.grid.get_field(field).map_err(field_error)?;
                field.sample(lon, lat, depth, time)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InterpretedExecutor;
    use crate::executor::{Executor, Scratch};
    use crate::field::FieldSpec;
    use crate::grid::{Grid, GridSettings};
    use crate::kernel::{Kernel, KernelAction};
    use crate::particle::{ParticleSchema, ParticleSet};

    fn grid() -> Grid {
        Grid::from_fields(
            [(
                "T",
                FieldSpec::surface(vec![0.0, 10.0], vec![0.0, 10.0], vec![0.0, 10.0, 0.0, 10.0]),
            )],
            GridSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn source_stage_reads_fields_and_updates_aux() {
        let grid = grid();
        let schema = ParticleSchema::new()
            .with_variable("temp", -1.0)
            .and_then(|s| s.with_variable("age", 0.0))
            .unwrap();
        let mut set = ParticleSet::new(schema);
        set.add(2.5, 5.0, 0.0, 0.0);
        let kernel = Kernel::from_source(
            "Sample",
            "temp = T[time, lon, lat]
             age += dt
             if temp > 2 { hot = 1 } else { hot = 0 }
             lat = lat + hot",
        )
        .unwrap();
        let executor = InterpretedExecutor::new(&kernel, &grid, set.shared_schema()).unwrap();
        let particle = &mut set.particles_mut()[0];
        let action = executor
            .run_stages(particle, &grid, 0.0, 60.0, &mut Scratch::new())
            .unwrap();
        assert_eq!(action, KernelAction::Continue);
        assert_eq!(particle.aux, vec![2.5, 60.0]);
        assert_eq!(particle.lat, 6.0);
    }

    #[test]
    fn locals_start_at_zero_each_call() {
        let grid = grid();
        let mut set = ParticleSet::from_positions(&[(1.0, 1.0)], 0.0);
        let kernel = Kernel::from_source("Counter", "n = n + 1\nlon = lon + n").unwrap();
        let executor = InterpretedExecutor::new(&kernel, &grid, set.shared_schema()).unwrap();
        let particle = &mut set.particles_mut()[0];
        let mut scratch = Scratch::new();
        executor.run_stages(particle, &grid, 0.0, 1.0, &mut scratch).unwrap();
        executor.run_stages(particle, &grid, 0.0, 1.0, &mut scratch).unwrap();
        assert_eq!(particle.lon, 3.0);
    }

    #[test]
    fn native_stage_observes_earlier_mutations() {
        let grid = grid();
        let mut set = ParticleSet::from_positions(&[(1.0, 1.0)], 0.0);
        let kernel = Kernel::from_source("Shift", "lon = 4").unwrap()
            + Kernel::function("Double", |p, _, _, _| {
                p.lon *= 2.0;
                Ok(KernelAction::Continue)
            });
        let executor = InterpretedExecutor::new(&kernel, &grid, set.shared_schema()).unwrap();
        let particle = &mut set.particles_mut()[0];
        executor
            .run_stages(particle, &grid, 0.0, 1.0, &mut Scratch::new())
            .unwrap();
        assert_eq!(particle.lon, 8.0);
    }
}
