//! Ahead-of-time lowering of kernel pipelines to a stack VM.
//!
//! Source stages are compiled once into `Bytecode` whose variable and field
//! references are already resolved to slots and grid field indices.
//! Built-in advection stages are bound to the indices of `U` and `V`.
//! Evaluation order mirrors the interpreter exactly (left operand first,
//! sample indices in `time, lon, lat, depth` order), so both strategies
//! produce the same floating-point results.

use super::{check_variables, Executor, Scratch};
use crate::error::{KernelError, Result, SimulationError};
use crate::grid::{Grid, MERIDIONAL_VELOCITY, ZONAL_VELOCITY};
use crate::kernel::advection::{advection_ee, advection_rk4};
use crate::kernel::lang::{BinaryOp, Expr, Function, Program, Stmt};
use crate::kernel::{Kernel, KernelAction, Primitive};
use crate::particle::{Particle, ParticleSchema};
use std::collections::HashMap;

/// Storage location a compiled kernel reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Lon,
    Lat,
    Depth,
    Time,
    Dt,
    Id,
    /// Auxiliary particle variable by schema index.
    Aux(usize),
    /// Kernel-local variable, zeroed at the start of every invocation.
    Local(usize),
}

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes the value held in a slot.
    Load(Slot),
    /// Pops the top value into a slot.
    Store(Slot),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top two values (b, a), pushes 1.0 if `a op b` holds, else 0.0.
    Compare(BinaryOp),
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
    /// Pops depth, lat, lon, time and pushes the sample of a grid field.
    Sample(usize),
    /// Pops a condition and jumps to the target if it is 0.0.
    JumpIfZero(usize),
    Jump(usize),
    /// Ends the stage and requests deletion.
    Delete,
}

/// A compiled source stage.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    pub locals: usize,
}

#[derive(Debug, Clone)]
enum CompiledStage {
    Rk4 { u: usize, v: usize },
    Ee { u: usize, v: usize },
    Program(Bytecode),
}

/// Lowers one source program, resolving names against a schema and a grid.
pub struct Compiler<'a> {
    kernel: &'a str,
    schema: &'a ParticleSchema,
    grid: &'a Grid,
    local_map: HashMap<String, usize>,
}

impl<'a> Compiler<'a> {
    pub fn new(kernel: &'a str, schema: &'a ParticleSchema, grid: &'a Grid) -> Self {
        Self {
            kernel,
            schema,
            grid,
            local_map: HashMap::new(),
        }
    }

    pub fn compile(mut self, program: &Program) -> Result<Bytecode> {
        program
            .check_names(self.schema)
            .map_err(|message| SimulationError::KernelSyntax {
                kernel: self.kernel.to_string(),
                message,
            })?;
        for (i, name) in program.locals(self.schema).into_iter().enumerate() {
            self.local_map.insert(name, i);
        }

        let mut ops = Vec::new();
        self.compile_block(&program.body, &mut ops)?;
        Ok(Bytecode {
            ops,
            locals: self.local_map.len(),
        })
    }

    fn slot(&self, name: &str) -> Result<Slot> {
        let slot = match name {
            "lon" => Slot::Lon,
            "lat" => Slot::Lat,
            "depth" => Slot::Depth,
            "time" => Slot::Time,
            "dt" => Slot::Dt,
            "id" => Slot::Id,
            _ => {
                if let Some(i) = self.schema.index_of(name) {
                    Slot::Aux(i)
                } else if let Some(&i) = self.local_map.get(name) {
                    Slot::Local(i)
                } else {
                    return Err(SimulationError::KernelSyntax {
                        kernel: self.kernel.to_string(),
                        message: format!("unknown variable '{name}'"),
                    });
                }
            }
        };
        Ok(slot)
    }

    fn compile_block(&self, body: &[Stmt], ops: &mut Vec<OpCode>) -> Result<()> {
        for stmt in body {
            match stmt {
                Stmt::Assign { target, value } => {
                    self.compile_expr(value, ops)?;
                    ops.push(OpCode::Store(self.slot(target)?));
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    self.compile_expr(cond, ops)?;
                    let to_else = ops.len();
                    ops.push(OpCode::JumpIfZero(0));
                    self.compile_block(then, ops)?;
                    if otherwise.is_empty() {
                        ops[to_else] = OpCode::JumpIfZero(ops.len());
                    } else {
                        let to_end = ops.len();
                        ops.push(OpCode::Jump(0));
                        ops[to_else] = OpCode::JumpIfZero(ops.len());
                        self.compile_block(otherwise, ops)?;
                        ops[to_end] = OpCode::Jump(ops.len());
                    }
                }
                Stmt::Delete => ops.push(OpCode::Delete),
            }
        }
        Ok(())
    }

    fn compile_expr(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Name(name) => ops.push(OpCode::Load(self.slot(name)?)),
            Expr::Neg(inner) => {
                self.compile_expr(inner, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Binary(left, op, right) => {
                self.compile_expr(left, ops)?;
                self.compile_expr(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                    cmp => OpCode::Compare(*cmp),
                });
            }
            Expr::Call(func, arg) => {
                self.compile_expr(arg, ops)?;
                ops.push(OpCode::Call(*func));
            }
            Expr::Sample {
                field,
                time,
                lon,
                lat,
                depth,
            } => {
                let index = self
                    .grid
                    .field_index(field)
                    .ok_or_else(|| SimulationError::UnknownField(field.clone()))?;
                self.compile_expr(time, ops)?;
                self.compile_expr(lon, ops)?;
                self.compile_expr(lat, ops)?;
                match depth {
                    Some(depth) => self.compile_expr(depth, ops)?,
                    None => ops.push(OpCode::Load(Slot::Depth)),
                }
                ops.push(OpCode::Sample(index));
            }
        }
        Ok(())
    }
}

fn missing_aux(index: usize) -> KernelError {
    KernelError::fault(format!("particle has no auxiliary variable at slot {index}"))
}

/// Stack-based virtual machine for compiled stages.
pub struct VM;

impl VM {
    fn pop(stack: &mut Vec<f64>) -> Result<f64, KernelError> {
        stack
            .pop()
            .ok_or_else(|| KernelError::fault("compiled kernel stack underflow"))
    }

    pub fn execute(
        bytecode: &Bytecode,
        particle: &mut Particle,
        grid: &Grid,
        time: f64,
        dt: f64,
        stack: &mut Vec<f64>,
        locals: &mut Vec<f64>,
    ) -> Result<KernelAction, KernelError> {
        stack.clear();
        locals.clear();
        locals.resize(bytecode.locals, 0.0);

        let mut pc = 0;
        while let Some(op) = bytecode.ops.get(pc) {
            pc += 1;
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::Load(slot) => stack.push(match slot {
                    Slot::Lon => particle.lon,
                    Slot::Lat => particle.lat,
                    Slot::Depth => particle.depth,
                    Slot::Time => time,
                    Slot::Dt => dt,
                    Slot::Id => particle.id() as f64,
                    Slot::Aux(i) => *particle.aux.get(i).ok_or_else(|| missing_aux(i))?,
                    Slot::Local(i) => locals[i],
                }),
                OpCode::Store(slot) => {
                    let value = Self::pop(stack)?;
                    match slot {
                        Slot::Lon => particle.lon = value,
                        Slot::Lat => particle.lat = value,
                        Slot::Depth => particle.depth = value,
                        Slot::Aux(i) => {
                            *particle.aux.get_mut(i).ok_or_else(|| missing_aux(i))? = value
                        }
                        Slot::Local(i) => locals[i] = value,
                        Slot::Time | Slot::Dt | Slot::Id => {
                            return Err(KernelError::fault("store to read-only slot"))
                        }
                    }
                }
                OpCode::Add => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(a.powf(b));
                }
                OpCode::Compare(op) => {
                    let b = Self::pop(stack)?;
                    let a = Self::pop(stack)?;
                    stack.push(op.apply(a, b));
                }
                OpCode::Neg => {
                    let a = Self::pop(stack)?;
                    stack.push(-a);
                }
                OpCode::Call(func) => {
                    let a = Self::pop(stack)?;
                    stack.push(func.apply(a));
                }
                OpCode::Sample(index) => {
                    let depth = Self::pop(stack)?;
                    let lat = Self::pop(stack)?;
                    let lon = Self::pop(stack)?;
                    let t = Self::pop(stack)?;
                    stack.push(grid.field_at(index).sample(lon, lat, depth, t)?);
                }
                OpCode::JumpIfZero(target) => {
                    if Self::pop(stack)? == 0.0 {
                        pc = target;
                    }
                }
                OpCode::Jump(target) => pc = target,
                OpCode::Delete => return Ok(KernelAction::Delete),
            }
        }
        Ok(KernelAction::Continue)
    }
}

/// Pipeline specialised for one kernel, particle schema and grid layout.
#[derive(Debug)]
pub struct CompiledExecutor {
    stages: Vec<CompiledStage>,
    /// (field name, index) pairs the stages were bound to.
    bindings: Vec<(String, usize)>,
    /// Auxiliary variables the slots were resolved against, in schema order.
    variables: Vec<String>,
}

impl CompiledExecutor {
    /// Compiles every stage of `kernel`, failing on stages that cannot be lowered.
    pub fn compile(kernel: &Kernel, grid: &Grid, schema: &ParticleSchema) -> Result<Self> {
        let velocity = || -> Result<(usize, usize)> {
            let u = grid
                .field_index(ZONAL_VELOCITY)
                .ok_or_else(|| SimulationError::UnknownField(ZONAL_VELOCITY.to_string()))?;
            let v = grid
                .field_index(MERIDIONAL_VELOCITY)
                .ok_or_else(|| SimulationError::UnknownField(MERIDIONAL_VELOCITY.to_string()))?;
            Ok((u, v))
        };

        let mut stages = Vec::new();
        for stage in kernel.stages() {
            let compiled = match stage {
                Primitive::AdvectionRK4 => {
                    let (u, v) = velocity()?;
                    CompiledStage::Rk4 { u, v }
                }
                Primitive::AdvectionEE => {
                    let (u, v) = velocity()?;
                    CompiledStage::Ee { u, v }
                }
                Primitive::Source { name, program } => {
                    CompiledStage::Program(Compiler::new(name, schema, grid).compile(program)?)
                }
                Primitive::Function { name, .. } => {
                    return Err(SimulationError::CompilationUnsupported {
                        kernel: name.clone(),
                        reason: "native function stages are opaque to the compiler".to_string(),
                    });
                }
            };
            stages.push(compiled);
        }

        let bindings = kernel
            .field_names()
            .into_iter()
            .filter_map(|name| grid.field_index(&name).map(|i| (name, i)))
            .collect();

        Ok(Self {
            stages,
            bindings,
            variables: schema.names().to_vec(),
        })
    }
}

impl Executor for CompiledExecutor {
    fn name(&self) -> &'static str {
        "compiled"
    }

    fn check_grid(&self, grid: &Grid) -> Result<()> {
        for (name, index) in &self.bindings {
            match grid.field_index(name) {
                None => return Err(SimulationError::UnknownField(name.clone())),
                Some(i) if i != *index => {
                    return Err(SimulationError::MalformedGrid(format!(
                        "field '{name}' moved from index {index} to {i} since compilation"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_schema(&self, schema: &ParticleSchema) -> Result<()> {
        check_variables(&self.variables, schema)
    }

    fn run_stages(
        &self,
        particle: &mut Particle,
        grid: &Grid,
        time: f64,
        dt: f64,
        scratch: &mut Scratch,
    ) -> Result<KernelAction, KernelError> {
        for stage in &self.stages {
            let action = match stage {
                CompiledStage::Rk4 { u, v } => {
                    advection_rk4(particle, grid, grid.field_at(*u), grid.field_at(*v), time, dt)?;
                    KernelAction::Continue
                }
                CompiledStage::Ee { u, v } => {
                    advection_ee(particle, grid, grid.field_at(*u), grid.field_at(*v), time, dt)?;
                    KernelAction::Continue
                }
                CompiledStage::Program(bytecode) => VM::execute(
                    bytecode,
                    particle,
                    grid,
                    time,
                    dt,
                    &mut scratch.stack,
                    &mut scratch.locals,
                )?,
            };
            if action == KernelAction::Delete {
                return Ok(KernelAction::Delete);
            }
        }
        Ok(KernelAction::Continue)
    }
}
