//! Execution environment and the tiered interpreter.
//!
//! [`Runtime`] owns all execution state: the module-scope global map, the
//! current frame's local map (with outer frames saved across guest calls),
//! the heap arena, per-block execution counters and the segment cache.
//! Blocks start out tree-walked; once a block's counter passes the
//! promotion threshold it is compiled once and every later entry runs the
//! cached native segment, with the environment synchronized into and out
//! of the segment's shadow slots around each invocation.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::ir::{
    BinOp, BlockId, FuncId, Instr, Module, Op, Pred, Type, TypeId, TypeTable, Value, ValueId,
};
use crate::segment::{build_segment, Backend, CompareStyle, Segment};

/// Interpreted executions a block gets before promotion. Calibration
/// parameter.
pub const DEFAULT_THRESHOLD: u64 = 1;

/// A fatal guest or host error. There is no recovery; these propagate to
/// the top-level entry point.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("No function called 'main'.")]
    NoMain,
    #[error("main() with arguments not supported.")]
    MainWithArgs,
    #[error("Too many arguments passed to function.")]
    TooManyArgs,
    #[error("Value not computed yet.")]
    ValueNotComputed,
    #[error("divide by zero")]
    DivideByZero,
    #[error("mod by zero")]
    ModByZero,
    #[error("Dereferencing null pointer.")]
    NullDeref,
    #[error("Dereferencing null pointer in GEP")]
    NullDerefGep,
    #[error("External function call not allowed.")]
    ExternalCall,
    #[error("Non-constant struct index in GEP")]
    NonConstStructIndex,
    #[error("Struct field index out of range in GEP")]
    StructFieldRange,
    #[error("Unsupported type in GEP traversal")]
    GepUnsupportedType,
    #[error("Unsupported type for allocation")]
    UnsupportedAllocType,
    #[error("Unsupported ICmp predicate in compile mode.")]
    UnsupportedPredicate,
    #[error("Fell off end of basic block - malformed IR.")]
    MalformedBlock,
    #[error("Failed to allocate executable memory: {0}")]
    ExecMmap(std::io::Error),
    #[error("native segment execution requires a riscv64 host")]
    NativeUnsupported,
    #[error("illegal instruction word {0:#010x} in native segment")]
    IllegalWord(u32),
}

/// Arena of guest-visible memory. Hands out raw 64-bit addresses into
/// buffers that stay pinned until the runtime drops; nothing is freed
/// earlier. Every buffer carries 8 bytes of tail slack so a 64-bit
/// access at the last element of a narrow-element region stays inside
/// the buffer.
#[derive(Debug, Default)]
pub struct Heap {
    regions: Vec<*mut [u8]>,
}

impl Heap {
    fn raw_alloc(&mut self, size: u64) -> i64 {
        let buf = vec![0u8; size as usize + 8].into_boxed_slice();
        let raw = Box::into_raw(buf);
        self.regions.push(raw);
        raw as *mut u8 as i64
    }

    /// Allocate backing store for one value of `ty`. Scalars get a
    /// single 8-byte slot; arrays of scalars and structs are contiguous;
    /// arrays of arrays are jagged, a row of pointers to independently
    /// allocated subarrays.
    pub fn alloc(&mut self, types: &TypeTable, ty: TypeId) -> Result<i64, Fault> {
        match types.get(ty).clone() {
            Type::Int { .. } | Type::Ptr => Ok(self.raw_alloc(8)),
            Type::Array { elem, len } => {
                if matches!(types.get(elem), Type::Array { .. }) {
                    let base = self.raw_alloc(len * 8);
                    for i in 0..len {
                        let sub = self.alloc(types, elem)?;
                        unsafe { *((base + 8 * i as i64) as *mut i64) = sub };
                    }
                    Ok(base)
                } else {
                    Ok(self.raw_alloc(types.alloc_size(elem) * len))
                }
            }
            Type::Struct { .. } => Ok(self.raw_alloc(types.alloc_size(ty))),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            unsafe { drop(Box::from_raw(region)) };
        }
    }
}

/// How a block's execution ended: a function return, or a jump to a
/// successor that the caller should continue with.
enum BlockExit {
    Return(i64),
    Jump(BlockId),
}

/// All state for one guest program run.
pub struct Runtime<'m> {
    module: &'m Module,
    globals: HashMap<ValueId, i64>,
    locals: HashMap<ValueId, i64>,
    counters: HashMap<BlockId, u64>,
    segments: HashMap<BlockId, Rc<Segment>>,
    heap: Heap,
    threshold: u64,
    backend: Backend,
    compare_style: CompareStyle,
    trace: bool,
}

impl<'m> Runtime<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut heap = Heap::default();
        let mut globals = HashMap::new();
        for global in &module.globals {
            let addr = heap.raw_alloc(8);
            unsafe { *(addr as *mut i64) = global.init };
            globals.insert(global.value_id, addr);
        }
        Runtime {
            module,
            globals,
            locals: HashMap::new(),
            counters: HashMap::new(),
            segments: HashMap::new(),
            heap,
            threshold: DEFAULT_THRESHOLD,
            backend: Backend::default(),
            compare_style: CompareStyle::default(),
            trace: false,
        }
    }

    pub fn set_threshold(&mut self, threshold: u64) {
        self.threshold = threshold;
    }

    pub fn set_backend(&mut self, backend: Backend) {
        self.backend = backend;
    }

    pub fn set_compare_style(&mut self, style: CompareStyle) {
        self.compare_style = style;
    }

    /// Print promotions and segment disassembly as they happen.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// How often a block has been entered so far.
    pub fn block_count(&self, id: BlockId) -> u64 {
        self.counters.get(&id).copied().unwrap_or(0)
    }

    /// Execute the module's `main` and return its exit code.
    pub fn run(&mut self) -> Result<i64, Fault> {
        let main = self.module.func_by_name("main").ok_or(Fault::NoMain)?;
        if !self.module.func(main).params.is_empty() {
            return Err(Fault::MainWithArgs);
        }
        self.exec_function(main, &[])
    }

    fn exec_function(&mut self, id: FuncId, args: &[i64]) -> Result<i64, Fault> {
        let func = self.module.func(id);
        if func.is_declaration() {
            return Err(Fault::ExternalCall);
        }
        if args.len() > func.params.len() {
            return Err(Fault::TooManyArgs);
        }
        let saved = std::mem::take(&mut self.locals);
        for (param, arg) in func.params.iter().zip(args) {
            self.locals.insert(*param, *arg);
        }
        let mut block = self.module.entry(id);
        let result = loop {
            match self.exec_block(block) {
                Ok(BlockExit::Return(value)) => break Ok(value),
                Ok(BlockExit::Jump(next)) => block = next,
                Err(fault) => break Err(fault),
            }
        };
        self.locals = saved;
        result
    }

    fn exec_block(&mut self, id: BlockId) -> Result<BlockExit, Fault> {
        let count = {
            let counter = self.counters.entry(id).or_insert(0);
            *counter = counter.saturating_add(1);
            *counter
        };

        if count > self.threshold {
            if !self.segments.contains_key(&id) {
                let func_name = &self.module.func(id.func).name;
                let label = &self.module.block(id).label;
                tracing::debug!(
                    func = %func_name,
                    block = %label,
                    executions = count,
                    "promoting block to native tier"
                );
                let segment =
                    build_segment(self.module, &mut self.heap, id, 0, self.compare_style)?;
                if self.trace {
                    println!("promoting {func_name}:{label} to native tier");
                    println!("{}", segment.disassembly());
                }
                self.segments.insert(id, Rc::new(segment));
            }
            let segment = Rc::clone(
                self.segments
                    .get(&id)
                    .expect("segment was cached just above"),
            );
            return self.run_segment(&segment);
        }

        let module = self.module;
        let block = module.block(id);
        let mut phi_buffer: Vec<(ValueId, i64)> = Vec::new();
        for instr in &block.instrs {
            if let Op::Phi { incoming } = &instr.op {
                // resolved against the first incoming edge, not the
                // traversed one; pinned down in the test suite
                let value = self.get(incoming[0].0)?;
                phi_buffer.push((instr.result, value));
                continue;
            }
            for (phi, value) in phi_buffer.drain(..) {
                self.set(phi, value);
            }
            match &instr.op {
                Op::Ret { value } => {
                    let value = match value {
                        Some(v) => self.get(*v)?,
                        None => 0,
                    };
                    return Ok(BlockExit::Return(value));
                }
                Op::Br { dest } => {
                    return Ok(BlockExit::Jump(BlockId {
                        func: id.func,
                        index: *dest,
                    }));
                }
                Op::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    let cond = self.get(*cond)?;
                    let index = if cond != 0 { *then_dest } else { *else_dest };
                    return Ok(BlockExit::Jump(BlockId {
                        func: id.func,
                        index,
                    }));
                }
                _ => {
                    let value = self.visit_instr(instr)?;
                    self.set(instr.result, value);
                }
            }
        }
        Err(Fault::MalformedBlock)
    }

    /// Run a compiled segment: sync bound values into its shadow slots,
    /// invoke the native region, sync every slot back, then finish the
    /// recorded terminator in the interpreter.
    fn run_segment(&mut self, segment: &Segment) -> Result<BlockExit, Fault> {
        for value in segment.shadow.values() {
            // values with no binding yet are fine: fresh alloca
            // addresses and still-undefined results keep their slots
            if let Ok(bound) = self.get(Value::Ref(value)) {
                segment.shadow.write(value, bound);
            }
        }

        segment.run(self.backend)?;

        for value in segment.shadow.values() {
            let slot = segment
                .shadow
                .read(value)
                .expect("iterated values have slots");
            self.set(value, slot);
        }

        let terminator = segment.terminator.as_ref().ok_or(Fault::MalformedBlock)?;
        match &terminator.op {
            Op::Ret { value } => {
                let value = match value {
                    Some(v) => self.get(*v)?,
                    None => 0,
                };
                Ok(BlockExit::Return(value))
            }
            Op::Br { dest } => Ok(BlockExit::Jump(BlockId {
                func: segment.block.func,
                index: *dest,
            })),
            Op::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let cond = self.get(*cond)?;
                let index = if cond != 0 { *then_dest } else { *else_dest };
                Ok(BlockExit::Jump(BlockId {
                    func: segment.block.func,
                    index,
                }))
            }
            Op::Call { callee, args } => {
                let result = self.visit_call(*callee, args)?;
                self.set(terminator.result, result);
                match &segment.continuation {
                    Some(continuation) => self.run_segment(continuation),
                    None => Err(Fault::MalformedBlock),
                }
            }
            _ => Err(Fault::MalformedBlock),
        }
    }

    fn visit_call(&mut self, callee: FuncId, args: &[Value]) -> Result<i64, Fault> {
        if self.module.func(callee).is_declaration() {
            return Err(Fault::ExternalCall);
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.get(*arg)?);
        }
        self.exec_function(callee, &values)
    }

    fn visit_instr(&mut self, instr: &Instr) -> Result<i64, Fault> {
        match &instr.op {
            Op::Bin { op, lhs, rhs } => {
                let lhs = self.get(*lhs)?;
                let rhs = self.get(*rhs)?;
                Ok(match op {
                    BinOp::Add => lhs.wrapping_add(rhs),
                    BinOp::Sub => lhs.wrapping_sub(rhs),
                    BinOp::Mul => lhs.wrapping_mul(rhs),
                    BinOp::SDiv => {
                        if rhs == 0 {
                            return Err(Fault::DivideByZero);
                        }
                        lhs.wrapping_div(rhs)
                    }
                    BinOp::SRem => {
                        if rhs == 0 {
                            return Err(Fault::ModByZero);
                        }
                        lhs.wrapping_rem(rhs)
                    }
                    BinOp::And => lhs & rhs,
                    BinOp::Or => lhs | rhs,
                    BinOp::Xor => lhs ^ rhs,
                    BinOp::Shl => lhs.wrapping_shl(rhs as u32),
                    BinOp::AShr => lhs.wrapping_shr(rhs as u32),
                })
            }
            Op::Icmp { pred, lhs, rhs } => {
                let lhs = self.get(*lhs)?;
                let rhs = self.get(*rhs)?;
                Ok(i64::from(match pred {
                    Pred::Eq => lhs == rhs,
                    Pred::Ne => lhs != rhs,
                    Pred::Slt => lhs < rhs,
                    Pred::Sle => lhs <= rhs,
                    Pred::Sgt => lhs > rhs,
                    Pred::Sge => lhs >= rhs,
                }))
            }
            Op::Alloca { ty } => self.heap.alloc(&self.module.types, *ty),
            Op::Load { ptr } => {
                let addr = self.get(*ptr)?;
                if addr == 0 {
                    return Err(Fault::NullDeref);
                }
                Ok(unsafe { std::ptr::read_unaligned(addr as *const i64) })
            }
            Op::Store { value, ptr } => {
                let addr = self.get(*ptr)?;
                if addr == 0 {
                    return Err(Fault::NullDeref);
                }
                let value = self.get(*value)?;
                unsafe { std::ptr::write_unaligned(addr as *mut i64, value) };
                Ok(0)
            }
            Op::Gep {
                source_ty,
                base,
                indices,
            } => self.eval_gep(*source_ty, *base, indices),
            // 64 bits is the universal width already
            Op::Sext { value } => self.get(*value),
            Op::Phi { incoming } => self.get(incoming[0].0),
            Op::Call { callee, args } => self.visit_call(*callee, args),
            Op::Ret { .. } | Op::Br { .. } | Op::CondBr { .. } => {
                unreachable!("terminators are handled by exec_block")
            }
        }
    }

    fn eval_gep(
        &mut self,
        source_ty: TypeId,
        base: Value,
        indices: &[Value],
    ) -> Result<i64, Fault> {
        let base = self.get(base)?;
        if base == 0 {
            return Err(Fault::NullDerefGep);
        }
        let module = self.module;
        let types = &module.types;
        let mut cur = source_ty;
        let mut offset: i64 = 0;
        if let Some(first) = indices.first() {
            let index = self.get(*first)?;
            if index != 0 {
                offset = offset.wrapping_add(index.wrapping_mul(types.alloc_size(cur) as i64));
            }
        }
        for index in indices.iter().skip(1) {
            match types.get(cur).clone() {
                Type::Struct { fields } => {
                    let field = index.as_const().ok_or(Fault::NonConstStructIndex)? as usize;
                    if field >= fields.len() {
                        return Err(Fault::StructFieldRange);
                    }
                    offset = offset.wrapping_add(types.field_offset(cur, field) as i64);
                    cur = fields[field];
                }
                Type::Array { elem, .. } => {
                    let index = self.get(*index)?;
                    offset = offset.wrapping_add(index.wrapping_mul(types.alloc_size(elem) as i64));
                    cur = elem;
                }
                _ => return Err(Fault::GepUnsupportedType),
            }
        }
        Ok(base.wrapping_add(offset))
    }

    fn get(&self, value: Value) -> Result<i64, Fault> {
        match value {
            Value::Const(c) => Ok(c),
            Value::Ref(id) => self
                .globals
                .get(&id)
                .or_else(|| self.locals.get(&id))
                .copied()
                .ok_or(Fault::ValueNotComputed),
        }
    }

    fn set(&mut self, id: ValueId, value: i64) {
        if let Some(slot) = self.globals.get_mut(&id) {
            *slot = value;
        } else {
            self.locals.insert(id, value);
        }
    }
}
