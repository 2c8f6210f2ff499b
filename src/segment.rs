//! Native code segments for hot basic blocks.
//!
//! A segment covers a basic block from some start instruction up to its
//! first non-local transfer (return, branch or call). Every IR value the
//! segment touches is bound to a stable 64-bit *shadow slot*; emitted code
//! reads and writes the slots through absolute addresses materialized with
//! `li`, so no register allocation is needed. A segment that stops at a
//! call owns a continuation segment covering the rest of the block.
//!
//! Segments are executed either by calling the mmap'd region directly
//! (riscv64 hosts) or by feeding its words through a small RV64IM
//! micro-interpreter that performs the same loads and stores against host
//! memory, so both backends move identical data through the slots.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::str::FromStr;

use itertools::Itertools;

use crate::encode::{encode, AluOp, AsmInstr, Reg};
use crate::ir::{BinOp, BlockId, Instr, Module, Op, Pred, Type, TypeId, Value, ValueId};
use crate::runtime::{Fault, Heap};

/// How icmp results are emitted.
///
/// `Legal` lowers every predicate to base-ISA sequences. `Tagged` emits
/// the synthetic compare tags, whose words are bit-identical to the
/// M-extension `mul` family and therefore only meaningful to a consumer
/// that has agreed to read them that way; an RV64 core (and the emulated
/// backend) will execute them as multiplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareStyle {
    #[default]
    Legal,
    Tagged,
}

/// How a built segment is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Call the executable region in place. Requires a riscv64 host.
    Native,
    /// Run the encoded words through the in-process micro-interpreter.
    Emulated,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_arch = "riscv64") {
            Backend::Native
        } else {
            Backend::Emulated
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Backend::Native),
            "emulated" => Ok(Backend::Emulated),
            _ => Err(format!(
                "unknown backend '{s}' (expected 'native' or 'emulated')"
            )),
        }
    }
}

/// Stable 64-bit cells bound to IR values and addressed directly by
/// emitted code. Cells are boxed so their addresses survive growth of
/// the map for the life of the segment.
#[derive(Debug, Default)]
pub struct ShadowEnv {
    slots: HashMap<ValueId, usize>,
    cells: Vec<Box<UnsafeCell<i64>>>,
}

impl ShadowEnv {
    /// Address of the slot for `value`, allocating one on first touch.
    fn slot_addr(&mut self, value: ValueId) -> i64 {
        if let Some(&index) = self.slots.get(&value) {
            return self.cells[index].get() as i64;
        }
        self.cells.push(Box::new(UnsafeCell::new(0)));
        let index = self.cells.len() - 1;
        self.slots.insert(value, index);
        self.cells[index].get() as i64
    }

    /// Set a slot's content at build time (used for allocas, which emit
    /// no code).
    fn install(&mut self, value: ValueId, content: i64) {
        let addr = self.slot_addr(value);
        unsafe { *(addr as *mut i64) = content };
    }

    pub fn values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.slots.keys().copied()
    }

    pub fn read(&self, value: ValueId) -> Option<i64> {
        self.slots
            .get(&value)
            .map(|&index| unsafe { *self.cells[index].get() })
    }

    pub fn write(&self, value: ValueId, content: i64) -> bool {
        match self.slots.get(&value) {
            Some(&index) => {
                unsafe { *self.cells[index].get() = content };
                true
            }
            None => false,
        }
    }
}

/// An mmap'd read/write/execute region holding encoded instructions.
/// Immutable once filled; lives as long as the segment.
#[derive(Debug)]
pub struct ExecRegion {
    ptr: *mut u8,
    len: usize,
}

impl ExecRegion {
    fn new(bytes: &[u8]) -> Result<Self, Fault> {
        let len = bytes.len();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Fault::ExecMmap(std::io::Error::last_os_error()));
        }
        let ptr = ptr as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, len) };
        Ok(ExecRegion { ptr, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

/// A compiled basic-block prefix: its executable region, the shadow
/// environment it reads and writes, the IR terminator it stopped at, and
/// (after a call) the continuation covering the rest of the block.
#[derive(Debug)]
pub struct Segment {
    pub block: BlockId,
    instrs: Vec<AsmInstr>,
    region: ExecRegion,
    pub shadow: ShadowEnv,
    pub terminator: Option<Instr>,
    pub continuation: Option<Box<Segment>>,
}

impl Segment {
    pub fn disassembly(&self) -> String {
        self.instrs.iter().map(|i| i.to_string()).join("\n")
    }

    pub fn run(&self, backend: Backend) -> Result<(), Fault> {
        match backend {
            Backend::Emulated => emulate(self.region.as_bytes()),
            Backend::Native => self.run_native(),
        }
    }

    #[cfg(target_arch = "riscv64")]
    fn run_native(&self) -> Result<(), Fault> {
        let entry: extern "C" fn() = unsafe { std::mem::transmute(self.region.ptr) };
        entry();
        Ok(())
    }

    #[cfg(not(target_arch = "riscv64"))]
    fn run_native(&self) -> Result<(), Fault> {
        Err(Fault::NativeUnsupported)
    }
}

fn alu_op(op: BinOp) -> AluOp {
    match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::Mul => AluOp::Mul,
        BinOp::SDiv => AluOp::Div,
        BinOp::SRem => AluOp::Rem,
        BinOp::And => AluOp::And,
        BinOp::Or => AluOp::Or,
        BinOp::Xor => AluOp::Xor,
        BinOp::Shl => AluOp::Sll,
        BinOp::AShr => AluOp::Sra,
    }
}

struct Builder<'m> {
    module: &'m Module,
    instrs: Vec<AsmInstr>,
    shadow: ShadowEnv,
}

impl<'m> Builder<'m> {
    fn push(&mut self, instr: AsmInstr) {
        self.instrs.push(instr);
    }

    fn reg_save(&mut self) {
        for (i, reg) in [Reg::S0, Reg::S1, Reg::S2, Reg::S3, Reg::S4]
            .into_iter()
            .enumerate()
        {
            self.push(AsmInstr::Sd {
                src: reg,
                base: Reg::Sp,
                offset: -8 * (i as i32 + 1),
            });
        }
    }

    fn reg_load(&mut self) {
        for (i, reg) in [Reg::S0, Reg::S1, Reg::S2, Reg::S3, Reg::S4]
            .into_iter()
            .enumerate()
            .rev()
        {
            self.push(AsmInstr::Ld {
                rd: reg,
                base: Reg::Sp,
                offset: -8 * (i as i32 + 1),
            });
        }
    }

    /// Bring an operand into `reg`: constants via `li`, everything else
    /// via its shadow slot.
    fn materialize(&mut self, reg: Reg, value: Value) {
        match value {
            Value::Const(imm) => self.push(AsmInstr::Li { rd: reg, imm }),
            Value::Ref(id) => {
                let addr = self.shadow.slot_addr(id);
                self.push(AsmInstr::Li { rd: reg, imm: addr });
                self.push(AsmInstr::Ld {
                    rd: reg,
                    base: reg,
                    offset: 0,
                });
            }
        }
    }

    /// Write `reg` back to the value's shadow slot, through s4.
    fn spill(&mut self, reg: Reg, value: ValueId) {
        let addr = self.shadow.slot_addr(value);
        self.push(AsmInstr::Li {
            rd: Reg::S4,
            imm: addr,
        });
        self.push(AsmInstr::Sd {
            src: reg,
            base: Reg::S4,
            offset: 0,
        });
    }

    fn binary(&mut self, op: AluOp, result: ValueId, lhs: Value, rhs: Value) {
        self.materialize(Reg::S1, lhs);
        self.materialize(Reg::S2, rhs);
        self.push(AsmInstr::Bin {
            op,
            rd: Reg::S0,
            rs1: Reg::S1,
            rs2: Reg::S2,
        });
        self.spill(Reg::S0, result);
    }

    fn compare(
        &mut self,
        style: CompareStyle,
        pred: Pred,
        result: ValueId,
        lhs: Value,
        rhs: Value,
    ) -> Result<(), Fault> {
        if style == CompareStyle::Tagged {
            let op = match pred {
                Pred::Eq => AluOp::Eq,
                Pred::Ne => AluOp::Ne,
                Pred::Slt => AluOp::Slt,
                Pred::Sgt => AluOp::Sgt,
                Pred::Sge => AluOp::Sge,
                Pred::Sle => return Err(Fault::UnsupportedPredicate),
            };
            self.binary(op, result, lhs, rhs);
            return Ok(());
        }

        self.materialize(Reg::S1, lhs);
        self.materialize(Reg::S2, rhs);
        let bin = |op, rs1, rs2| AsmInstr::Bin {
            op,
            rd: Reg::S0,
            rs1,
            rs2,
        };
        // not(x) for a 0/1 flag is xor with 1
        let negate = [
            AsmInstr::Li {
                rd: Reg::S1,
                imm: 1,
            },
            bin(AluOp::Xor, Reg::S0, Reg::S1),
        ];
        match pred {
            Pred::Slt => self.push(bin(AluOp::Slt, Reg::S1, Reg::S2)),
            Pred::Sgt => self.push(bin(AluOp::Slt, Reg::S2, Reg::S1)),
            Pred::Ne => {
                self.push(bin(AluOp::Sub, Reg::S1, Reg::S2));
                self.push(bin(AluOp::Sltu, Reg::Zero, Reg::S0));
            }
            Pred::Eq => {
                self.push(bin(AluOp::Sub, Reg::S1, Reg::S2));
                self.push(bin(AluOp::Sltu, Reg::Zero, Reg::S0));
                self.instrs.extend_from_slice(&negate);
            }
            Pred::Sge => {
                self.push(bin(AluOp::Slt, Reg::S1, Reg::S2));
                self.instrs.extend_from_slice(&negate);
            }
            Pred::Sle => {
                self.push(bin(AluOp::Slt, Reg::S2, Reg::S1));
                self.instrs.extend_from_slice(&negate);
            }
        }
        self.spill(Reg::S0, result);
        Ok(())
    }

    fn load(&mut self, result: ValueId, ptr: Value) {
        self.materialize(Reg::S0, ptr);
        self.push(AsmInstr::Ld {
            rd: Reg::S0,
            base: Reg::S0,
            offset: 0,
        });
        self.spill(Reg::S0, result);
    }

    fn store(&mut self, value: Value, ptr: Value) {
        self.materialize(Reg::S0, value);
        self.materialize(Reg::S1, ptr);
        self.push(AsmInstr::Sd {
            src: Reg::S0,
            base: Reg::S1,
            offset: 0,
        });
    }

    /// Accumulate the address walk into s0: the leading index scales by
    /// the source type's allocation size, struct indices add constant
    /// field offsets, array indices scale by element size.
    fn gep(
        &mut self,
        result: ValueId,
        source_ty: TypeId,
        base: Value,
        indices: &[Value],
    ) -> Result<(), Fault> {
        let types = &self.module.types;
        self.materialize(Reg::S0, base);
        let mut cur = source_ty;
        if let Some(first) = indices.first() {
            if first.as_const() != Some(0) {
                self.materialize(Reg::S1, *first);
                self.push(AsmInstr::Li {
                    rd: Reg::S2,
                    imm: types.alloc_size(cur) as i64,
                });
                self.push(AsmInstr::Bin {
                    op: AluOp::Mul,
                    rd: Reg::S1,
                    rs1: Reg::S1,
                    rs2: Reg::S2,
                });
                self.push(AsmInstr::Bin {
                    op: AluOp::Add,
                    rd: Reg::S0,
                    rs1: Reg::S0,
                    rs2: Reg::S1,
                });
            }
        }
        for index in indices.iter().skip(1) {
            match types.get(cur).clone() {
                Type::Struct { fields } => {
                    let field = index
                        .as_const()
                        .ok_or(Fault::NonConstStructIndex)? as usize;
                    if field >= fields.len() {
                        return Err(Fault::StructFieldRange);
                    }
                    self.push(AsmInstr::Li {
                        rd: Reg::S1,
                        imm: types.field_offset(cur, field) as i64,
                    });
                    self.push(AsmInstr::Bin {
                        op: AluOp::Add,
                        rd: Reg::S0,
                        rs1: Reg::S0,
                        rs2: Reg::S1,
                    });
                    cur = fields[field];
                }
                Type::Array { elem, .. } => {
                    self.materialize(Reg::S1, *index);
                    self.push(AsmInstr::Li {
                        rd: Reg::S2,
                        imm: types.alloc_size(elem) as i64,
                    });
                    self.push(AsmInstr::Bin {
                        op: AluOp::Mul,
                        rd: Reg::S1,
                        rs1: Reg::S1,
                        rs2: Reg::S2,
                    });
                    self.push(AsmInstr::Bin {
                        op: AluOp::Add,
                        rd: Reg::S0,
                        rs1: Reg::S0,
                        rs2: Reg::S1,
                    });
                    cur = elem;
                }
                _ => return Err(Fault::GepUnsupportedType),
            }
        }
        self.spill(Reg::S0, result);
        Ok(())
    }
}

/// Build a segment covering `block` from instruction `start` to its
/// first non-local transfer.
pub fn build_segment(
    module: &Module,
    heap: &mut Heap,
    block_id: BlockId,
    start: usize,
    style: CompareStyle,
) -> Result<Segment, Fault> {
    let block = module.block(block_id);
    let mut b = Builder {
        module,
        instrs: Vec::new(),
        shadow: ShadowEnv::default(),
    };
    b.reg_save();

    let mut terminator = None;
    let mut continuation = None;
    for (offset, instr) in block.instrs.iter().enumerate().skip(start) {
        match &instr.op {
            Op::Bin { op, lhs, rhs } => b.binary(alu_op(*op), instr.result, *lhs, *rhs),
            Op::Icmp { pred, lhs, rhs } => b.compare(style, *pred, instr.result, *lhs, *rhs)?,
            Op::Load { ptr } => b.load(instr.result, *ptr),
            Op::Store { value, ptr } => b.store(*value, *ptr),
            Op::Gep {
                source_ty,
                base,
                indices,
            } => b.gep(instr.result, *source_ty, *base, indices)?,
            Op::Alloca { ty } => {
                // no code: the region exists before the segment ever runs
                let addr = heap.alloc(&module.types, *ty)?;
                b.shadow.install(instr.result, addr);
            }
            Op::Ret { .. } | Op::Br { .. } | Op::CondBr { .. } => {
                terminator = Some(instr.clone());
                break;
            }
            Op::Call { .. } => {
                terminator = Some(instr.clone());
                continuation = Some(Box::new(build_segment(
                    module,
                    heap,
                    block_id,
                    offset + 1,
                    style,
                )?));
                break;
            }
            // not compiled at this tier
            Op::Phi { .. } | Op::Sext { .. } => {}
        }
    }

    b.reg_load();
    b.push(AsmInstr::Ret);

    let bytes = encode(&b.instrs);
    let region = ExecRegion::new(&bytes)?;
    tracing::debug!(
        block = ?block_id,
        instructions = b.instrs.len(),
        bytes = bytes.len(),
        "assembled native segment"
    );

    Ok(Segment {
        block: block_id,
        instrs: b.instrs,
        region,
        shadow: b.shadow,
        terminator,
        continuation,
    })
}

fn imm_i(word: u32) -> i64 {
    i64::from((word as i32) >> 20)
}

fn imm_s(word: u32) -> i64 {
    i64::from(((word & 0xfe00_0000) as i32) >> 20) | i64::from((word >> 7) & 0x1f)
}

/// Execute a segment's words on an in-process RV64IM core. Loads and
/// stores dereference the absolute host addresses baked into the stream.
/// The scratch stack gives the prologue's sp-relative spill slots a place
/// to land without touching the host stack.
fn emulate(code: &[u8]) -> Result<(), Fault> {
    const SCRATCH: usize = 64;
    let mut scratch = [0u8; SCRATCH];
    let mut x = [0i64; 32];
    x[Reg::Sp.id() as usize] = scratch.as_mut_ptr() as i64 + SCRATCH as i64;

    let mut pc = 0usize;
    while pc + 4 <= code.len() {
        let word = u32::from_le_bytes(
            code[pc..pc + 4]
                .try_into()
                .expect("slice is exactly four bytes"),
        );
        let rd = ((word >> 7) & 0x1f) as usize;
        let funct3 = (word >> 12) & 0x7;
        let rs1 = x[((word >> 15) & 0x1f) as usize];
        let rs2 = x[((word >> 20) & 0x1f) as usize];
        let funct7 = word >> 25;

        match word & 0x7f {
            0x37 => x[rd] = i64::from((word & 0xffff_f000) as i32),
            0x13 => match funct3 {
                0x0 => x[rd] = rs1.wrapping_add(imm_i(word)),
                0x1 => x[rd] = rs1 << ((word >> 20) & 0x3f),
                _ => return Err(Fault::IllegalWord(word)),
            },
            0x03 if funct3 == 0x3 => {
                let addr = rs1.wrapping_add(imm_i(word));
                x[rd] = unsafe { std::ptr::read_unaligned(addr as *const i64) };
            }
            0x23 if funct3 == 0x3 => {
                let addr = rs1.wrapping_add(imm_s(word));
                unsafe { std::ptr::write_unaligned(addr as *mut i64, rs2) };
            }
            0x33 => {
                x[rd] = match (funct3, funct7) {
                    (0x0, 0x00) => rs1.wrapping_add(rs2),
                    (0x0, 0x20) => rs1.wrapping_sub(rs2),
                    (0x0, 0x01) => rs1.wrapping_mul(rs2),
                    // div/rem follow the ISA: no traps, zero divisor
                    // yields -1 / the dividend
                    (0x4, 0x01) => {
                        if rs2 == 0 {
                            -1
                        } else {
                            rs1.wrapping_div(rs2)
                        }
                    }
                    (0x6, 0x01) => {
                        if rs2 == 0 {
                            rs1
                        } else {
                            rs1.wrapping_rem(rs2)
                        }
                    }
                    (0x7, 0x00) => rs1 & rs2,
                    (0x6, 0x00) => rs1 | rs2,
                    (0x4, 0x00) => rs1 ^ rs2,
                    (0x1, 0x00) => rs1 << (rs2 & 0x3f),
                    (0x5, 0x00) => ((rs1 as u64) >> (rs2 & 0x3f)) as i64,
                    (0x5, 0x20) => rs1 >> (rs2 & 0x3f),
                    (0x2, 0x00) => i64::from(rs1 < rs2),
                    (0x3, 0x00) => i64::from((rs1 as u64) < (rs2 as u64)),
                    _ => return Err(Fault::IllegalWord(word)),
                };
            }
            0x67 => return Ok(()),
            _ => return Err(Fault::IllegalWord(word)),
        }
        x[0] = 0;
        pc += 4;
    }
    // the builder terminates every segment with ret
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    /// Run a handwritten sequence through the emulated core.
    fn run_instrs(instrs: &[AsmInstr]) {
        emulate(&encode(instrs)).expect("sequence should execute");
    }

    #[test]
    fn li_store_round_trip_through_core() {
        for value in [0i64, 1, -1, 42, 0x1234_5678_9abc_def0u64 as i64, i64::MIN] {
            let cell = UnsafeCell::new(0i64);
            run_instrs(&[
                AsmInstr::Li {
                    rd: Reg::S0,
                    imm: value,
                },
                AsmInstr::Li {
                    rd: Reg::S4,
                    imm: cell.get() as i64,
                },
                AsmInstr::Sd {
                    src: Reg::S0,
                    base: Reg::S4,
                    offset: 0,
                },
                AsmInstr::Ret,
            ]);
            assert_eq!(unsafe { *cell.get() }, value);
        }
    }

    fn eval_compare(pred: Pred, lhs: i64, rhs: i64) -> i64 {
        let module = Module::default();
        let mut b = Builder {
            module: &module,
            instrs: Vec::new(),
            shadow: ShadowEnv::default(),
        };
        b.compare(
            CompareStyle::Legal,
            pred,
            ValueId(0),
            Value::Const(lhs),
            Value::Const(rhs),
        )
        .expect("legal lowering covers every predicate");
        let addr = b.shadow.slot_addr(ValueId(0));
        b.push(AsmInstr::Ret);
        run_instrs(&b.instrs);
        unsafe { *(addr as *const i64) }
    }

    #[test]
    fn legal_compare_lowerings() {
        let cases = [(3i64, 5i64), (5, 3), (4, 4), (-2, 2), (i64::MIN, i64::MAX)];
        for (lhs, rhs) in cases {
            assert_eq!(eval_compare(Pred::Eq, lhs, rhs), i64::from(lhs == rhs));
            assert_eq!(eval_compare(Pred::Ne, lhs, rhs), i64::from(lhs != rhs));
            assert_eq!(eval_compare(Pred::Slt, lhs, rhs), i64::from(lhs < rhs));
            assert_eq!(eval_compare(Pred::Sle, lhs, rhs), i64::from(lhs <= rhs));
            assert_eq!(eval_compare(Pred::Sgt, lhs, rhs), i64::from(lhs > rhs));
            assert_eq!(eval_compare(Pred::Sge, lhs, rhs), i64::from(lhs >= rhs));
        }
    }

    #[test]
    fn tagged_mode_rejects_sle() {
        let module = Module::default();
        let mut b = Builder {
            module: &module,
            instrs: Vec::new(),
            shadow: ShadowEnv::default(),
        };
        let result = b.compare(
            CompareStyle::Tagged,
            Pred::Sle,
            ValueId(0),
            Value::Const(1),
            Value::Const(2),
        );
        assert!(matches!(result, Err(Fault::UnsupportedPredicate)));
    }

    fn build_for(src: &str) -> Segment {
        let module = parse_module(src).unwrap();
        let mut heap = Heap::default();
        let block = module.entry(module.func_by_name("main").unwrap());
        build_segment(&module, &mut heap, block, 0, CompareStyle::Legal).unwrap()
    }

    #[test]
    fn segment_has_prologue_epilogue_and_ret() {
        let seg = build_for("define i64 @main() {\n  ret i64 0\n}\n");
        let n = seg.instrs.len();
        // five stores down from sp, five loads back, final ret
        for i in 0..5 {
            assert!(matches!(
                seg.instrs[i],
                AsmInstr::Sd {
                    base: Reg::Sp,
                    ..
                }
            ));
        }
        for i in n - 6..n - 1 {
            assert!(matches!(
                seg.instrs[i],
                AsmInstr::Ld {
                    base: Reg::Sp,
                    ..
                }
            ));
        }
        assert_eq!(seg.instrs[n - 1], AsmInstr::Ret);
        assert!(seg.terminator.is_some());
    }

    #[test]
    fn segment_computes_through_shadow_slots() {
        let src = "define i64 @main() {\n  %x = add i64 20, 22\n  ret i64 %x\n}\n";
        let module = parse_module(src).unwrap();
        let mut heap = Heap::default();
        let block = module.entry(module.func_by_name("main").unwrap());
        let seg = build_segment(&module, &mut heap, block, 0, CompareStyle::Legal).unwrap();
        seg.run(Backend::Emulated).unwrap();
        let result = module.funcs[0].blocks[0].instrs[0].result;
        assert_eq!(seg.shadow.read(result), Some(42));
    }

    #[test]
    fn call_grows_a_continuation() {
        let src = r#"
define i64 @id(i64 %n) {
  ret i64 %n
}
define i64 @main() {
  %a = add i64 1, 2
  %b = call i64 @id(i64 %a)
  %c = mul i64 %b, 10
  ret i64 %c
}
"#;
        let module = parse_module(src).unwrap();
        let mut heap = Heap::default();
        let block = module.entry(module.func_by_name("main").unwrap());
        let seg = build_segment(&module, &mut heap, block, 0, CompareStyle::Legal).unwrap();
        assert!(matches!(
            seg.terminator.as_ref().map(|t| &t.op),
            Some(Op::Call { .. })
        ));
        let cont = seg.continuation.as_ref().expect("call ends the segment");
        assert!(matches!(
            cont.terminator.as_ref().map(|t| &t.op),
            Some(Op::Ret { .. })
        ));
        assert!(cont.continuation.is_none());
    }

    #[test]
    fn alloca_preinstalls_heap_address() {
        let src = "define i64 @main() {\n  %p = alloca i64, align 8\n  ret i64 0\n}\n";
        let module = parse_module(src).unwrap();
        let mut heap = Heap::default();
        let block = module.entry(module.func_by_name("main").unwrap());
        let seg = build_segment(&module, &mut heap, block, 0, CompareStyle::Legal).unwrap();
        let p = module.funcs[0].blocks[0].instrs[0].result;
        let addr = seg.shadow.read(p).expect("alloca owns a slot");
        assert_ne!(addr, 0);
    }
}
