//! Jump-table recovery.
//!
//! When an indirect jump ends a path, the instructions decoded just before
//! it are matched against the dispatch sequences real-mode compilers emit:
//!
//! 1. **TableShift**: `cmp r,N; ja default; [mov x,r]; shl x,1; jmp cs:[x+table]`
//! 2. **TableSkipJump**: `cmp r,N; jbe +2/+3; jmp default; [mov x,r]; shl x,1; jmp cs:[x+table]`
//! 3. **TableBiased**: `sub r,K; cmp r,N; ja default; [mov x,r]; shl x,1; jmp cs:[x+table]`
//! 4. **TableXchg**: `cmp r,N; ja default; xchg r,x; shl x,1; jmp cs:[x+table]`
//! 5. **SparseSearch**: a `loop` over a value table followed by a jump
//!    through the parallel target table:
//!    ```text
//!    mov cx, N
//!    mov bx, table
//!    L: cmp r, cs:[bx]
//!       je  found          ; displacement 7 or 8
//!       add bx, 2
//!       loop L
//!       jmp default
//!    found: jmp cs:[bx + 2*N]
//!    ```
//!
//! Tables are read from the code segment. A window that matches no shape
//! yields `None`; the caller logs it and leaves the path unexplored.

use tracing::debug;

use dosrec_core::{Condition, Instruction, Mnemonic, Operand, Register, RmBase, SegOff, Segment};

/// `JBE` displacements that skip a short (2) or near (3) default `JMP`.
const SKIP_DISPLACEMENTS: [i16; 2] = [2, 3];

/// `JE` displacements from the search loop to the dispatch jump, behind a
/// short (7) or near (8) default `JMP`.
const SEARCH_DISPLACEMENTS: [i16; 2] = [7, 8];

/// Largest table accepted.
const MAX_CASES: usize = 1024;

/// The dispatch sequence a switch was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchShape {
    TableShift,
    TableSkipJump,
    TableBiased,
    TableXchg,
    SparseSearch,
}

impl SwitchShape {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TableShift => "table-shift",
            Self::TableSkipJump => "table-skip-jump",
            Self::TableBiased => "table-biased",
            Self::TableXchg => "table-xchg",
            Self::SparseSearch => "sparse-search",
        }
    }
}

/// A recovered jump table.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchTable {
    pub shape: SwitchShape,
    /// The value switched on.
    pub selector: Operand,
    /// `(case value, target)` pairs in table order.
    pub cases: Vec<(i32, u16)>,
    pub default: u16,
    /// Address of the table in the code segment.
    pub table: u16,
    /// Offsets of every instruction the dispatch replaces, ending with the
    /// indirect jump.
    pub covered: Vec<u16>,
    start: SegOff,
    size: u8,
}

impl SwitchTable {
    /// Every target, cases first, default last.
    pub fn targets(&self) -> impl Iterator<Item = u16> + '_ {
        self.cases
            .iter()
            .map(|(_, target)| *target)
            .chain(std::iter::once(self.default))
    }

    /// The SWITCH pseudo-instruction spanning the whole dispatch sequence.
    pub fn to_instruction(&self) -> Instruction {
        let mut operands = Vec::with_capacity(self.cases.len() + 2);
        operands.push(self.selector.clone());
        operands.extend(
            self.cases
                .iter()
                .map(|&(value, target)| Operand::Case { value, target }),
        );
        operands.push(Operand::Default {
            target: self.default,
        });
        let mut inst =
            Instruction::new(self.start, self.size, Mnemonic::Switch).with_operands(operands);
        inst.synthetic = true;
        inst
    }
}

/// Matches `window` (contiguous instructions ending with an indirect jump)
/// against the known dispatch shapes.
pub fn recognize(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let recognizers: [fn(&[Instruction], &Segment) -> Option<SwitchTable>; 5] = [
        sparse_search,
        table_biased,
        table_skip_jump,
        table_xchg,
        table_shift,
    ];
    let table = recognizers
        .iter()
        .find_map(|recognize| recognize(window, code))?;
    debug!(
        shape = table.shape.name(),
        table = format_args!("{:04X}", table.table),
        cases = table.cases.len(),
        "recovered switch"
    );
    Some(table)
}

/// The `[mov x,r]; shl x,1; jmp cs:[x+table]` tail shared by the table
/// shapes.
struct Dispatch {
    /// Index of the first dispatch instruction in the window.
    first: usize,
    /// Register holding the case index before doubling.
    selector: Register,
    table: u16,
}

fn dispatch(window: &[Instruction]) -> Option<Dispatch> {
    let n = window.len();
    let (index, table) = table_jump(window.last()?)?;
    let shift = window.get(n.checked_sub(2)?)?;
    if !doubles(shift, index) {
        return None;
    }
    if let Some(copy) = n.checked_sub(3).and_then(|i| window.get(i)) {
        if let Some(source) = copy_source(copy, index) {
            return Some(Dispatch {
                first: n - 3,
                selector: source,
                table,
            });
        }
    }
    Some(Dispatch {
        first: n - 2,
        selector: index,
        table,
    })
}

fn table_shift(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let d = dispatch(window)?;
    let ja = window.get(d.first.checked_sub(1)?)?;
    let cmp = window.get(d.first.checked_sub(2)?)?;
    let default = branch(ja, Condition::Above)?.1;
    let (reg, bound) = compare_immediate(cmp)?;
    if reg != d.selector {
        return None;
    }
    dense(SwitchShape::TableShift, window, d.first - 2, reg, 0, bound, default, d.table, code)
}

fn table_skip_jump(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let d = dispatch(window)?;
    let jmp = window.get(d.first.checked_sub(1)?)?;
    let jbe = window.get(d.first.checked_sub(2)?)?;
    let cmp = window.get(d.first.checked_sub(3)?)?;
    let default = direct_jump(jmp)?;
    let (displacement, skip_to) = branch(jbe, Condition::BelowOrEqual)?;
    if !SKIP_DISPLACEMENTS.contains(&displacement) || skip_to != window[d.first].offset() {
        return None;
    }
    let (reg, bound) = compare_immediate(cmp)?;
    if reg != d.selector {
        return None;
    }
    dense(SwitchShape::TableSkipJump, window, d.first - 3, reg, 0, bound, default, d.table, code)
}

fn table_biased(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let d = dispatch(window)?;
    let ja = window.get(d.first.checked_sub(1)?)?;
    let cmp = window.get(d.first.checked_sub(2)?)?;
    let sub = window.get(d.first.checked_sub(3)?)?;
    let default = branch(ja, Condition::Above)?.1;
    let (reg, bound) = compare_immediate(cmp)?;
    if reg != d.selector || sub.mnemonic != Mnemonic::Sub {
        return None;
    }
    if sub.op(0).and_then(Operand::as_register) != Some(reg) {
        return None;
    }
    // the bias word is signed
    let bias = i32::from(sub.op(1).and_then(Operand::as_immediate)? as u16 as i16);
    dense(SwitchShape::TableBiased, window, d.first - 3, reg, bias, bound, default, d.table, code)
}

fn table_xchg(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let d = dispatch(window)?;
    let xchg = window.get(d.first.checked_sub(1)?)?;
    let ja = window.get(d.first.checked_sub(2)?)?;
    let cmp = window.get(d.first.checked_sub(3)?)?;
    let default = branch(ja, Condition::Above)?.1;
    let (reg, bound) = compare_immediate(cmp)?;
    if !exchanges(xchg, reg, d.selector) {
        return None;
    }
    dense(SwitchShape::TableXchg, window, d.first - 3, reg, 0, bound, default, d.table, code)
}

fn sparse_search(window: &[Instruction], code: &Segment) -> Option<SwitchTable> {
    let n = window.len();
    let start = n.checked_sub(8)?;
    let w = &window[start..];
    let (index, dispatch_table) = table_jump(&w[7])?;
    if index != Register::BX {
        return None;
    }
    let count = load_immediate(&w[0], Register::CX)?;
    let table = load_immediate(&w[1], Register::BX)?;
    let selector = compare_with_table(&w[2])?;
    let (displacement, found) = branch(&w[3], Condition::Equal)?;
    if !SEARCH_DISPLACEMENTS.contains(&displacement) || found != w[7].offset() {
        return None;
    }
    if !adds(&w[4], Register::BX, 2) {
        return None;
    }
    if w[5].mnemonic != Mnemonic::Loop
        || w[5].op(0).and_then(Operand::branch_target) != Some(w[2].offset())
    {
        return None;
    }
    let default = direct_jump(&w[6])?;

    let count = usize::from(count);
    if count == 0 || count > MAX_CASES {
        return None;
    }
    if dispatch_table != table.wrapping_add((count * 2) as u16) {
        return None;
    }
    let values = read_words(code, table, count)?;
    let targets = read_words(code, dispatch_table, count)?;
    if !targets.iter().chain(Some(&default)).all(|t| code.contains(*t)) {
        return None;
    }

    Some(SwitchTable {
        shape: SwitchShape::SparseSearch,
        selector: Operand::reg(selector),
        cases: values
            .into_iter()
            .map(|v| v as i16 as i32)
            .zip(targets)
            .collect(),
        default,
        table,
        covered: w.iter().map(Instruction::offset).collect(),
        start: w[0].address,
        size: span(w)?,
    })
}

/// Builds a dense table switch of `bound + 1` cases starting at `bias`.
#[allow(clippy::too_many_arguments)]
fn dense(
    shape: SwitchShape,
    window: &[Instruction],
    first: usize,
    selector: Register,
    bias: i32,
    bound: i32,
    default: u16,
    table: u16,
    code: &Segment,
) -> Option<SwitchTable> {
    let count = usize::try_from(bound).ok()?.checked_add(1)?;
    if count > MAX_CASES || !code.contains(default) {
        return None;
    }
    let targets = read_words(code, table, count)?;
    if !targets.iter().all(|t| code.contains(*t)) {
        return None;
    }
    let covered = &window[first..];
    Some(SwitchTable {
        shape,
        selector: Operand::reg(selector),
        cases: targets
            .into_iter()
            .enumerate()
            .map(|(i, target)| (bias + i as i32, target))
            .collect(),
        default,
        table,
        covered: covered.iter().map(Instruction::offset).collect(),
        start: covered[0].address,
        size: span(covered)?,
    })
}

fn span(instructions: &[Instruction]) -> Option<u8> {
    let first = instructions.first()?;
    let last = instructions.last()?;
    u8::try_from(last.end_offset().wrapping_sub(first.offset())).ok()
}

fn read_words(code: &Segment, at: u16, count: usize) -> Option<Vec<u16>> {
    (0..count)
        .map(|i| code.read_u16(at.wrapping_add((i * 2) as u16)).ok())
        .collect()
}

/// `jmp cs:[x + table]` with `x` one of BX, SI, DI.
fn table_jump(inst: &Instruction) -> Option<(Register, u16)> {
    if inst.mnemonic != Mnemonic::Jmp {
        return None;
    }
    let mem = inst.op(0)?.as_memory()?;
    if mem.segment_register() != Some(Register::CS) {
        return None;
    }
    let index = match mem.mode.base()? {
        RmBase::Bx => Register::BX,
        RmBase::Si => Register::SI,
        RmBase::Di => Register::DI,
        _ => return None,
    };
    Some((index, mem.displacement as u16))
}

/// `shl x,1` or `add x,x`.
fn doubles(inst: &Instruction, reg: Register) -> bool {
    let dst = inst.op(0).and_then(Operand::as_register);
    match inst.mnemonic {
        Mnemonic::Shl => dst == Some(reg) && inst.op(1).and_then(Operand::as_immediate) == Some(1),
        Mnemonic::Add => dst == Some(reg) && inst.op(1).and_then(Operand::as_register) == Some(reg),
        _ => false,
    }
}

/// Source of `mov dst, src` between two distinct word registers.
fn copy_source(inst: &Instruction, dst: Register) -> Option<Register> {
    if inst.mnemonic != Mnemonic::Mov || inst.op(0)?.as_register()? != dst {
        return None;
    }
    let src = inst.op(1)?.as_register()?;
    (src != dst && src.is_general() && src.size == 16).then_some(src)
}

fn exchanges(inst: &Instruction, a: Register, b: Register) -> bool {
    if inst.mnemonic != Mnemonic::Xchg || a == b {
        return false;
    }
    let x = inst.op(0).and_then(Operand::as_register);
    let y = inst.op(1).and_then(Operand::as_register);
    (x == Some(a) && y == Some(b)) || (x == Some(b) && y == Some(a))
}

/// `cmp r16, imm`.
fn compare_immediate(inst: &Instruction) -> Option<(Register, i32)> {
    if inst.mnemonic != Mnemonic::Cmp {
        return None;
    }
    let reg = inst.op(0)?.as_register()?;
    if !reg.is_general() || reg.size != 16 {
        return None;
    }
    Some((reg, inst.op(1)?.as_immediate()?))
}

/// `cmp r, cs:[bx]` in either operand order.
fn compare_with_table(inst: &Instruction) -> Option<Register> {
    if inst.mnemonic != Mnemonic::Cmp {
        return None;
    }
    let (reg, mem) = match (inst.op(0)?, inst.op(1)?) {
        (Operand::Register(reg), Operand::Memory(mem)) => (*reg, mem),
        (Operand::Memory(mem), Operand::Register(reg)) => (*reg, mem),
        _ => return None,
    };
    let at_bx = mem.mode.base() == Some(RmBase::Bx) && mem.displacement == 0;
    (at_bx && mem.segment_register() == Some(Register::CS)).then_some(reg)
}

/// `mov reg, imm16`.
fn load_immediate(inst: &Instruction, reg: Register) -> Option<u16> {
    if inst.mnemonic != Mnemonic::Mov || inst.op(0)?.as_register()? != reg {
        return None;
    }
    Some(inst.op(1)?.as_immediate()? as u16)
}

fn adds(inst: &Instruction, reg: Register, value: i32) -> bool {
    inst.mnemonic == Mnemonic::Add
        && inst.op(0).and_then(Operand::as_register) == Some(reg)
        && inst.op(1).and_then(Operand::as_immediate) == Some(value)
}

/// Displacement and target of a `Jcc` with the given condition.
fn branch(inst: &Instruction, condition: Condition) -> Option<(i16, u16)> {
    if inst.mnemonic != Mnemonic::Jcc(condition) {
        return None;
    }
    match inst.op(0)? {
        Operand::Relative {
            displacement,
            target,
        } => Some((*displacement, *target)),
        _ => None,
    }
}

fn direct_jump(inst: &Instruction) -> Option<u16> {
    if inst.mnemonic != Mnemonic::Jmp {
        return None;
    }
    match inst.op(0)? {
        Operand::Relative { target, .. } => Some(*target),
        _ => None,
    }
}
