//! Low-Level IR (LIR) consumed by the register allocator
//!
//! LIR is a generic machine-level form: every instruction is an opcode with
//! ordered destination and source operands. Values live in virtual registers,
//! in hard registers, or in variables. Virtual registers and variables whose
//! address is never taken are register candidates; allocatable hard
//! registers take part in allocation as precolored values.

use std::collections::HashMap;
use std::fmt;

use super::reg_info::{HardReg, RegClassId};

/// Virtual register ID - unlimited, will be allocated to physical registers later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Variable identifier (locals, parameters, globals and spill homes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// An instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Virtual register
    VReg(VReg),
    /// Physical register
    Hard(HardReg),
    /// The value of a variable
    Var(VarId),
    /// The memory home of a variable (effective address, never a register candidate)
    Addr(VarId),
    /// Immediate constant
    Imm(i64),
}

impl Operand {
    pub fn is_hard_reg(&self) -> bool {
        matches!(self, Operand::Hard(_))
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(var) => Some(*var),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::VReg(vreg) => write!(f, "{}", vreg),
            Operand::Hard(reg) => write!(f, "{}", reg),
            Operand::Var(var) => write!(f, "{}", var),
            Operand::Addr(var) => write!(f, "[{}]", var),
            Operand::Imm(value) => write!(f, "{}", value),
        }
    }
}

impl From<VReg> for Operand {
    fn from(vreg: VReg) -> Self {
        Operand::VReg(vreg)
    }
}

impl From<HardReg> for Operand {
    fn from(reg: HardReg) -> Self {
        Operand::Hard(reg)
    }
}

/// Binary operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Bitwise
    And,
    Or,
    Xor,
    Shl,
    Shr,

    // Comparison (result is 0 or 1)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for BinOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOpKind::Add => "add",
            BinOpKind::Sub => "sub",
            BinOpKind::Mul => "mul",
            BinOpKind::Div => "div",
            BinOpKind::Mod => "mod",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
            BinOpKind::Xor => "xor",
            BinOpKind::Shl => "shl",
            BinOpKind::Shr => "shr",
            BinOpKind::Eq => "eq",
            BinOpKind::Ne => "ne",
            BinOpKind::Lt => "lt",
            BinOpKind::Le => "le",
            BinOpKind::Gt => "gt",
            BinOpKind::Ge => "ge",
        };
        write!(f, "{}", s)
    }
}

/// Unary operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpKind {
    Neg,
    Not,
}

impl fmt::Display for UnaryOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOpKind::Neg => write!(f, "neg"),
            UnaryOpKind::Not => write!(f, "not"),
        }
    }
}

/// Instruction opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Register-to-register copy: `dst = src`
    Copy,
    /// `dst = load [addr]`
    Load,
    /// `[addr] = store src`
    Store,
    Binary(BinOpKind),
    Unary(UnaryOpKind),
    /// Procedure call; destinations are results, sources are arguments
    Call,
    Nop,
    // Terminators
    Jump(BlockId),
    Branch { if_true: BlockId, if_false: BlockId },
    Return,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Copy => write!(f, "copy"),
            Opcode::Load => write!(f, "load"),
            Opcode::Store => write!(f, "store"),
            Opcode::Binary(op) => write!(f, "{}", op),
            Opcode::Unary(op) => write!(f, "{}", op),
            Opcode::Call => write!(f, "call"),
            Opcode::Nop => write!(f, "nop"),
            Opcode::Jump(target) => write!(f, "jump {}", target),
            Opcode::Branch { if_true, if_false } => write!(f, "branch {}, {}", if_true, if_false),
            Opcode::Return => write!(f, "ret"),
        }
    }
}

/// Annotation attached to instructions inserted by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstNote {
    /// Fill or spill inserted because a candidate failed to color
    SpillCode,
    /// Entry load of a stack-passed parameter promoted to a register
    ParamInit,
}

/// Position of an operand within an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSlot {
    Dst(usize),
    Src(usize),
}

impl OperandSlot {
    pub fn is_src(self) -> bool {
        matches!(self, OperandSlot::Src(_))
    }
}

/// LIR instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub opcode: Opcode,
    pub dsts: Vec<Operand>,
    pub srcs: Vec<Operand>,
    pub note: Option<InstNote>,
}

impl Inst {
    pub fn new(opcode: Opcode, dsts: Vec<Operand>, srcs: Vec<Operand>) -> Self {
        Self {
            opcode,
            dsts,
            srcs,
            note: None,
        }
    }

    pub fn copy(dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Self::new(Opcode::Copy, vec![dst.into()], vec![src.into()])
    }

    pub fn load(dst: impl Into<Operand>, var: VarId) -> Self {
        Self::new(Opcode::Load, vec![dst.into()], vec![Operand::Addr(var)])
    }

    pub fn store(var: VarId, src: impl Into<Operand>) -> Self {
        Self::new(Opcode::Store, vec![Operand::Addr(var)], vec![src.into()])
    }

    pub fn binary(
        op: BinOpKind,
        dst: impl Into<Operand>,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Self {
        Self::new(
            Opcode::Binary(op),
            vec![dst.into()],
            vec![lhs.into(), rhs.into()],
        )
    }

    pub fn unary(op: UnaryOpKind, dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Self::new(Opcode::Unary(op), vec![dst.into()], vec![src.into()])
    }

    pub fn call(results: Vec<Operand>, args: Vec<Operand>) -> Self {
        Self::new(Opcode::Call, results, args)
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Vec::new(), Vec::new())
    }

    pub fn jump(target: BlockId) -> Self {
        Self::new(Opcode::Jump(target), Vec::new(), Vec::new())
    }

    pub fn branch(cond: impl Into<Operand>, if_true: BlockId, if_false: BlockId) -> Self {
        Self::new(
            Opcode::Branch { if_true, if_false },
            Vec::new(),
            vec![cond.into()],
        )
    }

    pub fn ret(value: Option<Operand>) -> Self {
        Self::new(Opcode::Return, Vec::new(), value.into_iter().collect())
    }

    pub fn with_note(mut self, note: InstNote) -> Self {
        self.note = Some(note);
        self
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Jump(_) | Opcode::Branch { .. } | Opcode::Return
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.opcode {
            Opcode::Jump(target) => vec![target],
            Opcode::Branch { if_true, if_false } => vec![if_true, if_false],
            _ => vec![],
        }
    }

    /// All operands, destinations first
    pub fn operands(&self) -> impl Iterator<Item = (OperandSlot, &Operand)> {
        let dsts = self
            .dsts
            .iter()
            .enumerate()
            .map(|(i, opnd)| (OperandSlot::Dst(i), opnd));
        let srcs = self
            .srcs
            .iter()
            .enumerate()
            .map(|(i, opnd)| (OperandSlot::Src(i), opnd));
        dsts.chain(srcs)
    }

    pub fn operand(&self, slot: OperandSlot) -> Option<&Operand> {
        match slot {
            OperandSlot::Dst(i) => self.dsts.get(i),
            OperandSlot::Src(i) => self.srcs.get(i),
        }
    }

    pub fn operand_mut(&mut self, slot: OperandSlot) -> Option<&mut Operand> {
        match slot {
            OperandSlot::Dst(i) => self.dsts.get_mut(i),
            OperandSlot::Src(i) => self.srcs.get_mut(i),
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.dsts.is_empty() {
            for (i, dst) in self.dsts.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", dst)?;
            }
            write!(f, " = ")?;
        }
        write!(f, "{}", self.opcode)?;
        for (i, src) in self.srcs.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, src)?;
        }
        match self.note {
            Some(InstNote::SpillCode) => write!(f, "  ; spill"),
            Some(InstNote::ParamInit) => write!(f, "  ; param init"),
            None => Ok(()),
        }
    }
}

/// Location of an instruction: block plus index, where the index equal to
/// the instruction count names the terminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstHandle {
    pub block: BlockId,
    pub index: usize,
}

/// LIR basic block
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<Inst>,
    pub terminator: Inst,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: Inst::ret(None),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }

    /// Number of instructions including the terminator
    pub fn inst_count(&self) -> usize {
        self.instructions.len() + 1
    }

    pub fn inst(&self, index: usize) -> &Inst {
        if index == self.instructions.len() {
            &self.terminator
        } else {
            &self.instructions[index]
        }
    }

    pub fn inst_mut(&mut self, index: usize) -> &mut Inst {
        if index == self.instructions.len() {
            &mut self.terminator
        } else {
            &mut self.instructions[index]
        }
    }

    /// Instructions in order, terminator last
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Inst> {
        self.instructions
            .iter()
            .chain(std::iter::once(&self.terminator))
    }
}

/// How a variable is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Function-local automatic variable
    Local,
    /// Formal parameter, passed in `register` or (if `None`) on the stack
    Param { register: Option<HardReg> },
    /// Global variable; never a register candidate
    Global,
    /// Memory home created for a spilled virtual register
    Spill,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub kind: VarKind,
    pub addr_taken: bool,
}

impl Variable {
    /// Local, non-address-taken variables may live in a register
    pub fn is_register_candidate(&self) -> bool {
        !self.addr_taken && self.kind != VarKind::Global
    }

    pub fn is_stack_param(&self) -> bool {
        matches!(self.kind, VarKind::Param { register: None })
    }
}

/// A complete LIR function
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<String>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub vreg_count: u32,
    pub vars: Vec<Variable>,
    /// Formal parameters in declaration order
    pub params: Vec<VarId>,
    /// Register class a virtual register is restricted to, if any
    pub vreg_classes: HashMap<VReg, RegClassId>,
}

impl Function {
    pub fn new() -> Self {
        Self {
            name: None,
            blocks: Vec::new(),
            entry: BlockId(0),
            vreg_count: 0,
            vars: Vec::new(),
            params: Vec::new(),
            vreg_classes: HashMap::new(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn alloc_vreg(&mut self) -> VReg {
        let vreg = VReg(self.vreg_count);
        self.vreg_count += 1;
        vreg
    }

    /// Allocate a virtual register restricted to `class`
    pub fn alloc_vreg_in(&mut self, class: RegClassId) -> VReg {
        let vreg = self.alloc_vreg();
        self.vreg_classes.insert(vreg, class);
        vreg
    }

    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    pub fn alloc_var(&mut self, name: impl Into<String>, kind: VarKind) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable {
            id,
            name: name.into(),
            kind,
            addr_taken: false,
        });
        id
    }

    pub fn alloc_param(&mut self, name: impl Into<String>, register: Option<HardReg>) -> VarId {
        let id = self.alloc_var(name, VarKind::Param { register });
        self.params.push(id);
        id
    }

    /// Create a fresh memory home for a spilled virtual register
    pub fn alloc_spill_var(&mut self, vreg: VReg) -> VarId {
        let name = format!("spill.{}", vreg);
        self.alloc_var(name, VarKind::Spill)
    }

    pub fn var(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0 as usize)
    }

    pub fn var_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.vars.get_mut(id.0 as usize)
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("Block {:?} not found", id))
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("Block {:?} not found", id))
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks.iter().any(|b| b.id == id)
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {}:", self.name.as_deref().unwrap_or("<anon>"))?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.id)?;
            for inst in block.iter() {
                writeln!(f, "    {}", inst)?;
            }
        }
        Ok(())
    }
}
