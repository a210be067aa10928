//! Target hooks used by the allocator
//!
//! The allocator never interprets opcodes itself. Everything it needs to
//! know about a machine (its registers, per-operand register constraints,
//! implicit register effects, what counts as a copy, and how to move a
//! value between a register and memory) comes through [`Target`].

use super::lir::{Inst, InstNote, Opcode, Operand, OperandSlot, VarId};
use super::reg_info::{RegClassId, RegSet, RegisterModel};

pub trait Target {
    fn registers(&self) -> &RegisterModel;

    /// Register class the operand in `slot` of `inst` must be drawn from,
    /// or `None` if the instruction places no constraint on it
    fn operand_class(&self, inst: &Inst, slot: OperandSlot) -> Option<RegClassId> {
        let _ = (inst, slot);
        None
    }

    /// Hard registers written by `inst` without appearing as operands
    fn implicit_defs(&self, inst: &Inst) -> RegSet {
        match inst.opcode {
            Opcode::Call => self.registers().caller_saved(),
            _ => RegSet::empty(),
        }
    }

    /// Hard registers read by `inst` without appearing as operands
    fn implicit_uses(&self, inst: &Inst) -> RegSet {
        let _ = inst;
        RegSet::empty()
    }

    /// Whether `inst` is a plain register-to-register copy
    fn is_move(&self, inst: &Inst) -> bool {
        inst.opcode == Opcode::Copy && inst.dsts.len() == 1 && inst.srcs.len() == 1
    }

    /// Sequence loading the memory home of `var` into `dst`
    fn fill(&self, dst: Operand, var: VarId) -> Vec<Inst> {
        vec![Inst::load(dst, var)]
    }

    /// Sequence storing `src` into the memory home of `var`
    fn spill(&self, var: VarId, src: Operand) -> Vec<Inst> {
        vec![Inst::store(var, src)]
    }

    /// Fill sequence tagged with `note` on every instruction
    fn noted_fill(&self, dst: Operand, var: VarId, note: Option<InstNote>) -> Vec<Inst> {
        tag(self.fill(dst, var), note)
    }

    /// Spill sequence tagged with `note` on every instruction
    fn noted_spill(&self, var: VarId, src: Operand, note: Option<InstNote>) -> Vec<Inst> {
        tag(self.spill(var, src), note)
    }
}

fn tag(mut seq: Vec<Inst>, note: Option<InstNote>) -> Vec<Inst> {
    if note.is_some() {
        for inst in &mut seq {
            inst.note = note;
        }
    }
    seq
}

/// A target described entirely by its register model, using the default
/// hooks: calls clobber the caller-saved pool and copies are `Opcode::Copy`
#[derive(Debug, Clone)]
pub struct GenericTarget {
    model: RegisterModel,
}

impl GenericTarget {
    pub fn new(model: RegisterModel) -> Self {
        Self { model }
    }
}

impl Target for GenericTarget {
    fn registers(&self) -> &RegisterModel {
        &self.model
    }
}
