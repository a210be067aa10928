use std::collections::HashMap;

use super::*;
use crate::compiler::lir::{BinOpKind, BlockId, Opcode, UnaryOpKind, VarKind};
use crate::compiler::target::GenericTarget;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `caller` caller-saved registers r0.. followed by `callee` callee-saved ones
fn flat_model(caller: usize, callee: usize) -> (RegisterModel, Vec<HardReg>) {
    let mut b = RegisterModel::builder();
    let regs: Vec<HardReg> = (0..caller + callee)
        .map(|i| b.register(format!("r{}", i)))
        .collect();
    b.caller_saved(&regs[..caller]).callee_saved(&regs[caller..]);
    (b.build().unwrap(), regs)
}

/// Four word registers, the first two with addressable byte halves
fn byte_model() -> (RegisterModel, RegClassId, RegClassId) {
    let mut b = RegisterModel::builder();
    let words: Vec<HardReg> = (0..4).map(|i| b.register(format!("w{}", i))).collect();
    let bytes: Vec<HardReg> = (0..2).map(|i| b.register(format!("b{}", i))).collect();
    b.alias(words[0], bytes[0]).alias(words[1], bytes[1]);
    let word = b.class("word", &words);
    let byte = b.class("byte", &bytes);
    b.caller_saved(&words).caller_saved(&bytes);
    (b.build().unwrap(), word, byte)
}

const UNDEFINED: i64 = -1;
const CLOBBERED: i64 = 0x0bad_0000;

/// Execute `func`, returning its result and final memory. Writing a hard
/// register clobbers every register it overlaps, and calls clobber the
/// target's implicit definitions, so a bad assignment changes the outcome.
fn run(func: &Function, target: &dyn Target, memory: &[(VarId, i64)]) -> (i64, HashMap<VarId, i64>) {
    let model = target.registers();
    let mut regs: HashMap<Operand, i64> = HashMap::new();
    let mut mem: HashMap<VarId, i64> = memory.iter().copied().collect();

    let read = |regs: &HashMap<Operand, i64>, mem: &HashMap<VarId, i64>, opnd: &Operand| match opnd
    {
        Operand::Imm(value) => *value,
        Operand::Var(var) | Operand::Addr(var) => mem.get(var).copied().unwrap_or(UNDEFINED),
        other => regs.get(other).copied().unwrap_or(UNDEFINED),
    };
    let write = |regs: &mut HashMap<Operand, i64>,
                 mem: &mut HashMap<VarId, i64>,
                 opnd: &Operand,
                 value: i64| {
        match opnd {
            Operand::Var(var) | Operand::Addr(var) => {
                mem.insert(*var, value);
            }
            Operand::Hard(reg) => {
                for alias in model.aliases(*reg).iter() {
                    regs.insert(Operand::Hard(alias), CLOBBERED + alias.index() as i64);
                }
                regs.insert(*opnd, value);
            }
            other => {
                regs.insert(*other, value);
            }
        }
    };

    let mut block = func.entry;
    for _ in 0..10_000 {
        let b = func.block(block);
        for inst in &b.instructions {
            let srcs: Vec<i64> = inst.srcs.iter().map(|s| read(&regs, &mem, s)).collect();
            let value = match inst.opcode {
                Opcode::Copy | Opcode::Load | Opcode::Store => srcs[0],
                Opcode::Binary(op) => {
                    let (l, r) = (srcs[0], srcs[1]);
                    match op {
                        BinOpKind::Add => l.wrapping_add(r),
                        BinOpKind::Sub => l.wrapping_sub(r),
                        BinOpKind::Mul => l.wrapping_mul(r),
                        BinOpKind::Div => l.checked_div(r).unwrap_or(0),
                        BinOpKind::Mod => l.checked_rem(r).unwrap_or(0),
                        BinOpKind::And => l & r,
                        BinOpKind::Or => l | r,
                        BinOpKind::Xor => l ^ r,
                        BinOpKind::Shl => l.wrapping_shl(r as u32),
                        BinOpKind::Shr => l.wrapping_shr(r as u32),
                        BinOpKind::Eq => i64::from(l == r),
                        BinOpKind::Ne => i64::from(l != r),
                        BinOpKind::Lt => i64::from(l < r),
                        BinOpKind::Le => i64::from(l <= r),
                        BinOpKind::Gt => i64::from(l > r),
                        BinOpKind::Ge => i64::from(l >= r),
                    }
                }
                Opcode::Unary(UnaryOpKind::Neg) => srcs[0].wrapping_neg(),
                Opcode::Unary(UnaryOpKind::Not) => !srcs[0],
                Opcode::Call => {
                    for reg in target.implicit_defs(inst).iter() {
                        write(&mut regs, &mut mem, &Operand::Hard(reg), CLOBBERED);
                    }
                    srcs.iter().sum::<i64>() + 1
                }
                _ => continue,
            };
            for dst in &inst.dsts {
                write(&mut regs, &mut mem, dst, value);
            }
        }

        let term = &b.terminator;
        match term.opcode {
            Opcode::Jump(next) => block = next,
            Opcode::Branch { if_true, if_false } => {
                block = if read(&regs, &mem, &term.srcs[0]) != 0 {
                    if_true
                } else {
                    if_false
                };
            }
            _ => {
                let result = term
                    .srcs
                    .first()
                    .map(|s| read(&regs, &mem, s))
                    .unwrap_or(0);
                return (result, mem);
            }
        }
    }
    panic!("function did not return");
}

/// Every register operand of `func` is a hard register
fn assert_fully_allocated(func: &Function) {
    for block in &func.blocks {
        for inst in block.iter() {
            for (_, opnd) in inst.operands() {
                assert!(
                    matches!(opnd, Operand::Hard(_) | Operand::Imm(_) | Operand::Addr(_)),
                    "unallocated operand {} in `{}`",
                    opnd,
                    inst
                );
            }
        }
    }
}

/// Allocate `func` and check it still computes the same thing
fn allocate_and_check(
    mut func: Function,
    target: &dyn Target,
    config: RagaConfig,
    memory: &[(VarId, i64)],
) -> (Function, AllocationResult) {
    init_logger();
    let var_count = func.vars.len();
    let before = func.clone();
    let result = Raga::new(target, config)
        .allocate(&mut func)
        .unwrap_or_else(|e| panic!("allocation failed: {}\n{}", e, before));
    assert_fully_allocated(&func);

    let (expected, expected_mem) = run(&before, target, memory);
    let (actual, actual_mem) = run(&func, target, memory);
    assert_eq!(expected, actual, "result changed by allocation:\n{}", func);
    for id in 0..var_count as u32 {
        assert_eq!(
            expected_mem.get(&VarId(id)),
            actual_mem.get(&VarId(id)),
            "memory of ${} changed by allocation",
            id
        );
    }
    (func, result)
}

fn make_simple_function() -> Function {
    // v0 = 1
    // v1 = 2
    // v2 = v0 + v1
    // return v2
    let mut func = Function::with_name("simple");
    let bb0 = func.alloc_block();
    func.entry = bb0;

    let v0 = func.alloc_vreg();
    let v1 = func.alloc_vreg();
    let v2 = func.alloc_vreg();

    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Imm(1)));
    block.instructions.push(Inst::copy(v1, Operand::Imm(2)));
    block.instructions.push(Inst::binary(BinOpKind::Add, v2, v0, v1));
    block.terminator = Inst::ret(Some(v2.into()));

    func
}

fn make_coalesce_function() -> Function {
    // v0 = 1
    // v1 = v0  <-- this move should be coalesced
    // return v1
    let mut func = Function::with_name("coalesce");
    let bb0 = func.alloc_block();
    func.entry = bb0;

    let v0 = func.alloc_vreg();
    let v1 = func.alloc_vreg();

    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Imm(1)));
    block.instructions.push(Inst::copy(v1, v0));
    block.terminator = Inst::ret(Some(v1.into()));

    func
}

fn make_triangle_function() -> Function {
    // v0 = 1
    // v1 = 2
    // v2 = 3       <-- v0, v1 and v2 are all live here
    // v2 = v2 + v1
    // v3 = v1 + v2
    // v4 = v3 * v0
    // return v4
    let mut func = Function::with_name("triangle");
    let bb0 = func.alloc_block();
    func.entry = bb0;

    let v: Vec<VReg> = (0..5).map(|_| func.alloc_vreg()).collect();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v[0], Operand::Imm(1)));
    block.instructions.push(Inst::copy(v[1], Operand::Imm(2)));
    block.instructions.push(Inst::copy(v[2], Operand::Imm(3)));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v[2], v[2], v[1]));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v[3], v[1], v[2]));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Mul, v[4], v[3], v[0]));
    block.terminator = Inst::ret(Some(v[4].into()));

    func
}

/// Sum of 0..10 computed in a loop that also makes a call each iteration,
/// with two constants held across the whole loop
fn make_loop_function(ret_reg: HardReg) -> Function {
    let mut func = Function::with_name("loop");
    let bb0 = func.alloc_block();
    let bb1 = func.alloc_block();
    let bb2 = func.alloc_block();
    let bb3 = func.alloc_block();
    func.entry = bb0;

    let sum = func.alloc_vreg();
    let i = func.alloc_vreg();
    let a = func.alloc_vreg();
    let b = func.alloc_vreg();
    let c = func.alloc_vreg();
    let t = func.alloc_vreg();
    let k = func.alloc_vreg();
    let ab = func.alloc_vreg();
    let out = func.alloc_vreg();

    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(sum, Operand::Imm(0)));
    block.instructions.push(Inst::copy(i, Operand::Imm(0)));
    block.instructions.push(Inst::copy(a, Operand::Imm(3)));
    block.instructions.push(Inst::copy(b, Operand::Imm(4)));
    block.terminator = Inst::jump(bb1);

    let block = func.block_mut(bb1);
    block
        .instructions
        .push(Inst::binary(BinOpKind::Lt, c, i, Operand::Imm(10)));
    block.terminator = Inst::branch(c, bb2, bb3);

    let block = func.block_mut(bb2);
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, t, sum, i));
    block.instructions.push(Inst::copy(sum, t));
    block
        .instructions
        .push(Inst::call(vec![ret_reg.into()], vec![]));
    block.instructions.push(Inst::copy(k, ret_reg));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, sum, sum, k));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, i, i, Operand::Imm(1)));
    block.terminator = Inst::jump(bb1);

    let block = func.block_mut(bb3);
    block.instructions.push(Inst::binary(BinOpKind::Mul, ab, a, b));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, out, sum, ab));
    block.terminator = Inst::ret(Some(out.into()));

    func
}

#[test]
fn test_simple_allocation() {
    let (model, _) = flat_model(3, 0);
    let target = GenericTarget::new(model);

    let (_, result) = allocate_and_check(make_simple_function(), &target, RagaConfig::default(), &[]);

    // All vregs should be colored, no spills
    assert_eq!(result.assignments.len(), 3);
    assert!(result.spilled.is_empty());
    assert_eq!(result.stats.rounds, 1);
    assert_ne!(
        result.assignments[&Operand::VReg(VReg(0))],
        result.assignments[&Operand::VReg(VReg(1))],
        "v0 and v1 interfere"
    );
}

#[test]
fn test_coalescing() {
    let (model, _) = flat_model(3, 0);
    let target = GenericTarget::new(model);

    let (func, result) =
        allocate_and_check(make_coalesce_function(), &target, RagaConfig::default(), &[]);

    assert_eq!(result.stats.coalesced_moves, 1);
    assert_eq!(result.stats.eliminated_moves, 1);
    assert_eq!(
        result.assignments.get(&Operand::VReg(VReg(0))),
        result.assignments.get(&Operand::VReg(VReg(1))),
        "Coalesced nodes should have same color"
    );
    assert_eq!(func.blocks[0].instructions.len(), 1, "copy should be deleted");
}

#[test]
fn test_coalesce_only_renames() {
    let (model, _) = flat_model(3, 0);
    let target = GenericTarget::new(model);
    let mut func = make_coalesce_function();

    init_logger();
    let result = Raga::new(&target, RagaConfig::coalesce_only())
        .allocate(&mut func)
        .unwrap();

    assert!(result.assignments.is_empty());
    assert_eq!(result.aliases.len(), 1);
    let block = &func.blocks[0];
    assert_eq!(block.instructions.len(), 1);
    // Both names collapse onto one virtual register
    let def = block.instructions[0].dsts[0];
    assert!(matches!(def, Operand::VReg(_)));
    assert_eq!(block.terminator.srcs[0], def);
    assert_eq!(run(&func, &target, &[]).0, 1);
}

#[test]
fn test_register_pressure_spills() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);

    let (func, result) =
        allocate_and_check(make_triangle_function(), &target, RagaConfig::default(), &[]);

    // v0 is the cheapest member of the triangle, with the fewest uses for
    // the same pressure. Spilling it leaves two short temps and a colorable
    // graph for the second round.
    assert_eq!(result.spilled, vec![Operand::VReg(VReg(0))]);
    assert_eq!(result.stats.rounds, 2);
    assert_eq!(result.stats.spilled_nodes, 1);
    assert_eq!(result.stats.spill_loads, 1);
    assert_eq!(result.stats.spill_stores, 1);
    // Spill homes were created for the spilled virtual registers
    assert!(func.vars.iter().any(|v| v.kind == VarKind::Spill));
}

#[test]
fn test_note_spills() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let spill_notes = |func: &Function| {
        func.blocks
            .iter()
            .flat_map(|b| b.iter())
            .filter(|inst| inst.note == Some(InstNote::SpillCode))
            .count()
    };

    let (plain, _) =
        allocate_and_check(make_triangle_function(), &target, RagaConfig::default(), &[]);
    assert_eq!(spill_notes(&plain), 0);

    let config = RagaConfig {
        note_spills: true,
        ..RagaConfig::default()
    };
    let (noted, result) = allocate_and_check(make_triangle_function(), &target, config, &[]);
    assert_eq!(
        spill_notes(&noted),
        result.stats.spill_loads + result.stats.spill_stores
    );
}

#[test]
fn test_call_clobbers_move_value_to_callee_saved() {
    // v0 = 5
    // r0 = call
    // v1 = r0
    // v2 = v0 + v1
    // return v2
    let (model, regs) = flat_model(2, 1);
    let target = GenericTarget::new(model);
    let mut func = Function::with_name("call");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let v0 = func.alloc_vreg();
    let v1 = func.alloc_vreg();
    let v2 = func.alloc_vreg();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Imm(5)));
    block
        .instructions
        .push(Inst::call(vec![regs[0].into()], vec![]));
    block.instructions.push(Inst::copy(v1, regs[0]));
    block.instructions.push(Inst::binary(BinOpKind::Add, v2, v0, v1));
    block.terminator = Inst::ret(Some(v2.into()));

    for hard_regs in [HardRegPolicy::Excluded, HardRegPolicy::InGraph] {
        let config = RagaConfig {
            hard_regs,
            ..RagaConfig::default()
        };
        let (_, result) = allocate_and_check(func.clone(), &target, config, &[]);
        assert_eq!(
            result.assignments[&Operand::VReg(v0)],
            regs[2],
            "value live across the call must be in a callee-saved register ({:?})",
            hard_regs
        );
        assert_eq!(result.assignments[&Operand::VReg(v1)], regs[0]);
        assert!(result.spilled.is_empty());
    }
}

#[test]
fn test_byte_registers_do_not_overlap_words() {
    let (model, word, byte) = byte_model();
    let target = GenericTarget::new(model.clone());

    // Four words and one byte live at once: the byte needs a register whose
    // word is free, so at most one of w0 and w1 may hold a word
    let mut func = Function::with_name("bytes");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let words: Vec<VReg> = (0..3).map(|_| func.alloc_vreg_in(word)).collect();
    let small = func.alloc_vreg_in(byte);
    let acc = func.alloc_vreg_in(word);
    let block = func.block_mut(bb0);
    for (i, &w) in words.iter().enumerate() {
        block
            .instructions
            .push(Inst::copy(w, Operand::Imm(10 * (i as i64 + 1))));
    }
    block.instructions.push(Inst::copy(small, Operand::Imm(7)));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, acc, words[0], words[1]));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, acc, acc, words[2]));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, acc, acc, small));
    block.terminator = Inst::ret(Some(acc.into()));

    for hard_regs in [HardRegPolicy::Excluded, HardRegPolicy::InGraph] {
        let config = RagaConfig {
            hard_regs,
            ..RagaConfig::default()
        };
        let (_, result) = allocate_and_check(func.clone(), &target, config, &[]);
        assert!(result.spilled.is_empty(), "{:?}", hard_regs);
        let b = result.assignments[&Operand::VReg(small)];
        assert!(model.members(byte).contains(b));
        for w in &words {
            let w = result.assignments[&Operand::VReg(*w)];
            assert!(model.members(word).contains(w));
            assert!(!model.aliases(w).contains(b), "{} overlaps {}", w, b);
        }
    }
}

/// Every combination of hard-register policy, lazy enabling and census
fn every_variant() -> Vec<RagaConfig> {
    let mut configs = Vec::new();
    for hard_regs in [HardRegPolicy::Excluded, HardRegPolicy::InGraph] {
        for lazy_move_enabling in [true, false] {
            for neighbor_census in [false, true] {
                configs.push(RagaConfig {
                    hard_regs,
                    lazy_move_enabling,
                    neighbor_census,
                    min_caller_saved: neighbor_census,
                    ..RagaConfig::default()
                });
            }
        }
    }
    configs
}

#[test]
fn test_loop_under_every_variant() {
    let (model, regs) = flat_model(2, 2);
    let target = GenericTarget::new(model);
    let expected = 45 + 10 + 12;

    for config in every_variant() {
        let (func, _) = allocate_and_check(make_loop_function(regs[0]), &target, config, &[]);
        assert_eq!(run(&func, &target, &[]).0, expected);
    }
}

#[test]
fn test_loop_weights_spill_choice() {
    // Too few registers for everything held across the call: the values
    // used only outside the loop are the cheap ones to spill
    let (model, regs) = flat_model(2, 2);
    let target = GenericTarget::new(model);

    let (_, result) = allocate_and_check(
        make_loop_function(regs[0]),
        &target,
        RagaConfig::default(),
        &[],
    );
    let a = Operand::VReg(VReg(2));
    let b = Operand::VReg(VReg(3));
    let sum = Operand::VReg(VReg(0));
    let i = Operand::VReg(VReg(1));
    assert!(!result.spilled.contains(&sum) && !result.spilled.contains(&i));
    assert!(result.spilled.contains(&a) || result.spilled.contains(&b));
}

#[test]
fn test_stack_param_loaded_on_entry() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);

    let mut func = Function::with_name("param");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let p = func.alloc_param("p", None);
    let v0 = func.alloc_vreg();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::binary(
        BinOpKind::Add,
        v0,
        Operand::Var(p),
        Operand::Imm(1),
    ));
    block.terminator = Inst::ret(Some(v0.into()));

    let (func, result) = allocate_and_check(func, &target, RagaConfig::default(), &[(p, 41)]);
    let first = &func.blocks[0].instructions[0];
    assert_eq!(first.opcode, Opcode::Load);
    assert_eq!(first.note, Some(InstNote::ParamInit));
    assert_eq!(first.srcs[0], Operand::Addr(p));
    assert_eq!(Operand::Hard(result.assignments[&Operand::Var(p)]), first.dsts[0]);
    assert_eq!(run(&func, &target, &[(p, 41)]).0, 42);
}

#[test]
fn test_global_stays_in_memory() {
    // v0 = g + 1
    // g = v0
    // return g
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);

    let mut func = Function::with_name("global");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let g = func.alloc_var("g", VarKind::Global);
    let v0 = func.alloc_vreg();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::binary(
        BinOpKind::Add,
        v0,
        Operand::Var(g),
        Operand::Imm(1),
    ));
    block.instructions.push(Inst::copy(Operand::Var(g), v0));
    block.terminator = Inst::ret(Some(Operand::Var(g)));

    let (func, result) = allocate_and_check(func, &target, RagaConfig::default(), &[(g, 10)]);
    assert!(result.spilled.is_empty());
    assert_eq!(result.stats.spilled_nodes, 0);
    let (value, mem) = run(&func, &target, &[(g, 10)]);
    assert_eq!(value, 11);
    assert_eq!(mem[&g], 11);
    let stores = func.blocks[0]
        .instructions
        .iter()
        .filter(|inst| inst.opcode == Opcode::Store && inst.dsts[0] == Operand::Addr(g))
        .count();
    assert_eq!(stores, 1);
}

#[test]
fn test_allocator_is_reusable() {
    let (model, _) = flat_model(3, 0);
    let target = GenericTarget::new(model);
    let mut raga = Raga::new(&target, RagaConfig::default());

    let mut first = make_triangle_function();
    raga.allocate(&mut first).unwrap();
    let mut second = make_simple_function();
    let result = raga.allocate(&mut second).unwrap();

    assert_eq!(result.stats.rounds, 1);
    assert_eq!(raga.stats(), &result.stats);
    assert_fully_allocated(&second);
}

#[test]
fn test_empty_function() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = Function::new();
    let bb0 = func.alloc_block();
    func.entry = bb0;

    let result = allocate_registers(&mut func, &target).unwrap();
    assert!(result.assignments.is_empty());
    assert!(result.spilled.is_empty());
}

/// Allocator with the operands of `func` catalogued and no graph built yet
fn catalogued<'t, T: Target + ?Sized>(
    target: &'t T,
    config: RagaConfig,
    func: &mut Function,
) -> Raga<'t, T> {
    init_logger();
    let mut raga = Raga::new(target, config);
    raga.reset();
    raga.enter_hard_reg_nodes();
    raga.gather(func).unwrap();
    raga.init().unwrap();
    raga
}

/// Allocator holding the interference graph of `func`
fn built<'t, T: Target + ?Sized>(
    target: &'t T,
    config: RagaConfig,
    func: &mut Function,
) -> Raga<'t, T> {
    let mut raga = catalogued(target, config, func);
    let cfg = CFG::build(func);
    let liveness =
        LivenessInfo::compute(func, &cfg, raga.nodes.len(), |inst| raga.defs_and_uses(inst));
    raga.build(func, &liveness).unwrap();
    raga
}

#[test]
fn test_interference_detection() {
    // v0 and v1 are both live at the add, so they interfere; v2 interferes
    // with neither
    let (model, _) = flat_model(3, 0);
    let target = GenericTarget::new(model);
    let mut func = make_simple_function();
    let raga = built(&target, RagaConfig::default(), &mut func);

    let n0 = raga.node_of(&Operand::VReg(VReg(0))).unwrap();
    let n1 = raga.node_of(&Operand::VReg(VReg(1))).unwrap();
    let n2 = raga.node_of(&Operand::VReg(VReg(2))).unwrap();
    assert!(raga.adjacent(n0, n1), "v0 and v1 should interfere");
    assert!(!raga.adjacent(n0, n2));
    assert!(!raga.adjacent(n1, n2));
    assert_eq!(raga.nodes[n0].squeeze, 1);
    assert_eq!(raga.stats.edges, 1);
}

/// Binary results must be drawn from `narrow`
struct NarrowTarget {
    model: RegisterModel,
    narrow: RegClassId,
}

impl Target for NarrowTarget {
    fn registers(&self) -> &RegisterModel {
        &self.model
    }

    fn operand_class(&self, inst: &Inst, slot: OperandSlot) -> Option<RegClassId> {
        match (inst.opcode, slot) {
            (Opcode::Binary(_), OperandSlot::Dst(0)) => Some(self.narrow),
            _ => None,
        }
    }
}

fn narrow_target() -> (NarrowTarget, Vec<HardReg>) {
    let mut b = RegisterModel::builder();
    let regs: Vec<HardReg> = (0..4).map(|i| b.register(format!("r{}", i))).collect();
    let narrow = b.class("narrow", &regs[2..]);
    b.caller_saved(&regs);
    let model = b.build().unwrap();
    (NarrowTarget { model, narrow }, regs)
}

#[test]
fn test_operand_constraint_narrows_class() {
    let (target, regs) = narrow_target();
    let (_, result) =
        allocate_and_check(make_simple_function(), &target, RagaConfig::default(), &[]);
    let v2 = result.assignments[&Operand::VReg(VReg(2))];
    assert!(regs[2..].contains(&v2), "{} is not in the narrow class", v2);
}

#[test]
fn test_over_constrained_operand() {
    let (target, _) = narrow_target();
    let low = target.model.class_by_name("r0").unwrap();
    let mut func = make_simple_function();
    func.vreg_classes.insert(VReg(2), low);

    let err = Raga::new(&target, RagaConfig::default())
        .allocate(&mut func)
        .unwrap_err();
    assert!(matches!(err, RegAllocError::OverConstrained(_)), "{}", err);
}

#[test]
fn test_missing_entry_block() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = make_simple_function();
    func.entry = BlockId(7);

    let err = allocate_registers(&mut func, &target).unwrap_err();
    assert!(matches!(err, RegAllocError::MalformedFunction(_)), "{}", err);
}

#[test]
fn test_too_many_candidates() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let config = RagaConfig {
        max_node_count: 4,
        ..RagaConfig::default()
    };
    let mut func = make_simple_function();

    let err = Raga::new(&target, config).allocate(&mut func).unwrap_err();
    assert!(
        matches!(err, RegAllocError::TooManyCandidates { count: 5, limit: 4 }),
        "{}",
        err
    );
}

fn named_reg(model: &RegisterModel, name: &str) -> HardReg {
    (0..model.reg_count() as u16)
        .map(HardReg)
        .find(|&reg| model.reg_name(reg) == name)
        .unwrap()
}

/// `v0 = 0`, `v1 = 1`, ... with nothing but the return reading them
fn make_independent_values(count: u32) -> Function {
    let mut func = Function::with_name("values");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let vregs: Vec<VReg> = (0..count).map(|_| func.alloc_vreg()).collect();
    let block = func.block_mut(bb0);
    for (i, &v) in vregs.iter().enumerate() {
        block.instructions.push(Inst::copy(v, Operand::Imm(i as i64)));
    }
    block.terminator = Inst::ret(Some(vregs[0].into()));
    func
}

fn vreg_nodes<T: Target + ?Sized>(raga: &Raga<'_, T>, count: u32) -> Vec<NodeId> {
    (0..count)
        .map(|i| raga.node_of(&Operand::VReg(VReg(i))).unwrap())
        .collect()
}

fn make_call_pressure_function() -> Function {
    // v0 = 5
    // call          <-- clobbers every register
    // v1 = v0 + 1
    // v1 = v1 + v0
    // v1 = v1 + v0
    // return v1
    let mut func = Function::with_name("call_pressure");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let v0 = func.alloc_vreg();
    let v1 = func.alloc_vreg();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Imm(5)));
    block.instructions.push(Inst::call(vec![], vec![]));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v1, v0, Operand::Imm(1)));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v1, v1, v0));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v1, v1, v0));
    block.terminator = Inst::ret(Some(v1.into()));
    func
}

#[test]
fn test_spill_value_that_relieves_no_pressure() {
    // Once v1 is simplified v0 squeezes nothing, but it still cannot keep
    // a register across the call
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);

    for config in every_variant() {
        let (func, result) =
            allocate_and_check(make_call_pressure_function(), &target, config.clone(), &[]);
        assert_eq!(result.spilled, vec![Operand::VReg(VReg(0))], "{:?}", config);
        assert_eq!(result.stats.rounds, 2);
        assert_eq!(run(&func, &target, &[]).0, 16);
    }
}

#[test]
fn test_spill_cost() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = make_independent_values(3);
    let mut raga = catalogued(&target, RagaConfig::default(), &mut func);
    let v = vreg_nodes(&raga, 3);

    raga.nodes[v[0]].frequency = 9.0;
    raga.nodes[v[0]].antisqueeze = -0.75;
    raga.nodes[v[1]].frequency = 2.0;
    raga.nodes[v[1]].antisqueeze = 0.5;
    raga.nodes[v[2]].frequency = f64::INFINITY;
    raga.nodes[v[2]].antisqueeze = 4.0;

    assert_eq!(raga.spill_cost(v[0]), Some(0.0));
    assert_eq!(raga.spill_cost(v[1]), Some(4.0));
    assert_eq!(raga.spill_cost(v[2]), None);

    for &n in &v {
        raga.initial.remove(&mut raga.nodes, n);
        raga.spill_work.push(&mut raga.nodes, n);
    }
    raga.select_spill().unwrap();
    assert_eq!(raga.nodes[v[0]].state, NodeState::SimplifyWork);
    raga.select_spill().unwrap();
    assert_eq!(raga.nodes[v[1]].state, NodeState::SimplifyWork);
    // A point-lifetime temp is never a candidate
    assert!(matches!(
        raga.select_spill(),
        Err(RegAllocError::NoSpillCandidate)
    ));
    assert_eq!(raga.nodes[v[2]].state, NodeState::SpillWork);
}

#[test]
fn test_coalesce_only_loads_param_merged_into_register() {
    // r0 = $p
    // return r0
    let (model, regs) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = Function::with_name("param_to_register");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let p = func.alloc_param("p", None);
    let block = func.block_mut(bb0);
    block
        .instructions
        .push(Inst::copy(regs[0], Operand::Var(p)));
    block.terminator = Inst::ret(Some(regs[0].into()));

    init_logger();
    for hard_regs in [HardRegPolicy::Excluded, HardRegPolicy::InGraph] {
        for mode in [OutputMode::Allocate, OutputMode::CoalesceOnly] {
            let config = RagaConfig {
                mode,
                hard_regs,
                ..RagaConfig::default()
            };
            let mut out = func.clone();
            let result = Raga::new(&target, config).allocate(&mut out).unwrap();
            assert_eq!(result.stats.coalesced_moves, 1, "{:?} {:?}", mode, hard_regs);

            // The copy is gone and the parameter is loaded straight into r0
            let insts = &out.blocks[0].instructions;
            assert_eq!(insts.len(), 1, "{}", out);
            assert_eq!(insts[0].opcode, Opcode::Load);
            assert_eq!(insts[0].note, Some(InstNote::ParamInit));
            assert_eq!(insts[0].dsts[0], Operand::Hard(regs[0]));
            assert_eq!(run(&out, &target, &[(p, 41)]).0, 41);
        }
    }
}

#[test]
fn test_coalesce_only_loads_param_merged_into_vreg() {
    // v0 = $p
    // v1 = v0 + 1
    // return v1
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = Function::with_name("param_to_vreg");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let p = func.alloc_param("p", None);
    let v0 = func.alloc_vreg();
    let v1 = func.alloc_vreg();
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Var(p)));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v1, v0, Operand::Imm(1)));
    block.terminator = Inst::ret(Some(v1.into()));

    init_logger();
    let mut out = func.clone();
    let result = Raga::new(&target, RagaConfig::coalesce_only())
        .allocate(&mut out)
        .unwrap();
    assert_eq!(result.aliases[&Operand::Var(p)], Operand::VReg(v0));

    let first = &out.blocks[0].instructions[0];
    assert_eq!(first.opcode, Opcode::Load);
    assert_eq!(first.dsts[0], Operand::VReg(v0));
    assert_eq!(first.srcs[0], Operand::Addr(p));
    assert_eq!(run(&out, &target, &[(p, 41)]).0, 42);
}

#[test]
fn test_hard_conflict_squeezes_once() {
    // v0 (a word) is live across a write to w0, which overlaps b0
    let (model, word, _) = byte_model();
    let target = GenericTarget::new(model.clone());
    let w0 = named_reg(&model, "w0");
    let b0 = named_reg(&model, "b0");

    let mut func = Function::with_name("hard_conflict");
    let bb0 = func.alloc_block();
    func.entry = bb0;
    let v0 = func.alloc_vreg_in(word);
    let v1 = func.alloc_vreg_in(word);
    let block = func.block_mut(bb0);
    block.instructions.push(Inst::copy(v0, Operand::Imm(1)));
    block.instructions.push(Inst::copy(w0, Operand::Imm(2)));
    block
        .instructions
        .push(Inst::binary(BinOpKind::Add, v1, v0, w0));
    block.terminator = Inst::ret(Some(v1.into()));

    let in_graph = RagaConfig {
        hard_regs: HardRegPolicy::InGraph,
        ..RagaConfig::default()
    };
    let mut graph_func = func.clone();
    let raga = built(&target, in_graph.clone(), &mut graph_func);
    let n = raga.node_of(&Operand::VReg(v0)).unwrap();
    let hw0 = raga.node_of(&Operand::Hard(w0)).unwrap();
    let hb0 = raga.node_of(&Operand::Hard(b0)).unwrap();

    let w0_class = model.singleton(w0).unwrap();
    assert_eq!(raga.nodes[n].squeeze, model.displacement(word, w0_class));
    assert_eq!(raga.nodes[n].squeeze, 1);
    assert_eq!(raga.nodes[n].adj_list, vec![hw0]);
    assert!(raga.adjacent(n, hw0));
    assert!(raga.adjacent(n, hb0), "a conflict with w0 is one with b0 too");
    assert_eq!(raga.stats.edges, 1);

    for config in [RagaConfig::default(), in_graph] {
        let (_, result) = allocate_and_check(func.clone(), &target, config, &[]);
        let reg = result.assignments[&Operand::VReg(v0)];
        assert!(!model.aliases(w0).contains(reg), "v0 got {}", model.reg_name(reg));
    }
}

#[test]
fn test_get_alias_compresses_paths() {
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = make_independent_values(3);
    let mut raga = catalogued(&target, RagaConfig::default(), &mut func);
    let v = vreg_nodes(&raga, 3);

    // v0 -> v1 -> v2
    for (from, to) in [(v[0], v[1]), (v[1], v[2])] {
        raga.nodes[from].state = NodeState::Coalesced;
        raga.nodes[from].alias = Some(to);
    }

    assert_eq!(raga.get_alias(v[0]), v[2]);
    assert_eq!(raga.nodes[v[0]].alias, Some(v[2]));
    assert_eq!(raga.get_alias(v[0]), v[2]);
    assert_eq!(raga.get_alias(v[1]), v[2]);
    assert_eq!(raga.get_alias(v[2]), v[2]);
    assert_eq!(raga.representative(v[0]), v[2]);
}

#[test]
fn test_briggs_counts_shared_neighbors_once() {
    // u and w share the significant neighbor s; a is significant and next
    // to u alone; b is next to w alone and insignificant. Two registers.
    let (model, _) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = make_independent_values(6);
    let mut raga = catalogued(&target, RagaConfig::default(), &mut func);
    let v = vreg_nodes(&raga, 6);
    let (u, w, s, a, b, x) = (v[0], v[1], v[2], v[3], v[4], v[5]);
    for (p, q) in [(s, u), (s, w), (a, u), (a, x), (b, w)] {
        assert!(raga.add_edge(p, q));
    }
    assert!(raga.significant(s) && raga.significant(a) && !raga.significant(b));

    let m = raga.moves.len();
    raga.record_move(
        u,
        w,
        InstHandle {
            block: BlockId(0),
            index: 0,
        },
    );
    raga.coalesce();

    // s and a squeeze the merged node by 2 against 2 placements: one too many
    assert_eq!(raga.stats.briggs_tests, 1);
    assert_eq!(raga.moves[m].state, MoveState::Active);
    assert_eq!(raga.moves[m].hi, 1);

    // a leaving the graph relieves exactly that much
    raga.enable_moves_adjacent(a, false);
    assert_eq!(raga.moves[m].state, MoveState::Worklist);
    assert_eq!(raga.stats.moves_reenabled, 1);
}

#[test]
fn test_george_countdown_reenables_move() {
    // v0 = r0, where v0 has two significant neighbors that do not
    // conflict with r0
    let (model, regs) = flat_model(2, 0);
    let target = GenericTarget::new(model);
    let mut func = make_independent_values(4);
    let mut raga = catalogued(&target, RagaConfig::default(), &mut func);
    let v = vreg_nodes(&raga, 4);
    let r0 = raga.node_of(&Operand::Hard(regs[0])).unwrap();
    for (p, q) in [(v[1], v[0]), (v[1], v[3]), (v[2], v[0]), (v[2], v[3])] {
        assert!(raga.add_edge(p, q));
    }

    let m = raga.moves.len();
    raga.record_move(
        v[0],
        r0,
        InstHandle {
            block: BlockId(0),
            index: 0,
        },
    );
    raga.coalesce();
    assert_eq!(raga.stats.george_tests, 1);
    assert_eq!(raga.moves[m].state, MoveState::Active);
    assert_eq!(raga.moves[m].hi, 2);

    raga.enable_moves_adjacent(v[1], false);
    assert_eq!(raga.moves[m].state, MoveState::Active);
    assert_eq!(raga.moves[m].hi, 1);

    raga.enable_moves_adjacent(v[2], false);
    assert_eq!(raga.moves[m].state, MoveState::Worklist);
    assert_eq!(raga.stats.moves_reenabled, 1);
}

/// Every candidate is on exactly the bucket named by its state, and so is
/// every move
fn assert_buckets_consistent<T: Target + ?Sized>(raga: &Raga<'_, T>) {
    let node_buckets = [
        (&raga.initial, NodeState::Initial),
        (&raga.simplify_work, NodeState::SimplifyWork),
        (&raga.freeze_work, NodeState::FreezeWork),
        (&raga.spill_work, NodeState::SpillWork),
        (&raga.spilled, NodeState::Spilled),
        (&raga.coalesced, NodeState::Coalesced),
        (&raga.colored, NodeState::Colored),
        (&raga.select_stack, NodeState::SelectStacked),
    ];
    let mut seen = vec![0; raga.nodes.len()];
    for (bucket, state) in node_buckets {
        let members: Vec<NodeId> = bucket.iter(&raga.nodes).collect();
        assert_eq!(members.len(), bucket.len());
        for n in members {
            assert_eq!(raga.nodes[n].state, state, "n{} on the {:?} bucket", n, state);
            seen[n] += 1;
        }
    }
    for node in &raga.nodes {
        let expected = usize::from(node.state != NodeState::Precolored);
        assert_eq!(seen[node.id], expected, "n{} ({:?})", node.id, node.state);
    }

    let move_buckets = [
        (&raga.move_worklist, MoveState::Worklist),
        (&raga.active_moves, MoveState::Active),
        (&raga.coalesced_moves, MoveState::Coalesced),
        (&raga.constrained_moves, MoveState::Constrained),
        (&raga.frozen_moves, MoveState::Frozen),
    ];
    let mut seen = vec![0; raga.moves.len()];
    for (bucket, state) in move_buckets {
        for m in bucket.iter(&raga.moves) {
            assert_eq!(raga.moves[m].state, state, "move {} on the {:?} bucket", m, state);
            seen[m] += 1;
        }
    }
    assert!(seen.iter().all(|&count| count == 1), "{:?}", seen);
}

/// Run the reduction loop one step at a time, checking the buckets between
/// steps
fn reduce_checking_buckets<T: Target + ?Sized>(raga: &mut Raga<'_, T>) {
    raga.mk_worklist();
    loop {
        assert_buckets_consistent(raga);
        if !raga.simplify_work.is_empty() {
            raga.simplify();
        } else if !raga.move_worklist.is_empty() {
            raga.coalesce();
        } else if !raga.freeze_work.is_empty() {
            raga.freeze();
        } else if !raga.spill_work.is_empty() {
            raga.select_spill().unwrap();
        } else {
            break;
        }
    }
    raga.dispose_stranded_moves();
    assert_buckets_consistent(raga);

    for node in &raga.nodes {
        assert!(
            matches!(
                node.state,
                NodeState::Precolored | NodeState::SelectStacked | NodeState::Coalesced
            ),
            "n{} left as {:?}",
            node.id,
            node.state
        );
    }
}

#[test]
fn test_buckets_stay_consistent_while_reducing() {
    let (small, _) = flat_model(2, 0);
    let small = GenericTarget::new(small);
    let (large, regs) = flat_model(2, 2);
    let large = GenericTarget::new(large);

    let small_functions: [fn() -> Function; 2] =
        [make_triangle_function, make_call_pressure_function];

    for config in every_variant() {
        for make in small_functions {
            let mut func = make();
            let mut raga = built(&small, config.clone(), &mut func);
            reduce_checking_buckets(&mut raga);
        }
        let mut func = make_loop_function(regs[0]);
        let mut raga = built(&large, config.clone(), &mut func);
        reduce_checking_buckets(&mut raga);
    }
}

/// Deterministic xorshift generator for building test programs
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn pick(&mut self, values: &[Operand]) -> Operand {
        values[self.below(values.len())]
    }
}

/// Append `count` random instructions to `block`. Sources are drawn from
/// `values`, which gains every newly defined virtual register.
fn random_straight_line(
    func: &mut Function,
    block: BlockId,
    rng: &mut Rng,
    values: &mut Vec<Operand>,
    ret_reg: HardReg,
    count: usize,
) {
    const OPS: [BinOpKind; 4] = [
        BinOpKind::Add,
        BinOpKind::Sub,
        BinOpKind::Mul,
        BinOpKind::Xor,
    ];
    for _ in 0..count {
        let choice = rng.below(6);
        // Redefine an existing virtual register now and then
        let redefinable: Vec<Operand> = values
            .iter()
            .copied()
            .filter(|v| matches!(v, Operand::VReg(_)))
            .collect();
        let dst = if choice >= 4 && !redefinable.is_empty() && rng.below(3) == 0 {
            rng.pick(&redefinable)
        } else {
            Operand::VReg(func.alloc_vreg())
        };
        let inst = match choice {
            0 => Inst::copy(dst, Operand::Imm(rng.below(100) as i64)),
            1 => Inst::copy(dst, rng.pick(values)),
            2 => {
                func.block_mut(block)
                    .instructions
                    .push(Inst::call(vec![ret_reg.into()], vec![]));
                Inst::copy(dst, ret_reg)
            }
            3 => Inst::binary(
                OPS[rng.below(OPS.len())],
                dst,
                rng.pick(values),
                Operand::Imm(rng.below(10) as i64),
            ),
            _ => Inst::binary(
                OPS[rng.below(OPS.len())],
                dst,
                rng.pick(values),
                rng.pick(values),
            ),
        };
        func.block_mut(block).instructions.push(inst);
        if !values.contains(&dst) {
            values.push(dst);
        }
    }
}

/// A diamond of random straight-line code reading a stack parameter.
/// Everything read is defined on every path that reaches it.
fn make_random_function(rng: &mut Rng, ret_reg: HardReg) -> (Function, VarId) {
    let mut func = Function::with_name("random");
    let bb0 = func.alloc_block();
    let bb1 = func.alloc_block();
    let bb2 = func.alloc_block();
    let bb3 = func.alloc_block();
    func.entry = bb0;
    let p = func.alloc_param("p", None);

    let first = func.alloc_vreg();
    func.block_mut(bb0)
        .instructions
        .push(Inst::copy(first, Operand::Imm(1)));
    let mut values = vec![Operand::Var(p), Operand::VReg(first)];
    let count = 4 + rng.below(8);
    random_straight_line(&mut func, bb0, rng, &mut values, ret_reg, count);
    let cond = func.alloc_vreg();
    let lhs = rng.pick(&values);
    func.block_mut(bb0).instructions.push(Inst::binary(
        BinOpKind::And,
        cond,
        lhs,
        Operand::Imm(1),
    ));
    func.block_mut(bb0).terminator = Inst::branch(cond, bb1, bb2);

    let join = func.alloc_vreg();
    for arm in [bb1, bb2] {
        let mut arm_values = values.clone();
        let count = 2 + rng.below(5);
        random_straight_line(&mut func, arm, rng, &mut arm_values, ret_reg, count);
        let (lhs, rhs) = (rng.pick(&arm_values), rng.pick(&arm_values));
        func.block_mut(arm)
            .instructions
            .push(Inst::binary(BinOpKind::Add, join, lhs, rhs));
        func.block_mut(arm).terminator = Inst::jump(bb3);
    }

    values.push(Operand::VReg(join));
    let count = 2 + rng.below(5);
    random_straight_line(&mut func, bb3, rng, &mut values, ret_reg, count);
    let mut out = Operand::VReg(join);
    for _ in 0..3 {
        let sum = func.alloc_vreg();
        let rhs = rng.pick(&values);
        func.block_mut(bb3)
            .instructions
            .push(Inst::binary(BinOpKind::Add, sum, out, rhs));
        out = Operand::VReg(sum);
    }
    func.block_mut(bb3).terminator = Inst::ret(Some(out));
    (func, p)
}

#[test]
fn test_random_programs_under_every_variant() {
    let (model, regs) = flat_model(2, 2);
    let target = GenericTarget::new(model);
    let memory = |p: VarId| [(p, 7i64)];

    for seed in 1..=60 {
        let mut rng = Rng::new(seed);
        let (func, p) = make_random_function(&mut rng, regs[0]);
        let (expected, _) = run(&func, &target, &memory(p));

        for config in every_variant() {
            allocate_and_check(func.clone(), &target, config, &memory(p));
        }
        for hard_regs in [HardRegPolicy::Excluded, HardRegPolicy::InGraph] {
            let config = RagaConfig {
                hard_regs,
                ..RagaConfig::coalesce_only()
            };
            let mut out = func.clone();
            Raga::new(&target, config)
                .allocate(&mut out)
                .unwrap_or_else(|e| panic!("seed {}: {}\n{}", seed, e, func));
            assert_eq!(
                run(&out, &target, &memory(p)).0,
                expected,
                "seed {}: coalescing changed the result\n{}",
                seed,
                out
            );
        }
    }
}
