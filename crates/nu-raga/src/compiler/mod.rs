//! Register allocation by graph coloring
//!
//! This module holds the allocator and the small machine-level world it runs
//! in: the LIR instruction form, the register model, CFG and liveness
//! analysis, and the target hooks used to emit spill code.

pub mod cfg;
pub mod config;
pub mod graph_coloring;
pub mod lir;
pub mod reg_info;
pub mod stats;
pub mod target;

pub use config::{HardRegPolicy, OutputMode, RagaConfig};
pub use graph_coloring::{AllocationResult, Raga, allocate_registers};
pub use lir::{BlockId, Function, Inst, InstHandle, InstNote, Opcode, Operand, VReg, VarId, VarKind};
pub use reg_info::{HardReg, RegClassId, RegSet, RegisterModel, RegisterModelBuilder};
pub use stats::Stats;
pub use target::{GenericTarget, Target};

use thiserror::Error;

/// Errors that abort register allocation of a function
#[derive(Debug, Error)]
pub enum RegAllocError {
    #[error("Too many register candidates: {count} >= {limit}")]
    TooManyCandidates { count: usize, limit: usize },

    #[error("No acceptable spill candidate")]
    NoSpillCandidate,

    #[error("Operand {0} has no register class satisfying all its uses")]
    OverConstrained(String),

    #[error("Missing liveness information for block {0}")]
    MissingLiveness(BlockId),

    #[error("Malformed function: {0}")]
    MalformedFunction(String),

    #[error("Invalid register model: {0}")]
    InvalidRegisterModel(String),

    #[error("Register candidate {0} was left without a color")]
    UncoloredOperand(String),

    #[error("Invalid allocator configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}
