#![doc = include_str!("../README.md")]

pub mod compiler;

pub use compiler::{
    AllocationResult, GenericTarget, HardRegPolicy, OutputMode, Raga, RagaConfig, RegAllocError,
    RegisterModel, Stats, Target, allocate_registers,
};
