//! Tiered runner for a typed SSA intermediate representation.
//!
//! Programs are tree-walked by a baseline interpreter; basic blocks that
//! cross an execution-count threshold are compiled to RV64 machine code
//! held in executable memory and run natively from then on, with the
//! interpreter handling every non-local transfer.

pub mod encode;
pub mod ir;
pub mod parser;
pub mod runtime;
pub mod segment;
