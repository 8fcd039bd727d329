//! Context assembly for kiln.
//!
//! Builds the exact ordered message list sent to generation from a
//! conversation's active system injections, its trailing history window,
//! and the caller's new messages.

pub mod assembler;

pub use assembler::{AssembledContext, AssemblyInput, ContextApplied, assemble, assemble_for};
