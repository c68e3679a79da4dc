//! Core of a source level debugger for Go programs: ptrace based process
//! control, software breakpoints, goroutine aware source stepping, stack
//! walking and an expression evaluator over DWARF described memory.

pub mod debugger;
pub mod version;
