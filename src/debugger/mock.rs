//! In-memory stand-ins for the oracle and target boundaries, unit tests
//! build tiny synthetic processes with them.

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debug_info::{
    DebugInfo, Function, Place, TypeMeta, TypeRef, VariableMeta,
};
use crate::debugger::error::Error;
use crate::debugger::register::Registers;
use crate::debugger::target::{TargetControl, TargetEvent};
use gimli::Range;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range as StdRange;
use std::path::PathBuf;
use std::sync::Arc;

/// Sparse memory image implementing the memory and register halves of
/// target control.
#[derive(Default)]
pub struct MockTargetMemory {
    mem: RefCell<HashMap<usize, u8>>,
    regs: RefCell<HashMap<i32, Registers>>,
}

impl MockTargetMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_word(&self, addr: usize, value: u64) {
        let mut mem = self.mem.borrow_mut();
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            mem.insert(addr + i, *b);
        }
    }

    pub fn write_bytes(&self, addr: usize, data: &[u8]) {
        let mut mem = self.mem.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            mem.insert(addr + i, *b);
        }
    }

    pub fn set_thread_registers(&self, tid: Pid, regs: Registers) {
        self.regs.borrow_mut().insert(tid.as_raw(), regs);
    }
}

impl TargetControl for MockTargetMemory {
    fn pid(&self) -> Pid {
        Pid::from_raw(1)
    }
    fn cont(&self, _: Pid, _: Option<Signal>) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
    fn single_step(&self, _: Pid) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
    fn interrupt(&self, _: Pid) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
    fn wait_any(&self) -> Result<TargetEvent, Error> {
        unimplemented!("memory-only mock")
    }
    fn wait_thread(&self, _: Pid) -> Result<TargetEvent, Error> {
        unimplemented!("memory-only mock")
    }
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let mem = self.mem.borrow();
        Ok((0..len)
            .map(|i| mem.get(&(addr.as_usize() + i)).copied().unwrap_or(0))
            .collect())
    }
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let mut mem = self.mem.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            mem.insert(addr.as_usize() + i, *b);
        }
        Ok(())
    }
    fn registers(&self, tid: Pid) -> Result<Registers, Error> {
        Ok(self
            .regs
            .borrow()
            .get(&tid.as_raw())
            .copied()
            .unwrap_or_default())
    }
    fn set_registers(&self, _: Pid, _: Registers) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
    fn send_signal(&self, _: Signal) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
    fn kill(&self) -> Result<(), Error> {
        unimplemented!("memory-only mock")
    }
}

/// Hand-built symbol oracle.
#[derive(Default)]
pub struct MockInfo {
    functions: Vec<Function>,
    places: Vec<Place>,
    cfa: Vec<(StdRange<u64>, i64)>,
    symbols: HashMap<String, GlobalAddress>,
    types: HashMap<u64, Arc<TypeMeta>>,
    type_names: HashMap<String, TypeRef>,
    scope_vars: Vec<(StdRange<u64>, VariableMeta)>,
    globals: HashMap<String, VariableMeta>,
    next_type_id: u64,
}

impl MockInfo {
    pub fn add_function(&mut self, name: &str, begin: u64, end: u64) {
        self.functions.push(Function {
            name: name.to_string(),
            ranges: vec![Range { begin, end }],
        });
    }

    pub fn add_place(&mut self, file: &str, line: u64, address: u64, is_stmt: bool) {
        self.places.push(Place {
            file: PathBuf::from(file),
            line_number: line,
            address: GlobalAddress::from(address),
            is_stmt,
        });
        self.places.sort_by_key(|p| p.address);
    }

    pub fn add_cfa_offset(&mut self, range: StdRange<u64>, offset: i64) {
        self.cfa.push((range, offset));
    }

    pub fn add_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), GlobalAddress::from(addr));
    }

    /// Register a type under a fresh reference, optionally binding a name.
    pub fn add_type(&mut self, name: Option<&str>, meta: TypeMeta) -> TypeRef {
        let type_ref = self.reserve_type();
        self.set_type(type_ref, meta);
        if let Some(name) = name {
            self.type_names.insert(name.to_string(), type_ref);
        }
        type_ref
    }

    /// Allocate a reference before the type body exists (recursive types).
    pub fn reserve_type(&mut self) -> TypeRef {
        self.next_type_id += 1;
        TypeRef(self.next_type_id)
    }

    pub fn set_type(&mut self, type_ref: TypeRef, meta: TypeMeta) {
        self.types.insert(type_ref.0, Arc::new(meta));
    }

    pub fn name_type(&mut self, name: &str, type_ref: TypeRef) {
        self.type_names.insert(name.to_string(), type_ref);
    }

    pub fn add_scope_var(&mut self, scope: StdRange<u64>, var: VariableMeta) {
        self.scope_vars.push((scope, var));
    }

    pub fn add_global(&mut self, name: &str, var: VariableMeta) {
        self.globals.insert(name.to_string(), var);
    }
}

impl DebugInfo for MockInfo {
    fn function_by_name(&self, name: &str) -> Option<Function> {
        self.functions.iter().find(|f| f.name == name).cloned()
    }

    fn function_by_pc(&self, pc: GlobalAddress) -> Option<Function> {
        self.functions.iter().find(|f| f.contains(pc)).cloned()
    }

    fn place_from_pc(&self, pc: GlobalAddress) -> Option<Place> {
        self.places
            .iter()
            .take_while(|p| p.address <= pc)
            .last()
            .cloned()
    }

    fn places_for_line(&self, file: &str, line: u64) -> Vec<Place> {
        self.places
            .iter()
            .filter(|p| p.is_stmt && p.line_number == line && p.file == PathBuf::from(file))
            .cloned()
            .collect()
    }

    fn function_places(&self, function: &Function) -> Vec<Place> {
        self.places
            .iter()
            .filter(|p| p.address.in_ranges(&function.ranges))
            .cloned()
            .collect()
    }

    fn symbol_address(&self, name: &str) -> Option<GlobalAddress> {
        self.symbols.get(name).copied()
    }

    fn type_by_name(&self, name: &str) -> Option<TypeRef> {
        self.type_names.get(name).copied()
    }

    fn type_meta(&self, type_ref: TypeRef) -> Result<Arc<TypeMeta>, Error> {
        self.types
            .get(&type_ref.0)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(format!("#{}", type_ref.0)))
    }

    fn scope_variables(&self, pc: GlobalAddress) -> Vec<VariableMeta> {
        self.scope_vars
            .iter()
            .filter(|(scope, _)| scope.contains(&u64::from(pc)))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn global_variable(&self, name: &str) -> Option<VariableMeta> {
        self.globals.get(name).cloned()
    }

    fn cfa_offset(&self, pc: GlobalAddress) -> Result<i64, Error> {
        self.cfa
            .iter()
            .find(|(range, _)| range.contains(&u64::from(pc)))
            .map(|(_, offset)| *offset)
            .ok_or(Error::NoFrameDescription(pc))
    }
}
