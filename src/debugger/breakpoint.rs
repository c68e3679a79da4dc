use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::error::Error;
use crate::debugger::target::TargetControl;
use indexmap::IndexMap;
use log::debug;
use nix::unistd::Pid;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrkptType {
    /// Breakpoint requested by the user, visible in enumeration.
    UserDefined,
    /// Internal breakpoint (installed by the next engine and friends),
    /// hidden from the user and removed before an operation returns.
    Temporary,
}

/// Software interception at a single address: the trap instruction is
/// spliced over the original code bytes while the breakpoint is enabled.
#[derive(Debug)]
pub struct Breakpoint {
    pub addr: RelocatedAddress,
    pub number: u32,
    r#type: BrkptType,
    saved_data: RefCell<Box<[u8]>>,
    enabled: Cell<bool>,
    hit_count: Cell<u64>,
    thread_hits: RefCell<HashMap<Pid, u64>>,
    condition: RefCell<Option<String>>,
}

impl Breakpoint {
    fn new(addr: RelocatedAddress, number: u32, r#type: BrkptType) -> Self {
        Self {
            addr,
            number,
            r#type,
            saved_data: RefCell::new(Box::new([])),
            enabled: Cell::new(false),
            hit_count: Cell::new(0),
            thread_hits: RefCell::default(),
            condition: RefCell::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn is_temporary(&self) -> bool {
        self.r#type == BrkptType::Temporary
    }

    pub fn total_hit_count(&self) -> u64 {
        self.hit_count.get()
    }

    pub fn thread_hit_count(&self, tid: Pid) -> u64 {
        self.thread_hits.borrow().get(&tid).copied().unwrap_or(0)
    }

    pub fn condition(&self) -> Option<String> {
        self.condition.borrow().clone()
    }

    pub fn set_condition(&self, cond: Option<String>) {
        *self.condition.borrow_mut() = cond;
    }

    pub(super) fn register_hit(&self, tid: Pid) {
        self.hit_count.set(self.hit_count.get() + 1);
        *self.thread_hits.borrow_mut().entry(tid).or_insert(0) += 1;
    }

    pub fn enable(&self, target: &dyn TargetControl, arch: Arch) -> Result<(), Error> {
        let saved = target.read_memory(self.addr, arch.trap_instruction.len())?;
        *self.saved_data.borrow_mut() = saved.into_boxed_slice();
        target.write_memory(self.addr, arch.trap_instruction)?;
        self.enabled.set(true);
        Ok(())
    }

    pub fn disable(&self, target: &dyn TargetControl) -> Result<(), Error> {
        target.write_memory(self.addr, &self.saved_data.borrow())?;
        self.enabled.set(false);
        Ok(())
    }
}

/// Address keyed breakpoint table. All mutation happens on the controller
/// thread, readers go through the debugger facade.
#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: IndexMap<RelocatedAddress, Breakpoint>,
    user_seq: u32,
    temp_seq: u32,
}

impl BreakpointRegistry {
    pub fn set(
        &mut self,
        target: &dyn TargetControl,
        arch: Arch,
        addr: RelocatedAddress,
    ) -> Result<&Breakpoint, Error> {
        self.user_seq += 1;
        let number = self.user_seq;
        self.add_and_enable(target, arch, Breakpoint::new(addr, number, BrkptType::UserDefined))
    }

    pub fn set_temporary(
        &mut self,
        target: &dyn TargetControl,
        arch: Arch,
        addr: RelocatedAddress,
    ) -> Result<&Breakpoint, Error> {
        self.temp_seq += 1;
        let number = self.temp_seq;
        self.add_and_enable(target, arch, Breakpoint::new(addr, number, BrkptType::Temporary))
    }

    fn add_and_enable(
        &mut self,
        target: &dyn TargetControl,
        arch: Arch,
        brkpt: Breakpoint,
    ) -> Result<&Breakpoint, Error> {
        if brkpt.addr.is_null() {
            return Err(Error::InvalidAddress(brkpt.addr));
        }
        if self.breakpoints.contains_key(&brkpt.addr) {
            return Err(Error::AlreadySet(brkpt.addr));
        }

        debug!(target: "debugger", "set breakpoint at {}", brkpt.addr);
        brkpt.enable(target, arch)?;
        let addr = brkpt.addr;
        self.breakpoints.insert(addr, brkpt);
        Ok(&self.breakpoints[&addr])
    }

    /// Restore original code bytes and forget the breakpoint.
    pub fn clear(
        &mut self,
        target: &dyn TargetControl,
        addr: RelocatedAddress,
    ) -> Result<Breakpoint, Error> {
        let brkpt = self
            .breakpoints
            .shift_remove(&addr)
            .ok_or(Error::NotFound(addr))?;
        if brkpt.is_enabled() {
            brkpt.disable(target)?;
        }
        debug!(target: "debugger", "clear breakpoint at {addr}");
        Ok(brkpt)
    }

    pub fn at(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn enabled_at(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr).filter(|b| b.is_enabled())
    }

    /// User visible breakpoints, temporaries are hidden.
    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values().filter(|b| !b.is_temporary())
    }

    pub fn temporaries(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values().filter(|b| b.is_temporary())
    }

    /// Remove every temporary breakpoint, restoring original code bytes.
    pub fn clear_temporaries(&mut self, target: &dyn TargetControl) -> Result<(), Error> {
        let temp_addrs: Vec<RelocatedAddress> = self
            .temporaries()
            .map(|b| b.addr)
            .collect();
        for addr in temp_addrs {
            self.clear(target, addr)?;
        }
        Ok(())
    }

    /// Drop temporary records without touching memory. Used when the target
    /// is gone and there is nothing to restore.
    pub fn forget_temporaries(&mut self) {
        self.breakpoints.retain(|_, b| !b.is_temporary());
    }
}
