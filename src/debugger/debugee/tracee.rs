use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::Location;
use crate::debugger::error::Error;
use crate::debugger::register::Register;
use crate::debugger::target::{TargetControl, TargetEvent};
use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopType {
    Interrupt,
    SignalStop(Signal),
    /// Stopped at an installed breakpoint, PC already rewound to its address.
    Breakpoint(RelocatedAddress),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped(StopType),
    Running,
}

/// Tracee is a thread attached to debugger with ptrace.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    /// Tracee thread id.
    pub pid: Pid,
    /// Tracee current status.
    pub status: TraceeStatus,
}

impl Tracee {
    /// Wait for change of tracee status.
    pub fn wait_one(&self, target: &dyn TargetControl) -> Result<TargetEvent, Error> {
        debug!(target: "tracer", "wait for tracee status, thread {pid}", pid = self.pid);
        let event = target.wait_thread(self.pid)?;
        debug!(target: "tracer", "receive tracee status, thread {pid}, event: {event:?}", pid = self.pid);
        Ok(event)
    }

    fn update_status(&mut self, status: TraceeStatus) {
        debug!(
            target: "tracer",
            "tracee accept new status ({status:?}), thread: {pid}",
            pid = self.pid
        );
        self.status = status
    }

    /// Resume tracee, if signal is some - inject signal on resuming.
    pub fn r#continue(
        &mut self,
        target: &dyn TargetControl,
        sig: Option<Signal>,
    ) -> Result<(), Error> {
        debug!(
            target: "tracer",
            "continue tracee execution with signal {sig:?}, thread: {pid}",
            pid = self.pid,
        );

        target.cont(self.pid, sig).map(|ok| {
            self.update_status(TraceeStatus::Running);
            ok
        })
    }

    /// Set tracee status into stop.
    ///
    /// Note: this function does not actually stop the tracee.
    pub fn set_stop(&mut self, r#type: StopType) {
        self.update_status(TraceeStatus::Stopped(r#type));
    }

    /// Mark tracee as running without issuing a resume request.
    pub fn set_running(&mut self) {
        self.update_status(TraceeStatus::Running);
    }

    /// Returns true if tracee in one of stopping statuses.
    pub fn is_stopped(&self) -> bool {
        matches!(self.status, TraceeStatus::Stopped(_))
    }

    /// Return the breakpoint address if the last stop was a breakpoint hit.
    pub fn current_breakpoint(&self) -> Option<RelocatedAddress> {
        match self.status {
            TraceeStatus::Stopped(StopType::Breakpoint(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Get current program counter value.
    pub fn pc(&self, target: &dyn TargetControl) -> Result<RelocatedAddress, Error> {
        target
            .registers(self.pid)
            .map(|regs| RelocatedAddress::from(regs.pc()))
    }

    /// Set new program counter value.
    pub fn set_pc(&self, target: &dyn TargetControl, value: RelocatedAddress) -> Result<(), Error> {
        let mut regs = target.registers(self.pid)?;
        regs.update(Register::Rip, value.as_u64());
        target.set_registers(self.pid, regs)
    }

    /// Get current tracee location.
    pub fn location(
        &self,
        target: &dyn TargetControl,
        mapping_offset: usize,
    ) -> Result<Location, Error> {
        let pc = self.pc(target)?;
        Ok(Location {
            pid: self.pid,
            pc,
            global_pc: pc.into_global(mapping_offset),
        })
    }
}

/// Thread table of the traced process.
pub struct TraceeCtl {
    process_pid: Pid,
    in_focus_tid: Pid,
    threads_state: HashMap<Pid, Tracee>,
}

impl TraceeCtl {
    pub fn new(proc_pid: Pid) -> TraceeCtl {
        Self {
            process_pid: proc_pid,
            in_focus_tid: proc_pid,
            threads_state: HashMap::from([(
                proc_pid,
                Tracee {
                    pid: proc_pid,
                    status: TraceeStatus::Stopped(StopType::Interrupt),
                },
            )]),
        }
    }

    pub(crate) fn tracee(&self, pid: Pid) -> Option<&Tracee> {
        self.threads_state.get(&pid)
    }

    pub(crate) fn tracee_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.threads_state.get_mut(&pid)
    }

    pub(crate) fn tracee_ensure(&self, pid: Pid) -> &Tracee {
        self.threads_state.get(&pid).unwrap()
    }

    pub(crate) fn tracee_ensure_mut(&mut self, pid: Pid) -> &mut Tracee {
        self.tracee_mut(pid).unwrap()
    }

    /// Return pid of debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Set tracee into focus.
    pub fn set_tracee_to_focus(&mut self, tid: Pid) {
        self.in_focus_tid = tid
    }

    /// Return current focused tracee.
    pub fn tracee_in_focus(&self) -> &Tracee {
        &self.threads_state[&self.in_focus_tid]
    }

    /// Adds thread to the table in stopped status.
    pub fn add(&mut self, pid: Pid) -> &Tracee {
        debug!(target: "tracer", "add new tracee, thread: {pid}");
        let new = Tracee {
            pid,
            status: TraceeStatus::Stopped(StopType::Interrupt),
        };
        self.threads_state.insert(pid, new);
        &self.threads_state[&pid]
    }

    /// Remove thread from the table.
    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        debug!(target: "tracer", "try to remove tracee, thread: {pid}");
        self.threads_state.remove(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.threads_state.contains_key(&pid)
    }

    /// Thread table snapshot ordered by ascending thread id. Kernel event
    /// races are resolved with this ordering, making multi-trap stops
    /// deterministic.
    pub fn snapshot(&self) -> Vec<Tracee> {
        let mut tracees: Vec<Tracee> = self.threads_state.values().cloned().collect();
        tracees.sort_by_key(|t| t.pid);
        tracees
    }
}
