use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::breakpoint::BreakpointRegistry;
use crate::debugger::debugee::tracee::{StopType, Tracee, TraceeCtl, TraceeStatus};
use crate::debugger::error::Error;
use crate::debugger::target::{TargetControl, TargetEvent};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Whole debugee process exited with code
    DebugeeExit(i32),
    /// Debugee just started
    DebugeeStart,
    /// Debugee stopped at breakpoint
    Breakpoint(Pid, RelocatedAddress),
    /// Debugee stopped with OS signal
    SignalStop(Pid, Signal),
    /// Debugee stopped because the user asked for it
    ManualStop(Pid),
    /// Debugee stopped with Errno::ESRCH
    NoSuchProcess(Pid),
}

/// Thread controller: owns the per-thread state machines and serializes all
/// resume/wait cycles of the target.
pub struct Tracer {
    pub(super) tracee_ctl: TraceeCtl,
    manual_stop: Arc<AtomicBool>,
    arch: Arch,
}

impl Tracer {
    pub fn new(proc_pid: Pid, arch: Arch) -> Self {
        Self {
            tracee_ctl: TraceeCtl::new(proc_pid),
            manual_stop: Arc::new(AtomicBool::new(false)),
            arch,
        }
    }

    /// Flag raised by a manual stop request. Shared with the stop handle,
    /// which is the only piece of the debugger allowed on another thread.
    pub fn manual_stop_flag(&self) -> Arc<AtomicBool> {
        self.manual_stop.clone()
    }

    /// Continue debugee execution until stop happened.
    pub fn resume(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
    ) -> Result<StopReason, Error> {
        loop {
            self.cont_stopped(target, brkpts)?;
            let event = target.wait_any()?;
            if let Some(stop) = self.update_state(target, brkpts, event)? {
                return Ok(stop);
            }
        }
    }

    /// Continue all currently stopped tracees. A thread that reported a
    /// breakpoint hit (its PC was rewound onto the trap) first executes the
    /// original instruction via the step-over primitive; a thread merely
    /// interrupted at a trap address runs into it and reports the hit.
    fn cont_stopped(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
    ) -> Result<(), Error> {
        let mut errors = vec![];

        for tracee in self.tracee_ctl.snapshot() {
            if !tracee.is_stopped() {
                continue;
            }

            if tracee.current_breakpoint().is_some() {
                if let Err(e) = self.step_over_breakpoint(target, brkpts, tracee.pid) {
                    if is_esrch(&e) {
                        warn!("thread {} not found, ESRCH", tracee.pid);
                        self.tracee_ctl.remove(tracee.pid);
                        continue;
                    }
                    errors.push(e);
                    continue;
                }
            }

            // thread may already be gone or running after the step
            let pid = tracee.pid;
            let Some(tracee) = self.tracee_ctl.tracee_mut(pid) else {
                continue;
            };
            if !tracee.is_stopped() {
                continue;
            }

            if let Err(e) = tracee.r#continue(target, None) {
                if is_esrch(&e) {
                    warn!("thread {} not found, ESRCH", pid);
                    self.tracee_ctl.remove(pid);
                    continue;
                }
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(Error::MultipleErrors(errors));
        }
        Ok(())
    }

    /// Handle tracee event wired by the wait syscall.
    /// After this function ends the thread table must be in consistent state.
    /// If debugee process stop detected - returns stop reason.
    fn update_state(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        event: TargetEvent,
    ) -> Result<Option<StopReason>, Error> {
        match event {
            TargetEvent::Exited { tid, status } => {
                self.tracee_ctl.remove(tid);
                if tid == self.tracee_ctl.proc_pid() {
                    return Ok(Some(StopReason::DebugeeExit(status)));
                }
                Ok(None)
            }
            TargetEvent::Exec { tid } => {
                // fire just before debugee start, `fork()` in debugee is unsupported
                // so this event comes once
                if !self.tracee_ctl.contains(tid) {
                    self.tracee_ctl.add(tid);
                } else {
                    self.tracee_ctl
                        .tracee_ensure_mut(tid)
                        .set_stop(StopType::Interrupt);
                }
                Ok(Some(StopReason::DebugeeStart))
            }
            TargetEvent::Cloned { parent, child } => {
                self.tracee_ctl
                    .tracee_ensure_mut(parent)
                    .set_stop(StopType::Interrupt);

                // the child event-stop may have been seen first, then the
                // new tracee is already registered at this point
                if !self.tracee_ctl.contains(child) {
                    let new_tracee = self.tracee_ctl.add(child);
                    let status = new_tracee.wait_one(target)?;
                    debug_assert!(
                        matches!(status, TargetEvent::Stop { .. }),
                        "the newly cloned thread must start with an event-stop (PTRACE_SEIZE was used)"
                    );
                }
                Ok(None)
            }
            TargetEvent::Stop { tid } => {
                // fire right after new thread started or interrupt request delivered
                match self.tracee_ctl.tracee_mut(tid) {
                    Some(tracee) => tracee.set_stop(StopType::Interrupt),
                    None => {
                        self.tracee_ctl.add(tid);
                    }
                }
                Ok(None)
            }
            TargetEvent::ThreadExit { tid } => {
                // release the tracee so the kernel can finish the exit
                let tracee = self.tracee_ctl.remove(tid);
                if let Some(mut tracee) = tracee {
                    tracee.r#continue(target, None)?;
                }
                Ok(None)
            }
            TargetEvent::Trap { tid } | TargetEvent::SingleStep { tid } => {
                let mb_brkpt = self.fixup_trap(target, brkpts, tid)?;

                self.tracee_ctl.set_tracee_to_focus(tid);
                self.group_stop_interrupt(target, brkpts, tid)?;

                match mb_brkpt {
                    Some(_) => {
                        // when several threads race to installed traps in one
                        // resume cycle the lowest tid becomes the reported one
                        let (tid, addr) = self
                            .tracee_ctl
                            .snapshot()
                            .iter()
                            .filter_map(|t| t.current_breakpoint().map(|addr| (t.pid, addr)))
                            .next()
                            .expect("at least initiator must be at breakpoint");
                        self.tracee_ctl.set_tracee_to_focus(tid);
                        Ok(Some(StopReason::Breakpoint(tid, addr)))
                    }
                    // a trap we did not install (e.g. a trap compiled into
                    // the debugee) is reported as a bare signal stop
                    None => Ok(Some(StopReason::SignalStop(tid, Signal::SIGTRAP))),
                }
            }
            TargetEvent::SignalStop { tid, signal } => {
                if signal == Signal::SIGSTOP && self.manual_stop.swap(false, Ordering::SeqCst) {
                    if let Some(tracee) = self.tracee_ctl.tracee_mut(tid) {
                        tracee.set_stop(StopType::Interrupt);
                    }
                    self.tracee_ctl.set_tracee_to_focus(tid);
                    self.group_stop_interrupt(target, brkpts, tid)?;
                    return Ok(Some(StopReason::ManualStop(tid)));
                }

                if let Some(tracee) = self.tracee_ctl.tracee_mut(tid) {
                    tracee.set_stop(StopType::SignalStop(signal));
                }
                self.tracee_ctl.set_tracee_to_focus(tid);
                self.group_stop_interrupt(target, brkpts, tid)?;
                Ok(Some(StopReason::SignalStop(tid, signal)))
            }
            TargetEvent::NoSuchProcess { tid } => Ok(Some(StopReason::NoSuchProcess(tid))),
            TargetEvent::Spurious => Ok(None),
        }
    }

    /// Classify a trap event on one thread: if PC minus the trap length
    /// matches an installed breakpoint, rewind PC onto it and record the hit.
    fn fixup_trap(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        tid: Pid,
    ) -> Result<Option<RelocatedAddress>, Error> {
        let pc = self.tracee_ctl.tracee_ensure(tid).pc(target)?;
        let rewound = pc.offset(-(self.arch.trap_rewind as isize));

        if let Some(brkpt) = brkpts.enabled_at(rewound) {
            let tracee = self.tracee_ctl.tracee_ensure_mut(tid);
            tracee.set_pc(target, rewound)?;
            tracee.set_stop(StopType::Breakpoint(rewound));
            brkpt.register_hit(tid);
            debug!(target: "tracer", "breakpoint {} hit, thread: {tid}", brkpt.number);
            return Ok(Some(rewound));
        }

        self.tracee_ctl
            .tracee_ensure_mut(tid)
            .set_stop(StopType::Interrupt);
        Ok(None)
    }

    /// For stop whole debugee process this function stops tracees (threads)
    /// one by one using the interrupt request.
    /// If tracee receives signals before interrupt - handle signals.
    fn group_stop_interrupt(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        initiator_pid: Pid,
    ) -> Result<(), Error> {
        let has_non_stopped = self
            .tracee_ctl
            .snapshot()
            .into_iter()
            .any(|t| t.pid != initiator_pid && !t.is_stopped());
        if !has_non_stopped {
            // no need to group-stop
            return Ok(());
        }

        // two rounds, threads spawned while the first round settles are
        // interrupted by the second
        for _ in 0..2 {
            let tracees = self.tracee_ctl.snapshot();

            for tracee in tracees {
                if tracee.status != TraceeStatus::Running {
                    continue;
                }

                if let Err(e) = target.interrupt(tracee.pid) {
                    // if no such process - the tracee will be removed later,
                    // on the thread exit event
                    if is_esrch(&e) {
                        warn!("thread {} not found, ESRCH", tracee.pid);
                        if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                            t.set_stop(StopType::Interrupt);
                        }
                        continue;
                    }
                    return Err(e);
                }

                let mut tracee = tracee;
                loop {
                    let event = tracee.wait_one(target)?;
                    match event {
                        TargetEvent::Stop { .. } | TargetEvent::SingleStep { .. } => {
                            if let Some(t) = self.tracee_ctl.tracee_mut(tracee.pid) {
                                t.set_stop(StopType::Interrupt);
                            }
                            break;
                        }
                        TargetEvent::Trap { tid } => {
                            // tracee reached one of our breakpoints while the
                            // interrupt was in flight, keep its record
                            self.fixup_trap(target, brkpts, tid)?;
                            break;
                        }
                        TargetEvent::SignalStop { tid, signal } => {
                            // tracee in signal-stop, inject the signal and keep waiting
                            if let Some(t) = self.tracee_ctl.tracee_mut(tid) {
                                t.r#continue(target, Some(signal))?;
                            } else {
                                break;
                            }
                        }
                        TargetEvent::ThreadExit { tid } => {
                            if let Some(mut t) = self.tracee_ctl.remove(tid) {
                                t.r#continue(target, None)?;
                            }
                            break;
                        }
                        TargetEvent::Exited { tid, status } => {
                            self.tracee_ctl.remove(tid);
                            if tid == self.tracee_ctl.proc_pid() {
                                return Err(Error::ProcessExited { pid: tid, status });
                            }
                            break;
                        }
                        TargetEvent::Cloned { parent, child } => {
                            if !self.tracee_ctl.contains(child) {
                                self.tracee_ctl.add(child);
                            }
                            if let Some(t) = self.tracee_ctl.tracee_mut(parent) {
                                t.set_stop(StopType::Interrupt);
                            }
                            break;
                        }
                        TargetEvent::NoSuchProcess { tid } => {
                            self.tracee_ctl.remove(tid);
                            break;
                        }
                        TargetEvent::Exec { .. } | TargetEvent::Spurious => {}
                    }

                    // reload tracee, its state may change after signal handling
                    tracee = match self.tracee_ctl.tracee(tracee.pid).cloned() {
                        None => break,
                        Some(t) => t,
                    };
                }
            }
        }

        Ok(())
    }

    /// Execute the original instruction under a breakpoint without removing
    /// the breakpoint permanently: restore the byte, single-step, splice the
    /// trap back.
    pub fn step_over_breakpoint(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        tid: Pid,
    ) -> Result<(), Error> {
        let pc = self.tracee_ctl.tracee_ensure(tid).pc(target)?;
        if let Some(brkpt) = brkpts.enabled_at(pc) {
            brkpt.disable(target)?;
            let step_result = self.single_step_raw(target, brkpts, tid);
            let enable_result = brkpt.enable(target, self.arch);
            step_result?;
            enable_result?;
        }
        Ok(())
    }

    /// Single-step one thread, stepping over an installed breakpoint when
    /// the PC is parked on one.
    pub fn single_step(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        tid: Pid,
    ) -> Result<(), Error> {
        let pc = self.tracee_ctl.tracee_ensure(tid).pc(target)?;
        if brkpts.enabled_at(pc).is_some() {
            self.step_over_breakpoint(target, brkpts, tid)
        } else {
            self.single_step_raw(target, brkpts, tid)
        }
    }

    fn single_step_raw(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
        tid: Pid,
    ) -> Result<(), Error> {
        target.single_step(tid)?;
        self.tracee_ctl.tracee_ensure_mut(tid).set_running();

        loop {
            let event = target.wait_thread(tid)?;
            match event {
                TargetEvent::SingleStep { .. } | TargetEvent::Stop { .. } => {
                    self.tracee_ctl
                        .tracee_ensure_mut(tid)
                        .set_stop(StopType::Interrupt);
                    return Ok(());
                }
                TargetEvent::Trap { .. } => {
                    // the step landed on an installed trap byte
                    self.fixup_trap(target, brkpts, tid)?;
                    return Ok(());
                }
                TargetEvent::SignalStop { tid, signal } => {
                    self.tracee_ctl
                        .tracee_ensure_mut(tid)
                        .set_stop(StopType::SignalStop(signal));
                    return Ok(());
                }
                TargetEvent::Cloned { child, .. } => {
                    // stepped over a clone syscall
                    if !self.tracee_ctl.contains(child) {
                        self.tracee_ctl.add(child);
                    }
                    target.single_step(tid)?;
                }
                TargetEvent::ThreadExit { tid: exited } => {
                    if let Some(mut t) = self.tracee_ctl.remove(exited) {
                        t.r#continue(target, None)?;
                    }
                    if exited == tid {
                        return Err(Error::InvalidThread(tid));
                    }
                }
                TargetEvent::Exited { tid: exited, status } => {
                    self.tracee_ctl.remove(exited);
                    return Err(Error::ProcessExited {
                        pid: exited,
                        status,
                    });
                }
                TargetEvent::NoSuchProcess { tid } => {
                    self.tracee_ctl.remove(tid);
                    return Err(Error::InvalidThread(tid));
                }
                TargetEvent::Exec { .. } | TargetEvent::Spurious => {}
            }
        }
    }

}

fn is_esrch(err: &Error) -> bool {
    matches!(
        err,
        Error::Ptrace(Errno::ESRCH) | Error::Waitpid(Errno::ESRCH) | Error::Syscall(_, Errno::ESRCH)
    )
}
