//! Source level stepping: move the selected goroutine one source line
//! forward, over scheduler switches, deferred bodies and function returns.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::tracer::StopReason;
use crate::debugger::error::Error;
use crate::debugger::Debugger;
use crate::muted_error;
use log::debug;
use nix::unistd::Pid;
use std::collections::HashSet;

impl Debugger {
    /// Step the selected goroutine over one source line.
    ///
    /// Temporary breakpoints go to every statement of the enclosing function
    /// that starts a different line, to the return site and to a pending
    /// deferred dispatch site. Stops of other goroutines on those traps are
    /// absorbed silently. After return the temporaries are gone and the user
    /// breakpoint table is unchanged.
    pub fn next(&mut self) -> Result<(), Error> {
        self.ensure_stopped()?;

        let location = self.current_location()?;
        let func = self
            .info
            .function_by_pc(location.global_pc)
            .ok_or(Error::FunctionNotFound(format!("at {}", location.pc)))?;
        let current_place = self
            .info
            .place_from_pc(location.global_pc)
            .ok_or(Error::PlaceNotFound(location.global_pc))?;

        // the goroutine this step belongs to, when the runtime is visible
        let step_goroutine = self
            .introspector()
            .ok()
            .and_then(|gsched| gsched.current(location.pid).ok().flatten());
        let step_goroutine_id = step_goroutine.map(|g| g.id);

        // line exit set: statement starts of every other line of the function
        let mut candidates: Vec<RelocatedAddress> = self
            .info
            .function_places(&func)
            .iter()
            .filter(|place| {
                place.is_stmt
                    && place.address != current_place.address
                    && place.line_number != current_place.line_number
            })
            .map(|place| place.address.relocate(self.mapping_offset()))
            .collect();

        // the return site covers stepping off the last statement
        if let Ok(ret_addr) = self.return_address(location.pid) {
            candidates.push(ret_addr);
        }

        // a pending deferred call runs before the function epilogue
        if let Some(goroutine) = &step_goroutine {
            if let Ok(gsched) = self.introspector() {
                if let Some(defer_pc) = muted_error!(gsched.defer_pc(goroutine)).flatten() {
                    candidates.push(defer_pc);
                }
            }
        }

        let mut installed: HashSet<RelocatedAddress> = HashSet::new();
        for addr in candidates {
            if self.breakpoints.enabled_at(addr).is_some() || installed.contains(&addr) {
                continue;
            }
            self.breakpoints
                .set_temporary(self.target.as_ref(), self.arch, addr)?;
            installed.insert(addr);
        }
        debug!(
            target: "debugger",
            "next from line {}: {} temporary breakpoints",
            current_place.line_number,
            installed.len()
        );

        let result = self.next_stop_loop(step_goroutine_id, &installed);

        if self.exited() {
            // target memory is gone, drop the records only
            self.breakpoints.forget_temporaries();
        } else {
            self.breakpoints.clear_temporaries(self.target.as_ref())?;
        }

        result
    }

    /// Resume until the stepped goroutine reaches one of the step traps (or
    /// a user visible stop happens). Foreign goroutines hitting step traps
    /// are stepped over and silently resumed.
    fn next_stop_loop(
        &mut self,
        step_goroutine_id: Option<u64>,
        installed: &HashSet<RelocatedAddress>,
    ) -> Result<(), Error> {
        loop {
            let reason = self
                .debugee
                .trace_until_stop(self.target.as_ref(), &self.breakpoints)?;

            match reason {
                StopReason::DebugeeExit(code) => {
                    self.exit_status = Some(code);
                    return Err(Error::ProcessExited {
                        pid: self.target.pid(),
                        status: code,
                    });
                }
                StopReason::Breakpoint(tid, addr) => {
                    if !installed.contains(&addr) {
                        // a user breakpoint outranks the step
                        self.refresh_selected_goroutine(tid);
                        return Ok(());
                    }

                    if self.stop_belongs_to_step(tid, step_goroutine_id) {
                        self.refresh_selected_goroutine(tid);
                        return Ok(());
                    }

                    debug!(
                        target: "debugger",
                        "foreign goroutine at step trap {addr}, thread {tid}, resuming"
                    );
                    self.step_over_trap(tid)?;
                }
                StopReason::ManualStop(tid) => {
                    self.refresh_selected_goroutine(tid);
                    return Ok(());
                }
                StopReason::SignalStop(tid, signal) => {
                    debug!(target: "debugger", "signal {signal} during step, thread {tid}");
                    self.refresh_selected_goroutine(tid);
                    return Ok(());
                }
                StopReason::DebugeeStart | StopReason::NoSuchProcess(_) => return Ok(()),
            }
        }
    }

    /// A stop belongs to the step when it happens on the goroutine the step
    /// started on. Without runtime introspection every stop matches.
    fn stop_belongs_to_step(&self, tid: Pid, step_goroutine_id: Option<u64>) -> bool {
        let Some(expected) = step_goroutine_id else {
            return true;
        };
        let Ok(gsched) = self.introspector() else {
            return true;
        };
        match gsched.current(tid) {
            Ok(Some(g)) => g.id == expected,
            // threads outside the runtime can not carry the stepped goroutine
            Ok(None) => false,
            Err(_) => true,
        }
    }

    fn step_over_trap(&mut self, tid: Pid) -> Result<(), Error> {
        self.debugee
            .tracer
            .step_over_breakpoint(self.target.as_ref(), &self.breakpoints, tid)
    }

    /// Step one machine instruction on the thread in focus.
    pub fn step(&mut self) -> Result<(), Error> {
        self.step_instruction()
    }
}
