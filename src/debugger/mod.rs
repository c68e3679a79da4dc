pub mod address;
pub mod arch;
pub mod breakpoint;
pub mod debug_info;
pub mod debugee;
pub mod error;
pub mod goroutine;
#[cfg(test)]
pub(crate) mod mock;
mod next;
pub mod register;
pub mod target;
pub mod unwind;
pub mod variable;

pub use crate::debugger::debugee::tracer::StopReason;
pub use crate::debugger::debugee::Location;
pub use crate::debugger::error::Error;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::breakpoint::{Breakpoint, BreakpointRegistry};
use crate::debugger::debug_info::{DebugInfo, Place};
use crate::debugger::debugee::tracee::Tracee;
use crate::debugger::debugee::{Debugee, ExecutionStatus};
use crate::debugger::goroutine::{Goroutine, GoroutineIntrospector, GoroutineLayout};
use crate::debugger::target::{read_ptr, TargetControl};
use crate::debugger::unwind::Backtrace;
use crate::debugger::variable::eval::EvalScope;
use crate::debugger::variable::{LoadContext, Variable};
use crate::version::{self, GoVersion, GO_1_5};
use crate::weak_error;
use log::{info, warn};
use nix::sys::signal::{Signal, SIGSTOP};
use object::Object;
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default frame limit for stack walks.
pub const DEFAULT_STACK_DEPTH: usize = 50;

/// Thread state visible to the debugger user.
pub struct ThreadSnapshot {
    pub thread: Tracee,
    pub place: Option<Place>,
    pub bt: Option<Backtrace>,
    pub in_focus: bool,
}

/// Manual-stop requester. The only part of the debugger that may be used
/// from another thread: it raises the stop flag and delivers a stop signal
/// with a plain `kill(2)`, no ptrace calls involved.
#[derive(Clone)]
pub struct StopHandle {
    pid: Pid,
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), Error> {
        self.flag.store(true, Ordering::SeqCst);
        nix::sys::signal::kill(self.pid, SIGSTOP).map_err(|e| Error::Syscall("kill", e))
    }
}

/// Source level debugger for Go programs.
///
/// Owns the target process handle, the symbol oracle, the breakpoint table
/// and the per-thread state machines. All methods must be called from one
/// thread (see [`StopHandle`] for the single exception).
pub struct Debugger {
    target: Box<dyn TargetControl>,
    info: Box<dyn DebugInfo>,
    arch: Arch,
    debugee: Debugee,
    breakpoints: BreakpointRegistry,
    go_version: GoVersion,
    g_layout: Option<GoroutineLayout>,
    selected_goroutine: Option<u64>,
    exit_status: Option<i32>,
}

impl Debugger {
    /// Assemble a debugger from its parts. The target must already be
    /// attached and stopped.
    pub fn new(
        target: Box<dyn TargetControl>,
        info: Box<dyn DebugInfo>,
        path: &Path,
        object_kind: object::ObjectKind,
        arch: Arch,
    ) -> Self {
        let proc_pid = target.pid();
        Self {
            target,
            info,
            arch,
            debugee: Debugee::new_non_running(path, proc_pid, object_kind, arch),
            breakpoints: BreakpointRegistry::default(),
            go_version: GO_1_5,
            g_layout: None,
            selected_goroutine: None,
            exit_status: None,
        }
    }

    /// Start a program under trace and run it to its entry.
    pub fn launch<ARGS, I>(
        program: &str,
        args: ARGS,
        stdout: os_pipe::PipeWriter,
        stderr: os_pipe::PipeWriter,
    ) -> Result<Self, Error>
    where
        ARGS: IntoIterator<Item = I>,
        I: Into<String>,
    {
        let process = target::linux::Child::new(program, args, None::<&Path>, stdout, stderr)
            .install()?;
        Self::from_installed(program, process)
    }

    /// Attach to a running process by pid and bring it to a stop.
    pub fn attach(
        pid: Pid,
        stdout: os_pipe::PipeWriter,
        stderr: os_pipe::PipeWriter,
    ) -> Result<Self, Error> {
        let process = target::linux::Child::from_external(pid, stdout, stderr)?;
        let program = process.program().to_string();
        let threads: Vec<Pid> = process
            .external_info()
            .map(|info| info.threads.clone())
            .unwrap_or_default();

        let file = std::fs::File::open(&program)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        let object_kind = object.kind();
        let info = debugee::dwarf::DwarfInfo::build(&object)?;

        let mut debugger = Debugger::new(
            Box::new(target::linux::LinuxTarget::new(process)),
            Box::new(info),
            Path::new(&program),
            object_kind,
            Arch::X86_64,
        );
        for tid in threads {
            if !debugger.debugee.tracee_ctl().contains(tid) {
                debugger.debugee.tracee_ctl_mut().add(tid);
            }
        }
        debugger.debugee.mark_attached(debugger.target.as_ref())?;
        debugger.init_runtime_view();
        Ok(debugger)
    }

    fn from_installed(
        program: &str,
        process: target::linux::Child<target::linux::Installed>,
    ) -> Result<Self, Error> {
        let file = std::fs::File::open(program)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        let object_kind = object.kind();
        let info = debugee::dwarf::DwarfInfo::build(&object)?;

        let mut debugger = Debugger::new(
            Box::new(target::linux::LinuxTarget::new(process)),
            Box::new(info),
            Path::new(program),
            object_kind,
            Arch::X86_64,
        );
        debugger.start()?;
        Ok(debugger)
    }

    pub fn pid(&self) -> Pid {
        self.target.pid()
    }

    /// Run the freshly attached debugee up to its entry: the image is
    /// mapped afterwards, breakpoints can be placed.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.debugee.execution_status != ExecutionStatus::Unload {
            return Err(Error::AlreadyRun);
        }

        let reason = self
            .debugee
            .trace_until_stop(self.target.as_ref(), &self.breakpoints)?;
        match reason {
            StopReason::DebugeeStart => {}
            StopReason::DebugeeExit(code) => {
                self.exit_status = Some(code);
                return Err(Error::ProcessExited {
                    pid: self.target.pid(),
                    status: code,
                });
            }
            unexpected => {
                warn!(target: "debugger", "unexpected stop at launch: {unexpected:?}");
            }
        }

        self.init_runtime_view();
        Ok(())
    }

    /// Runtime version and struct layouts, best effort: a debugee without
    /// the expected runtime data keeps thread level debugging only.
    fn init_runtime_view(&mut self) {
        self.go_version = self.read_build_version().unwrap_or(GO_1_5);
        if !version::probe_version(self.go_version) {
            warn!(
                target: "debugger",
                "runtime version {:?} is not supported, supported versions: {}",
                self.go_version,
                version::supported_versions_to_string()
            );
        }

        self.g_layout = weak_error!(
            GoroutineLayout::resolve(self.info.as_ref(), self.go_version),
            "goroutine introspection disabled:"
        );
    }

    /// `runtime.buildVersion` is an ordinary Go string in target memory.
    fn read_build_version(&self) -> Option<GoVersion> {
        let sym = self.info.symbol_address("runtime.buildVersion")?;
        let addr = sym.relocate(self.mapping_offset());

        let str_ptr = weak_error!(read_ptr(self.target.as_ref(), addr, self.arch.ptr_size))?;
        let str_len = weak_error!(read_ptr(
            self.target.as_ref(),
            addr.offset(self.arch.ptr_size as isize),
            self.arch.ptr_size
        ))?;
        if str_ptr == 0 || str_len == 0 || str_len > 64 {
            return None;
        }

        let raw = weak_error!(self
            .target
            .read_memory(RelocatedAddress::from(str_ptr), str_len as usize))?;
        let version_str = std::str::from_utf8(&raw).ok()?;
        info!(target: "debugger", "debugee runtime version: {version_str}");
        GoVersion::parse(version_str)
    }

    fn mapping_offset(&self) -> usize {
        self.debugee.mapping_offset()
    }

    /// Fails unless every thread is stopped.
    fn ensure_stopped(&self) -> Result<(), Error> {
        if self.exited() {
            return Err(Error::ProcessExited {
                pid: self.target.pid(),
                status: self.exit_status.unwrap_or(0),
            });
        }
        if self.running() {
            return Err(Error::TargetRunning);
        }
        Ok(())
    }

    // --------------------------------- breakpoints -----------------------------------------------

    pub fn set_breakpoint(&mut self, addr: RelocatedAddress) -> Result<&Breakpoint, Error> {
        self.ensure_stopped()?;
        self.breakpoints.set(self.target.as_ref(), self.arch, addr)
    }

    pub fn clear_breakpoint(&mut self, addr: RelocatedAddress) -> Result<Breakpoint, Error> {
        self.ensure_stopped()?;
        self.breakpoints.clear(self.target.as_ref(), addr)
    }

    /// Address of a function suitable for a breakpoint: the function entry,
    /// or the first statement behind the prologue.
    pub fn find_function_location(
        &self,
        name: &str,
        first_line: bool,
    ) -> Result<RelocatedAddress, Error> {
        let func = self
            .info
            .function_by_name(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;

        let global = if first_line {
            let places = self.info.function_places(&func);
            places
                .iter()
                .find(|p| p.is_stmt && p.address > func.entry())
                .map(|p| p.address)
                .unwrap_or_else(|| func.entry())
        } else {
            func.entry()
        };

        Ok(global.relocate(self.mapping_offset()))
    }

    pub fn set_breakpoint_at_fn(&mut self, name: &str) -> Result<&Breakpoint, Error> {
        let addr = self.find_function_location(name, true)?;
        self.set_breakpoint(addr)
    }

    pub fn set_breakpoint_at_line(&mut self, file: &str, line: u64) -> Result<&Breakpoint, Error> {
        let places = self.info.places_for_line(file, line);
        let place = places.first().ok_or(Error::NoSuitablePlace)?;
        let addr = place.address.relocate(self.mapping_offset());
        self.set_breakpoint(addr)
    }

    /// User visible breakpoints.
    pub fn breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints.user_breakpoints().collect()
    }

    /// Breakpoint the thread in focus is currently stopped at.
    pub fn current_breakpoint(&self) -> Option<&Breakpoint> {
        let addr = self.debugee.tracee_in_focus().current_breakpoint()?;
        self.breakpoints.at(addr)
    }

    // --------------------------------- execution control -----------------------------------------

    /// Resume the whole process and block until the next meaningful stop.
    /// Natural debugee end is reported as [`StopReason::DebugeeExit`], not
    /// as an error.
    pub fn continue_execution(&mut self) -> Result<StopReason, Error> {
        self.ensure_stopped()?;

        loop {
            let reason = self
                .debugee
                .trace_until_stop(self.target.as_ref(), &self.breakpoints)?;

            match reason {
                StopReason::DebugeeExit(code) => {
                    self.exit_status = Some(code);
                    return Ok(reason);
                }
                StopReason::Breakpoint(tid, addr) => {
                    self.refresh_selected_goroutine(tid);

                    // conditional breakpoints resume silently when the
                    // condition does not hold
                    let condition = self.breakpoints.at(addr).and_then(|b| b.condition());
                    if let Some(condition) = condition {
                        if !self.breakpoint_condition_holds(&condition) {
                            continue;
                        }
                    }
                    return Ok(reason);
                }
                StopReason::ManualStop(tid) | StopReason::SignalStop(tid, _) => {
                    self.refresh_selected_goroutine(tid);
                    return Ok(reason);
                }
                StopReason::DebugeeStart | StopReason::NoSuchProcess(_) => {
                    return Ok(reason);
                }
            }
        }
    }

    fn breakpoint_condition_holds(&self, condition: &str) -> bool {
        match self.eval_expression(condition) {
            Ok(value) => matches!(
                value.value,
                Some(variable::constant::Constant::Bool(true))
            ),
            Err(e) => {
                warn!(target: "debugger", "breakpoint condition failed: {e:#}");
                true
            }
        }
    }

    /// Execute one machine instruction on the thread in focus.
    pub fn step_instruction(&mut self) -> Result<(), Error> {
        self.ensure_stopped()?;
        let tid = self.debugee.tracee_in_focus().pid;
        self.debugee
            .tracer
            .single_step(self.target.as_ref(), &self.breakpoints, tid)
    }

    /// Stop every thread of a running target. A no-op when the target is
    /// stopped already.
    pub fn halt(&mut self) -> Result<(), Error> {
        if !self.running() {
            return Ok(());
        }
        self.request_manual_stop()
    }

    /// Request a stop of the running debugee from this thread.
    pub fn request_manual_stop(&self) -> Result<(), Error> {
        self.debugee
            .tracer
            .manual_stop_flag()
            .store(true, Ordering::SeqCst);
        self.target.send_signal(SIGSTOP)
    }

    /// Handle for requesting a manual stop from a background thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            pid: self.target.pid(),
            flag: self.debugee.tracer.manual_stop_flag(),
        }
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        if self.exited() {
            return Ok(());
        }
        self.target.kill()?;
        self.debugee.execution_status = ExecutionStatus::Exited;
        self.exit_status = Some(-(Signal::SIGKILL as i32));
        Ok(())
    }

    pub fn exited(&self) -> bool {
        self.debugee.is_exited()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// True while at least one thread is resumed.
    pub fn running(&self) -> bool {
        self.debugee
            .tracee_ctl()
            .snapshot()
            .iter()
            .any(|t| !t.is_stopped())
    }

    // --------------------------------- threads ---------------------------------------------------

    pub fn switch_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.ensure_stopped()?;
        if !self.debugee.tracee_ctl().contains(tid) {
            return Err(Error::InvalidThread(tid));
        }
        self.debugee.tracee_ctl_mut().set_tracee_to_focus(tid);
        self.refresh_selected_goroutine(tid);
        Ok(())
    }

    pub fn thread_state(&self) -> Result<Vec<ThreadSnapshot>, Error> {
        self.ensure_stopped()?;
        let focus = self.debugee.tracee_in_focus().pid;
        let threads = self.debugee.tracee_ctl().snapshot();

        Ok(threads
            .into_iter()
            .map(|tracee| {
                let place = weak_error!(self.debugee.location(self.target.as_ref(), tracee.pid))
                    .and_then(|location| self.info.place_from_pc(location.global_pc));
                let bt = weak_error!(self.stacktrace(tracee.pid, DEFAULT_STACK_DEPTH));
                ThreadSnapshot {
                    in_focus: tracee.pid == focus,
                    thread: tracee,
                    place,
                    bt,
                }
            })
            .collect())
    }

    /// Current location of the thread in focus.
    pub fn current_location(&self) -> Result<Location, Error> {
        self.debugee
            .location(self.target.as_ref(), self.debugee.tracee_in_focus().pid)
    }

    pub fn pc_to_line(&self, pc: RelocatedAddress) -> Option<Place> {
        self.info
            .place_from_pc(pc.into_global(self.mapping_offset()))
    }

    // --------------------------------- stack walking ---------------------------------------------

    pub fn stacktrace(&self, tid: Pid, depth: usize) -> Result<Backtrace, Error> {
        let regs = self.target.registers(tid)?;
        unwind::unwind(
            self.info.as_ref(),
            self.target.as_ref(),
            self.arch,
            self.mapping_offset(),
            RelocatedAddress::from(regs.pc()),
            RelocatedAddress::from(regs.sp()),
            depth,
        )
    }

    pub fn return_address(&self, tid: Pid) -> Result<RelocatedAddress, Error> {
        let regs = self.target.registers(tid)?;
        unwind::return_addr(
            self.info.as_ref(),
            self.target.as_ref(),
            self.arch,
            self.mapping_offset(),
            RelocatedAddress::from(regs.pc()),
            RelocatedAddress::from(regs.sp()),
        )
    }

    // --------------------------------- goroutines ------------------------------------------------

    fn introspector(&self) -> Result<GoroutineIntrospector<'_>, Error> {
        let layout = self
            .g_layout
            .as_ref()
            .ok_or(Error::NoDebugInformation("goroutine layout"))?;
        Ok(GoroutineIntrospector {
            info: self.info.as_ref(),
            target: self.target.as_ref(),
            arch: self.arch,
            mapping_offset: self.mapping_offset(),
            layout,
        })
    }

    fn refresh_selected_goroutine(&mut self, tid: Pid) {
        self.selected_goroutine = self
            .introspector()
            .ok()
            .and_then(|gsched| gsched.current(tid).ok().flatten())
            .map(|g| g.id);
    }

    pub fn selected_goroutine(&self) -> Option<u64> {
        self.selected_goroutine
    }

    /// All goroutines of the runtime; positions of running goroutines come
    /// from their thread registers instead of the stale scheduling site.
    pub fn goroutines_info(&self) -> Result<Vec<Goroutine>, Error> {
        self.ensure_stopped()?;
        let gsched = self.introspector()?;
        let mut goroutines = gsched.all()?;

        for tracee in self.debugee.tracee_ctl().snapshot() {
            if let Some(running) = weak_error!(gsched.current(tracee.pid)).flatten() {
                if let Some(g) = goroutines.iter_mut().find(|g| g.id == running.id) {
                    *g = running;
                }
            }
        }
        Ok(goroutines)
    }

    pub fn goroutine_stacktrace(&self, id: u64, depth: usize) -> Result<Backtrace, Error> {
        let goroutine = self
            .goroutines_info()?
            .into_iter()
            .find(|g| g.id == id)
            .ok_or(Error::GoroutineNotFound(id))?;

        unwind::unwind(
            self.info.as_ref(),
            self.target.as_ref(),
            self.arch,
            self.mapping_offset(),
            goroutine.pc,
            goroutine.sp,
            depth,
        )
    }

    // --------------------------------- expressions -----------------------------------------------

    /// Evaluate an expression in the scope of the thread in focus.
    pub fn eval_expression(&self, source: &str) -> Result<Variable, Error> {
        self.ensure_stopped()?;
        let location = self.current_location()?;

        let regs = self.target.registers(location.pid)?;
        let sp = RelocatedAddress::from(regs.sp());
        // without frame description data the frame base defaults to the
        // stack pointer, constants still evaluate
        let frame_base = match self.info.cfa_offset(location.global_pc) {
            Ok(cfa_offset) => sp.offset(cfa_offset as isize),
            Err(_) => sp,
        };

        let scope = EvalScope::new(
            LoadContext::new(
                self.info.as_ref(),
                self.target.as_ref(),
                self.arch,
                self.mapping_offset(),
            ),
            location.global_pc,
            frame_base,
        );
        scope.eval_expression(source)
    }
}
