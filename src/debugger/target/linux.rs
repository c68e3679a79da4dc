//! Linux implementation of the target control boundary, built on the
//! ptrace seize-style interface.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::{SI_KERNEL, TRAP_BRKPT, TRAP_TRACE};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use crate::debugger::register::{Register, Registers};
use crate::debugger::target::{TargetControl, TargetEvent};
use log::warn;
use nix::errno::Errno;
use nix::libc::{c_long, pid_t, user_regs_struct};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::{AddressType, Options};
use nix::sys::signal::{Signal, SIGKILL, SIGSTOP, SIGTRAP};
use nix::sys::wait::WaitStatus::PtraceEvent;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use nix::{libc, sys::signal};
use os_pipe::PipeWriter;
use std::collections::HashSet;
use std::iter;
use std::marker::PhantomData;
use std::mem;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{RefreshKind, System};

const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Process state.
pub trait State {}

/// Process running and attached with the ptrace seize request.
pub struct Installed;

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// External process information.
pub struct ExternalInfo {
    /// List of threads observed at the time of attaching.
    pub threads: Vec<Pid>,
}

/// Debugee process, attached to the tracer with ptrace.
pub struct Child<S: State> {
    program: String,
    stdout: PipeWriter,
    stderr: PipeWriter,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    pid: Option<Pid>,
    external_info: Option<ExternalInfo>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create a new process without starting it.
    ///
    /// # Arguments
    ///
    /// * `program`: program name
    /// * `args`: program arguments
    /// * `cwd`: working directory for the debugee
    /// * `stdout`: stdout pipe
    /// * `stderr`: stderr pipe
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<String>,
        args: ARGS,
        cwd: Option<impl Into<PathBuf>>,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Child<Template> {
        Self {
            stdout,
            stderr,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.map(Into::into),
            pid: None,
            external_info: None,
            _p: PhantomData,
        }
    }
}

impl Child<Installed> {
    /// Return the running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed process must have a pid")
    }

    /// Create a [`Child`] from an already running external process.
    ///
    /// All threads observed at attach time are seized and interrupted, the
    /// process comes back fully stopped.
    ///
    /// # Arguments
    ///
    /// * `pid`: an external process pid
    /// * `stdout`: stdout pipe, unused by the external process itself but kept for a possible restart
    /// * `stderr`: stderr pipe, same as `stdout`
    pub fn from_external(pid: Pid, stdout: PipeWriter, stderr: PipeWriter) -> Result<Self, Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());

        let external_process = System::process(&sys, sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::AttachedProcessNotFound(pid))?;

        let program_name = external_process
            .exe()
            .ok_or(Error::AttachedProcessNotFound(pid))?
            .to_string_lossy()
            .to_string();

        let cwd = external_process.cwd().map(ToOwned::to_owned);

        let mut interrupted_threads = HashSet::new();
        // two interrupt rounds, threads spawned while the first round
        // settles are caught by the second
        for _ in 0..2 {
            let threads_iter = iter::once(pid);
            let threads: Vec<Pid> = if let Some(tasks) = external_process.tasks() {
                threads_iter
                    .chain(tasks.iter().map(|tid| Pid::from_raw(tid.as_u32() as i32)))
                    .collect()
            } else {
                threads_iter.collect()
            };

            let threads: Vec<Pid> = threads
                .into_iter()
                .filter(|t| !interrupted_threads.contains(t))
                .collect();

            for tid in &threads {
                sys::ptrace::seize(*tid, TRACE_OPTIONS).map_err(Error::Attach)?;
            }

            for tid in &threads {
                sys::ptrace::interrupt(*tid).map_err(Error::Attach)?;
            }

            for tid in &threads {
                let status = waitpid(*tid, None).map_err(Error::Attach)?;
                // currently we assume that the attached process is not in a stop status
                debug_assert!(matches!(status, PtraceEvent(_, SIGTRAP, _)));
            }

            interrupted_threads.extend(threads);
        }

        Ok(Self {
            stdout,
            stderr,
            program: program_name,
            args: external_process.cmd()[1..]
                .iter()
                .map(|s| s.to_string_lossy().into_owned())
                .collect(),
            cwd,
            pid: Some(pid),
            external_info: Some(ExternalInfo {
                threads: interrupted_threads.into_iter().collect(),
            }),
            _p: PhantomData,
        })
    }
}

impl<S: State> Child<S> {
    /// Return the program name.
    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    /// True when the process was attached by its pid, false elsewhere.
    pub fn is_external(&self) -> bool {
        self.external_info.is_some()
    }

    /// Return [`ExternalInfo`] if the underlying process is external.
    pub fn external_info(&self) -> Option<&ExternalInfo> {
        self.external_info.as_ref()
    }

    /// Instantiate the process by a `fork()` system call with the caller as
    /// the parent. The child raises `SIGSTOP` before exec so the tracer can
    /// seize it while frozen.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.program);
        let debugee_cmd = debugee_cmd
            .args(&self.args)
            .stdout(self.stdout.try_clone()?)
            .stderr(self.stderr.try_clone()?);

        if let Some(cwd) = self.cwd.as_deref() {
            debugee_cmd.current_dir(cwd);
        }

        unsafe {
            debugee_cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                Ok(())
            });
        }

        match unsafe { fork().expect("fork() error") } {
            ForkResult::Parent { child: pid } => {
                waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, TRACE_OPTIONS).map_err(Ptrace)?;

                Ok(Child {
                    stdout: self.stdout.try_clone()?,
                    stderr: self.stderr.try_clone()?,
                    program: self.program.clone(),
                    args: self.args.clone(),
                    cwd: self.cwd.clone(),
                    pid: Some(pid),
                    external_info: None,
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                sys::signal::raise(SIGSTOP).unwrap();
                let err = debugee_cmd.exec();
                panic!("run debugee fail with: {err}");
            }
        }
    }
}

/// The one Linux target: ptrace requests plus wait status classification
/// into [`TargetEvent`]s.
pub struct LinuxTarget {
    process: Child<Installed>,
}

impl LinuxTarget {
    pub fn new(process: Child<Installed>) -> Self {
        Self { process }
    }

    /// Underlying process handle.
    pub fn process(&self) -> &Child<Installed> {
        &self.process
    }
}

impl TargetControl for LinuxTarget {
    fn pid(&self) -> Pid {
        self.process.pid()
    }

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::cont(tid, signal).map_err(Ptrace)
    }

    fn single_step(&self, tid: Pid) -> Result<(), Error> {
        sys::ptrace::step(tid, None).map_err(Ptrace)
    }

    fn interrupt(&self, tid: Pid) -> Result<(), Error> {
        sys::ptrace::interrupt(tid).map_err(Ptrace)
    }

    fn wait_any(&self) -> Result<TargetEvent, Error> {
        let status = waitpid(Pid::from_raw(-1), None).map_err(Waitpid)?;
        classify(status)
    }

    fn wait_thread(&self, tid: Pid) -> Result<TargetEvent, Error> {
        match waitpid(tid, None) {
            Ok(status) => classify(status),
            Err(Errno::ESRCH) => Ok(TargetEvent::NoSuchProcess { tid }),
            Err(e) => Err(Waitpid(e)),
        }
    }

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let pid = self.pid();
        let word_len = mem::size_of::<c_long>();
        let mut result = Vec::with_capacity(len);

        let mut read_reminder = len as isize;
        let mut addr = addr.as_usize() as *mut c_long;
        while read_reminder > 0 {
            let value = sys::ptrace::read(pid, addr as AddressType).map_err(Ptrace)?;
            result.extend(value.to_ne_bytes().into_iter().take(read_reminder as usize));

            read_reminder -= word_len as isize;
            addr = unsafe { addr.offset(1) };
        }

        debug_assert!(result.len() == len);
        Ok(result)
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let pid = self.pid();
        let word_len = mem::size_of::<c_long>();

        let mut offset = 0;
        while offset < data.len() {
            let chunk = &data[offset..(offset + word_len).min(data.len())];
            let chunk_addr = (addr.as_usize() + offset) as AddressType;

            let mut word = [0u8; mem::size_of::<c_long>()];
            if chunk.len() == word_len {
                word.copy_from_slice(chunk);
            } else {
                // partial word, splice the bytes over what is already there
                let existing = sys::ptrace::read(pid, chunk_addr).map_err(Ptrace)?;
                word = existing.to_ne_bytes();
                word[..chunk.len()].copy_from_slice(chunk);
            }
            sys::ptrace::write(pid, chunk_addr, c_long::from_ne_bytes(word)).map_err(Ptrace)?;

            offset += word_len;
        }
        Ok(())
    }

    fn registers(&self, tid: Pid) -> Result<Registers, Error> {
        let raw = sys::ptrace::getregs(tid).map_err(Ptrace)?;
        Ok(snapshot_from_raw(&raw))
    }

    fn set_registers(&self, tid: Pid, regs: Registers) -> Result<(), Error> {
        sys::ptrace::setregs(tid, raw_from_snapshot(&regs)).map_err(Ptrace)
    }

    fn send_signal(&self, sig: Signal) -> Result<(), Error> {
        signal::kill(self.pid(), sig).map_err(|e| Error::Syscall("kill", e))
    }

    fn kill(&self) -> Result<(), Error> {
        let pid = self.pid();
        signal::kill(pid, SIGKILL).map_err(|e| Error::Syscall("kill", e))?;
        // reap the zombie, further statuses carry nothing of interest
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        Ok(())
    }
}

/// Translate a kernel wait status into a target event.
fn classify(status: WaitStatus) -> Result<TargetEvent, Error> {
    match status {
        WaitStatus::Exited(pid, code) => Ok(TargetEvent::Exited {
            tid: pid,
            status: code,
        }),
        WaitStatus::Signaled(pid, sig, _) => Ok(TargetEvent::Exited {
            tid: pid,
            status: -(sig as i32),
        }),
        WaitStatus::PtraceEvent(pid, _, code) => match code {
            libc::PTRACE_EVENT_EXEC => Ok(TargetEvent::Exec { tid: pid }),
            libc::PTRACE_EVENT_CLONE => {
                let child = sys::ptrace::getevent(pid).map_err(Ptrace)?;
                Ok(TargetEvent::Cloned {
                    parent: pid,
                    child: Pid::from_raw(child as pid_t),
                })
            }
            libc::PTRACE_EVENT_STOP => Ok(TargetEvent::Stop { tid: pid }),
            libc::PTRACE_EVENT_EXIT => Ok(TargetEvent::ThreadExit { tid: pid }),
            code => {
                warn!(target: "tracer", "unexpected ptrace event {code}, thread: {pid}");
                Ok(TargetEvent::Spurious)
            }
        },
        WaitStatus::Stopped(pid, sig) => {
            let info = match sys::ptrace::getsiginfo(pid) {
                Ok(info) => info,
                Err(Errno::ESRCH) => return Ok(TargetEvent::NoSuchProcess { tid: pid }),
                // group-stop, getsiginfo is only valid in signal-delivery-stop
                Err(Errno::EINVAL) => return Ok(TargetEvent::Stop { tid: pid }),
                Err(e) => return Err(Ptrace(e)),
            };

            match sig {
                Signal::SIGTRAP => match info.si_code {
                    TRAP_TRACE => Ok(TargetEvent::SingleStep { tid: pid }),
                    TRAP_BRKPT | SI_KERNEL => Ok(TargetEvent::Trap { tid: pid }),
                    code => {
                        warn!(target: "tracer", "unexpected SIGTRAP code {code}, thread: {pid}");
                        Ok(TargetEvent::SignalStop {
                            tid: pid,
                            signal: sig,
                        })
                    }
                },
                _ => Ok(TargetEvent::SignalStop {
                    tid: pid,
                    signal: sig,
                }),
            }
        }
        status => {
            warn!(target: "tracer", "unexpected wait status: {status:?}");
            Ok(TargetEvent::Spurious)
        }
    }
}

fn snapshot_from_raw(raw: &user_regs_struct) -> Registers {
    let mut regs = Registers::default();
    regs.update(Register::Rax, raw.rax);
    regs.update(Register::Rbx, raw.rbx);
    regs.update(Register::Rcx, raw.rcx);
    regs.update(Register::Rdx, raw.rdx);
    regs.update(Register::Rdi, raw.rdi);
    regs.update(Register::Rsi, raw.rsi);
    regs.update(Register::Rbp, raw.rbp);
    regs.update(Register::Rsp, raw.rsp);
    regs.update(Register::R8, raw.r8);
    regs.update(Register::R9, raw.r9);
    regs.update(Register::R10, raw.r10);
    regs.update(Register::R11, raw.r11);
    regs.update(Register::R12, raw.r12);
    regs.update(Register::R13, raw.r13);
    regs.update(Register::R14, raw.r14);
    regs.update(Register::R15, raw.r15);
    regs.update(Register::Rip, raw.rip);
    regs.update(Register::Eflags, raw.eflags);
    regs.update(Register::Cs, raw.cs);
    regs.update(Register::OrigRax, raw.orig_rax);
    regs.update(Register::FsBase, raw.fs_base);
    regs.update(Register::GsBase, raw.gs_base);
    regs.update(Register::Fs, raw.fs);
    regs.update(Register::Gs, raw.gs);
    regs.update(Register::Ss, raw.ss);
    regs.update(Register::Ds, raw.ds);
    regs.update(Register::Es, raw.es);
    regs
}

fn raw_from_snapshot(regs: &Registers) -> user_regs_struct {
    user_regs_struct {
        r15: regs.value(Register::R15),
        r14: regs.value(Register::R14),
        r13: regs.value(Register::R13),
        r12: regs.value(Register::R12),
        rbp: regs.value(Register::Rbp),
        rbx: regs.value(Register::Rbx),
        r11: regs.value(Register::R11),
        r10: regs.value(Register::R10),
        r9: regs.value(Register::R9),
        r8: regs.value(Register::R8),
        rax: regs.value(Register::Rax),
        rcx: regs.value(Register::Rcx),
        rdx: regs.value(Register::Rdx),
        rsi: regs.value(Register::Rsi),
        rdi: regs.value(Register::Rdi),
        orig_rax: regs.value(Register::OrigRax),
        rip: regs.value(Register::Rip),
        cs: regs.value(Register::Cs),
        eflags: regs.value(Register::Eflags),
        rsp: regs.value(Register::Rsp),
        ss: regs.value(Register::Ss),
        fs_base: regs.value(Register::FsBase),
        gs_base: regs.value(Register::GsBase),
        ds: regs.value(Register::Ds),
        es: regs.value(Register::Es),
        fs: regs.value(Register::Fs),
        gs: regs.value(Register::Gs),
    }
}
