//! Platform boundary of the debugger: the only layer that issues kernel
//! debug syscalls. Everything above reasons in terms of [`TargetControl`]
//! operations and the [`TargetEvent`]s they report.

pub mod linux;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::register::Registers;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Stop event of one traced thread as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
    /// Thread group exited with a status code. When `tid` is the process
    /// main thread the whole debugee is gone.
    Exited { tid: Pid, status: i32 },
    /// The debugee replaced its image, fires once right before its entry.
    Exec { tid: Pid },
    /// A thread spawned a new OS thread. The child starts in an
    /// event-stop of its own.
    Cloned { parent: Pid, child: Pid },
    /// Event-stop: an interrupt request was delivered or a new thread
    /// came up stopped.
    Stop { tid: Pid },
    /// The thread is about to exit and stays frozen until resumed.
    ThreadExit { tid: Pid },
    /// The thread executed a trap instruction.
    Trap { tid: Pid },
    /// A single-step request completed.
    SingleStep { tid: Pid },
    /// The thread stopped with an ordinary signal.
    SignalStop { tid: Pid, signal: Signal },
    /// The kernel no longer knows the thread.
    NoSuchProcess { tid: Pid },
    /// A wait status that carries nothing for the debugger.
    Spurious,
}

/// Target control primitives, one implementation per OS.
///
/// All methods except [`TargetControl::send_signal`] must be called from
/// the single controller thread that attached the target (a kernel
/// requirement on the ptrace family of interfaces). Memory operations
/// address the whole process and require it to be stopped.
pub trait TargetControl {
    /// Pid of the traced process (its main thread).
    fn pid(&self) -> Pid;

    /// Resume one thread, optionally injecting a signal.
    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error>;

    /// Execute one machine instruction on a stopped thread. The completion
    /// arrives as a [`TargetEvent::SingleStep`] through a wait call.
    fn single_step(&self, tid: Pid) -> Result<(), Error>;

    /// Ask a running thread to enter an event-stop.
    fn interrupt(&self, tid: Pid) -> Result<(), Error>;

    /// Block until any thread of the target reports an event.
    fn wait_any(&self) -> Result<TargetEvent, Error>;

    /// Block until the given thread reports an event.
    fn wait_thread(&self, tid: Pid) -> Result<TargetEvent, Error>;

    /// Read `len` bytes of target memory.
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error>;

    /// Write bytes over target memory.
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    /// Snapshot of the canonical register bank of a stopped thread.
    fn registers(&self, tid: Pid) -> Result<Registers, Error>;

    /// Write a register snapshot back into a stopped thread.
    fn set_registers(&self, tid: Pid, regs: Registers) -> Result<(), Error>;

    /// Deliver a signal to the whole process. The one operation that is
    /// safe from another debugger thread.
    fn send_signal(&self, signal: Signal) -> Result<(), Error>;

    /// Terminate the target.
    fn kill(&self) -> Result<(), Error>;
}

/// Read a little endian pointer-wide unsigned value from target memory.
pub fn read_ptr(
    target: &dyn TargetControl,
    addr: RelocatedAddress,
    ptr_size: usize,
) -> Result<u64, Error> {
    let data = target.read_memory(addr, ptr_size)?;
    let mut buf = [0u8; 8];
    buf[..data.len()].copy_from_slice(&data);
    Ok(u64::from_le_bytes(buf))
}
