//! Test doubles for the platform boundaries: a scripted target that
//! emulates kernel trap semantics over an in-memory machine, and a
//! hand-built symbol oracle.

use gander::debugger::address::{GlobalAddress, RelocatedAddress};
use gander::debugger::arch::Arch;
use gander::debugger::debug_info::{
    DebugInfo, Field, Function, Place, TypeKind, TypeMeta, TypeRef, VariableMeta,
};
use gander::debugger::error::Error;
use gander::debugger::register::{Register, Registers};
use gander::debugger::target::{TargetControl, TargetEvent};
use gander::debugger::Debugger;
use gimli::Range;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

pub const MAIN_TID: i32 = 100;

pub const TRAP: u8 = 0xCC;

struct SimThread {
    trace: Vec<usize>,
    idx: usize,
    loop_start: Option<usize>,
    running: bool,
    alive: bool,
    reported_pc: usize,
    sp: u64,
    fs_base: u64,
    events: VecDeque<TargetEvent>,
}

/// Target control over a simulated machine: every thread executes a fixed
/// program counter trace, trap bytes written into simulated memory stop it
/// the way the kernel would.
#[derive(Default)]
pub struct ScriptedTarget {
    mem: RefCell<HashMap<usize, u8>>,
    threads: RefCell<BTreeMap<i32, SimThread>>,
    global_events: RefCell<VecDeque<TargetEvent>>,
    exec_pending: Cell<bool>,
    exited: Cell<bool>,
}

impl ScriptedTarget {
    pub fn new(main_trace: Vec<usize>) -> Self {
        let target = ScriptedTarget {
            exec_pending: Cell::new(true),
            ..Default::default()
        };
        target.threads.borrow_mut().insert(
            MAIN_TID,
            SimThread {
                reported_pc: main_trace[0],
                trace: main_trace,
                idx: 0,
                loop_start: None,
                running: false,
                alive: true,
                sp: 0x7FF0_0000,
                fs_base: 0,
                events: VecDeque::new(),
            },
        );
        target
    }

    /// Make the main thread loop forever over a tail of its trace.
    pub fn loop_main(&self, loop_start: usize) {
        self.threads
            .borrow_mut()
            .get_mut(&MAIN_TID)
            .unwrap()
            .loop_start = Some(loop_start);
    }

    /// Register an extra thread: a clone event (and the initial event-stop
    /// of the new tracee) is delivered before the simulation resumes.
    pub fn add_thread(&self, tid: i32, trace: Vec<usize>, loop_start: Option<usize>) {
        let mut events = VecDeque::new();
        events.push_back(TargetEvent::Stop {
            tid: Pid::from_raw(tid),
        });
        self.threads.borrow_mut().insert(
            tid,
            SimThread {
                reported_pc: trace[0],
                trace,
                idx: 0,
                loop_start,
                running: false,
                alive: true,
                sp: 0x7FE0_0000 - tid as u64 * 0x10000,
                fs_base: 0,
                events,
            },
        );
        self.global_events.borrow_mut().push_back(TargetEvent::Cloned {
            parent: Pid::from_raw(MAIN_TID),
            child: Pid::from_raw(tid),
        });
    }

    pub fn set_sp(&self, tid: i32, sp: u64) {
        self.threads.borrow_mut().get_mut(&tid).unwrap().sp = sp;
    }

    pub fn set_fs_base(&self, tid: i32, fs_base: u64) {
        self.threads.borrow_mut().get_mut(&tid).unwrap().fs_base = fs_base;
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

    pub fn byte_at(&self, addr: usize) -> u8 {
        self.mem.borrow().get(&addr).copied().unwrap_or(0)
    }

    /// True if any trap byte remains in the simulated memory.
    pub fn any_trap_in_memory(&self) -> bool {
        self.mem.borrow().values().any(|&b| b == TRAP)
    }

    fn deliver(&self, event: TargetEvent) -> TargetEvent {
        let stop_tid = match event {
            TargetEvent::Trap { tid }
            | TargetEvent::SingleStep { tid }
            | TargetEvent::SignalStop { tid, .. }
            | TargetEvent::Stop { tid }
            | TargetEvent::ThreadExit { tid } => Some(tid),
            _ => None,
        };
        if let Some(tid) = stop_tid {
            if let Some(thread) = self.threads.borrow_mut().get_mut(&tid.as_raw()) {
                thread.running = false;
            }
        }
        event
    }

    /// Advance one thread by a single instruction the way the kernel
    /// scheduler would: a trap byte under the program counter raises the
    /// debug trap, a trace running out ends the thread.
    fn advance_one(&self, tid: i32) -> Option<TargetEvent> {
        let mut threads = self.threads.borrow_mut();
        let mem = self.mem.borrow();
        let thread = threads.get_mut(&tid).unwrap();

        let pc = thread.trace[thread.idx];
        if mem.get(&pc).copied().unwrap_or(0) == TRAP {
            thread.reported_pc = pc + 1;
            thread.running = false;
            return Some(TargetEvent::Trap {
                tid: Pid::from_raw(tid),
            });
        }

        thread.idx += 1;
        if thread.idx >= thread.trace.len() {
            match thread.loop_start {
                Some(loop_start) => thread.idx = loop_start,
                None => {
                    thread.alive = false;
                    thread.running = false;
                    if tid == MAIN_TID {
                        self.exited.set(true);
                        return Some(TargetEvent::Exited {
                            tid: Pid::from_raw(tid),
                            status: 0,
                        });
                    }
                    return Some(TargetEvent::ThreadExit {
                        tid: Pid::from_raw(tid),
                    });
                }
            }
        }
        thread.reported_pc = thread.trace[thread.idx];
        None
    }
}

impl TargetControl for ScriptedTarget {
    fn pid(&self) -> Pid {
        Pid::from_raw(MAIN_TID)
    }

    fn cont(&self, tid: Pid, _signal: Option<Signal>) -> Result<(), Error> {
        let mut threads = self.threads.borrow_mut();
        let Some(thread) = threads.get_mut(&tid.as_raw()) else {
            return Err(Error::Ptrace(nix::errno::Errno::ESRCH));
        };
        if !thread.alive {
            return Ok(());
        }
        thread.running = true;
        Ok(())
    }

    fn single_step(&self, tid: Pid) -> Result<(), Error> {
        let mut threads = self.threads.borrow_mut();
        let mem = self.mem.borrow();
        let Some(thread) = threads.get_mut(&tid.as_raw()) else {
            return Err(Error::Ptrace(nix::errno::Errno::ESRCH));
        };

        let pc = thread.trace[thread.idx];
        if mem.get(&pc).copied().unwrap_or(0) == TRAP {
            thread.reported_pc = pc + 1;
            thread.events.push_back(TargetEvent::Trap { tid });
            return Ok(());
        }

        thread.idx += 1;
        if thread.idx >= thread.trace.len() {
            match thread.loop_start {
                Some(loop_start) => thread.idx = loop_start,
                None => {
                    thread.alive = false;
                    thread.events.push_back(TargetEvent::ThreadExit { tid });
                    return Ok(());
                }
            }
        }
        thread.reported_pc = thread.trace[thread.idx];
        thread.events.push_back(TargetEvent::SingleStep { tid });
        Ok(())
    }

    fn interrupt(&self, tid: Pid) -> Result<(), Error> {
        let mut threads = self.threads.borrow_mut();
        let Some(thread) = threads.get_mut(&tid.as_raw()) else {
            return Err(Error::Ptrace(nix::errno::Errno::ESRCH));
        };
        thread.events.push_back(TargetEvent::Stop { tid });
        Ok(())
    }

    fn wait_any(&self) -> Result<TargetEvent, Error> {
        if self.exec_pending.replace(false) {
            let mut threads = self.threads.borrow_mut();
            threads.get_mut(&MAIN_TID).unwrap().running = false;
            return Ok(TargetEvent::Exec {
                tid: Pid::from_raw(MAIN_TID),
            });
        }

        if let Some(event) = self.global_events.borrow_mut().pop_front() {
            return Ok(self.deliver(event));
        }

        // threads advance round-robin one instruction at a time, the thread
        // closest to a trap wins the race deterministically
        for _ in 0..1_000_000 {
            let running: Vec<i32> = self
                .threads
                .borrow()
                .iter()
                .filter(|(_, t)| t.running && t.alive)
                .map(|(tid, _)| *tid)
                .collect();
            if running.is_empty() {
                panic!("scripted target deadlock: no running threads");
            }

            for tid in &running {
                if let Some(event) = self.advance_one(*tid) {
                    return Ok(self.deliver(event));
                }
            }
        }

        panic!("scripted target runaway: no thread reaches a trap");
    }

    fn wait_thread(&self, tid: Pid) -> Result<TargetEvent, Error> {
        let event = self
            .threads
            .borrow_mut()
            .get_mut(&tid.as_raw())
            .and_then(|t| t.events.pop_front());
        match event {
            Some(event) => Ok(self.deliver(event)),
            None => panic!("no scripted event for thread {tid}"),
        }
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
        let threads = self.threads.borrow();
        let thread = threads
            .get(&tid.as_raw())
            .ok_or(Error::Ptrace(nix::errno::Errno::ESRCH))?;
        let mut regs = Registers::default();
        regs.update(Register::Rip, thread.reported_pc as u64);
        regs.update(Register::Rsp, thread.sp);
        regs.update(Register::FsBase, thread.fs_base);
        Ok(regs)
    }

    fn set_registers(&self, tid: Pid, regs: Registers) -> Result<(), Error> {
        let mut threads = self.threads.borrow_mut();
        let thread = threads
            .get_mut(&tid.as_raw())
            .ok_or(Error::Ptrace(nix::errno::Errno::ESRCH))?;
        thread.reported_pc = regs.pc() as usize;
        thread.sp = regs.sp();
        Ok(())
    }

    fn send_signal(&self, signal: Signal) -> Result<(), Error> {
        self.global_events
            .borrow_mut()
            .push_back(TargetEvent::SignalStop {
                tid: Pid::from_raw(MAIN_TID),
                signal,
            });
        Ok(())
    }

    fn kill(&self) -> Result<(), Error> {
        self.exited.set(true);
        for thread in self.threads.borrow_mut().values_mut() {
            thread.alive = false;
            thread.running = false;
        }
        Ok(())
    }
}

/// Hand-built oracle for the scripted machine.
#[derive(Default)]
pub struct FixtureInfo {
    functions: Vec<Function>,
    places: Vec<Place>,
    cfa: Vec<(std::ops::Range<u64>, i64)>,
    symbols: HashMap<String, GlobalAddress>,
    types: HashMap<u64, Arc<TypeMeta>>,
    type_names: HashMap<String, TypeRef>,
    next_type_id: Cell<u64>,
}

impl FixtureInfo {
    pub fn function(mut self, name: &str, begin: u64, end: u64) -> Self {
        self.functions.push(Function {
            name: name.to_string(),
            ranges: vec![Range { begin, end }],
        });
        self
    }

    pub fn place(mut self, file: &str, line: u64, address: u64) -> Self {
        self.places.push(Place {
            file: PathBuf::from(file),
            line_number: line,
            address: GlobalAddress::from(address),
            is_stmt: true,
        });
        self.places.sort_by_key(|p| p.address);
        self
    }

    pub fn cfa_offset(mut self, range: std::ops::Range<u64>, offset: i64) -> Self {
        self.cfa.push((range, offset));
        self
    }

    pub fn symbol(mut self, name: &str, addr: u64) -> Self {
        self.symbols
            .insert(name.to_string(), GlobalAddress::from(addr));
        self
    }

    pub fn with_type(mut self, name: Option<&str>, meta: TypeMeta) -> (Self, TypeRef) {
        let id = self.next_type_id.get() + 1;
        self.next_type_id.set(id);
        let type_ref = TypeRef(id);
        self.types.insert(id, Arc::new(meta));
        if let Some(name) = name {
            self.type_names.insert(name.to_string(), type_ref);
        }
        (self, type_ref)
    }
}

impl DebugInfo for FixtureInfo {
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
            .filter(|p| p.line_number == line && p.file == Path::new(file))
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

    fn scope_variables(&self, _pc: GlobalAddress) -> Vec<VariableMeta> {
        vec![]
    }

    fn global_variable(&self, _name: &str) -> Option<VariableMeta> {
        None
    }

    fn cfa_offset(&self, pc: GlobalAddress) -> Result<i64, Error> {
        self.cfa
            .iter()
            .find(|(range, _)| range.contains(&u64::from(pc)))
            .map(|(_, offset)| *offset)
            .ok_or(Error::NoFrameDescription(pc))
    }
}

/// Build the runtime type graph (`runtime.g`, `runtime.gobuf`) the
/// goroutine introspector resolves its offsets from.
///
/// Fixture g struct layout:
///   0x00 goid, 0x08 atomicstatus, 0x10 sched.sp, 0x18 sched.pc
pub fn with_runtime_types(info: FixtureInfo) -> FixtureInfo {
    let (info, t_int64) = info.with_type(
        Some("int64"),
        TypeMeta {
            name: Some("int64".to_string()),
            byte_size: 8,
            kind: TypeKind::Int,
        },
    );
    let (info, t_uint32) = info.with_type(
        Some("uint32"),
        TypeMeta {
            name: Some("uint32".to_string()),
            byte_size: 4,
            kind: TypeKind::Uint,
        },
    );
    let (info, t_uintptr) = info.with_type(
        Some("uintptr"),
        TypeMeta {
            name: Some("uintptr".to_string()),
            byte_size: 8,
            kind: TypeKind::Uint,
        },
    );
    let (info, t_gobuf) = info.with_type(
        Some("runtime.gobuf"),
        TypeMeta {
            name: Some("runtime.gobuf".to_string()),
            byte_size: 16,
            kind: TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "sp".to_string(),
                        offset: 0,
                        type_ref: t_uintptr,
                    },
                    Field {
                        name: "pc".to_string(),
                        offset: 8,
                        type_ref: t_uintptr,
                    },
                ],
            },
        },
    );
    let (info, t_funcval) = info.with_type(
        Some("runtime.funcval"),
        TypeMeta {
            name: Some("runtime.funcval".to_string()),
            byte_size: 8,
            kind: TypeKind::Struct {
                fields: vec![Field {
                    name: "fn".to_string(),
                    offset: 0,
                    type_ref: t_uintptr,
                }],
            },
        },
    );
    let (info, t_funcval_ptr) = info.with_type(
        None,
        TypeMeta {
            name: Some("*runtime.funcval".to_string()),
            byte_size: 8,
            kind: TypeKind::Pointer(Some(t_funcval)),
        },
    );
    let (info, t_defer) = info.with_type(
        Some("runtime._defer"),
        TypeMeta {
            name: Some("runtime._defer".to_string()),
            byte_size: 16,
            kind: TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "siz".to_string(),
                        offset: 0,
                        type_ref: t_uint32,
                    },
                    Field {
                        name: "fn".to_string(),
                        offset: 8,
                        type_ref: t_funcval_ptr,
                    },
                ],
            },
        },
    );
    let (info, t_defer_ptr) = info.with_type(
        None,
        TypeMeta {
            name: Some("*runtime._defer".to_string()),
            byte_size: 8,
            kind: TypeKind::Pointer(Some(t_defer)),
        },
    );
    let (info, _) = info.with_type(
        Some("runtime.g"),
        TypeMeta {
            name: Some("runtime.g".to_string()),
            byte_size: 40,
            kind: TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "goid".to_string(),
                        offset: 0,
                        type_ref: t_int64,
                    },
                    Field {
                        name: "atomicstatus".to_string(),
                        offset: 8,
                        type_ref: t_uint32,
                    },
                    Field {
                        name: "sched".to_string(),
                        offset: 0x10,
                        type_ref: t_gobuf,
                    },
                    Field {
                        name: "_defer".to_string(),
                        offset: 0x20,
                        type_ref: t_defer_ptr,
                    },
                ],
            },
        },
    );
    info
}

/// Write a fixture `runtime.g` struct into scripted memory.
pub fn write_g(target: &ScriptedTarget, addr: usize, id: u64, status: u64, pc: u64, sp: u64) {
    target.write_word(addr, id);
    target.write_bytes(addr + 8, &(status as u32).to_le_bytes());
    target.write_word(addr + 0x10, sp);
    target.write_word(addr + 0x18, pc);
}

/// Assemble a started debugger over the scripted parts.
pub fn prepare_debugger(target: ScriptedTarget, info: FixtureInfo) -> (Debugger, Rc<ScriptedTarget>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let target = Rc::new(target);
    let mut debugger = Debugger::new(
        Box::new(SharedTarget(target.clone())),
        Box::new(info),
        Path::new("/fixture/testprog"),
        object::ObjectKind::Executable,
        Arch::X86_64,
    );
    debugger.start().expect("debugee must start");
    (debugger, target)
}

/// The debugger owns its target; tests keep a second handle for memory
/// pokes and assertions.
pub struct SharedTarget(pub Rc<ScriptedTarget>);

impl TargetControl for SharedTarget {
    fn pid(&self) -> Pid {
        self.0.pid()
    }
    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        self.0.cont(tid, signal)
    }
    fn single_step(&self, tid: Pid) -> Result<(), Error> {
        self.0.single_step(tid)
    }
    fn interrupt(&self, tid: Pid) -> Result<(), Error> {
        self.0.interrupt(tid)
    }
    fn wait_any(&self) -> Result<TargetEvent, Error> {
        self.0.wait_any()
    }
    fn wait_thread(&self, tid: Pid) -> Result<TargetEvent, Error> {
        self.0.wait_thread(tid)
    }
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        self.0.read_memory(addr, len)
    }
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.0.write_memory(addr, data)
    }
    fn registers(&self, tid: Pid) -> Result<Registers, Error> {
        self.0.registers(tid)
    }
    fn set_registers(&self, tid: Pid, regs: Registers) -> Result<(), Error> {
        self.0.set_registers(tid, regs)
    }
    fn send_signal(&self, signal: Signal) -> Result<(), Error> {
        self.0.send_signal(signal)
    }
    fn kill(&self) -> Result<(), Error> {
        self.0.kill()
    }
}
