//! Goroutine introspection: recovering the logical threads the runtime
//! multiplexes over OS threads, from runtime data structures in target
//! memory. Struct offsets come from the debug information, never from
//! hard-coded tables; the runtime version only switches the shape of the
//! all-goroutines list.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::debug_info::{DebugInfo, TypeKind};
use crate::debugger::error::Error;
use crate::debugger::register::Register;
use crate::debugger::target::{read_ptr, TargetControl};
use crate::version::{GoVersion, GO_1_5};
use log::debug;
use nix::unistd::Pid;

/// Goroutine status values of the runtime (`runtime.gidle` and friends).
pub const G_STATUS_IDLE: u64 = 0;
pub const G_STATUS_RUNNABLE: u64 = 1;
pub const G_STATUS_RUNNING: u64 = 2;
pub const G_STATUS_WAITING: u64 = 4;
pub const G_STATUS_DEAD: u64 = 6;

/// A logical runtime thread with its saved execution site.
#[derive(Debug, Clone, Copy)]
pub struct Goroutine {
    pub id: u64,
    pub status: u64,
    /// Address of the `runtime.g` struct.
    pub g_addr: RelocatedAddress,
    /// Saved scheduling point (stale while the goroutine runs on a thread).
    pub pc: RelocatedAddress,
    pub sp: RelocatedAddress,
    pub bp: RelocatedAddress,
    /// OS thread currently executing this goroutine, if any.
    pub thread: Option<Pid>,
}

#[derive(Debug, Clone, Copy)]
struct FieldSlot {
    offset: usize,
    size: usize,
}

/// How the list of all goroutines is reached.
#[derive(Debug, Clone, Copy)]
enum AllGs {
    /// go1.5 and newer: `runtime.allgs` is a slice of `*g`.
    Slice,
    /// before go1.5: `runtime.allg` array pointer plus `runtime.allglen`.
    ArrayPtr,
}

/// Offsets inside the runtime structs, resolved once at attach time.
#[derive(Debug, Clone)]
pub struct GoroutineLayout {
    goid: FieldSlot,
    status: FieldSlot,
    sched_offset: usize,
    gobuf_pc: usize,
    gobuf_sp: usize,
    gobuf_bp: Option<usize>,
    defer_offset: Option<usize>,
    defer_fn_offset: Option<usize>,
    funcval_fn_offset: usize,
    allgs: AllGs,
}

impl GoroutineLayout {
    pub fn resolve(info: &dyn DebugInfo, version: GoVersion) -> Result<Self, Error> {
        let g_ref = info
            .type_by_name("runtime.g")
            .ok_or_else(|| Error::TypeNotFound("runtime.g".to_string()))?;
        let g_meta = info.type_meta(g_ref)?;

        let slot = |name: &str| -> Result<FieldSlot, Error> {
            let field = g_meta
                .field(name)
                .ok_or_else(|| Error::TypeNotFound(format!("runtime.g.{name}")))?;
            let field_meta = info.type_meta(field.type_ref)?;
            Ok(FieldSlot {
                offset: field.offset,
                size: field_meta.byte_size as usize,
            })
        };

        let goid = slot("goid")?;
        let status = slot("atomicstatus")?;

        let sched_field = g_meta
            .field("sched")
            .ok_or_else(|| Error::TypeNotFound("runtime.g.sched".to_string()))?;
        let gobuf_meta = info.type_meta(sched_field.type_ref)?;
        let gobuf_field = |name: &str| {
            gobuf_meta
                .field(name)
                .map(|f| f.offset)
                .ok_or_else(|| Error::TypeNotFound(format!("runtime.gobuf.{name}")))
        };

        // the deferred-call chain: g._defer -> _defer.fn -> funcval.fn
        let mut defer_offset = None;
        let mut defer_fn_offset = None;
        if let Some(defer_field) = g_meta.field("_defer") {
            defer_offset = Some(defer_field.offset);
            let defer_ptr_meta = info.type_meta(defer_field.type_ref)?;
            if let TypeKind::Pointer(Some(defer_ref)) = defer_ptr_meta.kind {
                let defer_meta = info.type_meta(defer_ref)?;
                defer_fn_offset = defer_meta.field("fn").map(|f| f.offset);
            }
        }

        let funcval_fn_offset = info
            .type_by_name("runtime.funcval")
            .and_then(|r| info.type_meta(r).ok())
            .and_then(|m| m.field("fn").map(|f| f.offset))
            .unwrap_or(0);

        let allgs = if version.after_or_equal(GO_1_5) {
            AllGs::Slice
        } else {
            AllGs::ArrayPtr
        };

        Ok(GoroutineLayout {
            goid,
            status,
            sched_offset: sched_field.offset,
            gobuf_pc: gobuf_field("pc")?,
            gobuf_sp: gobuf_field("sp")?,
            gobuf_bp: gobuf_meta.field("bp").map(|f| f.offset),
            defer_offset,
            defer_fn_offset,
            funcval_fn_offset,
            allgs,
        })
    }
}

/// View into the runtime scheduler of a stopped target.
pub struct GoroutineIntrospector<'a> {
    pub info: &'a dyn DebugInfo,
    pub target: &'a dyn TargetControl,
    pub arch: Arch,
    pub mapping_offset: usize,
    pub layout: &'a GoroutineLayout,
}

impl GoroutineIntrospector<'_> {
    fn read_word(&self, addr: usize) -> Result<u64, Error> {
        read_ptr(
            self.target,
            RelocatedAddress::from(addr),
            self.arch.ptr_size,
        )
    }

    fn read_uint(&self, addr: usize, size: usize) -> Result<u64, Error> {
        let data = self
            .target
            .read_memory(RelocatedAddress::from(addr), size)?;
        let mut buf = [0u8; 8];
        buf[..size.min(8)].copy_from_slice(&data[..size.min(8)]);
        Ok(u64::from_le_bytes(buf))
    }

    /// The goroutine currently scheduled on an OS thread.
    ///
    /// Threads that never entered the runtime (the bootstrap thread, foreign
    /// threads) have no goroutine; they yield `None` instead of an error.
    pub fn current(&self, tid: Pid) -> Result<Option<Goroutine>, Error> {
        let regs = self.target.registers(tid)?;
        let tls = regs.value(Register::FsBase);
        if tls == 0 {
            return Ok(None);
        }

        // the runtime keeps the current g in the last TLS slot
        let g_slot = (tls as usize).wrapping_sub(self.arch.ptr_size);
        let g_addr = match self.read_word(g_slot) {
            Ok(addr) => addr,
            Err(_) => {
                debug!(target: "debugger", "thread {tid} TLS is unreadable, not a runtime thread");
                return Ok(None);
            }
        };
        if g_addr == 0 {
            return Ok(None);
        }

        let mut g = self.read_goroutine(g_addr as usize)?;
        g.thread = Some(tid);
        // the scheduling site of a running goroutine is the live thread state
        g.pc = RelocatedAddress::from(regs.pc());
        g.sp = RelocatedAddress::from(regs.sp());
        g.bp = RelocatedAddress::from(regs.bp());
        Ok(Some(g))
    }

    /// All goroutines known to the runtime with their saved positions.
    pub fn all(&self) -> Result<Vec<Goroutine>, Error> {
        let (base, len) = match self.layout.allgs {
            AllGs::Slice => {
                let slice_addr = self.symbol("runtime.allgs")?;
                let base = self.read_word(slice_addr)? as usize;
                let len = self.read_word(slice_addr + self.arch.ptr_size)? as usize;
                (base, len)
            }
            AllGs::ArrayPtr => {
                let base = self.read_word(self.symbol("runtime.allg")?)? as usize;
                let len = self.read_word(self.symbol("runtime.allglen")?)? as usize;
                (base, len)
            }
        };

        let mut goroutines = Vec::with_capacity(len);
        for i in 0..len {
            let g_ptr = self.read_word(base + i * self.arch.ptr_size)?;
            if g_ptr == 0 {
                continue;
            }
            let g = self.read_goroutine(g_ptr as usize)?;
            if g.status == G_STATUS_DEAD {
                continue;
            }
            goroutines.push(g);
        }
        Ok(goroutines)
    }

    pub fn find(&self, id: u64) -> Result<Goroutine, Error> {
        self.all()?
            .into_iter()
            .find(|g| g.id == id)
            .ok_or(Error::GoroutineNotFound(id))
    }

    /// First deferred-call dispatch site of a goroutine, if a deferred call
    /// is pending.
    pub fn defer_pc(&self, g: &Goroutine) -> Result<Option<RelocatedAddress>, Error> {
        let (Some(defer_offset), Some(fn_offset)) =
            (self.layout.defer_offset, self.layout.defer_fn_offset)
        else {
            return Ok(None);
        };

        let defer_ptr = self.read_word(g.g_addr.as_usize() + defer_offset)? as usize;
        if defer_ptr == 0 {
            return Ok(None);
        }
        let funcval_ptr = self.read_word(defer_ptr + fn_offset)? as usize;
        if funcval_ptr == 0 {
            return Ok(None);
        }
        let fn_pc = self.read_word(funcval_ptr + self.layout.funcval_fn_offset)?;
        if fn_pc == 0 {
            return Ok(None);
        }
        Ok(Some(RelocatedAddress::from(fn_pc)))
    }

    fn symbol(&self, name: &str) -> Result<usize, Error> {
        let global = self
            .info
            .symbol_address(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        Ok(global.relocate(self.mapping_offset).as_usize())
    }

    fn read_goroutine(&self, g_addr: usize) -> Result<Goroutine, Error> {
        let layout = self.layout;
        let id = self.read_uint(g_addr + layout.goid.offset, layout.goid.size)?;
        let status = self.read_uint(g_addr + layout.status.offset, layout.status.size)?;

        let sched = g_addr + layout.sched_offset;
        let pc = self.read_word(sched + layout.gobuf_pc)?;
        let sp = self.read_word(sched + layout.gobuf_sp)?;
        let bp = match layout.gobuf_bp {
            Some(off) => self.read_word(sched + off)?,
            None => 0,
        };

        Ok(Goroutine {
            id,
            status,
            g_addr: RelocatedAddress::from(g_addr),
            pc: RelocatedAddress::from(pc),
            sp: RelocatedAddress::from(sp),
            bp: RelocatedAddress::from(bp),
            thread: None,
        })
    }
}
