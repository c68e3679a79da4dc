use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::arch::Arch;
use crate::debugger::breakpoint::BreakpointRegistry;
use crate::debugger::debugee::tracee::{Tracee, TraceeCtl};
use crate::debugger::debugee::tracer::{StopReason, Tracer};
use crate::debugger::error::Error;
use crate::debugger::target::TargetControl;
use log::info;
use nix::unistd::Pid;
use object::ObjectKind;
use proc_maps::MapRange;
use std::path::{Path, PathBuf};

pub mod dwarf;
pub mod tracee;
pub mod tracer;

/// Thread position.
/// Contains pid of thread, relocated and global address of instruction where thread stop.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Unload,
    InProgress,
    Exited,
}

/// Debugee - represent static and runtime debugee information.
pub struct Debugee {
    /// debugee running-status.
    pub execution_status: ExecutionStatus,
    /// path to debugee file.
    pub path: PathBuf,
    /// debugee process map address.
    mapping_addr: Option<usize>,
    /// kind of the underlying object file, drives relocation.
    object_kind: ObjectKind,
    /// Debugee tracer. Control debugee process.
    pub tracer: Tracer,
}

impl Debugee {
    pub fn new_non_running(path: &Path, proc_pid: Pid, object_kind: ObjectKind, arch: Arch) -> Self {
        Self {
            execution_status: ExecutionStatus::Unload,
            path: path.into(),
            mapping_addr: None,
            object_kind,
            tracer: Tracer::new(proc_pid, arch),
        }
    }

    /// Return debugee process mapping offset.
    /// This method will panic if called before debugee started,
    /// calling a method on time is the responsibility of the caller.
    pub fn mapping_offset(&self) -> usize {
        self.mapping_addr.expect("mapping address must exists")
    }

    pub fn is_in_progress(&self) -> bool {
        self.execution_status == ExecutionStatus::InProgress
    }

    pub fn is_exited(&self) -> bool {
        self.execution_status == ExecutionStatus::Exited
    }

    /// Resume the process and block until the next stop, keeping the
    /// execution status and the mapping address up to date.
    pub fn trace_until_stop(
        &mut self,
        target: &dyn TargetControl,
        brkpts: &BreakpointRegistry,
    ) -> Result<StopReason, Error> {
        let event = self.tracer.resume(target, brkpts)?;
        match event {
            StopReason::DebugeeExit(_) => {
                self.execution_status = ExecutionStatus::Exited;
            }
            StopReason::DebugeeStart => {
                self.execution_status = ExecutionStatus::InProgress;
                self.mapping_addr = Some(self.define_mapping_addr(target)?);
                info!(
                    target: "debugger",
                    "debugee started, mapping offset: {:#x}",
                    self.mapping_offset()
                );
            }
            _ => {}
        }

        Ok(event)
    }

    /// Attach path: the process is past exec already, mark it in progress
    /// and resolve the mapping immediately.
    pub fn mark_attached(&mut self, target: &dyn TargetControl) -> Result<(), Error> {
        self.execution_status = ExecutionStatus::InProgress;
        self.mapping_addr = Some(self.define_mapping_addr(target)?);
        Ok(())
    }

    pub fn tracee_ctl(&self) -> &TraceeCtl {
        &self.tracer.tracee_ctl
    }

    pub fn tracee_ctl_mut(&mut self) -> &mut TraceeCtl {
        &mut self.tracer.tracee_ctl
    }

    /// Returns tracee currently in focus.
    pub fn tracee_in_focus(&self) -> &Tracee {
        self.tracer.tracee_ctl.tracee_in_focus()
    }

    /// Current location of a thread.
    pub fn location(&self, target: &dyn TargetControl, tid: Pid) -> Result<Location, Error> {
        let tracee = self
            .tracee_ctl()
            .tracee(tid)
            .ok_or(Error::InvalidThread(tid))?;
        tracee.location(target, self.mapping_offset())
    }

    fn define_mapping_addr(&mut self, target: &dyn TargetControl) -> Result<usize, Error> {
        if self.object_kind != ObjectKind::Dynamic {
            // non-relocatable executable, object file addresses are live addresses
            return Ok(0);
        }

        let absolute_debugee_path_buf = self.path.canonicalize()?;
        let absolute_debugee_path = absolute_debugee_path_buf.as_path();

        let proc_maps: Vec<MapRange> = proc_maps::get_process_maps(target.pid().as_raw())
            .map_err(Error::IO)?
            .into_iter()
            .filter(|map| map.filename() == Some(absolute_debugee_path))
            .collect();

        let lowest_map = proc_maps
            .iter()
            .min_by(|map1, map2| map1.start().cmp(&map2.start()))
            .ok_or(Error::NoDebugInformation("mapping"))?;

        Ok(lowest_map.start())
    }
}
