use crate::debugger::address::RelocatedAddress;
use crate::debugger::arch::Arch;
use crate::debugger::debug_info::{DebugInfo, Place};
use crate::debugger::error::Error;
use crate::debugger::target::{read_ptr, TargetControl};

/// Function that sits at the bottom of every goroutine stack.
const STACK_BOTTOM: &str = "runtime.goexit";

/// Single stack frame in the unwind path.
#[derive(Debug, Clone)]
pub struct Stackframe {
    /// Instruction pointer inside the frame.
    pub ip: RelocatedAddress,
    pub func_name: Option<String>,
    pub place: Option<Place>,
    /// Call frame address: value of the stack pointer at the call site in
    /// the previous frame.
    pub base: RelocatedAddress,
    pub ret_addr: Option<RelocatedAddress>,
    /// Marker frame emitted when the walk reaches code without debug
    /// information (foreign frames), the trace is truncated after it.
    pub is_unknown: bool,
}

pub type Backtrace = Vec<Stackframe>;

/// Walk the stack of an execution context given its initial registers.
///
/// The walk ends at `depth` frames, at the runtime stack bottom sentinel, or
/// at the first frame without frame description data (a warning marker frame
/// is pushed and the trace is truncated).
pub fn unwind(
    info: &dyn DebugInfo,
    target: &dyn TargetControl,
    arch: Arch,
    mapping_offset: usize,
    pc: RelocatedAddress,
    sp: RelocatedAddress,
    depth: usize,
) -> Result<Backtrace, Error> {
    let mut frames = Backtrace::new();
    let mut pc = pc;
    let mut sp = sp;

    for _ in 0..depth {
        let global_pc = pc.into_global(mapping_offset);
        let func_name = info.function_by_pc(global_pc).map(|f| f.name);
        let place = info.place_from_pc(global_pc);

        let cfa_offset = match info.cfa_offset(global_pc) {
            Ok(offset) => offset,
            Err(_) => {
                frames.push(Stackframe {
                    ip: pc,
                    func_name,
                    place,
                    base: sp,
                    ret_addr: None,
                    is_unknown: true,
                });
                break;
            }
        };

        let cfa = sp.offset(cfa_offset as isize);
        let ret_addr_location = cfa.offset(-(arch.ptr_size as isize));
        let ret_addr = read_ptr(target, ret_addr_location, arch.ptr_size)?;

        let at_bottom = func_name.as_deref() == Some(STACK_BOTTOM) || ret_addr == 0;

        frames.push(Stackframe {
            ip: pc,
            func_name,
            place,
            base: cfa,
            ret_addr: (ret_addr != 0).then(|| RelocatedAddress::from(ret_addr)),
            is_unknown: false,
        });

        if at_bottom {
            break;
        }

        pc = RelocatedAddress::from(ret_addr);
        sp = cfa;
    }

    Ok(frames)
}

/// Return address of the immediate caller.
///
/// # Errors
///
/// `TopOfStack` for the root function of a stack (no frame description or
/// the stack bottom sentinel).
pub fn return_addr(
    info: &dyn DebugInfo,
    target: &dyn TargetControl,
    arch: Arch,
    mapping_offset: usize,
    pc: RelocatedAddress,
    sp: RelocatedAddress,
) -> Result<RelocatedAddress, Error> {
    let global_pc = pc.into_global(mapping_offset);

    if let Some(func) = info.function_by_pc(global_pc) {
        if func.name == STACK_BOTTOM {
            return Err(Error::TopOfStack);
        }
    }

    let cfa_offset = info.cfa_offset(global_pc).map_err(|_| Error::TopOfStack)?;
    let cfa = sp.offset(cfa_offset as isize);
    let ret_addr = read_ptr(target, cfa.offset(-(arch.ptr_size as isize)), arch.ptr_size)?;
    if ret_addr == 0 {
        return Err(Error::TopOfStack);
    }
    Ok(RelocatedAddress::from(ret_addr))
}
