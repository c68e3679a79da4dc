use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugee already run")]
    AlreadyRun,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error("operation requires a stopped target")]
    TargetRunning,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    // --------------------------------- debugger entity not found ---------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("thread {0} not found")]
    InvalidThread(Pid),
    #[error("function `{0}` not found")]
    FunctionNotFound(String),
    #[error("source place not found at address {0}")]
    PlaceNotFound(GlobalAddress),
    #[error("there are no suitable places for this request")]
    NoSuitablePlace,
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("type `{0}` not found")]
    TypeNotFound(String),
    #[error("goroutine {0} not found")]
    GoroutineNotFound(u64),
    #[error("could not find symbol value for `{0}`")]
    IdentUnknown(String),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("invalid breakpoint address {0}")]
    InvalidAddress(RelocatedAddress),
    #[error("breakpoint already set at {0}")]
    AlreadySet(RelocatedAddress),
    #[error("no breakpoint at {0}")]
    NotFound(RelocatedAddress),

    // --------------------------------- evaluation errors -----------------------------------------
    #[error("nil pointer dereference")]
    NilDeref,
    #[error("mismatched types `{0}` and `{1}`")]
    TypeMismatch(String, String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("unreadable: {0}")]
    Unreadable(String),
    #[error("expression syntax: {0}")]
    ExpressionSyntax(String),

    // --------------------------------- unwind errors ---------------------------------------------
    #[error("no return address: top of stack")]
    TopOfStack,
    #[error("no frame description entry for address {0}")]
    NoFrameDescription(GlobalAddress),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("process {pid} exited with status {status}")]
    ProcessExited { pid: Pid, status: i32 },
    #[error("program is not being started")]
    ProcessNotStarted,

    // --------------------------------- attach debugee errors -------------------------------------
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AlreadyRun => false,
            Error::IO(_) => false,
            Error::Utf8(_) => false,
            Error::TargetRunning => false,
            Error::Unsupported(_) => false,
            Error::NoDebugInformation(_) => false,
            Error::InvalidThread(_) => false,
            Error::FunctionNotFound(_) => false,
            Error::PlaceNotFound(_) => false,
            Error::NoSuitablePlace => false,
            Error::SymbolNotFound(_) => false,
            Error::TypeNotFound(_) => false,
            Error::GoroutineNotFound(_) => false,
            Error::IdentUnknown(_) => false,
            Error::InvalidAddress(_) => false,
            Error::AlreadySet(_) => false,
            Error::NotFound(_) => false,
            Error::NilDeref => false,
            Error::TypeMismatch(_, _) => false,
            Error::Arithmetic(_) => false,
            Error::KeyNotFound => false,
            Error::Unreadable(_) => false,
            Error::ExpressionSyntax(_) => false,
            Error::TopOfStack => false,
            Error::NoFrameDescription(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::MultipleErrors(_) => false,
            Error::ProcessExited { .. } => false,
            Error::ProcessNotStarted => false,

            // currently fatal errors
            Error::Syscall(_, _) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
            Error::AttachedProcessNotFound(_) => true,
            Error::Attach(_) => true,
        }
    }

    /// True for the natural end of the debugee, which callers distinguish
    /// from real failures.
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Error::ProcessExited { .. })
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
