use crate::debugger::error::Error;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

pub const REGISTER_COUNT: usize = 27;

pub struct RegisterDescription {
    pub r: Register,
    pub dwarf_num: i32,
    pub name: &'static str,
}

impl RegisterDescription {
    const fn new(reg: Register, dwarf_num: i32, name: &'static str) -> Self {
        Self {
            r: reg,
            dwarf_num,
            name,
        }
    }
}

pub const LIST: [RegisterDescription; REGISTER_COUNT] = [
    RegisterDescription::new(Register::Rip, -1, "rip"),
    RegisterDescription::new(Register::OrigRax, -1, "orig_rax"),
    RegisterDescription::new(Register::Rax, 0, "rax"),
    RegisterDescription::new(Register::Rdx, 1, "rdx"),
    RegisterDescription::new(Register::Rcx, 2, "rcx"),
    RegisterDescription::new(Register::Rbx, 3, "rbx"),
    RegisterDescription::new(Register::Rsi, 4, "rsi"),
    RegisterDescription::new(Register::Rdi, 5, "rdi"),
    RegisterDescription::new(Register::Rbp, 6, "rbp"),
    RegisterDescription::new(Register::Rsp, 7, "rsp"),
    RegisterDescription::new(Register::R8, 8, "r8"),
    RegisterDescription::new(Register::R9, 9, "r9"),
    RegisterDescription::new(Register::R10, 10, "r10"),
    RegisterDescription::new(Register::R11, 11, "r11"),
    RegisterDescription::new(Register::R12, 12, "r12"),
    RegisterDescription::new(Register::R13, 13, "r13"),
    RegisterDescription::new(Register::R14, 14, "r14"),
    RegisterDescription::new(Register::R15, 15, "r15"),
    RegisterDescription::new(Register::Eflags, 49, "eflags"),
    RegisterDescription::new(Register::Es, 50, "es"),
    RegisterDescription::new(Register::Cs, 51, "cs"),
    RegisterDescription::new(Register::Ss, 52, "ss"),
    RegisterDescription::new(Register::Ds, 53, "ds"),
    RegisterDescription::new(Register::Fs, 54, "fs"),
    RegisterDescription::new(Register::Gs, 55, "gs"),
    RegisterDescription::new(Register::FsBase, 58, "fs_base"),
    RegisterDescription::new(Register::GsBase, 59, "gs_base"),
];

/// Snapshot of the canonical register bank of a single thread.
///
/// Taken at stop time through [`super::target::TargetControl::registers`]
/// and written back with `set_registers`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    values: [u64; REGISTER_COUNT],
}

impl Registers {
    pub fn value(&self, reg: Register) -> u64 {
        self.values[reg as usize]
    }

    pub fn update(&mut self, reg: Register, value: u64) {
        self.values[reg as usize] = value;
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.value(Register::Rip)
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.value(Register::Rsp)
    }

    #[inline(always)]
    pub fn bp(&self) -> u64 {
        self.value(Register::Rbp)
    }

    pub fn value_dwarf(&self, dwarf_num: i32) -> Result<u64, Error> {
        let descr = LIST
            .iter()
            .find(|r| r.dwarf_num == dwarf_num && r.dwarf_num != -1)
            .ok_or(Error::Unsupported("unknown dwarf register number"))?;
        Ok(self.value(descr.r))
    }
}

pub fn register_from_name(name: &str) -> Result<Register, Error> {
    LIST.iter()
        .find_map(|r| if r.name == name { Some(r.r) } else { None })
        .ok_or(Error::Unsupported("unknown register name"))
}

pub fn register_name(reg: Register) -> &'static str {
    match LIST.iter().find(|r| r.r == reg) {
        None => unreachable!(),
        Some(descr) => descr.name,
    }
}
