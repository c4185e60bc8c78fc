//! Platform calling-convention tables
//!
//! Register classes, stack slot sizes and varargs rules are data, one table
//! per target. The builder consults the host table to classify each argument
//! and to reject signatures the target cannot express.

use crate::ffi::types::ForeignType;

/// Calling-convention description of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiTable {
    pub name: &'static str,
    pub int_registers: usize,
    pub float_registers: usize,
    /// Integer and float arguments consume one shared position sequence
    pub shared_sequence: bool,
    /// Minimum size of a stack-passed argument
    pub slot_size: usize,
    pub stack_align: usize,
    /// Variadic arguments always go on the stack
    pub variadic_on_stack: bool,
    /// Callee-pops convention available
    pub stdcall: bool,
}

impl AbiTable {
    pub const SYSV_X86_64: AbiTable = AbiTable {
        name: "x86-64 System V",
        int_registers: 6,
        float_registers: 8,
        shared_sequence: false,
        slot_size: 8,
        stack_align: 16,
        variadic_on_stack: false,
        stdcall: false,
    };

    pub const WIN64: AbiTable = AbiTable {
        name: "Win64",
        int_registers: 4,
        float_registers: 4,
        shared_sequence: true,
        slot_size: 8,
        stack_align: 16,
        variadic_on_stack: false,
        stdcall: false,
    };

    pub const AAPCS64: AbiTable = AbiTable {
        name: "AArch64 AAPCS",
        int_registers: 8,
        float_registers: 8,
        shared_sequence: false,
        slot_size: 8,
        stack_align: 16,
        variadic_on_stack: false,
        stdcall: false,
    };

    pub const APPLE_ARM64: AbiTable = AbiTable {
        name: "Apple arm64",
        int_registers: 8,
        float_registers: 8,
        shared_sequence: false,
        slot_size: 8,
        stack_align: 16,
        variadic_on_stack: true,
        stdcall: false,
    };

    pub const I386_CDECL: AbiTable = AbiTable {
        name: "i386 cdecl",
        int_registers: 0,
        float_registers: 0,
        shared_sequence: false,
        slot_size: 4,
        stack_align: 16,
        variadic_on_stack: true,
        stdcall: true,
    };

    /// Everything on the stack in pointer-sized slots
    pub const GENERIC: AbiTable = AbiTable {
        name: "generic",
        int_registers: 0,
        float_registers: 0,
        shared_sequence: false,
        slot_size: std::mem::size_of::<usize>(),
        stack_align: 16,
        variadic_on_stack: true,
        stdcall: false,
    };

    /// Table of the running target
    pub fn host() -> &'static AbiTable {
        if cfg!(all(target_arch = "x86_64", windows)) {
            &Self::WIN64
        } else if cfg!(target_arch = "x86_64") {
            &Self::SYSV_X86_64
        } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            &Self::APPLE_ARM64
        } else if cfg!(target_arch = "aarch64") {
            &Self::AAPCS64
        } else if cfg!(target_arch = "x86") {
            &Self::I386_CDECL
        } else {
            &Self::GENERIC
        }
    }
}

/// Register class of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Integer,
    Float,
}

impl ArgClass {
    pub fn of(ty: ForeignType) -> Self {
        if ty.is_float() {
            ArgClass::Float
        } else {
            ArgClass::Integer
        }
    }
}

/// Where one argument travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    IntRegister(usize),
    FloatRegister(usize),
    /// Byte offset into the outgoing stack area
    Stack(usize),
}

/// Assigns registers and stack offsets in argument order
#[derive(Debug, Clone)]
pub struct RegisterCursor {
    table: &'static AbiTable,
    int_used: usize,
    float_used: usize,
    stack_offset: usize,
}

impl RegisterCursor {
    pub fn new(table: &'static AbiTable) -> Self {
        Self {
            table,
            int_used: 0,
            float_used: 0,
            stack_offset: 0,
        }
    }

    pub fn reset(&mut self) {
        self.int_used = 0;
        self.float_used = 0;
        self.stack_offset = 0;
    }

    pub fn assign(&mut self, ty: ForeignType, variadic: bool) -> ArgLocation {
        let class = ArgClass::of(ty);
        if !(variadic && self.table.variadic_on_stack) {
            if self.table.shared_sequence {
                let position = self.int_used;
                if position < self.table.int_registers {
                    self.int_used += 1;
                    self.float_used += 1;
                    return match class {
                        ArgClass::Integer => ArgLocation::IntRegister(position),
                        ArgClass::Float => ArgLocation::FloatRegister(position),
                    };
                }
            } else {
                match class {
                    ArgClass::Integer if self.int_used < self.table.int_registers => {
                        self.int_used += 1;
                        return ArgLocation::IntRegister(self.int_used - 1);
                    }
                    ArgClass::Float if self.float_used < self.table.float_registers => {
                        self.float_used += 1;
                        return ArgLocation::FloatRegister(self.float_used - 1);
                    }
                    _ => {}
                }
            }
        }
        let align = ty.align().max(self.table.slot_size);
        let offset = align_up(self.stack_offset, align);
        let size = align_up(ty.size().max(1), self.table.slot_size);
        self.stack_offset = offset + size;
        ArgLocation::Stack(offset)
    }

    /// Bytes of outgoing stack used so far, rounded to the stack alignment
    pub fn stack_size(&self) -> usize {
        align_up(self.stack_offset, self.table.stack_align)
    }
}

pub(crate) fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}
