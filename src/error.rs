//! Two distinct error surfaces: host-level [`VmError`] (this crate's
//! `std::error::Error` type, used by the loader and CLI) and in-VM
//! [`Trap`] (data the interpreter produces and the trap-and-resume
//! protocol consumes; never a Rust `Error`).

use std::fmt;
use thiserror::Error;

/// Host-level failures: everything that happens before or around a
/// running VM, as opposed to inside one of its steps.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("could not read program image {path:?}: {source}")]
    ImageRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("program image is too short to hold a single instruction word")]
    ImageTooShort,

    #[error("vm run failed: {0}")]
    Trapped(Trap),
}

impl From<Trap> for VmError {
    fn from(trap: Trap) -> VmError {
        VmError::Trapped(trap)
    }
}

/// A trap code. Stored alongside the pending trap and pushed onto the
/// data stack when a handler is invoked.
pub type TrapCode = u16;

pub const TRAP_MISSING_BINARY_OPERAND: TrapCode = 0x10;
pub const TRAP_MISSING_UNARY_OPERAND: TrapCode = 0x11;
pub const TRAP_UNKNOWN_MODE: TrapCode = 0x13;
pub const TRAP_DIV_MOD_ZERO_OR_EMPTY_RET: TrapCode = 0x15;
pub const TRAP_CALL_STACK_OVERFLOW: TrapCode = 0x16;
pub const TRAP_DATA_STACK_OVERFLOW: TrapCode = 0x20;
pub const TRAP_EMPTY_STACK_ON_STORE: TrapCode = 0x21;
pub const TRAP_JUMP_OUT_OF_BOUNDS: TrapCode = 0x22;
pub const TRAP_LIBRARY_OPEN_FAILURE: TrapCode = 0x60;
pub const TRAP_SYMBOL_RESOLUTION_FAILURE: TrapCode = 0x65;
pub const TRAP_FFI_ARENA_FROZEN: TrapCode = 0x66;
pub const TRAP_ALIGNMENT_OR_TERMINATOR: TrapCode = 0x90;
pub const TRAP_UNSAFE_POINTER: TrapCode = 0x91;

/// Code carried by a `SETERR`-raised user error. Interpreter-raised
/// faults all use documented codes below this one; a value outside
/// that range is used here so a user error can never be mistaken for
/// one of them on the handler's data stack.
pub const TRAP_USER_RAISED: TrapCode = 0x95;

/// An interpreter-raised failure: a numeric code plus an optional
/// formatted message, and the `pc` at which it was raised. This is the
/// VM's own control-flow data, not a host exception — it is redirected
/// to an installed handler or reported and halts the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    pub code: TrapCode,
    pub message: Option<String>,
    pub pc: usize,
}

impl Trap {
    pub fn new(code: TrapCode, pc: usize) -> Trap {
        Trap {
            code,
            message: None,
            pc,
        }
    }

    pub fn with_message(code: TrapCode, pc: usize, message: impl Into<String>) -> Trap {
        Trap {
            code,
            message: Some(message.into()),
            pc,
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "trap 0x{:02x} at pc={}: {}", self.code, self.pc, m),
            None => write!(f, "trap 0x{:02x} at pc={}", self.code, self.pc),
        }
    }
}
