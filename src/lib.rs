//! A stack-based bytecode virtual machine: decoder, typed-value
//! dispatch, trap-and-resume error handling, and a foreign-function
//! interface for calling into dynamic libraries.

pub mod config;
pub mod decode;
pub mod error;
pub mod ffi;
pub mod interpreter;
pub mod opcode;
pub mod stack;
pub mod trap;
pub mod value;
pub mod vm;

use std::fs;
use std::path::Path;

pub use config::VmLimits;
pub use error::{Trap, VmError};
pub use vm::{State, Vm};

/// Load an image from `path` and run it to completion. The convenience
/// entry point for embedders who don't need to inspect VM state between
/// steps.
pub fn run_to_completion(path: impl AsRef<Path>, limits: VmLimits) -> Result<(), VmError> {
    let path = path.as_ref();
    let code = fs::read(path).map_err(|source| VmError::ImageRead {
        path: path.to_path_buf(),
        source,
    })?;
    if code.len() < 4 {
        return Err(VmError::ImageTooShort);
    }
    let mut vm = Vm::new(code, limits).map_err(|source| VmError::ImageRead {
        path: path.to_path_buf(),
        source,
    })?;
    vm.run()
}
