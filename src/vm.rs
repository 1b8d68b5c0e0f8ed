//! The VM: owns the code segment, both stacks, the trap controller,
//! and the FFI subsystem, and drives the outer loop.

use std::io;

use log::{error, info};

use crate::config::VmLimits;
use crate::error::{Trap, VmError};
use crate::ffi::FfiState;
use crate::interpreter::{self, StepOutcome};
use crate::stack::BoundedStack;
use crate::trap::TrapState;
use crate::value::Value;

/// Coarse lifecycle: `Ready -> Running <-> TrapPending -> (Handled | Halted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Halted,
}

pub struct Vm {
    pub code: Vec<u8>,
    pub pc: usize,
    pub data: BoundedStack,
    pub call: BoundedStack,
    pub trap: TrapState,
    pub ffi: FfiState,
    pub halted: bool,
    state: State,
}

impl Vm {
    pub fn new(code: Vec<u8>, limits: VmLimits) -> io::Result<Vm> {
        Ok(Vm {
            code,
            pc: 0,
            data: BoundedStack::new(limits.data_stack_capacity),
            call: BoundedStack::new(limits.call_stack_capacity),
            trap: TrapState::new(),
            ffi: FfiState::new(limits.ffi_arena_bytes)?,
            halted: false,
            state: State::Ready,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Run a single step, without applying the trap-and-resume protocol
    /// (exposed for tests that want to inspect a raw trap).
    pub fn step(&mut self) -> StepOutcome {
        if self.halted {
            return StepOutcome::Halted;
        }
        if self.state == State::Ready {
            self.state = State::Running;
        }
        interpreter::step(self)
    }

    /// Drive the VM to completion: repeatedly step, applying the
    /// trap-and-resume protocol on every trap.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.run_bounded(None)
    }

    /// As [`Vm::run`], but stops after `max_steps` steps if given. Used
    /// by the CLI's `--max-steps` flag and by tests guarding against
    /// runaway programs; the bound is tooling, not VM semantics.
    pub fn run_bounded(&mut self, max_steps: Option<u64>) -> Result<(), VmError> {
        let mut taken: u64 = 0;
        loop {
            if self.halted {
                return Ok(());
            }
            if let Some(limit) = max_steps {
                if taken >= limit {
                    error!("step limit of {limit} reached without halting");
                    self.halted = true;
                    self.state = State::Halted;
                    return Ok(());
                }
            }

            match self.step() {
                StepOutcome::Continue => {
                    taken += 1;
                    continue;
                }
                StepOutcome::Halted => {
                    self.halted = true;
                    self.state = State::Halted;
                    info!("vm has been halted");
                    return Ok(());
                }
                StepOutcome::Trap(trap) => {
                    self.handle_trap(trap)?;
                    taken += 1;
                }
            }
        }
    }

    /// If a handler is installed, push the error code and the faulting
    /// `pc`, then jump to the handler; otherwise report and halt.
    fn handle_trap(&mut self, trap: Trap) -> Result<(), VmError> {
        self.trap.raise(trap.clone());

        match self.trap.handler() {
            Some(handler_offset) => {
                if self.data.push(Value::from_u64(trap.code as u64)).is_err() {
                    self.halted = true;
                    self.state = State::Halted;
                    error!("cascading failure: could not push trap code for handler");
                    return Err(VmError::Trapped(trap));
                }
                if self.call.push(Value::from_offset(trap.pc)).is_err() {
                    self.halted = true;
                    self.state = State::Halted;
                    error!("cascading failure: could not push return address for handler");
                    return Err(VmError::Trapped(trap));
                }
                self.pc = handler_offset;
                Ok(())
            }
            None => {
                self.halted = true;
                self.state = State::Halted;
                error!("{trap}");
                Err(VmError::Trapped(trap))
            }
        }
    }
}
