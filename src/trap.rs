//! Trap state: a pending error (if any) and an installed handler
//! offset. Modelled as a software trap, not a language exception — the
//! interpreter step returns a result-like outcome and the outer loop
//! decides between handler redirection and halt.

use log::warn;

use crate::error::Trap;

/// `0` means "no handler installed".
pub const NO_HANDLER: usize = 0;

#[derive(Debug, Default)]
pub struct TrapState {
    pending: Option<Trap>,
    handler_offset: usize,
}

impl TrapState {
    pub fn new() -> TrapState {
        TrapState {
            pending: None,
            handler_offset: NO_HANDLER,
        }
    }

    pub fn install_handler(&mut self, offset: usize) {
        self.handler_offset = offset;
    }

    pub fn handler(&self) -> Option<usize> {
        if self.handler_offset == NO_HANDLER {
            None
        } else {
            Some(self.handler_offset)
        }
    }

    pub fn pending(&self) -> Option<&Trap> {
        self.pending.as_ref()
    }

    /// Raise a new pending error. If one is already pending, the new
    /// one is reported to the diagnostic channel and dropped — the
    /// first trap is preserved.
    pub fn raise(&mut self, trap: Trap) {
        if self.pending.is_some() {
            warn!(
                "trap raised while one is already pending, discarding: {}",
                trap
            );
            return;
        }
        self.pending = Some(trap);
    }

    /// Clears any pending error and frees its owned message (`CLRERR`).
    pub fn clear(&mut self) {
        self.pending = None;
    }
}
