//! FFI subsystem: dynamic-library loading via `dlopen`/`dlsym`, and a
//! single W^X trampoline arena that is written to while `Writable` and
//! flipped to `Executable` exactly once.

use std::ffi::{c_void, CString};
use std::io;

use libc::{dlclose, dlerror, dlopen, dlsym, RTLD_LAZY};
use log::debug;
use region::Protection;

use crate::stack::BoundedStack;
use crate::value::Value;

/// A resolved extern: the host address of the symbol it was bound to,
/// and the arena offset of the trampoline emitted for it.
#[derive(Debug, Clone, Copy)]
pub struct ExternDescriptor {
    pub symbol_addr: usize,
    pub trampoline_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArenaState {
    Writable,
    Executable,
}

/// The trampoline arena: a single page allocated read+write at init,
/// lowered to read+execute exactly once by `FFI_MAKE_DONE`.
pub struct TrampolineArena {
    base: *mut u8,
    size: usize,
    used: usize,
    state: ArenaState,
    _alloc: region::Allocation,
}

impl TrampolineArena {
    pub fn new(size: usize) -> io::Result<TrampolineArena> {
        let mut alloc = region::alloc(size, Protection::READ_WRITE)?;
        let base = alloc.as_mut_ptr::<u8>();
        Ok(TrampolineArena {
            base,
            size,
            used: 0,
            state: ArenaState::Writable,
            _alloc: alloc,
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.state == ArenaState::Executable
    }

    /// Emit a trampoline that forwards its single argument (a pointer
    /// to the VM, by host C calling convention) to `target`, and
    /// return the offset of its entry point within the arena.
    ///
    /// Fails if the arena has already transitioned to `Executable`.
    pub fn emit_trampoline(&mut self, target: usize) -> Option<usize> {
        if self.state != ArenaState::Writable {
            return None;
        }
        let code = encode_trampoline(target);
        if self.used + code.len() > self.size {
            return None;
        }
        let entry = self.used;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.base.add(entry), code.len());
        }
        self.used += code.len();
        debug!("ffi: emitted trampoline for 0x{target:x} at arena+{entry:#x}");
        Some(entry)
    }

    pub fn entry_addr(&self, offset: usize) -> usize {
        self.base as usize + offset
    }

    /// One-way transition from writable to executable (write XOR execute,
    /// never both at once).
    pub fn freeze(&mut self) -> io::Result<()> {
        unsafe {
            region::protect(self.base.cast(), self.size, Protection::READ_EXECUTE)?;
        }
        self.state = ArenaState::Executable;
        Ok(())
    }

    /// Invoke the trampoline at `offset`, forwarding `vm_ptr` to the
    /// resolved symbol under the host C calling convention. Only valid
    /// once the arena is `Executable`.
    ///
    /// # Safety
    /// Caller must ensure `offset` is the start of a trampoline this
    /// arena emitted and that the arena has been frozen.
    pub unsafe fn call(&self, offset: usize, vm_ptr: *mut c_void) -> u64 {
        let f: extern "C" fn(*mut c_void) -> u64 =
            std::mem::transmute(self.base.add(offset));
        f(vm_ptr)
    }
}

#[cfg(target_arch = "x86_64")]
fn encode_trampoline(target: usize) -> Vec<u8> {
    // SysV x86-64: the single argument arrives in %rdi and is left
    // untouched, so forwarding it is simply "call through unchanged".
    let mut code = Vec::with_capacity(18);
    code.push(0x55); // push rbp
    code.extend_from_slice(&[0x48, 0x89, 0xe5]); // mov rbp, rsp
    code.push(0x48); // REX.W
    code.push(0xb8); // movabs rax, imm64
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xff, 0xd0]); // call rax
    code.push(0x5d); // pop rbp
    code.push(0xc3); // ret
    code
}

#[cfg(not(target_arch = "x86_64"))]
fn encode_trampoline(_target: usize) -> Vec<u8> {
    // The trampoline's machine code is host-ABI specific and this crate
    // only encodes the x86-64 SysV calling convention.
    panic!("FFI trampolines are only implemented for x86-64 in this build");
}

/// Auxiliary state for the FFI group of opcodes: opened libraries, the
/// currently-selected one, resolved externs, and the trampoline arena.
pub struct FfiState {
    pub lib_stack: BoundedStack,
    pub extern_stack: BoundedStack,
    libraries: Vec<*mut c_void>,
    current_library: Option<usize>,
    externs: Vec<ExternDescriptor>,
    pub arena: TrampolineArena,
}

impl FfiState {
    pub fn new(arena_size: usize) -> io::Result<FfiState> {
        Ok(FfiState {
            lib_stack: BoundedStack::new(32),
            extern_stack: BoundedStack::new(32),
            libraries: Vec::new(),
            current_library: None,
            externs: Vec::new(),
            arena: TrampolineArena::new(arena_size)?,
        })
    }

    /// Opens `name` lazily and makes it the current library. Returns
    /// the index pushed onto the library-handle stack.
    pub fn load_library(&mut self, name: &str) -> Result<usize, String> {
        let cname = CString::new(name).map_err(|e| e.to_string())?;
        let _ = unsafe { dlerror() }; // clear any pending error, per `man 3 dlerror`
        let handle = unsafe { dlopen(cname.as_ptr(), RTLD_LAZY) };
        if handle.is_null() {
            let msg = unsafe { dlerror() };
            let msg = if msg.is_null() {
                "dlopen failed".to_string()
            } else {
                unsafe { std::ffi::CStr::from_ptr(msg) }
                    .to_string_lossy()
                    .into_owned()
            };
            return Err(msg);
        }
        let index = self.libraries.len();
        self.libraries.push(handle);
        self.current_library = Some(index);
        Ok(index)
    }

    pub fn select_library(&mut self, index: usize) -> bool {
        if index < self.libraries.len() {
            self.current_library = Some(index);
            true
        } else {
            false
        }
    }

    pub fn resolve_symbol(&self, name: &str) -> Result<usize, String> {
        let lib = self
            .current_library
            .and_then(|i| self.libraries.get(i))
            .ok_or_else(|| "no library selected".to_string())?;
        let cname = CString::new(name).map_err(|e| e.to_string())?;
        let _ = unsafe { dlerror() };
        let sym = unsafe { dlsym(*lib, cname.as_ptr()) };
        if sym.is_null() {
            let msg = unsafe { dlerror() };
            let msg = if msg.is_null() {
                format!("symbol {name} not found")
            } else {
                unsafe { std::ffi::CStr::from_ptr(msg) }
                    .to_string_lossy()
                    .into_owned()
            };
            return Err(msg);
        }
        Ok(sym as usize)
    }

    pub fn record_extern(&mut self, symbol_addr: usize, trampoline_offset: usize) {
        self.externs.push(ExternDescriptor {
            symbol_addr,
            trampoline_offset,
        });
        let _ = self
            .extern_stack
            .push(Value::from_host_addr(self.arena.entry_addr(trampoline_offset)));
    }
}

impl Drop for FfiState {
    fn drop(&mut self) {
        // Close in reverse open order.
        for handle in self.libraries.iter().rev() {
            unsafe {
                dlclose(*handle);
            }
        }
    }
}
