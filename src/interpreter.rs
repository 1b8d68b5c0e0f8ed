//! The interpreter step: pop operands, resolve immediates, dispatch on
//! opcode, push results — in that fixed order on every step.

use log::{debug, trace};

use crate::decode::{self, FetchOutcome, Word};
use crate::error::{
    Trap, TRAP_ALIGNMENT_OR_TERMINATOR, TRAP_CALL_STACK_OVERFLOW, TRAP_DATA_STACK_OVERFLOW,
    TRAP_DIV_MOD_ZERO_OR_EMPTY_RET, TRAP_EMPTY_STACK_ON_STORE, TRAP_FFI_ARENA_FROZEN,
    TRAP_JUMP_OUT_OF_BOUNDS, TRAP_LIBRARY_OPEN_FAILURE, TRAP_MISSING_BINARY_OPERAND,
    TRAP_MISSING_UNARY_OPERAND, TRAP_SYMBOL_RESOLUTION_FAILURE, TRAP_UNKNOWN_MODE,
    TRAP_UNSAFE_POINTER, TRAP_USER_RAISED,
};
use crate::opcode::Opcode;
use crate::value::{Mode, Value, Wide};
use crate::vm::Vm;

/// Outcome of one `step()` call.
pub enum StepOutcome {
    Continue,
    Halted,
    Trap(Trap),
}

/// Run one interpreter step against `vm`, in this fixed order:
/// fetch, pop operands, resolve extended immediate, dispatch, push.
pub fn step(vm: &mut Vm) -> StepOutcome {
    // Phase 2: fetch the fixed 4-byte instruction word.
    let word = match decode::fetch_word(&vm.code, vm.pc) {
        FetchOutcome::Word(w) => w,
        FetchOutcome::Exhausted => {
            debug!("no more instructions to execute at pc={}", vm.pc);
            return StepOutcome::Halted;
        }
    };
    vm.pc = word.next_pc;

    // Phase 3: pop operands by arity, before the extended immediate is
    // even looked at, so a missing operand traps ahead of a bad mode byte.
    let (left, right) = match pop_operands(vm, word.opcode) {
        Ok(pair) => pair,
        Err(trap) => return StepOutcome::Trap(trap),
    };

    // Phase 4: resolve the extended immediate, if the opcode has one.
    let (imm, next_pc) = match decode::resolve_extended_immediate(&vm.code, word) {
        Ok(pair) => pair,
        Err(trap) => return StepOutcome::Trap(trap),
    };
    vm.pc = next_pc;

    trace!(
        "step opcode={:?} mode={:#04x} imm={:#x} pc->{}",
        word.opcode,
        word.mode,
        imm,
        vm.pc
    );

    // Phases 5 & 6: dispatch and push any result.
    dispatch(vm, word, left, right, imm)
}

fn pop_operands(vm: &mut Vm, opcode: Opcode) -> Result<(Option<Value>, Option<Value>), Trap> {
    if opcode.is_binary_arith() {
        let right = vm
            .data
            .pop()
            .map_err(|_| Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc))?;
        let left = vm
            .data
            .pop()
            .map_err(|_| Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc))?;
        Ok((Some(left), Some(right)))
    } else if opcode.is_unary() {
        let left = vm
            .data
            .pop()
            .map_err(|_| Trap::new(TRAP_MISSING_UNARY_OPERAND, vm.pc))?;
        Ok((Some(left), None))
    } else {
        Ok((None, None))
    }
}

fn dispatch(
    vm: &mut Vm,
    word: Word,
    left: Option<Value>,
    right: Option<Value>,
    imm: u64,
) -> StepOutcome {
    use Opcode::*;

    match word.opcode {
        Nop => StepOutcome::Continue,

        Halt => {
            vm.halted = true;
            log::info!("vm has been halted");
            StepOutcome::Halted
        }

        Clrs => {
            vm.data.clear();
            StepOutcome::Continue
        }

        Pstate => {
            print_state(vm);
            StepOutcome::Continue
        }

        Push => push_result(vm, Value::from_u64(imm)),

        Pop => match vm.data.pop() {
            Ok(_) => StepOutcome::Continue,
            Err(_) => StepOutcome::Trap(Trap::new(TRAP_MISSING_UNARY_OPERAND, vm.pc)),
        },

        Swap => {
            vm.data.swap();
            StepOutcome::Continue
        }

        Rot3 => {
            vm.data.rot3();
            StepOutcome::Continue
        }

        Add | Sub | Mul | Div | Mod | And | Or | Xor | Neq | Eq | Lt | Le | Gt | Ge => {
            binary_arith(vm, word.opcode, word.mode, left.unwrap(), right.unwrap())
        }

        Not => unary(vm, word.mode, left.unwrap()),

        Jnz => conditional_jump(vm, left.unwrap(), imm as usize, true),
        Jz => conditional_jump(vm, left.unwrap(), imm as usize, false),

        Jmp => match vm_jump(vm, imm as usize) {
            Ok(()) => StepOutcome::Continue,
            Err(trap) => StepOutcome::Trap(trap),
        },

        Call => {
            let return_pc = vm.pc;
            if vm.call.push(Value::from_offset(return_pc)).is_err() {
                return StepOutcome::Trap(Trap::new(TRAP_CALL_STACK_OVERFLOW, vm.pc));
            }
            match vm_jump(vm, imm as usize) {
                Ok(()) => StepOutcome::Continue,
                Err(trap) => StepOutcome::Trap(trap),
            }
        }

        Ret => match vm.call.pop() {
            Ok(target) => match vm_jump(vm, target.as_offset()) {
                Ok(()) => StepOutcome::Continue,
                Err(trap) => StepOutcome::Trap(trap),
            },
            Err(_) => StepOutcome::Trap(Trap::new(TRAP_DIV_MOD_ZERO_OR_EMPTY_RET, vm.pc)),
        },

        Load => {
            let offset = imm as usize;
            match vm.code.get(offset) {
                Some(byte) => push_result(vm, Value::from_u64(*byte as u64)),
                None => StepOutcome::Trap(Trap::with_message(
                    TRAP_JUMP_OUT_OF_BOUNDS,
                    vm.pc,
                    "LOAD offset outside code segment",
                )),
            }
        }

        Store => {
            let offset = imm as usize;
            match vm.data.pop() {
                Ok(v) => {
                    if offset >= vm.code.len() {
                        StepOutcome::Trap(Trap::with_message(
                            TRAP_JUMP_OUT_OF_BOUNDS,
                            vm.pc,
                            "STORE offset outside code segment",
                        ))
                    } else {
                        vm.code[offset] = v.as_u64() as u8;
                        StepOutcome::Continue
                    }
                }
                Err(_) => StepOutcome::Trap(Trap::new(TRAP_EMPTY_STACK_ON_STORE, vm.pc)),
            }
        }

        Pseg => {
            let right = match vm.data.pop() {
                Ok(v) => v,
                Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc)),
            };
            let left = match vm.data.pop() {
                Ok(v) => v,
                Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc)),
            };
            let count = left.as_u64() as usize;
            let offset = right.as_u64() as usize;
            match vm.code.get(offset..offset.saturating_add(count)) {
                Some(bytes) => {
                    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
                    log::info!("pseg[{offset}..{}]: {}", offset + count, hex.join(" "));
                    StepOutcome::Continue
                }
                None => StepOutcome::Trap(Trap::with_message(
                    TRAP_JUMP_OUT_OF_BOUNDS,
                    vm.pc,
                    "PSEG range outside code segment",
                )),
            }
        }

        Sethdlr => {
            vm.trap.install_handler(imm as usize);
            StepOutcome::Continue
        }

        Seterr => set_err(vm, word.mode, imm),

        Clrerr => {
            vm.trap.clear();
            StepOutcome::Continue
        }

        FfiLibLoad => ffi_lib_load(vm),
        FfiLibSelect => ffi_lib_select(vm),
        FfiMakeExtern => ffi_make_extern(vm),
        FfiMakeDone => ffi_make_done(vm),
        FfiCall => ffi_call(vm, imm as usize),
    }
}

/// Shared push-result tail for arithmetic/bitwise/comparison/unary/PUSH.
fn push_result(vm: &mut Vm, v: Value) -> StepOutcome {
    match vm.data.push(v) {
        Ok(()) => StepOutcome::Continue,
        Err(()) => StepOutcome::Trap(Trap::new(TRAP_DATA_STACK_OVERFLOW, vm.pc)),
    }
}

fn decode_mode(vm: &Vm, mode_byte: u8, reject_float: bool) -> Result<Mode, Trap> {
    let mode = Mode::from_byte(mode_byte).ok_or_else(|| Trap::new(TRAP_UNKNOWN_MODE, vm.pc))?;
    if reject_float && mode.is_float() {
        return Err(Trap::with_message(
            TRAP_UNKNOWN_MODE,
            vm.pc,
            "float mode is not valid for this opcode",
        ));
    }
    Ok(mode)
}

fn binary_arith(vm: &mut Vm, opcode: Opcode, mode_byte: u8, left: Value, right: Value) -> StepOutcome {
    let mode = match decode_mode(vm, mode_byte, opcode.rejects_float_mode()) {
        Ok(m) => m,
        Err(trap) => return StepOutcome::Trap(trap),
    };

    let l = left.read(mode);
    let r = right.read(mode);

    let result = match opcode {
        Opcode::Add => wide_arith(l, r, |a, b| a.wrapping_add(b), |a, b| a.wrapping_add(b), |a, b| a + b, |a, b| a + b),
        Opcode::Sub => wide_arith(l, r, |a, b| a.wrapping_sub(b), |a, b| a.wrapping_sub(b), |a, b| a - b, |a, b| a - b),
        Opcode::Mul => wide_arith(l, r, |a, b| a.wrapping_mul(b), |a, b| a.wrapping_mul(b), |a, b| a * b, |a, b| a * b),
        Opcode::Div => {
            if r.is_zero() {
                return StepOutcome::Trap(Trap::new(TRAP_DIV_MOD_ZERO_OR_EMPTY_RET, vm.pc));
            }
            wide_arith(l, r, |a, b| a.wrapping_div(b), |a, b| a.wrapping_div(b), |a, b| a / b, |a, b| a / b)
        }
        Opcode::Mod => {
            if r.is_zero() {
                return StepOutcome::Trap(Trap::new(TRAP_DIV_MOD_ZERO_OR_EMPTY_RET, vm.pc));
            }
            match (l, r) {
                (Wide::U(a), Wide::U(b)) => Wide::U(a.wrapping_rem(b)),
                (Wide::I(a), Wide::I(b)) => Wide::I(a.wrapping_rem(b)),
                _ => unreachable!("float modes rejected for MOD"),
            }
        }
        Opcode::And => int_only(l, r, |a, b| a & b, |a, b| a & b),
        Opcode::Or => int_only(l, r, |a, b| a | b, |a, b| a | b),
        Opcode::Xor => int_only(l, r, |a, b| a ^ b, |a, b| a ^ b),
        Opcode::Neq => comparison(l, r, |ord| ord != std::cmp::Ordering::Equal),
        Opcode::Eq => comparison(l, r, |ord| ord == std::cmp::Ordering::Equal),
        Opcode::Lt => comparison(l, r, |ord| ord == std::cmp::Ordering::Less),
        Opcode::Le => comparison(l, r, |ord| ord != std::cmp::Ordering::Greater),
        Opcode::Gt => comparison(l, r, |ord| ord == std::cmp::Ordering::Greater),
        Opcode::Ge => comparison(l, r, |ord| ord != std::cmp::Ordering::Less),
        _ => unreachable!("binary_arith called with non-binary opcode"),
    };

    push_result(vm, result.pack(mode))
}

fn wide_arith(
    l: Wide,
    r: Wide,
    u_op: impl Fn(u64, u64) -> u64,
    i_op: impl Fn(i64, i64) -> i64,
    f32_op: impl Fn(f32, f32) -> f32,
    f64_op: impl Fn(f64, f64) -> f64,
) -> Wide {
    match (l, r) {
        (Wide::U(a), Wide::U(b)) => Wide::U(u_op(a, b)),
        (Wide::I(a), Wide::I(b)) => Wide::I(i_op(a, b)),
        (Wide::F32(a), Wide::F32(b)) => Wide::F32(f32_op(a, b)),
        (Wide::F64(a), Wide::F64(b)) => Wide::F64(f64_op(a, b)),
        _ => unreachable!("left/right always share the same mode"),
    }
}

fn int_only(l: Wide, r: Wide, u_op: impl Fn(u64, u64) -> u64, i_op: impl Fn(i64, i64) -> i64) -> Wide {
    match (l, r) {
        (Wide::U(a), Wide::U(b)) => Wide::U(u_op(a, b)),
        (Wide::I(a), Wide::I(b)) => Wide::I(i_op(a, b)),
        _ => unreachable!("float modes rejected for bitwise ops"),
    }
}

fn comparison(l: Wide, r: Wide, pred: impl Fn(std::cmp::Ordering) -> bool) -> Wide {
    let ord = match (l, r) {
        (Wide::U(a), Wide::U(b)) => a.cmp(&b),
        (Wide::I(a), Wide::I(b)) => a.cmp(&b),
        (Wide::F32(a), Wide::F32(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Greater),
        (Wide::F64(a), Wide::F64(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Greater),
        _ => unreachable!("left/right always share the same mode"),
    };
    Wide::U(pred(ord) as u64)
}

fn unary(vm: &mut Vm, mode_byte: u8, left: Value) -> StepOutcome {
    let mode = match decode_mode(vm, mode_byte, true) {
        Ok(m) => m,
        Err(trap) => return StepOutcome::Trap(trap),
    };
    let result = match left.read(mode) {
        Wide::U(a) => Wide::U(!a),
        Wide::I(a) => Wide::I(!a),
        _ => unreachable!("float modes rejected for NOT"),
    };
    push_result(vm, result.pack(mode))
}

fn conditional_jump(vm: &mut Vm, left: Value, target: usize, on_nonzero: bool) -> StepOutcome {
    // Predicate is evaluated on the raw 64-bit view.
    let take_branch = left.is_nonzero() == on_nonzero;
    if take_branch {
        if let Err(trap) = vm_jump(vm, target) {
            return StepOutcome::Trap(trap);
        }
    }
    // The operand is preserved on the data stack either way.
    push_result(vm, left)
}

fn vm_jump(vm: &mut Vm, target: usize) -> Result<(), Trap> {
    if target <= vm.code.len().saturating_sub(4) {
        vm.pc = target;
        Ok(())
    } else {
        Err(Trap::with_message(
            TRAP_JUMP_OUT_OF_BOUNDS,
            vm.pc,
            format!("target {target} is outside the code segment"),
        ))
    }
}

fn set_err(vm: &mut Vm, mode: u8, imm: u64) -> StepOutcome {
    // SETERR: mode 0x00 is a code-segment offset; mode 0x01 is a raw
    // pointer the VM itself must have produced, bounds-checked against
    // the code segment either way — other memory sources are
    // intentionally rejected. Raising goes through the ordinary
    // trap-and-resume path, so a handler sees it exactly like any
    // interpreter-raised fault.
    let offset = imm as usize;
    if offset >= vm.code.len() {
        return StepOutcome::Trap(Trap::new(TRAP_UNSAFE_POINTER, vm.pc));
    }
    match mode {
        0x00 | 0x01 => {
            let message = read_nul_terminated(&vm.code, offset);
            StepOutcome::Trap(Trap::with_message(TRAP_USER_RAISED, vm.pc, message))
        }
        _ => StepOutcome::Trap(Trap::new(TRAP_UNKNOWN_MODE, vm.pc)),
    }
}

fn read_nul_terminated(code: &[u8], offset: usize) -> String {
    let end = code[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(code.len());
    String::from_utf8_lossy(&code[offset..end]).into_owned()
}

fn print_state(vm: &Vm) {
    log::info!(
        "code: {} bytes, pc={}, data: {}/{}, call: {}/{}",
        vm.code.len(),
        vm.pc,
        vm.data.len(),
        vm.data.capacity(),
        vm.call.len(),
        vm.call.capacity()
    );
    for (i, v) in vm.data.iter().enumerate() {
        log::info!("  data[{i}] = {:#x}", v.as_u64());
    }
}

fn ffi_lib_load(vm: &mut Vm) -> StepOutcome {
    let name_offset = match vm.data.pop() {
        Ok(v) => v.as_offset(),
        Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_UNARY_OPERAND, vm.pc)),
    };
    let name = read_nul_terminated(&vm.code, name_offset);
    match vm.ffi.load_library(&name) {
        Ok(index) => {
            if vm.ffi.lib_stack.push(Value::from_u64(index as u64)).is_err() {
                return StepOutcome::Trap(Trap::new(TRAP_DATA_STACK_OVERFLOW, vm.pc));
            }
            StepOutcome::Continue
        }
        Err(msg) => StepOutcome::Trap(Trap::with_message(TRAP_LIBRARY_OPEN_FAILURE, vm.pc, msg)),
    }
}

fn ffi_lib_select(vm: &mut Vm) -> StepOutcome {
    let index = match vm.data.pop() {
        Ok(v) => v.as_u64() as usize,
        Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_UNARY_OPERAND, vm.pc)),
    };
    if vm.ffi.select_library(index) {
        StepOutcome::Continue
    } else {
        StepOutcome::Trap(Trap::with_message(
            TRAP_LIBRARY_OPEN_FAILURE,
            vm.pc,
            "no such library index",
        ))
    }
}

fn ffi_make_extern(vm: &mut Vm) -> StepOutcome {
    // Pops (store_target_offset, symbol_name_offset, argc) in that
    // order, so store_target_offset is the one on top of the stack.
    let store_target_offset = match vm.data.pop() {
        Ok(v) => v.as_offset(),
        Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc)),
    };
    let symbol_name_offset = match vm.data.pop() {
        Ok(v) => v.as_offset(),
        Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc)),
    };
    let argc = match vm.data.pop() {
        Ok(v) => v.as_u64(),
        Err(_) => return StepOutcome::Trap(Trap::new(TRAP_MISSING_BINARY_OPERAND, vm.pc)),
    };
    let _ = argc; // part of the wire contract; the trampoline forwards one pointer regardless of arity.

    let symbol_name = read_nul_terminated(&vm.code, symbol_name_offset);
    let symbol_addr = match vm.ffi.resolve_symbol(&symbol_name) {
        Ok(addr) => addr,
        Err(msg) => {
            return StepOutcome::Trap(Trap::with_message(
                TRAP_SYMBOL_RESOLUTION_FAILURE,
                vm.pc,
                msg,
            ))
        }
    };

    let trampoline_offset = match vm.ffi.arena.emit_trampoline(symbol_addr) {
        Some(off) => off,
        None => {
            return StepOutcome::Trap(Trap::with_message(
                TRAP_FFI_ARENA_FROZEN,
                vm.pc,
                "FFI arena is frozen or out of space",
            ))
        }
    };
    vm.ffi.record_extern(symbol_addr, trampoline_offset);

    let entry_addr = vm.ffi.arena.entry_addr(trampoline_offset);
    if store_target_offset + 8 > vm.code.len() {
        return StepOutcome::Trap(Trap::new(TRAP_JUMP_OUT_OF_BOUNDS, vm.pc));
    }
    vm.code[store_target_offset..store_target_offset + 8]
        .copy_from_slice(&(entry_addr as u64).to_le_bytes());

    StepOutcome::Continue
}

fn ffi_make_done(vm: &mut Vm) -> StepOutcome {
    if vm.ffi.arena.is_frozen() {
        return StepOutcome::Trap(Trap::with_message(TRAP_FFI_ARENA_FROZEN, vm.pc, "FFI arena already frozen"));
    }
    match vm.ffi.arena.freeze() {
        Ok(()) => StepOutcome::Continue,
        Err(e) => StepOutcome::Trap(Trap::with_message(TRAP_FFI_ARENA_FROZEN, vm.pc, e.to_string())),
    }
}

fn ffi_call(vm: &mut Vm, code_addr_slot: usize) -> StepOutcome {
    if code_addr_slot + 8 > vm.code.len() {
        return StepOutcome::Trap(Trap::new(TRAP_JUMP_OUT_OF_BOUNDS, vm.pc));
    }
    if !vm.ffi.arena.is_frozen() {
        return StepOutcome::Trap(Trap::with_message(TRAP_FFI_ARENA_FROZEN, vm.pc, "FFI arena is not executable yet"));
    }
    let bytes: [u8; 8] = vm.code[code_addr_slot..code_addr_slot + 8]
        .try_into()
        .unwrap();
    let entry_addr = u64::from_le_bytes(bytes) as usize;
    let arena_base = vm.ffi.arena.entry_addr(0);
    if entry_addr < arena_base {
        return StepOutcome::Trap(Trap::new(TRAP_ALIGNMENT_OR_TERMINATOR, vm.pc));
    }
    let offset = entry_addr - arena_base;
    let vm_ptr = vm as *mut Vm as *mut std::ffi::c_void;
    let _ = unsafe { vm.ffi.arena.call(offset, vm_ptr) };
    StepOutcome::Continue
}
