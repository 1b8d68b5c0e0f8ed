//! End-to-end scenarios run through the public `Vm` API: a program
//! image in, a final VM state out. These mirror the canonical examples
//! in the specification.

use pretty_assertions::assert_eq;

use bvm::opcode::Opcode;
use bvm::value::Value;
use bvm::{State, Vm, VmLimits};

fn word(opcode: Opcode, mode: u8, short_imm: u16) -> [u8; 4] {
    let b = short_imm.to_le_bytes();
    [opcode as u8, mode, b[0], b[1]]
}

fn vm_with(code: Vec<u8>) -> Vm {
    Vm::new(code, VmLimits::default()).expect("vm init should not fail")
}

#[test]
fn smoke_test_nop_then_halt() {
    let mut code = word(Opcode::Nop, 0x00, 0).to_vec();
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    let mut vm = vm_with(code);
    vm.run().unwrap();
    assert_eq!(vm.state(), State::Halted);
}

#[test]
fn arithmetic_add_pushes_the_sum() {
    let mut code = word(Opcode::Push, 0x00, 7).to_vec();
    code.extend_from_slice(&word(Opcode::Push, 0x00, 3));
    code.extend_from_slice(&word(Opcode::Add, 0x02, 0)); // U32
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    let mut vm = vm_with(code);
    vm.run().unwrap();
    assert_eq!(vm.data.pop().unwrap(), Value::from_u64(10));
}

#[test]
fn conditional_jump_preserves_its_operand() {
    // PUSH 1; JNZ +12 (skip the NOP); NOP; HALT
    let mut code = word(Opcode::Push, 0x00, 1).to_vec();
    code.extend_from_slice(&word(Opcode::Jnz, 0x02, 0)); // extended target follows
    code.extend_from_slice(&16u32.to_le_bytes());
    code.extend_from_slice(&word(Opcode::Nop, 0x00, 0)); // must be skipped
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    assert_eq!(code.len(), 20);

    let mut vm = vm_with(code);
    vm.run().unwrap();
    assert_eq!(vm.state(), State::Halted);
    // The tested operand is still on the data stack.
    assert_eq!(vm.data.pop().unwrap(), Value::from_u64(1));
    assert!(vm.data.is_empty());
}

#[test]
fn subroutine_call_and_return() {
    // CALL sub; HALT; sub: PUSH 99; RET
    let mut code = word(Opcode::Call, 0x02, 0).to_vec();
    code.extend_from_slice(&12u32.to_le_bytes());
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Push, 0x00, 99));
    code.extend_from_slice(&word(Opcode::Ret, 0x00, 0));
    assert_eq!(code.len(), 20);

    let mut vm = vm_with(code);
    vm.run().unwrap();
    assert_eq!(vm.state(), State::Halted);
    assert_eq!(vm.data.pop().unwrap(), Value::from_u64(99));
    assert!(vm.call.is_empty());
}

#[test]
fn trap_handler_resumes_past_the_faulting_instruction() {
    // SETHDLR 28; PUSH 1; PUSH 0; DIV u32 (traps 0x15 at pc=20); HALT;
    // NOP (padding); handler @28: STORE 48; CLRERR; RET; NOP (padding).
    let mut code = word(Opcode::Sethdlr, 0x02, 0).to_vec();
    code.extend_from_slice(&28u32.to_le_bytes());
    code.extend_from_slice(&word(Opcode::Push, 0x00, 1));
    code.extend_from_slice(&word(Opcode::Push, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Div, 0x02, 0)); // U32
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Nop, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Store, 0x02, 0)); // handler starts here, offset 28
    code.extend_from_slice(&48u32.to_le_bytes());
    code.extend_from_slice(&word(Opcode::Clrerr, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Ret, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Nop, 0x00, 0));
    code.extend_from_slice(&[0u8; 4]); // scratch byte lives at offset 48
    assert_eq!(code.len(), 52);

    let mut vm = vm_with(code);
    vm.run().unwrap();

    assert_eq!(vm.state(), State::Halted);
    assert_eq!(vm.code[48], 0x15, "handler should have observed trap code 0x15");
    assert!(vm.data.is_empty());
    assert!(vm.call.is_empty());
    assert!(vm.trap.pending().is_none());
}

#[test]
fn inline_string_push_and_pseg_read_the_same_bytes() {
    // PUSH 3 (count); PUSH mode=0x04 len=4 "HI\0\0" (offset); PSEG; HALT
    let mut code = word(Opcode::Push, 0x00, 3).to_vec();
    code.extend_from_slice(&word(Opcode::Push, 0x04, 4));
    code.extend_from_slice(b"HI\0\0");
    code.extend_from_slice(&word(Opcode::Pseg, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));
    assert_eq!(code.len(), 20);

    let mut vm = vm_with(code);
    vm.run().unwrap();
    assert_eq!(vm.state(), State::Halted);
    assert!(vm.data.is_empty());
}

#[test]
fn unhandled_trap_reports_and_halts_with_a_vm_error() {
    // PUSH 1; PUSH 0; DIV u32, with no handler installed.
    let mut code = word(Opcode::Push, 0x00, 1).to_vec();
    code.extend_from_slice(&word(Opcode::Push, 0x00, 0));
    code.extend_from_slice(&word(Opcode::Div, 0x02, 0));
    code.extend_from_slice(&word(Opcode::Halt, 0x00, 0));

    let mut vm = vm_with(code);
    let err = vm.run().unwrap_err();
    assert!(err.to_string().contains("0x15"));
    assert_eq!(vm.state(), State::Halted);
}
