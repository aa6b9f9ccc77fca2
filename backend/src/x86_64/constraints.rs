use crate::constraint::*;
use crate::x86_64::regs::{Reg, ALLOCATABLE_REGS};
use tcg_core::Opcode;

const R: tcg_core::RegSet = ALLOCATABLE_REGS;

/// Return the static register constraint for an opcode on
/// x86-64.
///
/// Mirrors QEMU's `tcg_target_op_def()` in
/// `tcg/i386/tcg-target.c.inc`.
pub fn op_constraint(opc: Opcode) -> &'static OpConstraint {
    match opc {
        // -- Three-address via LEA --
        Opcode::Add => {
            static C: OpConstraint = o1_i2(R, R, R);
            &C
        }
        // -- Destructive binary (output aliases input 0) --
        Opcode::Sub | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor => {
            static C: OpConstraint = o1_i2_alias(R, R, R);
            &C
        }
        // -- Destructive unary (output aliases input 0) --
        Opcode::Neg | Opcode::Not => {
            static C: OpConstraint = o1_i1_alias(R, R);
            &C
        }
        // -- Shifts: output aliases input 0, count in RCX --
        Opcode::Shl | Opcode::Shr | Opcode::Sar => {
            static C: OpConstraint = o1_i2_alias_fixed(R, R, Reg::Rcx as u8);
            &C
        }
        // -- SetCond: newreg output (setcc writes low byte) --
        Opcode::SetCond => {
            static C: OpConstraint = n1_i2(R, R, R);
            &C
        }
        // -- BrCond: no outputs --
        Opcode::BrCond => {
            static C: OpConstraint = o0_i2(R, R);
            &C
        }
        // -- Load: output, base input --
        Opcode::Ld
        | Opcode::Ld8U
        | Opcode::Ld8S
        | Opcode::Ld16U
        | Opcode::Ld16S
        | Opcode::Ld32U
        | Opcode::Ld32S => {
            static C: OpConstraint = o1_i1(R, R);
            &C
        }
        // -- Store: value input, base input --
        Opcode::St | Opcode::St8 | Opcode::St16 | Opcode::St32 => {
            static C: OpConstraint = o0_i2(R, R);
            &C
        }
        // -- Type conversions: output, input --
        Opcode::ExtI32I64 | Opcode::ExtUI32I64 | Opcode::ExtrlI64I32 => {
            static C: OpConstraint = o1_i1(R, R);
            &C
        }
        // -- ExtrhI64I32: in-place SHR, output aliases input --
        Opcode::ExtrhI64I32 => {
            static C: OpConstraint = o1_i1_alias(R, R);
            &C
        }
        // -- AndC: ANDN is non-destructive, no alias needed --
        Opcode::AndC => {
            static C: OpConstraint = o1_i2(R, R, R);
            &C
        }
        // -- Destructive binary logic (output aliases input 0) --
        Opcode::OrC | Opcode::Eqv | Opcode::Nand | Opcode::Nor => {
            static C: OpConstraint = o1_i2_alias(R, R, R);
            &C
        }
        // -- Rotates: output aliases input 0, count in RCX --
        Opcode::RotL | Opcode::RotR => {
            static C: OpConstraint = o1_i2_alias_fixed(R, R, Reg::Rcx as u8);
            &C
        }
        // -- Carry/borrow arithmetic: destructive (output aliases input 0) --
        Opcode::AddCO
        | Opcode::AddCI
        | Opcode::AddCIO
        | Opcode::AddC1O
        | Opcode::SubBO
        | Opcode::SubBI
        | Opcode::SubBIO
        | Opcode::SubB1O => {
            static C: OpConstraint = o1_i2_alias(R, R, R);
            &C
        }
        // -- Double-width multiply: RAX:RDX = RAX * r/m --
        Opcode::MulS2 | Opcode::MulU2 => {
            static C: OpConstraint = o2_i2_fixed(Reg::Rax as u8, Reg::Rdx as u8, R);
            &C
        }
        // -- Double-width divide: RAX:RDX / r/m -> RAX,RDX --
        Opcode::DivS2 | Opcode::DivU2 => {
            static C: OpConstraint = o2_i3_fixed(Reg::Rax as u8, Reg::Rdx as u8, R);
            &C
        }
        // -- Double-word arithmetic (Add2/Sub2): aliases lo/hi pair --
        Opcode::Add2 | Opcode::Sub2 => {
            static C: OpConstraint = o2_i4_alias01(R, R, R, R, R, R);
            &C
        }
        // -- Bit-field extract: non-destructive --
        Opcode::Extract | Opcode::SExtract => {
            static C: OpConstraint = o1_i1(R, R);
            &C
        }
        // -- Deposit: overwrites low bits of the original value in place --
        Opcode::Deposit => {
            static C: OpConstraint = o1_i2_alias(R, R, R);
            &C
        }
        // -- Extract2: SHRD requires dst to already hold the low part --
        Opcode::Extract2 => {
            static C: OpConstraint = o1_i2_alias(R, R, R);
            &C
        }
        // -- Byte swap: in-place, output aliases input --
        Opcode::Bswap16 | Opcode::Bswap32 | Opcode::Bswap64 => {
            static C: OpConstraint = o1_i1_alias(R, R);
            &C
        }
        // -- Bit counting: LZCNT/TZCNT are non-destructive --
        Opcode::Clz | Opcode::Ctz => {
            static C: OpConstraint = o1_i2(R, R, R);
            &C
        }
        Opcode::CtPop => {
            static C: OpConstraint = o1_i1(R, R);
            &C
        }
        // -- NegSetCond: newreg output (setcc writes low byte) --
        Opcode::NegSetCond => {
            static C: OpConstraint = n1_i2(R, R, R);
            &C
        }
        // -- MovCond: output aliases v1 (input 2) --
        Opcode::MovCond => {
            static C: OpConstraint = o1_i4_alias2(R, R, R, R, R);
            &C
        }
        // -- GotoPtr: indirect jump through register --
        Opcode::GotoPtr => {
            static C: OpConstraint = o0_i1(R);
            &C
        }
        // -- Guest memory load: output, address input --
        Opcode::QemuLd => {
            static C: OpConstraint = o1_i1(R, R);
            &C
        }
        // -- Guest memory store: value input, address input --
        Opcode::QemuSt => {
            static C: OpConstraint = o0_i2(R, R);
            &C
        }
        _ => &OpConstraint::EMPTY,
    }
}
