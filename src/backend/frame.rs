//! Post-allocation stack lowering: every abstract `StackAccess` and
//! `Memory` operand becomes a `(base register, immediate offset)` pair using
//! the finalized frame layout. At most one such operand exists per
//! instruction; the pair is appended so the load/store templates see the
//! value register first.

use tracing::debug;

use crate::{
    backend::{
        llir::{LowLevelType, MachineFunction, Operand, OperandKind},
        target::TargetDescription,
    },
    error::CodegenError,
};

const PASS: &str = "frame";

pub fn lower_stack_accesses(
    func: &mut MachineFunction,
    target: &TargetDescription,
) -> Result<(), CodegenError> {
    debug!(function = %func.name, objects = func.frame.objects_size(), "lowering stack accesses");

    let stack_register = target.registers.stack_register();
    let frame = &func.frame;

    for block in &mut func.blocks {
        for instruction in &mut block.instructions {
            let Some(index) = instruction.operands.iter().position(|operand| {
                matches!(
                    operand.kind,
                    OperandKind::StackAccess { .. } | OperandKind::Memory { .. }
                )
            }) else {
                continue;
            };

            let memory_operands = instruction
                .operands
                .iter()
                .filter(|operand| {
                    matches!(
                        operand.kind,
                        OperandKind::StackAccess { .. } | OperandKind::Memory { .. }
                    )
                })
                .count();
            if memory_operands > 1 {
                return Err(CodegenError::invalid_ir(
                    PASS,
                    "more than one memory operand on a single instruction",
                ));
            }

            let operand = instruction.operands.remove(index);
            match operand.kind {
                OperandKind::StackAccess { slot, offset } => {
                    let position = frame.position(slot).ok_or_else(|| {
                        CodegenError::invalid_ir(PASS, format!("unknown stack slot {slot}"))
                    })?;
                    instruction.push(Operand::register(stack_register, LowLevelType::ptr()));
                    instruction.push(Operand::immediate(
                        i64::from(position) + i64::from(offset),
                        LowLevelType::int(32),
                    ));
                }
                OperandKind::Memory {
                    base,
                    offset,
                    is_virtual,
                } => {
                    if is_virtual {
                        return Err(CodegenError::invalid_ir(
                            PASS,
                            format!("memory base {base} still virtual after allocation"),
                        ));
                    }
                    let bits = target.registers.get(base).bits;
                    instruction.push(Operand::register(base, LowLevelType::int(bits)));
                    instruction.push(Operand::immediate(
                        i64::from(offset),
                        LowLevelType::int(32),
                    ));
                }
                _ => unreachable!(),
            }
        }
    }

    Ok(())
}
