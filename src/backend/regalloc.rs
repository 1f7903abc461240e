//! Linear-scan register allocation over a flat instruction numbering.
//!
//! Parameters and the returned value are pre-bound to their ABI registers,
//! then live ranges (first definition to last use) are walked in order:
//! expired ranges hand their register back, unallocated ranges draw from the
//! caller-saved pool, and when that pool runs dry a callee-saved register is
//! promoted into it (and recorded so the prolog saves it). Spilling to
//! memory under pressure is not implemented; exhausting both pools is fatal.

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    backend::{
        llir::{MachineFunction, Opcode, OperandKind},
        target::{TargetDescription, aarch64},
    },
    error::CodegenError,
};

const PASS: &str = "regalloc";

type LiveRange = (u32, u32);

pub fn allocate_registers(
    func: &mut MachineFunction,
    target: &TargetDescription,
) -> Result<(), CodegenError> {
    debug!(function = %func.name, "allocating registers");

    let mut allocated: HashMap<u32, u32> = HashMap::new();
    let mut live_ranges: HashMap<u32, LiveRange> = HashMap::new();
    // the width a register was first seen with decides what it gets
    let mut widths: HashMap<u32, u8> = HashMap::new();

    pre_allocate_parameters(func, target, &mut allocated, &mut live_ranges)?;
    pre_allocate_return_register(func, target, &mut allocated);

    // the primary pool starts as the caller-saved set, minus everything the
    // pre-allocation pinned (including parents and sub-registers)
    let mut pool: Vec<u32> = target.abi.caller_saved.clone();
    let mut backup_pool: Vec<u32> = target.abi.callee_saved.clone();

    for phys in allocated.values() {
        let descriptor = target.registers.get(*phys);
        let mut pinned = descriptor.subregs.clone();
        pinned.push(*phys);
        if let Some(parent) = descriptor.parent {
            pinned.push(parent);
        }
        pool.retain(|reg| !pinned.contains(reg));
    }

    // live ranges: number every instruction in program order and record
    // first-seen (def) and last-seen (kill) per register reference
    let mut counter = 0u32;
    for block in &func.blocks {
        for instruction in &block.instructions {
            for operand in &instruction.operands {
                let id = match operand.kind {
                    OperandKind::VirtualRegister(id) | OperandKind::Parameter(id) => id,
                    OperandKind::Memory {
                        base,
                        is_virtual: true,
                        ..
                    } => base,
                    _ => continue,
                };

                widths.entry(id).or_insert(operand.ty.bits);
                match live_ranges.get_mut(&id) {
                    None => {
                        live_ranges.insert(id, (counter, u32::MAX));
                    }
                    Some(range) => range.1 = counter,
                }
            }
            counter += 1;
        }
    }

    let mut sorted: Vec<(u32, u32, u32)> = live_ranges
        .iter()
        .map(|(vreg, (def, kill))| (*vreg, *def, *kill))
        .collect();
    sorted.sort_by_key(|(_, def, kill)| (*def, *kill));

    // ranges currently holding a register, ordered by arrival
    let mut active: Vec<(u32, u32, u32)> = Vec::new();

    for (vreg, def, kill) in sorted {
        // expire: anything killed before this definition hands its register
        // back to the front of the pool, canonicalized to the parent
        active.retain(|(expired_vreg, _, expired_kill)| {
            if *expired_kill >= def {
                return true;
            }
            let freed = target.registers.canonical(allocated[expired_vreg]);
            pool.insert(0, freed);
            false
        });

        if allocated.contains_key(&vreg) {
            continue;
        }

        let bits = widths.get(&vreg).copied().unwrap_or(32);
        let phys = take_register(bits, &mut pool, &mut backup_pool, func, target)?;
        debug!(vreg, reg = %target.registers.get(phys).name, "allocated");
        allocated.insert(vreg, phys);
        active.push((vreg, def, kill));
    }

    rewrite_operands(func, &allocated)
}

fn pre_allocate_parameters(
    func: &MachineFunction,
    target: &TargetDescription,
    allocated: &mut HashMap<u32, u32>,
    live_ranges: &mut HashMap<u32, LiveRange>,
) -> Result<(), CodegenError> {
    let arg_regs = &target.abi.argument_registers;

    for (index, (id, ty)) in func.parameters.iter().enumerate() {
        let arg_reg = arg_regs.get(index).ok_or_else(|| {
            CodegenError::unsupported(
                PASS,
                format!("`{}` takes more parameters than there are argument registers", func.name),
            )
        })?;

        // parameters stay live for the whole function
        live_ranges.insert(*id, (0, u32::MAX));

        let descriptor = target.registers.get(*arg_reg);
        let assigned = if ty.bits <= 32 {
            descriptor.subregs[0]
        } else {
            *arg_reg
        };
        allocated.insert(*id, assigned);
    }
    Ok(())
}

/// Binds the returned value to the first return register by scanning the
/// last block backwards for the return instruction.
fn pre_allocate_return_register(
    func: &MachineFunction,
    target: &TargetDescription,
    allocated: &mut HashMap<u32, u32>,
) {
    let Some(last_block) = func.blocks.last() else {
        return;
    };
    let ret_reg = target.abi.return_registers[0];
    let descriptor = target.registers.get(ret_reg);

    for instruction in last_block.instructions.iter().rev() {
        let Opcode::Target(opcode) = instruction.opcode else {
            continue;
        };
        if !aarch64::instr_def(opcode).is_return() {
            continue;
        }
        // a bare `ret` means the function is void
        let Some(operand) = instruction.operands.first() else {
            continue;
        };
        let Some(vreg) = operand.reg_id() else {
            continue; // constant returns went through LOAD_IMM already
        };
        if !operand.is_register_like() || allocated.contains_key(&vreg) {
            continue;
        }

        let assigned = if operand.ty.bits == descriptor.bits {
            ret_reg
        } else {
            descriptor.subregs[0]
        };
        allocated.insert(vreg, assigned);
    }
}

/// Pulls a register of the requested width out of the pool, falling back to
/// promoting a callee-saved register when the pool is empty.
fn take_register(
    bits: u8,
    pool: &mut Vec<u32>,
    backup_pool: &mut Vec<u32>,
    func: &mut MachineFunction,
    target: &TargetDescription,
) -> Result<u32, CodegenError> {
    if pool.is_empty() {
        if backup_pool.is_empty() {
            return Err(CodegenError::RegisterExhaustion {
                function: func.name.clone(),
            });
        }
        let promoted = backup_pool.remove(0);
        func.used_callee_saved.push(promoted);
        pool.push(promoted);
    }

    for index in 0..pool.len() {
        let candidate = pool[index];
        let descriptor = target.registers.get(candidate);

        if descriptor.bits == bits {
            pool.remove(index);
            return Ok(candidate);
        }
        for sub in &descriptor.subregs {
            if target.registers.get(*sub).bits == bits {
                pool.remove(index);
                return Ok(*sub);
            }
        }
    }

    Err(CodegenError::invalid_ir(
        PASS,
        format!("no register of width {bits} in the pool"),
    ))
}

/// Flips every virtual-register, parameter and memory-base operand over to
/// its assigned physical register.
fn rewrite_operands(
    func: &mut MachineFunction,
    allocated: &HashMap<u32, u32>,
) -> Result<(), CodegenError> {
    for block in &mut func.blocks {
        for instruction in &mut block.instructions {
            for operand in &mut instruction.operands {
                match operand.kind {
                    OperandKind::VirtualRegister(id) | OperandKind::Parameter(id) => {
                        let phys = *allocated.get(&id).ok_or_else(|| {
                            CodegenError::invalid_ir(
                                PASS,
                                format!("virtual register {id} was never allocated"),
                            )
                        })?;
                        operand.kind = OperandKind::Register(phys);
                    }
                    OperandKind::Memory {
                        base,
                        offset,
                        is_virtual: true,
                    } => {
                        let phys = *allocated.get(&base).ok_or_else(|| {
                            CodegenError::invalid_ir(
                                PASS,
                                format!("memory base register {base} was never allocated"),
                            )
                        })?;
                        operand.kind = OperandKind::Memory {
                            base: phys,
                            offset,
                            is_virtual: false,
                        };
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::llir::{
        GenericOpcode, LowLevelType, MachineBasicBlock, MachineInstruction, Operand,
    };
    use crate::backend::target::aarch64::{TargetOpcode, w, x};

    fn selected(mut mi: MachineInstruction, opcode: TargetOpcode) -> MachineInstruction {
        mi.set_opcode(opcode);
        mi
    }

    /// add(a, b) { return a + b; } after selection: parameters in w0/w1,
    /// the sum bound to w0 by the return pre-allocation.
    #[test]
    fn parameters_and_return_share_w0() {
        let target = aarch64::target();
        let mut func = MachineFunction::new("add", 10);
        func.parameters.push((0, LowLevelType::int(32)));
        func.parameters.push((1, LowLevelType::int(32)));

        let mut block = MachineBasicBlock::new("entry");
        let mut add = MachineInstruction::new(GenericOpcode::Add);
        add.push(Operand::vreg(10, LowLevelType::int(32)));
        add.push(Operand::parameter(0, LowLevelType::int(32)));
        add.push(Operand::parameter(1, LowLevelType::int(32)));
        block.push(selected(add, TargetOpcode::AddRrr));

        let mut ret = MachineInstruction::new(GenericOpcode::Ret);
        ret.push(Operand::vreg(10, LowLevelType::int(32)));
        block.push(selected(ret, TargetOpcode::Ret));
        func.blocks.push(block);

        allocate_registers(&mut func, target).unwrap();

        let add = &func.blocks[0].instructions[0];
        assert_eq!(add.operands[0].kind, OperandKind::Register(w(0)));
        assert_eq!(add.operands[1].kind, OperandKind::Register(w(0)));
        assert_eq!(add.operands[2].kind, OperandKind::Register(w(1)));
    }

    #[test]
    fn no_virtual_operands_survive() {
        let target = aarch64::target();
        let mut func = MachineFunction::new("f", 10);

        let mut block = MachineBasicBlock::new("entry");
        let mut mov = MachineInstruction::new(GenericOpcode::Mov);
        mov.push(Operand::vreg(10, LowLevelType::int(32)));
        mov.push(Operand::immediate(3, LowLevelType::int(32)));
        block.push(selected(mov, TargetOpcode::MovRc));

        let mut add = MachineInstruction::new(GenericOpcode::Add);
        add.push(Operand::vreg(11, LowLevelType::int(32)));
        add.push(Operand::vreg(10, LowLevelType::int(32)));
        add.push(Operand::immediate(1, LowLevelType::int(32)));
        block.push(selected(add, TargetOpcode::AddRri));
        func.blocks.push(block);

        allocate_registers(&mut func, target).unwrap();

        for instruction in &func.blocks[0].instructions {
            for operand in &instruction.operands {
                assert!(!matches!(
                    operand.kind,
                    OperandKind::VirtualRegister(_) | OperandKind::Parameter(_)
                ));
            }
        }
    }

    /// Two ranges that never overlap may share a register; overlapping ones
    /// must not share it or a sub/parent of it.
    #[test]
    fn overlapping_ranges_get_distinct_registers() {
        let target = aarch64::target();
        let mut func = MachineFunction::new("f", 10);

        let mut block = MachineBasicBlock::new("entry");
        for vreg in [10, 11] {
            let mut mov = MachineInstruction::new(GenericOpcode::Mov);
            mov.push(Operand::vreg(vreg, LowLevelType::int(32)));
            mov.push(Operand::immediate(1, LowLevelType::int(32)));
            block.push(selected(mov, TargetOpcode::MovRc));
        }
        // both live here
        let mut add = MachineInstruction::new(GenericOpcode::Add);
        add.push(Operand::vreg(12, LowLevelType::int(32)));
        add.push(Operand::vreg(10, LowLevelType::int(32)));
        add.push(Operand::vreg(11, LowLevelType::int(32)));
        block.push(selected(add, TargetOpcode::AddRrr));
        func.blocks.push(block);

        allocate_registers(&mut func, target).unwrap();

        let add = &func.blocks[0].instructions[2];
        let lhs = add.operands[1].kind.clone();
        let rhs = add.operands[2].kind.clone();
        assert_ne!(lhs, rhs);
    }

    #[test]
    fn callee_saved_promotion_is_recorded() {
        let target = aarch64::target();
        let mut func = MachineFunction::new("f", 100);

        // more simultaneously-live values than there are caller-saved regs
        let mut block = MachineBasicBlock::new("entry");
        let live = 16u32;
        for vreg in 0..live {
            let mut mov = MachineInstruction::new(GenericOpcode::Mov);
            mov.push(Operand::vreg(100 + vreg, LowLevelType::int(32)));
            mov.push(Operand::immediate(1, LowLevelType::int(32)));
            block.push(selected(mov, TargetOpcode::MovRc));
        }
        let mut add = MachineInstruction::new(GenericOpcode::Add);
        add.push(Operand::vreg(100 + live, LowLevelType::int(32)));
        add.push(Operand::vreg(100, LowLevelType::int(32)));
        add.push(Operand::vreg(100 + live - 1, LowLevelType::int(32)));
        block.push(selected(add, TargetOpcode::AddRrr));
        func.blocks.push(block);

        allocate_registers(&mut func, target).unwrap();
        assert!(!func.used_callee_saved.is_empty());
        assert!(func.used_callee_saved.iter().all(|r| *r >= x(19)));
    }
}
