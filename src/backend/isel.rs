//! Instruction selection: one walk over every machine instruction,
//! dispatching each generic opcode to the target's rewrite rule. Rules
//! mutate the instruction in place; a two-label branch may expand into two
//! instructions.

use tracing::debug;

use crate::{
    backend::{llir::MachineFunction, target::aarch64},
    error::CodegenError,
};

pub fn select_instructions(func: &mut MachineFunction) -> Result<(), CodegenError> {
    debug!(function = %func.name, "selecting instructions");

    let frame = &func.frame;
    for block in &mut func.blocks {
        let instructions = std::mem::take(&mut block.instructions);
        let mut selected = Vec::with_capacity(instructions.len());

        // the branch rule reads the relation of the instruction right
        // before it (the compare that set the flags)
        let mut preceding_relation = None;

        for mut instruction in instructions {
            let relation = instruction.relation;
            let expansion = aarch64::select(&mut instruction, frame, preceding_relation)?;
            preceding_relation = relation;

            selected.push(instruction);
            if let Some(expansion) = expansion {
                selected.push(expansion);
            }
        }

        block.instructions = selected;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::llir::{
        GenericOpcode, LowLevelType, MachineBasicBlock, MachineInstruction, Opcode, Operand,
    };
    use crate::backend::target::aarch64::TargetOpcode;
    use crate::mir::Relation;

    #[test]
    fn branch_uses_preceding_compare_relation() {
        let mut func = MachineFunction::new("f", 0);
        let mut block = MachineBasicBlock::new("entry");

        let mut cmp = MachineInstruction::new(GenericOpcode::Cmp);
        cmp.push(Operand::vreg(0, LowLevelType::int(1)));
        cmp.push(Operand::vreg(1, LowLevelType::int(32)));
        cmp.push(Operand::vreg(2, LowLevelType::int(32)));
        cmp.relation = Some(Relation::Le);
        block.push(cmp);

        let mut branch = MachineInstruction::new(GenericOpcode::Branch);
        branch.push(Operand::vreg(0, LowLevelType::int(1)));
        branch.push(Operand::label("body"));
        block.push(branch);

        func.blocks.push(block);
        select_instructions(&mut func).unwrap();

        let instructions = &func.blocks[0].instructions;
        assert_eq!(instructions[0].opcode, Opcode::Target(TargetOpcode::CmpRr));
        assert_eq!(instructions[1].opcode, Opcode::Target(TargetOpcode::BLe));
        // the condition operand is gone, the flags carry it
        assert_eq!(instructions[1].operands.len(), 1);
    }

    #[test]
    fn no_generic_opcode_survives_selection() {
        let mut func = MachineFunction::new("f", 10);
        let mut block = MachineBasicBlock::new("entry");

        let mut add = MachineInstruction::new(GenericOpcode::Add);
        add.push(Operand::vreg(0, LowLevelType::int(32)));
        add.push(Operand::vreg(1, LowLevelType::int(32)));
        add.push(Operand::immediate(1, LowLevelType::int(32)));
        block.push(add);
        block.push(MachineInstruction::new(GenericOpcode::Ret));

        func.blocks.push(block);
        select_instructions(&mut func).unwrap();

        for instruction in &func.blocks[0].instructions {
            assert!(matches!(instruction.opcode, Opcode::Target(_)));
        }
    }
}
