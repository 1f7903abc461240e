//! Assembly emission. Each selected instruction is rendered through its
//! definition's template (`$1`, `$2`, ... substituted with operands); the
//! prolog and epilog wrap every function body, and global data turns into
//! `.data` directives.

use core::fmt::Write;

use crate::{
    backend::{
        llir::{self, MachineFunction, MachineInstruction, Opcode, OperandKind},
        target::{OperandClass, TargetDescription, aarch64},
    },
    error::{self, CodegenError},
};

const PASS: &str = "emit";

pub fn emit_assembly(
    module: &llir::Module,
    target: &TargetDescription,
) -> Result<String, CodegenError> {
    let mut output = String::new();

    macro_rules! emit {
        ($($arg:tt)*) => {
            writeln!(&mut output, $($arg)*).unwrap();
        };
    }

    emit!("\t.text");
    for function in &module.functions {
        emit!("");
        emit_function(&mut output, function, target)?;
    }

    if !module.globals.is_empty() {
        emit!("");
        emit!("\t.data");
        for global in &module.globals {
            emit!("");
            emit_global(&mut output, global)?;
        }
    }

    Ok(output)
}

/// The frame layout below the entry stack pointer: the frame objects first,
/// then the saved link register, then any callee-saved registers, the whole
/// thing rounded up to the stack alignment.
struct FrameLayout {
    total: u32,
    link_offset: u32,
}

impl FrameLayout {
    fn of(function: &MachineFunction, target: &TargetDescription) -> Self {
        let link_offset = function.frame.objects_size().next_multiple_of(8);
        let save_area =
            u32::from(function.has_call) * 8 + 8 * function.used_callee_saved.len() as u32;
        let total = (link_offset + save_area).next_multiple_of(target.abi.stack_alignment);

        // leaf functions with no locals get no frame at all
        let total = if function.frame.objects_size() == 0 && save_area == 0 {
            0
        } else {
            total
        };

        Self { total, link_offset }
    }

    fn saved_register_offset(&self, function: &MachineFunction, index: usize) -> u32 {
        self.link_offset + u32::from(function.has_call) * 8 + 8 * index as u32
    }
}

fn emit_function(
    output: &mut String,
    function: &MachineFunction,
    target: &TargetDescription,
) -> Result<(), CodegenError> {
    macro_rules! emit {
        ($($arg:tt)*) => {
            writeln!(output, $($arg)*).unwrap()
        };
    }

    let layout = FrameLayout::of(function, target);
    let sp = &target.registers.get(target.registers.stack_register()).name;
    let lr = &target.registers.get(aarch64::LR).name;

    emit!("\t.global {}", function.name);
    emit!("{}:", function.name);

    /* Prolog */

    if layout.total > 0 {
        emit!("\tsub\t{sp}, {sp}, #{}", layout.total);
    }
    if function.has_call {
        emit!("\tstr\t{lr}, [{sp}, #{}]", layout.link_offset);
    }
    for (index, reg) in function.used_callee_saved.iter().enumerate() {
        emit!(
            "\tstr\t{}, [{sp}, #{}]",
            target.registers.get(*reg).name,
            layout.saved_register_offset(function, index)
        );
    }

    /* Body */

    for block in &function.blocks {
        emit!(".L{}_{}:", function.name, block.name);
        for instruction in &block.instructions {
            if is_return(instruction) {
                emit_epilog(output, function, target, &layout);
            }
            emit!("\t{}", render_instruction(instruction, target, &function.name)?);
        }
    }

    Ok(())
}

fn is_return(instruction: &MachineInstruction) -> bool {
    match instruction.opcode {
        Opcode::Target(opcode) => aarch64::instr_def(opcode).is_return(),
        Opcode::Generic(_) => false,
    }
}

fn emit_epilog(
    output: &mut String,
    function: &MachineFunction,
    target: &TargetDescription,
    layout: &FrameLayout,
) {
    macro_rules! emit {
        ($($arg:tt)*) => {
            writeln!(output, $($arg)*).unwrap()
        };
    }

    let sp = &target.registers.get(target.registers.stack_register()).name;
    let lr = &target.registers.get(aarch64::LR).name;

    for (index, reg) in function.used_callee_saved.iter().enumerate().rev() {
        emit!(
            "\tldr\t{}, [{sp}, #{}]",
            target.registers.get(*reg).name,
            layout.saved_register_offset(function, index)
        );
    }
    if function.has_call {
        emit!("\tldr\t{lr}, [{sp}, #{}]", layout.link_offset);
    }
    if layout.total > 0 {
        emit!("\tadd\t{sp}, {sp}, #{}", layout.total);
    }
}

fn render_instruction(
    instruction: &MachineInstruction,
    target: &TargetDescription,
    function: &str,
) -> Result<String, CodegenError> {
    let Opcode::Target(opcode) = instruction.opcode else {
        return Err(CodegenError::invalid_ir(
            PASS,
            format!("unselected instruction {:?} reached emission", instruction.opcode),
        ));
    };

    let def = aarch64::instr_def(opcode);
    if instruction.operands.len() < def.operands.len() {
        return Err(CodegenError::invalid_ir(
            PASS,
            format!(
                "{opcode:?} renders {} operands, instruction has {}",
                def.operands.len(),
                instruction.operands.len()
            ),
        ));
    }

    let mut text = def.template.to_owned();
    for (index, class) in def.operands.iter().enumerate() {
        let rendered = render_operand(&instruction.operands[index], *class, target, function)?;
        text = text.replace(&format!("${}", index + 1), &rendered);
    }
    Ok(text)
}

fn render_operand(
    operand: &llir::Operand,
    class: OperandClass,
    target: &TargetDescription,
    function: &str,
) -> Result<String, CodegenError> {
    match class {
        OperandClass::Gpr => match operand.kind {
            OperandKind::Register(id) => Ok(target.registers.get(id).name.clone()),
            _ => Err(mismatch("register", operand)),
        },
        OperandClass::UImm12 => {
            let value = immediate(operand)?;
            error::check_uint(PASS, value, 12, "rendered immediate")?;
            Ok(value.to_string())
        }
        OperandClass::SImm12 => {
            let value = immediate(operand)?;
            error::check_int(PASS, value, 12, "rendered offset")?;
            Ok(value.to_string())
        }
        OperandClass::SImm16 => {
            let value = immediate(operand)?;
            error::check_int(PASS, value, 16, "rendered immediate")?;
            Ok(value.to_string())
        }
        OperandClass::SImm21Lsb0 => match &operand.kind {
            OperandKind::Label(label) => Ok(format!(".L{function}_{label}")),
            OperandKind::FunctionName(name) => Ok(name.clone()),
            _ => Err(mismatch("branch target", operand)),
        },
        OperandClass::Symbol => match &operand.kind {
            OperandKind::GlobalSymbol(name) => Ok(name.clone()),
            _ => Err(mismatch("global symbol", operand)),
        },
    }
}

fn immediate(operand: &llir::Operand) -> Result<i64, CodegenError> {
    operand
        .immediate_value()
        .ok_or_else(|| mismatch("immediate", operand))
}

fn mismatch(expected: &str, operand: &llir::Operand) -> CodegenError {
    CodegenError::invalid_ir(
        PASS,
        format!("operand {operand:?} where the template expects a {expected}"),
    )
}

fn emit_global(output: &mut String, global: &llir::GlobalData) -> Result<(), CodegenError> {
    macro_rules! emit {
        ($($arg:tt)*) => {
            writeln!(output, $($arg)*).unwrap()
        };
    }

    emit!("\t.global {}", global.name);
    emit!("{}:", global.name);

    for (size, value) in &global.allocations {
        match size {
            1 => emit!("\t.byte\t{value}"),
            2 => emit!("\t.hword\t{value}"),
            4 => emit!("\t.word\t{value}"),
            8 => emit!("\t.xword\t{value}"),
            _ if *value == 0 => emit!("\t.zero\t{size}"),
            _ => {
                return Err(CodegenError::unsupported(
                    PASS,
                    format!(
                        "initialized allocation of {size} bytes in global `{}`",
                        global.name
                    ),
                ));
            }
        }
    }
    Ok(())
}
