use colored::Colorize;
use itertools::Itertools;

use crate::backend::{
    llir::{self, Opcode, OperandKind},
    target::TargetDescription,
};

pub fn pretty_print_llir(module: &llir::Module, target: &TargetDescription) {
    for function in &module.functions {
        print!("{} {}{}", "func".magenta(), function.name.blue(), "(");
        print!(
            "{}",
            function
                .parameters
                .iter()
                .map(|(id, ty)| format!("{}: {ty}", format!("%{id}").yellow()))
                .join(", ")
        );
        println!(") {{");

        if !function.frame.is_empty() {
            println!(
                "    {} {} bytes",
                "frame:".white(),
                function.frame.objects_size()
            );
        }

        for block in &function.blocks {
            println!("{}", format!("{}:", block.name).bright_red());
            for instruction in &block.instructions {
                let opcode = match instruction.opcode {
                    Opcode::Generic(generic) => generic.to_string(),
                    Opcode::Target(opcode) => format!("{opcode:?}"),
                };
                print!("    {}", opcode.cyan());
                if !instruction.operands.is_empty() {
                    print!(
                        "\t{}",
                        instruction
                            .operands
                            .iter()
                            .map(|operand| render_operand(operand, target))
                            .join(", ")
                    );
                }
                if let Some(relation) = instruction.relation {
                    print!(" {}{}{}", "[".white(), relation, "]".white());
                }
                println!();
            }
        }

        println!("}}");
    }

    for global in &module.globals {
        println!(
            "{} {} {} {} bytes",
            "global".magenta(),
            global.name.blue(),
            ":".white(),
            global.size
        );
    }
}

fn render_operand(operand: &llir::Operand, target: &TargetDescription) -> String {
    match &operand.kind {
        OperandKind::VirtualRegister(id) => {
            format!("{}({})", format!("%{id}").yellow(), operand.ty)
        }
        OperandKind::Register(id) => target.registers.get(*id).name.green().to_string(),
        OperandKind::Parameter(id) => format!("{}({})", format!("%{id}").yellow(), operand.ty),
        OperandKind::Immediate(value) => format!("#{value}").purple().to_string(),
        OperandKind::StackAccess { slot, offset } if *offset == 0 => format!("stack[{slot}]"),
        OperandKind::StackAccess { slot, offset } => format!("stack[{slot}]+{offset}"),
        OperandKind::Memory { base, offset, .. } => format!("[%{base}, #{offset}]"),
        OperandKind::Label(label) => label.blue().to_string(),
        OperandKind::GlobalSymbol(name) => format!("@{name}").blue().to_string(),
        OperandKind::FunctionName(name) => name.blue().to_string(),
    }
}
