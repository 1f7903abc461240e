use colored::Colorize;
use itertools::Itertools;

use crate::mir::{self, Instruction, ValueKind};

pub fn pretty_print_mir(module: &mir::Module) {
    for global in &module.globals {
        println!(
            "{} {} {} {}",
            "global".magenta(),
            global.name.blue(),
            ":".white(),
            global.ty.to_string().green(),
        );
    }

    for function in &module.functions {
        if function.is_declaration {
            println!(
                "{} {} {}",
                "declare".magenta(),
                "func".magenta(),
                function.name.blue()
            );
            continue;
        }

        print!("{} {}{}", "func".magenta(), function.name.blue(), "(");
        print!(
            "{}",
            function
                .parameters
                .iter()
                .map(|p| format!("{}: {}", p.name, p.ty.to_string().green()))
                .join(", ")
        );
        println!("{} {} {{", ")", function.return_type.to_string().green());

        for block in &function.blocks {
            println!("{}", format!("{}:", block.name).bright_red());
            for instruction in &block.instructions {
                println!("    {}", render_instruction(instruction));
            }
        }

        println!("}}");
    }
}

fn render_instruction(instruction: &Instruction) -> String {
    match instruction {
        Instruction::Binary { op, dest, lhs, rhs } => {
            format!("{} = {} {}, {}", value(dest), op.to_string().cyan(), value(lhs), value(rhs))
        }
        Instruction::Unary { op, dest, operand } => {
            format!(
                "{} = {} {} to {}",
                value(dest),
                op.to_string().cyan(),
                value(operand),
                dest.ty.to_string().green()
            )
        }
        Instruction::Compare { relation, dest, lhs, rhs } => {
            format!(
                "{} = {} {} {}, {}",
                value(dest),
                "cmp".cyan(),
                relation,
                value(lhs),
                value(rhs)
            )
        }
        Instruction::Load { dest, source } => {
            format!("{} = {} {}", value(dest), "load".cyan(), value(source))
        }
        Instruction::Store { destination, source } => {
            format!("{} {}, {}", "store".cyan(), value(source), value(destination))
        }
        Instruction::Gep { dest, base, index } => {
            format!("{} = {} {}, {}", value(dest), "gep".cyan(), value(base), value(index))
        }
        Instruction::Jump { target } => format!("{} {}", "jmp".cyan(), target.blue()),
        Instruction::Branch {
            condition,
            true_target,
            false_target,
        } => match false_target {
            Some(f) => format!(
                "{} {}, {}, {}",
                "br".cyan(),
                value(condition),
                true_target.blue(),
                f.blue()
            ),
            None => format!("{} {}, {}", "br".cyan(), value(condition), true_target.blue()),
        },
        Instruction::Call { dest, callee, args } => {
            let args = args.iter().map(value).join(", ");
            match dest {
                Some(dest) => format!("{} = {} @{}({})", value(dest), "call".cyan(), callee.blue(), args),
                None => format!("{} @{}({})", "call".cyan(), callee.blue(), args),
            }
        }
        Instruction::Return { value: Some(v) } => format!("{} {}", "ret".cyan(), value(v)),
        Instruction::Return { value: None } => format!("{}", "ret".cyan()),
        Instruction::MemCopy {
            destination,
            source,
            bytes,
        } => format!(
            "{} {}, {}, {}",
            "memcopy".cyan(),
            value(destination),
            value(source),
            bytes
        ),
        Instruction::StackAlloc { dest, ty } => {
            format!("{} = {} {}", value(dest), "stackalloc".cyan(), ty.to_string().green())
        }
    }
}

fn value(value: &mir::Value) -> String {
    match &value.kind {
        ValueKind::Register(id) => format!("%{}", id.0).yellow().to_string(),
        ValueKind::Parameter(id) => format!("%{}", id.0).yellow().to_string(),
        ValueKind::Constant(c) => c.to_string().purple().to_string(),
        ValueKind::Global(name) => format!("@{name}").blue().to_string(),
    }
}
