//! A small line-oriented reader for textual MIR, so the driver has a real
//! input format. One item per `type`/`global`/`func` declaration; inside a
//! function body every line is either a `label:` or a single instruction.
//!
//! ```text
//! type Point = { i32, i32 }
//! global a : [4 x i32]
//! declare func @c() -> i64
//!
//! func @add(a: i32, b: i32) -> i32 {
//! entry:
//!   %0 = add i32 %a, %b
//!   ret %0
//! }
//! ```
//!
//! This is driver tooling for feeding the backend, not a source language:
//! the front-end proper hands over modules through [`crate::mir::builder`].

use std::rc::Rc;

use hashbrown::HashMap;

use crate::{
    error::CodegenError,
    mir::{
        BinaryOp, Function, Module, Relation, UnaryOp, Value, ValueKind,
        builder::{FunctionBuilder, ModuleBuilder},
        ty::Type,
    },
};

pub fn parse_module(path: &str, source: &str) -> Result<Module, CodegenError> {
    let mut parser = Parser {
        path,
        builder: ModuleBuilder::new(),
        structs: HashMap::new(),
        globals: HashMap::new(),
        declared: Vec::new(),
    };

    let mut lines = source
        .lines()
        .enumerate()
        .map(|(number, line)| (number + 1, strip_comment(line).trim()))
        .filter(|(_, line)| !line.is_empty());

    while let Some((number, line)) = lines.next() {
        let mut cursor = Cursor::new(path, number, line);

        match cursor.peek_word() {
            Some("type") => parser.parse_type_decl(&mut cursor)?,
            Some("global") => parser.parse_global(&mut cursor)?,
            Some("declare") => parser.parse_declaration(&mut cursor)?,
            Some("func") => {
                let mut body = Vec::new();
                for (number, line) in lines.by_ref() {
                    if line == "}" {
                        break;
                    }
                    body.push((number, line));
                }
                parser.parse_function(&mut cursor, &body)?;
            }
            _ => return Err(cursor.error("expected `type`, `global`, `declare` or `func`")),
        }
    }

    let mut module = parser.builder.build();
    for function in parser.declared {
        module.functions.push(function);
    }
    Ok(module)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(at) => &line[..at],
        None => line,
    }
}

struct Parser<'src> {
    path: &'src str,
    builder: ModuleBuilder,
    structs: HashMap<String, Type>,
    globals: HashMap<String, Type>,
    declared: Vec<Function>,
}

impl<'src> Parser<'src> {
    /// `type Point = { i32, i32 }`
    fn parse_type_decl(&mut self, cursor: &mut Cursor) -> Result<(), CodegenError> {
        cursor.expect_word("type")?;
        let name = cursor.word()?.to_owned();
        cursor.expect_punct('=')?;
        cursor.expect_punct('{')?;

        let mut members = Vec::new();
        loop {
            members.push(self.parse_type(cursor)?);
            if !cursor.eat_punct(',') {
                break;
            }
        }
        cursor.expect_punct('}')?;

        let ty = Type::Struct {
            name: name.as_str().into(),
            members: members.into(),
        };
        self.structs.insert(name, ty);
        Ok(())
    }

    /// `global a : [4 x i32]` optionally followed by `= 7` or `= { 1, 2 }`
    fn parse_global(&mut self, cursor: &mut Cursor) -> Result<(), CodegenError> {
        cursor.expect_word("global")?;
        let name = cursor.word()?.to_owned();
        cursor.expect_punct(':')?;
        let ty = self.parse_type(cursor)?;

        let mut initializer = Vec::new();
        if cursor.eat_punct('=') {
            if cursor.eat_punct('{') {
                loop {
                    initializer.push(cursor.integer()?);
                    if !cursor.eat_punct(',') {
                        break;
                    }
                }
                cursor.expect_punct('}')?;
            } else {
                initializer.push(cursor.integer()?);
            }
        }

        self.globals.insert(name.clone(), ty.clone());
        self.builder.add_global(name, ty, initializer);
        Ok(())
    }

    /// `declare func @c() -> i64`
    fn parse_declaration(&mut self, cursor: &mut Cursor) -> Result<(), CodegenError> {
        cursor.expect_word("declare")?;
        let (builder, _) = self.parse_signature(cursor)?;
        let mut function = builder.build();
        function.is_declaration = true;
        self.declared.push(function);
        Ok(())
    }

    fn parse_signature(
        &mut self,
        cursor: &mut Cursor,
    ) -> Result<(FunctionBuilder, HashMap<String, Value>), CodegenError> {
        cursor.expect_word("func")?;
        cursor.expect_punct('@')?;
        let name = cursor.word()?.to_owned();

        // the return type comes after the parameter list, so collect first
        cursor.expect_punct('(')?;
        let mut params = Vec::new();
        if !cursor.eat_punct(')') {
            loop {
                let param = cursor.word()?.to_owned();
                cursor.expect_punct(':')?;
                let ty = self.parse_type(cursor)?;
                params.push((param, ty));
                if !cursor.eat_punct(',') {
                    break;
                }
            }
            cursor.expect_punct(')')?;
        }
        cursor.expect_arrow()?;
        let return_type = self.parse_type(cursor)?;

        let mut builder = FunctionBuilder::new(name, return_type);
        let mut values = HashMap::new();
        for (param, ty) in params {
            let value = builder.add_parameter(param.clone(), ty);
            values.insert(param, value);
        }
        Ok((builder, values))
    }

    fn parse_function(
        &mut self,
        header: &mut Cursor,
        body: &[(usize, &str)],
    ) -> Result<(), CodegenError> {
        let (mut builder, mut values) = self.parse_signature(header)?;
        header.expect_punct('{')?;

        for &(number, line) in body {
            let mut cursor = Cursor::new(self.path, number, line);

            if let Some(label) = line.strip_suffix(':') {
                if label.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                    builder.create_block(label);
                    continue;
                }
            }

            self.parse_instruction(&mut cursor, &mut builder, &mut values)?;
        }

        self.builder.add_function(builder.build());
        Ok(())
    }

    fn parse_instruction(
        &mut self,
        cursor: &mut Cursor,
        builder: &mut FunctionBuilder,
        values: &mut HashMap<String, Value>,
    ) -> Result<(), CodegenError> {
        // `%d = ...` destination prefix
        let dest = if cursor.eat_punct('%') {
            let name = cursor.word()?.to_owned();
            cursor.expect_punct('=')?;
            Some(name)
        } else {
            None
        };

        let mnemonic = cursor.word()?.to_owned();

        let binary = |word: &str| -> Option<BinaryOp> {
            Some(match word {
                "add" => BinaryOp::Add,
                "sub" => BinaryOp::Sub,
                "mul" => BinaryOp::Mul,
                "div" => BinaryOp::Div,
                "divu" => BinaryOp::DivU,
                "mod" => BinaryOp::Mod,
                "and" => BinaryOp::And,
                "or" => BinaryOp::Or,
                "xor" => BinaryOp::Xor,
                "shl" => BinaryOp::Shl,
                "shr" => BinaryOp::Shr,
                _ => return None,
            })
        };

        let result = match mnemonic.as_str() {
            op if binary(op).is_some() => {
                let ty = self.parse_type(cursor)?;
                let lhs = self.operand(cursor, values, &ty)?;
                cursor.expect_punct(',')?;
                let rhs = self.operand(cursor, values, &ty)?;
                Some(builder.binary(binary(op).unwrap(), lhs, rhs))
            }
            "cmp" => {
                let relation = match cursor.word()? {
                    "eq" => Relation::Eq,
                    "ne" => Relation::Ne,
                    "lt" => Relation::Lt,
                    "gt" => Relation::Gt,
                    "le" => Relation::Le,
                    "ge" => Relation::Ge,
                    other => return Err(cursor.error(format!("unknown relation `{other}`"))),
                };
                let ty = self.parse_type(cursor)?;
                let lhs = self.operand(cursor, values, &ty)?;
                cursor.expect_punct(',')?;
                let rhs = self.operand(cursor, values, &ty)?;
                Some(builder.compare(relation, lhs, rhs))
            }
            "sext" | "zext" | "trunc" => {
                let op = match mnemonic.as_str() {
                    "sext" => UnaryOp::SExt,
                    "zext" => UnaryOp::ZExt,
                    _ => UnaryOp::Trunc,
                };
                let operand = self.operand(cursor, values, &Type::Int(32))?;
                cursor.expect_word("to")?;
                let result = self.parse_type(cursor)?;
                Some(builder.unary(op, operand, result))
            }
            "load" => {
                let ty = self.parse_type(cursor)?;
                cursor.expect_punct(',')?;
                let source = self.operand(cursor, values, &ty)?;
                Some(builder.load(ty, source))
            }
            "store" => {
                let ty = self.parse_type(cursor)?;
                let source = self.operand(cursor, values, &ty)?;
                cursor.expect_punct(',')?;
                let destination = self.operand(cursor, values, &ty)?;
                builder.store(source, destination);
                None
            }
            "gep" => {
                let base = self.operand(cursor, values, &Type::Int(32))?;
                cursor.expect_punct(',')?;
                let index = self.operand(cursor, values, &Type::Int(32))?;
                Some(builder.gep(base, index))
            }
            "stackalloc" => {
                let ty = self.parse_type(cursor)?;
                Some(builder.stack_alloc(ty))
            }
            "call" => {
                let result = self.parse_type(cursor)?;
                cursor.expect_punct('@')?;
                let callee = cursor.word()?.to_owned();
                cursor.expect_punct('(')?;
                let mut args = Vec::new();
                if !cursor.eat_punct(')') {
                    loop {
                        let ty = self.parse_type(cursor)?;
                        args.push(self.operand(cursor, values, &ty)?);
                        if !cursor.eat_punct(',') {
                            break;
                        }
                    }
                    cursor.expect_punct(')')?;
                }
                builder.call(callee, args, result)
            }
            "jmp" => {
                let target = cursor.word()?.to_owned();
                builder.jump(target);
                None
            }
            "br" => {
                let condition = self.operand(cursor, values, &Type::Int(1))?;
                cursor.expect_punct(',')?;
                let true_target = cursor.word()?.to_owned();
                let false_target = cursor
                    .eat_punct(',')
                    .then(|| cursor.word().map(str::to_owned))
                    .transpose()?;
                builder.branch(condition, true_target, false_target);
                None
            }
            "ret" => {
                if cursor.at_end() {
                    builder.ret(None);
                } else {
                    let ty = builder.return_type().clone();
                    let value = self.operand(cursor, values, &ty)?;
                    builder.ret(Some(value));
                }
                None
            }
            "memcopy" => {
                let destination = self.operand(cursor, values, &Type::Int(32))?;
                cursor.expect_punct(',')?;
                let source = self.operand(cursor, values, &Type::Int(32))?;
                cursor.expect_punct(',')?;
                let bytes = cursor.integer()? as u32;
                builder.memcopy(destination, source, bytes);
                None
            }
            other => return Err(cursor.error(format!("unknown instruction `{other}`"))),
        };

        match (dest, result) {
            (Some(name), Some(value)) => {
                values.insert(name, value);
                Ok(())
            }
            (None, _) => Ok(()),
            (Some(_), None) => Err(cursor.error("instruction does not produce a value")),
        }
    }

    /// `%name`, `@global` or an integer constant typed by context.
    fn operand(
        &self,
        cursor: &mut Cursor,
        values: &HashMap<String, Value>,
        ty: &Type,
    ) -> Result<Value, CodegenError> {
        if cursor.eat_punct('%') {
            let name = cursor.word()?;
            return values
                .get(name)
                .cloned()
                .ok_or_else(|| cursor.error(format!("unknown value `%{name}`")));
        }
        if cursor.eat_punct('@') {
            let name = cursor.word()?;
            let ty = self
                .globals
                .get(name)
                .ok_or_else(|| cursor.error(format!("unknown global `@{name}`")))?;
            return Ok(Value {
                kind: ValueKind::Global(name.to_owned()),
                ty: ty.clone(),
            });
        }
        Ok(Value::constant(cursor.integer()?, ty.clone()))
    }

    fn parse_type(&self, cursor: &mut Cursor) -> Result<Type, CodegenError> {
        let mut ty = if cursor.eat_punct('[') {
            let length = cursor.integer()? as u32;
            cursor.expect_word("x")?;
            let elem = self.parse_type(cursor)?;
            cursor.expect_punct(']')?;
            Type::Array {
                elem: Rc::new(elem),
                length,
            }
        } else {
            match cursor.word()? {
                "void" => Type::Void,
                "i1" => Type::Int(1),
                "i8" => Type::Int(8),
                "i16" => Type::Int(16),
                "i32" => Type::Int(32),
                "i64" => Type::Int(64),
                name => self
                    .structs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| cursor.error(format!("unknown type `{name}`")))?,
            }
        };

        while cursor.eat_punct('*') {
            ty = ty.ptr_to();
        }
        Ok(ty)
    }
}

/// A cursor over one line of input.
struct Cursor<'a> {
    path: &'a str,
    number: usize,
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(path: &'a str, number: usize, line: &'a str) -> Self {
        Self {
            path,
            number,
            rest: line.trim_start(),
        }
    }

    fn error(&self, message: impl Into<String>) -> CodegenError {
        CodegenError::MirParse {
            path: self.path.to_owned(),
            line: self.number,
            message: message.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.rest.is_empty()
    }

    fn peek_word(&self) -> Option<&'a str> {
        let end = self
            .rest
            .find(|c: char| !c.is_alphanumeric() && c != '_' && c != '.')
            .unwrap_or(self.rest.len());
        (end > 0).then(|| &self.rest[..end])
    }

    fn word(&mut self) -> Result<&'a str, CodegenError> {
        let word = self
            .peek_word()
            .ok_or_else(|| self.error("expected identifier"))?;
        self.rest = self.rest[word.len()..].trim_start();
        Ok(word)
    }

    fn expect_word(&mut self, expected: &str) -> Result<(), CodegenError> {
        let word = self.word()?;
        if word != expected {
            return Err(self.error(format!("expected `{expected}`, found `{word}`")));
        }
        Ok(())
    }

    fn eat_punct(&mut self, punct: char) -> bool {
        if self.rest.starts_with(punct) {
            self.rest = self.rest[punct.len_utf8()..].trim_start();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: char) -> Result<(), CodegenError> {
        if !self.eat_punct(punct) {
            return Err(self.error(format!("expected `{punct}`")));
        }
        Ok(())
    }

    fn expect_arrow(&mut self) -> Result<(), CodegenError> {
        if let Some(rest) = self.rest.strip_prefix("->") {
            self.rest = rest.trim_start();
            Ok(())
        } else {
            Err(self.error("expected `->`"))
        }
    }

    fn integer(&mut self) -> Result<i64, CodegenError> {
        let negative = self.rest.starts_with('-');
        let digits = if negative { &self.rest[1..] } else { self.rest };
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        if end == 0 {
            return Err(self.error("expected integer"));
        }
        let value: i64 = digits[..end]
            .parse()
            .map_err(|_| self.error("integer out of range"))?;
        self.rest = digits[end..].trim_start();
        Ok(if negative { -value } else { value })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::mir::Instruction;

    #[test]
    fn parses_simple_function() {
        let module = parse_module(
            "t.mir",
            indoc! {"
                func @add(a: i32, b: i32) -> i32 {
                entry:
                  %0 = add i32 %a, %b
                  ret %0
                }
            "},
        )
        .unwrap();

        assert_eq!(module.functions.len(), 1);
        let f = &module.functions[0];
        assert_eq!(f.name, "add");
        assert_eq!(f.parameters.len(), 2);
        assert_eq!(f.blocks.len(), 1);
        assert!(matches!(
            f.blocks[0].instructions[0],
            Instruction::Binary { op: BinaryOp::Add, .. }
        ));
    }

    #[test]
    fn parses_globals_and_types() {
        let module = parse_module(
            "t.mir",
            indoc! {"
                type Point = { i32, i32 }
                global a : [4 x i32]
                global origin : Point = { 1, 2 }
                global answer : i32 = 42
            "},
        )
        .unwrap();

        assert_eq!(module.globals.len(), 3);
        assert_eq!(module.globals[0].ty.byte_size(), 16);
        assert!(module.globals[0].initializer.is_empty());
        assert_eq!(module.globals[1].initializer, vec![1, 2]);
        assert_eq!(module.globals[2].initializer, vec![42]);
    }

    #[test]
    fn parses_control_flow() {
        let module = parse_module(
            "t.mir",
            indoc! {"
                func @max(a: i32, b: i32) -> i32 {
                entry:
                  %c = cmp gt i32 %a, %b
                  br %c, take_a, take_b
                take_a:
                  ret %a
                take_b:
                  ret %b
                }
            "},
        )
        .unwrap();

        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 3);
        assert!(matches!(
            &f.blocks[0].instructions[1],
            Instruction::Branch { false_target: Some(t), .. } if t == "take_b"
        ));
    }

    #[test]
    fn reports_unknown_value_with_line() {
        let err = parse_module(
            "t.mir",
            indoc! {"
                func @f() -> i32 {
                entry:
                  ret %nope
                }
            "},
        )
        .unwrap_err();

        let rendered = err.to_string();
        assert!(rendered.contains("t.mir:3"), "got: {rendered}");
        assert!(rendered.contains("%nope"));
    }

    #[test]
    fn declarations_have_no_body() {
        let module = parse_module("t.mir", "declare func @c() -> i64\n").unwrap();
        assert!(module.functions[0].is_declaration);
        assert!(module.functions[0].blocks.is_empty());
    }
}
