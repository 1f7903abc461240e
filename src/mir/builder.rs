//! Programmatic MIR construction. This is the interface a front-end (or a
//! test) uses to hand the backend a module without going through the textual
//! form.

use crate::{
    index::Index,
    mir::{
        BasicBlock, BinaryOp, Function, GlobalVariable, Instruction, Module, Parameter, Relation,
        UnaryOp, Value, ValueId, ValueKind,
        ty::Type,
    },
};

#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: Type, initializer: Vec<i64>) {
        self.module.globals.push(GlobalVariable {
            name: name.into(),
            ty,
            initializer,
        });
    }

    pub fn add_function(&mut self, function: Function) {
        self.module.functions.push(function);
    }

    pub fn build(self) -> Module {
        self.module
    }
}

/// Builds one function, block by block. Instructions are appended to the
/// currently selected block; value ids are handed out monotonically.
pub struct FunctionBuilder {
    function: Function,
    next_id: ValueId,
    current: usize,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, return_type: Type) -> Self {
        Self {
            function: Function {
                name: name.into(),
                parameters: Vec::new(),
                return_type,
                blocks: Vec::new(),
                is_declaration: false,
            },
            next_id: ValueId(0),
            current: 0,
        }
    }

    pub fn return_type(&self) -> &Type {
        &self.function.return_type
    }

    fn fresh_id(&mut self) -> ValueId {
        let id = self.next_id;
        self.next_id.increment_by(1);
        id
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, ty: Type) -> Value {
        let id = self.fresh_id();
        self.function.parameters.push(Parameter {
            id,
            name: name.into(),
            ty: ty.clone(),
        });
        Value {
            kind: ValueKind::Parameter(id),
            ty,
        }
    }

    /// Creates a block and selects it as the insertion point.
    pub fn create_block(&mut self, name: impl Into<String>) {
        self.function.blocks.push(BasicBlock {
            name: name.into(),
            instructions: Vec::new(),
        });
        self.current = self.function.blocks.len() - 1;
    }

    pub fn select_block(&mut self, name: &str) {
        self.current = self
            .function
            .blocks
            .iter()
            .position(|block| block.name == name)
            .expect("selecting an unknown block");
    }

    fn emit(&mut self, instruction: Instruction) {
        assert!(!self.function.blocks.is_empty(), "no block selected");
        self.function.blocks[self.current]
            .instructions
            .push(instruction);
    }

    fn fresh(&mut self, ty: Type) -> Value {
        Value::register(self.fresh_id(), ty)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        let dest = self.fresh(lhs.ty.clone());
        self.emit(Instruction::Binary {
            op,
            dest: dest.clone(),
            lhs,
            rhs,
        });
        dest
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Value, result: Type) -> Value {
        let dest = self.fresh(result);
        self.emit(Instruction::Unary {
            op,
            dest: dest.clone(),
            operand,
        });
        dest
    }

    pub fn compare(&mut self, relation: Relation, lhs: Value, rhs: Value) -> Value {
        let dest = self.fresh(Type::Int(1));
        self.emit(Instruction::Compare {
            relation,
            dest: dest.clone(),
            lhs,
            rhs,
        });
        dest
    }

    pub fn load(&mut self, ty: Type, source: Value) -> Value {
        let dest = self.fresh(ty);
        self.emit(Instruction::Load {
            dest: dest.clone(),
            source,
        });
        dest
    }

    pub fn store(&mut self, source: Value, destination: Value) {
        self.emit(Instruction::Store {
            destination,
            source,
        });
    }

    pub fn gep(&mut self, base: Value, index: Value) -> Value {
        // step through at most one pointer level to find the aggregate
        let aggregate = match &base.ty {
            Type::Pointer(pointee) => (**pointee).clone(),
            other => other.clone(),
        };
        let elem = match &aggregate {
            Type::Struct { members, .. } => {
                let ValueKind::Constant(member) = index.kind else {
                    panic!("struct GEP requires a constant index");
                };
                members[member as usize].clone()
            }
            Type::Array { elem, .. } => (**elem).clone(),
            other => other.clone(),
        };
        let dest = self.fresh(elem.ptr_to());
        self.emit(Instruction::Gep {
            dest: dest.clone(),
            base,
            index,
        });
        dest
    }

    pub fn stack_alloc(&mut self, ty: Type) -> Value {
        let dest = self.fresh(ty.clone().ptr_to());
        self.emit(Instruction::StackAlloc {
            dest: dest.clone(),
            ty,
        });
        dest
    }

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<Value>, result: Type) -> Option<Value> {
        let dest = (!result.is_void()).then(|| self.fresh(result));
        self.emit(Instruction::Call {
            dest: dest.clone(),
            callee: callee.into(),
            args,
        });
        dest
    }

    pub fn jump(&mut self, target: impl Into<String>) {
        self.emit(Instruction::Jump {
            target: target.into(),
        });
    }

    pub fn branch(
        &mut self,
        condition: Value,
        true_target: impl Into<String>,
        false_target: Option<String>,
    ) {
        self.emit(Instruction::Branch {
            condition,
            true_target: true_target.into(),
            false_target,
        });
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.emit(Instruction::Return { value });
    }

    pub fn memcopy(&mut self, destination: Value, source: Value, bytes: u32) {
        self.emit(Instruction::MemCopy {
            destination,
            source,
            bytes,
        });
    }

    pub fn build(self) -> Function {
        self.function
    }
}
