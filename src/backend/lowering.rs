//! MIR -> LLIR lowering. Blocks mirror MIR blocks by name, MIR values map to
//! virtual registers, stack allocations become frame slots, and the calling
//! convention is materialized: arguments move into ABI registers, returned
//! values spill to fresh stack slots, struct-by-value traffic travels in
//! register-sized chunks.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::{
    backend::{
        llir::{
            self, GenericOpcode, LowLevelType, MachineInstruction, Operand, OperandKind,
        },
        target::TargetDescription,
    },
    error::CodegenError,
    mir::{self, Instruction, Value, ValueKind, ty::Type},
};

const PASS: &str = "lower";

/// Struct-by-value values move between registers and the stack in 32-bit
/// chunks, one `w` register per chunk.
const STRUCT_CHUNK_BITS: u32 = 32;

pub fn lower_module(
    module: &mir::Module,
    target: &TargetDescription,
) -> Result<llir::Module, CodegenError> {
    let mut lowered = llir::Module::default();

    for function in &module.functions {
        if function.is_declaration {
            continue;
        }
        debug!(function = %function.name, "lowering function");
        lowered.functions.push(lower_function(function, target)?);
    }

    for global in &module.globals {
        lowered.globals.push(lower_global(global));
    }

    Ok(lowered)
}

fn lower_global(global: &mir::GlobalVariable) -> llir::GlobalData {
    let size = global.ty.byte_size();
    let mut data = llir::GlobalData::new(global.name.clone(), size);

    if global.ty.is_struct() || global.ty.is_array() {
        if global.initializer.is_empty() {
            data.insert_allocation(size, 0);
        } else if global.ty.is_struct() {
            for (member, value) in global.ty.member_types().iter().zip(&global.initializer) {
                data.insert_allocation(member.byte_size(), *value);
            }
        } else {
            let elem = global.ty.base_type().byte_size();
            for value in &global.initializer {
                data.insert_allocation(elem, *value);
            }
        }
    } else if global.initializer.is_empty() {
        data.insert_allocation(size, 0);
    } else {
        data.insert_allocation(size, global.initializer[0]);
    }

    data
}

fn lower_function(
    function: &mir::Function,
    target: &TargetDescription,
) -> Result<llir::MachineFunction, CodegenError> {
    let mut ctx = LoweringContext::new(function, target)?;

    // create every block up front so jumps can refer to them already
    for block in &function.blocks {
        ctx.func.blocks.push(llir::MachineBasicBlock::new(block.name.clone()));
    }

    for (index, block) in function.blocks.iter().enumerate() {
        ctx.current = index;
        for instruction in &block.instructions {
            ctx.lower_instruction(instruction)?;
        }
    }

    Ok(ctx.func)
}

struct LoweringContext<'a> {
    target: &'a TargetDescription,
    mir_func: &'a mir::Function,
    func: llir::MachineFunction,
    current: usize,
    block_names: HashSet<String>,
    /// MIR value id -> LLIR vreg, or the stack slot a call result was
    /// spilled to.
    value_map: HashMap<u32, u32>,
    /// struct-by-value parameter name -> the vregs holding its chunks
    struct_param_regs: HashMap<String, Vec<u32>>,
    /// struct value id -> the vregs its chunks were loaded into
    struct_loads: HashMap<u32, Vec<u32>>,
}

impl<'a> LoweringContext<'a> {
    fn new(function: &'a mir::Function, target: &'a TargetDescription) -> Result<Self, CodegenError> {
        // virtual register ids continue after the MIR value ids so that
        // slot ids (MIR ids) and fresh vregs never collide
        let mut first_free = function.parameters.iter().map(|p| p.id.0 + 1).max().unwrap_or(0);
        for block in &function.blocks {
            for instruction in &block.instructions {
                if let Some(dest) = instruction.dest() {
                    if let Some(id) = dest.id() {
                        first_free = first_free.max(id.0 + 1);
                    }
                }
            }
        }

        let mut ctx = Self {
            target,
            mir_func: function,
            func: llir::MachineFunction::new(function.name.clone(), first_free),
            current: 0,
            block_names: function.blocks.iter().map(|b| b.name.clone()).collect(),
            value_map: HashMap::new(),
            struct_param_regs: HashMap::new(),
            struct_loads: HashMap::new(),
        };
        ctx.lower_parameters()?;
        Ok(ctx)
    }

    fn lower_parameters(&mut self) -> Result<(), CodegenError> {
        for param in &self.mir_func.parameters {
            if param.ty.is_struct() && !param.ty.is_ptr() {
                let bits = param.ty.byte_size() * 8;
                if bits > self.target.abi.max_struct_bits {
                    return Err(CodegenError::unsupported(
                        PASS,
                        format!(
                            "struct parameter `{}` exceeds {} bits",
                            param.name, self.target.abi.max_struct_bits
                        ),
                    ));
                }

                for _ in 0..bits.div_ceil(STRUCT_CHUNK_BITS) {
                    let vreg = self.func.next_vreg();
                    self.struct_param_regs
                        .entry(param.name.clone())
                        .or_default()
                        .push(vreg);
                    self.func
                        .parameters
                        .push((vreg, LowLevelType::int(STRUCT_CHUNK_BITS as u8)));
                }
                continue;
            }

            let ty = if param.ty.is_ptr() {
                LowLevelType::ptr()
            } else {
                LowLevelType::int(param.ty.bit_size())
            };
            self.func.parameters.push((param.id.0, ty));
        }
        Ok(())
    }

    fn emit(&mut self, instruction: MachineInstruction) {
        self.func.blocks[self.current].push(instruction);
    }

    fn llt_of(&self, ty: &Type) -> LowLevelType {
        if ty.is_ptr() {
            LowLevelType::ptr()
        } else {
            LowLevelType::int(ty.bit_size())
        }
    }

    /// The LLIR id a MIR value resolves to: its mapped vreg if one exists,
    /// the raw MIR id otherwise (parameters, stack slots).
    fn resolve_id(&self, value: &Value) -> Result<u32, CodegenError> {
        let id = value.id().ok_or_else(|| {
            CodegenError::invalid_ir(PASS, format!("expected a register value, found {value:?}"))
        })?;
        Ok(self.value_map.get(&id.0).copied().unwrap_or(id.0))
    }

    /// Maps a MIR value to a machine operand. Values living in a stack slot
    /// (spilled call results) are loaded into a fresh vreg first when used.
    fn operand_from_value(&mut self, value: &Value, is_def: bool) -> Result<Operand, CodegenError> {
        let ty = self.llt_of(&value.ty);

        match &value.kind {
            ValueKind::Register(id) => {
                let raw = id.0;
                let mapped = self.value_map.get(&raw).copied();

                if !is_def && mapped.is_none() && self.func.frame.is_slot(raw) {
                    let vreg = self.func.next_vreg();
                    let load = MachineInstruction::new(GenericOpcode::Load)
                        .with(Operand::vreg(vreg, ty))
                        .with(Operand::stack_access(raw, 0));
                    self.emit(load);
                    return Ok(Operand::vreg(vreg, ty));
                }

                if let Some(mapped) = mapped {
                    if !is_def && self.func.frame.is_slot(mapped) {
                        let vreg = self.func.next_vreg();
                        let load = MachineInstruction::new(GenericOpcode::Load)
                            .with(Operand::vreg(vreg, ty))
                            .with(Operand::stack_access(mapped, 0));
                        self.emit(load);
                        return Ok(Operand::vreg(vreg, ty));
                    }
                    return Ok(Operand::vreg(mapped, ty));
                }

                let vreg = self.func.next_vreg();
                self.value_map.insert(raw, vreg);
                Ok(Operand::vreg(vreg, ty))
            }
            ValueKind::Parameter(id) => Ok(Operand::parameter(id.0, ty)),
            ValueKind::Constant(value) => Ok(Operand::immediate(*value, LowLevelType::int(32))),
            ValueKind::Global(name) => Err(CodegenError::invalid_ir(
                PASS,
                format!("global `{name}` used where a register value was expected"),
            )),
        }
    }

    /// Resolves the address operand of a load/store: globals materialize
    /// into a fresh register, everything else is an id that is either a
    /// stack slot or a register holding a pointer.
    fn resolve_address(&mut self, address: &Value) -> Result<u32, CodegenError> {
        if let ValueKind::Global(name) = &address.kind {
            let vreg = self.func.next_vreg();
            let materialize = MachineInstruction::new(GenericOpcode::GlobalAddress)
                .with(Operand::vreg(vreg, LowLevelType::ptr()))
                .with(Operand::global_symbol(name.clone()));
            self.emit(materialize);
            return Ok(vreg);
        }
        self.resolve_id(address)
    }

    fn check_target(&self, label: &str) -> Result<(), CodegenError> {
        if self.block_names.contains(label) {
            return Ok(());
        }
        Err(CodegenError::invalid_ir(
            PASS,
            format!("branch to unknown block `{label}`"),
        ))
    }

    /// Stores pass register values; immediates are materialized first.
    fn materialize_if_immediate(&mut self, operand: Operand) -> Operand {
        if !operand.is_immediate() {
            return operand;
        }
        let vreg = self.func.next_vreg();
        let mov = MachineInstruction::new(GenericOpcode::Mov)
            .with(Operand::vreg(vreg, operand.ty))
            .with(operand.clone());
        self.emit(mov);
        Operand::vreg(vreg, operand.ty)
    }

    fn lower_instruction(&mut self, instruction: &Instruction) -> Result<(), CodegenError> {
        match instruction {
            Instruction::Binary { op, dest, lhs, rhs } => {
                use mir::BinaryOp::*;
                let opcode = match op {
                    Add => GenericOpcode::Add,
                    Sub => GenericOpcode::Sub,
                    Mul => GenericOpcode::Mul,
                    Div => GenericOpcode::Div,
                    DivU => GenericOpcode::DivU,
                    Mod => GenericOpcode::Mod,
                    And => GenericOpcode::And,
                    Or => GenericOpcode::Or,
                    Xor => GenericOpcode::Xor,
                    Shl => GenericOpcode::Shl,
                    Shr => GenericOpcode::Shr,
                };
                let dest = self.operand_from_value(dest, false)?;
                let lhs = self.operand_from_value(lhs, false)?;
                let rhs = self.operand_from_value(rhs, false)?;
                self.emit(
                    MachineInstruction::new(opcode)
                        .with(dest)
                        .with(lhs)
                        .with(rhs),
                );
            }
            Instruction::Unary { op, dest, operand } => {
                use mir::UnaryOp::*;
                let opcode = match op {
                    SExt => GenericOpcode::SExt,
                    ZExt => GenericOpcode::ZExt,
                    Trunc => GenericOpcode::Trunc,
                };
                let dest = self.operand_from_value(dest, false)?;
                let operand = self.operand_from_value(operand, false)?;
                self.emit(MachineInstruction::new(opcode).with(dest).with(operand));
            }
            Instruction::Compare {
                relation,
                dest,
                lhs,
                rhs,
            } => {
                let dest = self.operand_from_value(dest, false)?;
                let lhs = self.operand_from_value(lhs, false)?;
                let rhs = self.operand_from_value(rhs, false)?;
                let mut cmp = MachineInstruction::new(GenericOpcode::Cmp)
                    .with(dest)
                    .with(lhs)
                    .with(rhs);
                cmp.relation = Some(*relation);
                self.emit(cmp);
            }
            Instruction::Store {
                destination,
                source,
            } => self.lower_store(destination, source)?,
            Instruction::Load { dest, source } => self.lower_load(dest, source)?,
            Instruction::Gep { dest, base, index } => self.lower_gep(dest, base, index)?,
            Instruction::Jump { target } => {
                self.check_target(target)?;
                self.emit(MachineInstruction::new(GenericOpcode::Jump).with(Operand::label(target)));
            }
            Instruction::Branch {
                condition,
                true_target,
                false_target,
            } => {
                self.check_target(true_target)?;
                let condition = self.operand_from_value(condition, false)?;
                let mut branch = MachineInstruction::new(GenericOpcode::Branch)
                    .with(condition)
                    .with(Operand::label(true_target));
                if let Some(false_target) = false_target {
                    self.check_target(false_target)?;
                    branch.push(Operand::label(false_target));
                }
                self.emit(branch);
            }
            Instruction::Call { dest, callee, args } => self.lower_call(dest, callee, args)?,
            Instruction::Return { value } => self.lower_return(value.as_ref())?,
            Instruction::MemCopy {
                destination,
                source,
                bytes,
            } => self.lower_memcopy(destination, source, *bytes)?,
            Instruction::StackAlloc { dest, ty } => {
                let id = dest.id().expect("stack allocation destination").0;
                let size = if ty.is_ptr() {
                    self.target.pointer_bytes()
                } else {
                    ty.byte_size()
                };
                self.func.frame.insert_slot(id, size);
            }
        }
        Ok(())
    }

    fn lower_store(&mut self, destination: &Value, source: &Value) -> Result<(), CodegenError> {
        let address = self.resolve_address(destination)?;
        let address_is_slot = self.func.frame.is_slot(address);

        // struct-by-value sources arrive chunked in registers
        if source.ty.is_struct() && !source.ty.is_ptr() {
            if let ValueKind::Parameter(id) = &source.kind {
                let name = self
                    .mir_func
                    .parameters
                    .iter()
                    .find(|p| p.id == *id)
                    .map(|p| p.name.clone())
                    .ok_or_else(|| {
                        CodegenError::invalid_ir(PASS, format!("unknown parameter id {}", id.0))
                    })?;
                let chunks = self
                    .struct_param_regs
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| {
                        CodegenError::invalid_ir(PASS, format!("`{name}` is not a struct parameter"))
                    })?;

                for (i, vreg) in chunks.iter().enumerate() {
                    let store = MachineInstruction::new(GenericOpcode::Store)
                        .with(Operand::stack_access(
                            address,
                            i as i32 * (STRUCT_CHUNK_BITS / 8) as i32,
                        ))
                        .with(Operand::vreg(*vreg, LowLevelType::int(STRUCT_CHUNK_BITS as u8)));
                    self.emit(store);
                }
                return Ok(());
            }

            // a struct handed back by a call still sits in the return registers
            let chunks = (source.ty.byte_size() * 8).div_ceil(STRUCT_CHUNK_BITS);
            if chunks as usize > self.target.abi.return_registers.len() {
                return Err(CodegenError::unsupported(
                    PASS,
                    "struct does not fit the return registers",
                ));
            }
            for i in 0..chunks {
                let ret = self.target.abi.return_registers[i as usize];
                let chunk_reg = self.target.registers.get(ret).subregs[0];
                let store = MachineInstruction::new(GenericOpcode::Store)
                    .with(Operand::stack_access(
                        address,
                        i as i32 * (STRUCT_CHUNK_BITS / 8) as i32,
                    ))
                    .with(Operand::register(
                        chunk_reg,
                        LowLevelType::int(STRUCT_CHUNK_BITS as u8),
                    ));
                self.emit(store);
            }
            return Ok(());
        }

        let mut store = MachineInstruction::new(GenericOpcode::Store);
        if address_is_slot {
            store.push(Operand::stack_access(address, 0));
        } else {
            store.push(Operand::memory(address, LowLevelType::ptr()));
        }
        let source = self.operand_from_value(source, false)?;
        let source = self.materialize_if_immediate(source);
        store.push(source);
        self.emit(store);
        Ok(())
    }

    fn lower_load(&mut self, dest: &Value, source: &Value) -> Result<(), CodegenError> {
        let address = self.resolve_address(source)?;
        let address_is_slot = self.func.frame.is_slot(address);

        // struct destinations load chunk by chunk, remembering the chunk
        // registers for later call arguments
        if dest.ty.is_struct() && !dest.ty.is_ptr() {
            let id = dest.id().expect("load destination").0;
            let chunks = (dest.ty.byte_size() * 8).div_ceil(STRUCT_CHUNK_BITS);
            for i in 0..chunks {
                let vreg = self.func.next_vreg();
                self.struct_loads.entry(id).or_default().push(vreg);
                let load = MachineInstruction::new(GenericOpcode::Load)
                    .with(Operand::vreg(vreg, LowLevelType::int(STRUCT_CHUNK_BITS as u8)))
                    .with(Operand::stack_access(
                        address,
                        i as i32 * (STRUCT_CHUNK_BITS / 8) as i32,
                    ));
                self.emit(load);
            }
            return Ok(());
        }

        let dest = self.operand_from_value(dest, true)?;
        let mut load = MachineInstruction::new(GenericOpcode::Load).with(dest);
        if address_is_slot {
            load.push(Operand::stack_access(address, 0));
        } else {
            load.push(Operand::memory(address, LowLevelType::ptr()));
        }
        self.emit(load);
        Ok(())
    }

    fn lower_gep(&mut self, dest: &Value, base: &Value, index: &Value) -> Result<(), CodegenError> {
        let is_global = base.is_global();
        let source_id = if is_global {
            None
        } else {
            Some(self.resolve_id(base)?)
        };
        let is_stack = source_id.is_some_and(|id| self.func.frame.is_slot(id));
        let is_reg = !is_global && !is_stack;

        let dest_op = self.operand_from_value(dest, false)?;
        let pointer_bits = self.target.pointer_bits;

        // the aggregate being indexed sits behind at most one pointer level
        let aggregate = match &base.ty {
            Type::Pointer(pointee) => (**pointee).clone(),
            other => other.clone(),
        };

        // base-address instruction, unless the source already is a register
        let mut goal = if is_global {
            let ValueKind::Global(name) = &base.kind else {
                unreachable!()
            };
            Some(
                MachineInstruction::new(GenericOpcode::GlobalAddress)
                    .with(dest_op.clone())
                    .with(Operand::global_symbol(name.clone())),
            )
        } else if is_stack {
            Some(
                MachineInstruction::new(GenericOpcode::StackAddress)
                    .with(dest_op.clone())
                    .with(Operand::stack_access(source_id.unwrap(), 0)),
            )
        } else {
            None
        };

        if let ValueKind::Constant(index) = index.kind {
            let offset = if aggregate.is_struct() {
                aggregate.field_offset(index as usize) as i64
            } else {
                aggregate.elem_size() as i64 * index
            };

            // nothing to add: the base address is the result
            if offset == 0 {
                if let Some(goal) = goal.take() {
                    self.emit(goal);
                    return Ok(());
                }
            }

            // stack objects take the offset directly in the access operand
            if is_stack {
                let mut goal = goal.take().unwrap();
                goal.operands[1] = Operand::stack_access(source_id.unwrap(), offset as i32);
                self.emit(goal);
                return Ok(());
            }

            if let Some(goal) = goal.take() {
                self.emit(goal);
            }

            let base_op = if is_reg {
                self.operand_from_value(base, false)?
            } else {
                dest_op.clone()
            };
            let add = MachineInstruction::new(GenericOpcode::Add)
                .with(dest_op.clone())
                .with(base_op)
                .with(Operand::immediate(offset, dest_op.ty));
            self.emit(add);
            return Ok(());
        }

        // register index
        if aggregate.is_struct() {
            return Err(CodegenError::unsupported(
                PASS,
                "struct element access with a runtime index",
            ));
        }

        if let Some(goal) = goal.take() {
            self.emit(goal);
        }

        let index_op = self.operand_from_value(index, false)?;
        let multiplier = aggregate.elem_size() as i64;

        let product = if multiplier == 1 {
            // identity: a move (or sign extension) suffices
            let vreg = self.func.next_vreg();
            let mut mov = MachineInstruction::new(GenericOpcode::Mov)
                .with(Operand::vreg(vreg, LowLevelType::ptr()))
                .with(index_op.clone());
            if index_op.ty.bits < pointer_bits {
                mov.opcode = llir::Opcode::Generic(GenericOpcode::SExt);
            }
            self.emit(mov);
            vreg
        } else {
            // MUL takes no immediate operand, so materialize the multiplier
            let imm_vreg = self.func.next_vreg();
            self.emit(
                MachineInstruction::new(GenericOpcode::Mov)
                    .with(Operand::vreg(imm_vreg, LowLevelType::ptr()))
                    .with(Operand::immediate(multiplier, LowLevelType::int(32))),
            );

            let index_op = if index_op.ty.bits < pointer_bits {
                let sext_vreg = self.func.next_vreg();
                self.emit(
                    MachineInstruction::new(GenericOpcode::SExt)
                        .with(Operand::vreg(sext_vreg, LowLevelType::ptr()))
                        .with(index_op),
                );
                Operand::vreg(sext_vreg, LowLevelType::ptr())
            } else {
                index_op
            };

            let product = self.func.next_vreg();
            self.emit(
                MachineInstruction::new(GenericOpcode::Mul)
                    .with(Operand::vreg(product, LowLevelType::ptr()))
                    .with(index_op)
                    .with(Operand::vreg(imm_vreg, LowLevelType::ptr())),
            );
            product
        };

        let base_op = if is_reg {
            self.operand_from_value(base, false)?
        } else {
            dest_op.clone()
        };
        let add = MachineInstruction::new(GenericOpcode::Add)
            .with(dest_op)
            .with(base_op)
            .with(Operand::vreg(product, LowLevelType::ptr()));
        self.emit(add);
        Ok(())
    }

    fn lower_call(
        &mut self,
        dest: &Option<Value>,
        callee: &str,
        args: &[Value],
    ) -> Result<(), CodegenError> {
        self.func.has_call = true;

        let arg_regs = self.target.abi.argument_registers.clone();
        let mut counter = 0usize;

        let mut next_arg_reg = |counter: &mut usize| -> Result<u32, CodegenError> {
            let reg = arg_regs.get(*counter).copied().ok_or_else(|| {
                CodegenError::unsupported(
                    PASS,
                    format!("call to `{callee}` passes more than {} arguments", arg_regs.len()),
                )
            })?;
            *counter += 1;
            Ok(reg)
        };

        for arg in args {
            // struct by value: move the previously loaded chunks
            if arg.ty.is_struct() && !arg.ty.is_ptr() {
                let id = arg.id().ok_or_else(|| {
                    CodegenError::invalid_ir(PASS, "struct argument is not a register value")
                })?;
                let chunks = self.struct_loads.get(&id.0).cloned().ok_or_else(|| {
                    CodegenError::invalid_ir(PASS, "struct argument was never loaded")
                })?;

                for vreg in chunks {
                    let arg_reg = next_arg_reg(&mut counter)?;
                    let chunk_reg = self.target.registers.get(arg_reg).subregs[0];
                    self.emit(
                        MachineInstruction::new(GenericOpcode::Mov)
                            .with(Operand::register(
                                chunk_reg,
                                LowLevelType::int(STRUCT_CHUNK_BITS as u8),
                            ))
                            .with(Operand::vreg(vreg, LowLevelType::int(STRUCT_CHUNK_BITS as u8))),
                    );
                }
                continue;
            }

            // address-of-global and address-of-stack-object arguments
            if arg.ty.is_ptr() && arg.is_global() {
                let ValueKind::Global(name) = &arg.kind else {
                    unreachable!()
                };
                let arg_reg = next_arg_reg(&mut counter)?;
                self.emit(
                    MachineInstruction::new(GenericOpcode::GlobalAddress)
                        .with(Operand::register(arg_reg, LowLevelType::ptr()))
                        .with(Operand::global_symbol(name.clone())),
                );
                continue;
            }
            if arg.ty.is_ptr() {
                let id = self.resolve_id(arg)?;
                if self.func.frame.is_slot(id) {
                    let arg_reg = next_arg_reg(&mut counter)?;
                    self.emit(
                        MachineInstruction::new(GenericOpcode::StackAddress)
                            .with(Operand::register(arg_reg, LowLevelType::ptr()))
                            .with(Operand::stack_access(id, 0)),
                    );
                    continue;
                }
            }

            // plain values move into the argument register, through the
            // 32-bit sub-register when the source is narrower
            let source = self.operand_from_value(arg, false)?;
            let arg_reg = next_arg_reg(&mut counter)?;
            let full = self.target.registers.get(arg_reg);
            let (reg, bits) = if source.ty.bits < full.bits {
                let sub = full.subregs[0];
                (sub, self.target.registers.get(sub).bits)
            } else {
                (arg_reg, full.bits)
            };
            self.emit(
                MachineInstruction::new(GenericOpcode::Mov)
                    .with(Operand::register(reg, LowLevelType::int(bits)))
                    .with(source),
            );
        }

        self.emit(
            MachineInstruction::new(GenericOpcode::Call).with(Operand::function_name(callee)),
        );

        // spill returned values to fresh stack slots; later uses load from
        // the first slot
        if let Some(dest) = dest {
            let id = dest.id().expect("call destination").0;
            let chunk_bits = if dest.ty.is_struct() {
                STRUCT_CHUNK_BITS
            } else {
                u32::from(self.target.pointer_bits)
            };
            let mut remaining = dest.ty.byte_size() * 8;
            let count = remaining.div_ceil(chunk_bits);
            if count as usize > self.target.abi.return_registers.len() {
                return Err(CodegenError::unsupported(
                    PASS,
                    "call result does not fit the return registers",
                ));
            }

            for i in 0..count {
                let slot = self.func.next_vreg();
                if i == 0 {
                    self.value_map.insert(id, slot);
                }
                let bits = remaining.min(chunk_bits);
                self.func.frame.insert_slot(slot, bits / 8);

                let ret = self.target.abi.return_registers[i as usize];
                let reg = if bits >= u32::from(self.target.pointer_bits) {
                    ret
                } else {
                    self.target.registers.get(ret).subregs[0]
                };
                self.emit(
                    MachineInstruction::new(GenericOpcode::Store)
                        .with(Operand::stack_access(slot, 0))
                        .with(Operand::register(reg, LowLevelType::int(bits as u8))),
                );
                remaining = remaining.saturating_sub(chunk_bits);
            }
        }

        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Value>) -> Result<(), CodegenError> {
        let Some(value) = value else {
            self.emit(MachineInstruction::new(GenericOpcode::Ret));
            return Ok(());
        };

        let operand = self.operand_from_value(value, false)?;

        if value.ty.is_struct() {
            // load the chunks straight into the return registers
            let id = self.resolve_id(value)?;
            let chunks = (value.ty.byte_size() * 8).div_ceil(STRUCT_CHUNK_BITS);
            for i in 0..chunks {
                let ret = self.target.abi.return_registers[i as usize];
                let chunk_reg = self.target.registers.get(ret).subregs[0];
                self.emit(
                    MachineInstruction::new(GenericOpcode::Load)
                        .with(Operand::register(
                            chunk_reg,
                            LowLevelType::int(STRUCT_CHUNK_BITS as u8),
                        ))
                        .with(Operand::stack_access(
                            id,
                            i as i32 * (STRUCT_CHUNK_BITS / 8) as i32,
                        )),
                );
            }
        } else if value.is_constant() {
            let ret = self.target.abi.return_registers[0];
            let full = self.target.registers.get(ret);
            let (reg, bits) = if value.ty.bit_size() <= 32 {
                let sub = full.subregs[0];
                (sub, self.target.registers.get(sub).bits)
            } else {
                (ret, full.bits)
            };
            self.emit(
                MachineInstruction::new(GenericOpcode::LoadImm)
                    .with(Operand::register(reg, LowLevelType::int(bits)))
                    .with(operand.clone()),
            );
        }

        self.emit(MachineInstruction::new(GenericOpcode::Ret).with(operand));
        Ok(())
    }

    fn lower_memcopy(
        &mut self,
        destination: &Value,
        source: &Value,
        bytes: u32,
    ) -> Result<(), CodegenError> {
        if bytes % 4 != 0 {
            return Err(CodegenError::unsupported(
                PASS,
                format!("memcopy of {bytes} bytes is not word-sized"),
            ));
        }

        let source_id = self.resolve_id(source)?;
        let dest_id = self.resolve_id(destination)?;

        for i in 0..bytes / 4 {
            let vreg = self.func.next_vreg();
            self.emit(
                MachineInstruction::new(GenericOpcode::Load)
                    .with(Operand::vreg(vreg, LowLevelType::int(32)))
                    .with(Operand::stack_access(source_id, i as i32 * 4)),
            );

            let mut store = MachineInstruction::new(GenericOpcode::Store);
            if self.func.frame.is_slot(dest_id) {
                store.push(Operand::stack_access(dest_id, i as i32 * 4));
            } else {
                store.push(Operand {
                    kind: OperandKind::Memory {
                        base: dest_id,
                        offset: i as i32 * 4,
                        is_virtual: true,
                    },
                    ty: LowLevelType::ptr(),
                });
            }
            store.push(Operand::vreg(vreg, LowLevelType::int(32)));
            self.emit(store);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::target::aarch64;
    use crate::mir::{
        BinaryOp,
        builder::{FunctionBuilder, ModuleBuilder},
        ty::Type,
    };

    fn lower_single(function: mir::Function) -> llir::MachineFunction {
        let mut module = ModuleBuilder::new();
        module.add_function(function);
        let mut lowered = lower_module(&module.build(), aarch64::target()).unwrap();
        lowered.functions.pop().unwrap()
    }

    fn point() -> Type {
        Type::Struct {
            name: "Point".into(),
            members: vec![Type::Int(32), Type::Int(32)].into(),
        }
    }

    #[test]
    fn gep_constant_index_folds_into_stack_access() {
        let mut b = FunctionBuilder::new("f", Type::Int(32));
        b.create_block("entry");
        let array = b.stack_alloc(Type::Array {
            elem: std::rc::Rc::new(Type::Int(32)),
            length: 4,
        });
        let slot = array.id().unwrap().0;
        b.gep(array, mir::Value::constant(2, Type::Int(32)));
        b.ret(None);

        let func = lower_single(b.build());
        let address = &func.blocks[0].instructions[0];
        assert_eq!(
            address.opcode,
            llir::Opcode::Generic(GenericOpcode::StackAddress)
        );
        // base + index * elem_size, folded into the access operand
        assert_eq!(
            address.operands[1].kind,
            OperandKind::StackAccess { slot, offset: 8 }
        );
    }

    #[test]
    fn gep_register_index_multiplies() {
        let mut b = FunctionBuilder::new("g", Type::Int(32));
        let i = b.add_parameter("i", Type::Int(32));
        b.create_block("entry");
        let array = b.stack_alloc(Type::Array {
            elem: std::rc::Rc::new(Type::Int(32)),
            length: 4,
        });
        b.gep(array, i);
        b.ret(None);

        let func = lower_single(b.build());
        let opcodes: Vec<_> = func.blocks[0]
            .instructions
            .iter()
            .map(|mi| mi.opcode)
            .collect();
        assert_eq!(
            opcodes,
            [
                llir::Opcode::Generic(GenericOpcode::StackAddress),
                llir::Opcode::Generic(GenericOpcode::Mov),
                llir::Opcode::Generic(GenericOpcode::SExt),
                llir::Opcode::Generic(GenericOpcode::Mul),
                llir::Opcode::Generic(GenericOpcode::Add),
                llir::Opcode::Generic(GenericOpcode::Ret),
            ]
        );
    }

    #[test]
    fn stack_allocation_of_pointer_gets_pointer_size() {
        let mut b = FunctionBuilder::new("f", Type::Void);
        b.create_block("entry");
        let pp = b.stack_alloc(Type::Int(32).ptr_to());
        let slot = pp.id().unwrap().0;
        b.ret(None);

        let func = lower_single(b.build());
        assert_eq!(func.frame.slot_size(slot), Some(8));
    }

    #[test]
    fn struct_parameter_stores_in_word_chunks() {
        let mut b = FunctionBuilder::new("getx", Type::Int(32));
        let p = b.add_parameter("p", point());
        b.create_block("entry");
        let slot = b.stack_alloc(point());
        let slot_id = slot.id().unwrap().0;
        b.store(p, slot);
        b.ret(None);

        let func = lower_single(b.build());
        // two 32-bit parameter chunks
        assert_eq!(func.parameters.len(), 2);
        assert!(func.parameters.iter().all(|(_, ty)| ty.bits == 32));

        let stores: Vec<_> = func.blocks[0]
            .instructions
            .iter()
            .filter(|mi| mi.is_store)
            .collect();
        assert_eq!(stores.len(), 2);
        assert_eq!(
            stores[0].operands[0].kind,
            OperandKind::StackAccess { slot: slot_id, offset: 0 }
        );
        assert_eq!(
            stores[1].operands[0].kind,
            OperandKind::StackAccess { slot: slot_id, offset: 4 }
        );
    }

    #[test]
    fn call_results_spill_and_reload_through_the_frame() {
        let mut b = FunctionBuilder::new("h", Type::Void);
        b.create_block("entry");
        let local = b.stack_alloc(Type::Int(64));
        let result = b.call("c", vec![], Type::Int(64)).unwrap();
        b.store(result, local);
        b.ret(None);

        let func = lower_single(b.build());
        assert!(func.has_call);

        let instructions = &func.blocks[0].instructions;
        // call, spill of x0, reload, store to the local
        assert_eq!(instructions[0].opcode, llir::Opcode::Generic(GenericOpcode::Call));
        assert!(instructions[1].is_store);
        assert_eq!(
            instructions[1].operands[1].kind,
            OperandKind::Register(aarch64::x(0))
        );
        assert!(instructions[2].is_load);
        assert_eq!(instructions[2].operands[1].kind, instructions[1].operands[0].kind);
    }

    #[test]
    fn branch_attaches_both_labels() {
        let mut b = FunctionBuilder::new("f", Type::Int(32));
        let a = b.add_parameter("a", Type::Int(32));
        b.create_block("entry");
        let c = b.compare(mir::Relation::Lt, a, mir::Value::constant(0, Type::Int(32)));
        b.branch(c, "neg", Some("pos".to_owned()));
        b.create_block("neg");
        b.ret(None);
        b.create_block("pos");
        b.ret(None);

        let func = lower_single(b.build());
        let branch = &func.blocks[0].instructions[1];
        assert_eq!(branch.operands.len(), 3);
        assert_eq!(branch.operands[1].kind, OperandKind::Label("neg".into()));
        assert_eq!(branch.operands[2].kind, OperandKind::Label("pos".into()));
    }

    #[test]
    fn excess_call_arguments_are_rejected() {
        let mut b = FunctionBuilder::new("f", Type::Void);
        b.create_block("entry");
        let args: Vec<_> = (0..9)
            .map(|i| mir::Value::constant(i, Type::Int(32)))
            .collect();
        b.call("many", args, Type::Void);
        b.ret(None);

        let mut module = ModuleBuilder::new();
        module.add_function(b.build());
        let err = lower_module(&module.build(), aarch64::target()).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn immediate_stores_materialize_first() {
        let mut b = FunctionBuilder::new("f", Type::Void);
        b.create_block("entry");
        let local = b.stack_alloc(Type::Int(32));
        b.store(mir::Value::constant(7, Type::Int(32)), local);
        b.ret(None);

        let func = lower_single(b.build());
        let instructions = &func.blocks[0].instructions;
        assert_eq!(instructions[0].opcode, llir::Opcode::Generic(GenericOpcode::Mov));
        assert!(instructions[1].is_store);
        assert!(instructions[1].operands[1].is_register_like());
    }

    #[test]
    fn binary_ops_keep_three_address_form() {
        let mut b = FunctionBuilder::new("f", Type::Int(32));
        let a = b.add_parameter("a", Type::Int(32));
        let c = b.add_parameter("b", Type::Int(32));
        b.create_block("entry");
        let sum = b.binary(BinaryOp::Add, a, c);
        b.ret(Some(sum));

        let func = lower_single(b.build());
        let add = &func.blocks[0].instructions[0];
        assert_eq!(add.opcode, llir::Opcode::Generic(GenericOpcode::Add));
        assert_eq!(add.operands.len(), 3);
    }
}
