//! LLIR (Low-Level Intermediate Representation). Machine instructions over
//! virtual registers and abstract memory operands. Lowering produces generic
//! opcodes, instruction selection rewrites them to AArch64 opcodes in place,
//! register allocation replaces virtual registers with physical ones and the
//! frame pass resolves stack accesses to `[sp, #offset]` pairs.
//!
//! Functions own their blocks, blocks own their instructions, instructions
//! own their operands. Everything else is referenced by id (registers, stack
//! slots) or by name (blocks, globals, callees).

use crate::mir::{Relation, ty::POINTER_BITS};

use super::target::aarch64;

#[derive(Debug, Default)]
pub struct Module {
    pub functions: Vec<MachineFunction>,
    pub globals: Vec<GlobalData>,
}

#[derive(Debug)]
pub struct MachineFunction {
    pub name: String,
    /// `(vreg id, type)` per parameter, in declaration order. The ids live
    /// in the same namespace as virtual registers.
    pub parameters: Vec<(u32, LowLevelType)>,
    pub blocks: Vec<MachineBasicBlock>,
    pub frame: StackFrame,
    /// Set when the function calls anything; drives link-register saving.
    pub has_call: bool,
    /// Callee-saved registers the allocator pressed into service.
    pub used_callee_saved: Vec<u32>,
    next_vreg: u32,
}

impl MachineFunction {
    pub fn new(name: impl Into<String>, first_free_vreg: u32) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            blocks: Vec::new(),
            frame: StackFrame::default(),
            has_call: false,
            used_callee_saved: Vec::new(),
            next_vreg: first_free_vreg,
        }
    }

    /// Hands out a fresh virtual register id, disjoint from every MIR value
    /// id and stack slot id of this function.
    pub fn next_vreg(&mut self) -> u32 {
        let vreg = self.next_vreg;
        self.next_vreg += 1;
        vreg
    }
}

#[derive(Debug)]
pub struct MachineBasicBlock {
    /// Mirrors the MIR block name; jump targets refer to it.
    pub name: String,
    pub instructions: Vec<MachineInstruction>,
}

impl MachineBasicBlock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, instruction: MachineInstruction) {
        self.instructions.push(instruction);
    }
}

/// Width and kind of a machine value: an integer of some bit width, or a
/// pointer of the architecture's pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowLevelType {
    pub bits: u8,
    pub pointer: bool,
}

impl LowLevelType {
    pub fn int(bits: u8) -> Self {
        Self {
            bits,
            pointer: false,
        }
    }

    pub fn ptr() -> Self {
        Self {
            bits: POINTER_BITS,
            pointer: true,
        }
    }

    /// Untyped; used for labels and symbols.
    pub fn none() -> Self {
        Self {
            bits: 0,
            pointer: false,
        }
    }
}

impl core::fmt::Display for LowLevelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pointer {
            write!(f, "p{}", self.bits)
        } else {
            write!(f, "s{}", self.bits)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub ty: LowLevelType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandKind {
    /// An unallocated register
    VirtualRegister(u32),
    /// A physical register of the target
    Register(u32),
    /// A function parameter, still to be bound to its ABI register
    Parameter(u32),
    Immediate(i64),
    /// An abstract slot of the current function's stack frame
    StackAccess { slot: u32, offset: i32 },
    /// A `[base + offset]` access; `base` is a virtual register until
    /// allocation flips `is_virtual`.
    Memory {
        base: u32,
        offset: i32,
        is_virtual: bool,
    },
    /// A branch target block name
    Label(String),
    /// A global variable symbol
    GlobalSymbol(String),
    /// A call target
    FunctionName(String),
}

impl Operand {
    pub fn vreg(id: u32, ty: LowLevelType) -> Self {
        Self {
            kind: OperandKind::VirtualRegister(id),
            ty,
        }
    }

    pub fn register(id: u32, ty: LowLevelType) -> Self {
        Self {
            kind: OperandKind::Register(id),
            ty,
        }
    }

    pub fn parameter(id: u32, ty: LowLevelType) -> Self {
        Self {
            kind: OperandKind::Parameter(id),
            ty,
        }
    }

    pub fn immediate(value: i64, ty: LowLevelType) -> Self {
        Self {
            kind: OperandKind::Immediate(value),
            ty,
        }
    }

    pub fn stack_access(slot: u32, offset: i32) -> Self {
        Self {
            kind: OperandKind::StackAccess { slot, offset },
            ty: LowLevelType::ptr(),
        }
    }

    pub fn memory(base: u32, ty: LowLevelType) -> Self {
        Self {
            kind: OperandKind::Memory {
                base,
                offset: 0,
                is_virtual: true,
            },
            ty,
        }
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self {
            kind: OperandKind::Label(name.into()),
            ty: LowLevelType::none(),
        }
    }

    pub fn global_symbol(name: impl Into<String>) -> Self {
        Self {
            kind: OperandKind::GlobalSymbol(name.into()),
            ty: LowLevelType::none(),
        }
    }

    pub fn function_name(name: impl Into<String>) -> Self {
        Self {
            kind: OperandKind::FunctionName(name.into()),
            ty: LowLevelType::none(),
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, OperandKind::Immediate(_))
    }

    pub fn immediate_value(&self) -> Option<i64> {
        match self.kind {
            OperandKind::Immediate(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_register_like(&self) -> bool {
        matches!(
            self.kind,
            OperandKind::VirtualRegister(_) | OperandKind::Register(_) | OperandKind::Parameter(_)
        )
    }

    /// The register id referenced by a vreg, parameter or memory operand.
    pub fn reg_id(&self) -> Option<u32> {
        match self.kind {
            OperandKind::VirtualRegister(id)
            | OperandKind::Register(id)
            | OperandKind::Parameter(id) => Some(id),
            OperandKind::Memory { base, .. } => Some(base),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Generic(GenericOpcode),
    Target(aarch64::TargetOpcode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GenericOpcode {
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Div,
    DivU,
    Mod,
    Shl,
    Shr,
    Cmp,
    SExt,
    ZExt,
    Trunc,
    Call,
    Jump,
    Branch,
    Ret,
    Load,
    Store,
    StackAlloc,
    LoadImm,
    Mov,
    GlobalAddress,
    StackAddress,
}

#[derive(Debug)]
pub struct MachineInstruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Compare relation, consumed by the branch selector.
    pub relation: Option<Relation>,
    pub is_load: bool,
    pub is_store: bool,
}

impl MachineInstruction {
    pub fn new(opcode: GenericOpcode) -> Self {
        Self {
            opcode: Opcode::Generic(opcode),
            operands: Vec::new(),
            relation: None,
            is_load: matches!(opcode, GenericOpcode::Load),
            is_store: matches!(opcode, GenericOpcode::Store),
        }
    }

    pub fn with(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn push(&mut self, operand: Operand) {
        self.operands.push(operand);
    }

    pub fn set_opcode(&mut self, opcode: aarch64::TargetOpcode) {
        self.opcode = Opcode::Target(opcode);
    }

    pub fn remove_operand(&mut self, index: usize) {
        self.operands.remove(index);
    }

    /// A conditional branch that still carries its condition operand and a
    /// single target, relying on fall-through for the false edge.
    pub fn is_fall_through_branch(&self) -> bool {
        self.operands.len() == 2
    }
}

/// The initialized image of one global variable: a list of
/// `(size_bytes, value)` allocations emitted in order.
#[derive(Debug)]
pub struct GlobalData {
    pub name: String,
    pub size: u32,
    pub allocations: Vec<(u32, i64)>,
}

impl GlobalData {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            allocations: Vec::new(),
        }
    }

    pub fn insert_allocation(&mut self, size: u32, value: i64) {
        self.allocations.push((size, value));
    }
}

/// Insertion-ordered stack frame layout. Every slot occupies at least four
/// bytes; positions accumulate the aligned sizes of the slots before them so
/// large objects never overlap their neighbors.
#[derive(Debug, Default)]
pub struct StackFrame {
    slots: Vec<(u32, u32)>,
    objects_size: u32,
}

fn slot_stride(size: u32) -> u32 {
    size.max(4).next_multiple_of(4)
}

impl StackFrame {
    pub fn insert_slot(&mut self, id: u32, size: u32) {
        debug_assert!(
            !self.is_slot(id),
            "stack slot {id} inserted twice"
        );
        self.objects_size += slot_stride(size);
        self.slots.push((id, size));
    }

    pub fn is_slot(&self, id: u32) -> bool {
        self.slots.iter().any(|(slot, _)| *slot == id)
    }

    pub fn slot_size(&self, id: u32) -> Option<u32> {
        self.slots
            .iter()
            .find(|(slot, _)| *slot == id)
            .map(|(_, size)| *size)
    }

    /// Byte offset of `id` from the stack pointer after frame allocation.
    pub fn position(&self, id: u32) -> Option<u32> {
        let mut position = 0;
        for (slot, size) in &self.slots {
            if *slot == id {
                return Some(position);
            }
            position += slot_stride(*size);
        }
        None
    }

    pub fn objects_size(&self) -> u32 {
        self.objects_size
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_positions_accumulate_sizes() {
        let mut frame = StackFrame::default();
        frame.insert_slot(10, 8);
        frame.insert_slot(11, 1);
        frame.insert_slot(12, 4);

        assert_eq!(frame.position(10), Some(0));
        // the 8-byte object must not overlap its neighbor
        assert_eq!(frame.position(11), Some(8));
        assert_eq!(frame.position(12), Some(12));
        assert_eq!(frame.objects_size(), 16);
    }

    #[test]
    fn small_slots_still_take_four_bytes() {
        let mut frame = StackFrame::default();
        frame.insert_slot(1, 1);
        frame.insert_slot(2, 1);
        assert_eq!(frame.position(2), Some(4));
        assert_eq!(frame.objects_size(), 8);
    }

    #[test]
    fn vregs_are_disjoint_from_mir_ids() {
        let mut func = MachineFunction::new("f", 7);
        assert_eq!(func.next_vreg(), 7);
        assert_eq!(func.next_vreg(), 8);
    }
}
