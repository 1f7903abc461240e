//! The AArch64 target: register file, calling convention, instruction
//! definitions and the per-opcode selection rules.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::{
    backend::llir::{GenericOpcode, MachineInstruction, Opcode, Operand, OperandKind, StackFrame},
    error::{self, CodegenError},
    mir::Relation,
};

use super::{
    Abi, InstrDef, InstrKind, OperandClass, RegisterDescriptor, RegisterInfo, TargetDescription,
};

/// Register id of `wN` (the 32-bit view).
pub fn w(n: u32) -> u32 {
    debug_assert!(n <= 30);
    n
}

/// Register id of `xN` (the full 64-bit register).
pub fn x(n: u32) -> u32 {
    debug_assert!(n <= 30);
    32 + n
}

/// The stack pointer.
pub const SP: u32 = 64;

/// The link register, clobbered by `bl`.
pub const LR: u32 = 32 + 30;

static TARGET: Lazy<TargetDescription> = Lazy::new(build_target);

pub fn target() -> &'static TargetDescription {
    &TARGET
}

fn build_target() -> TargetDescription {
    let mut registers = Vec::new();

    for n in 0..=30 {
        registers.push(RegisterDescriptor {
            id: w(n),
            name: format!("w{n}"),
            bits: 32,
            subregs: Vec::new(),
            parent: Some(x(n)),
        });
        registers.push(RegisterDescriptor {
            id: x(n),
            name: format!("x{n}"),
            bits: 64,
            subregs: vec![w(n)],
            parent: None,
        });
    }
    registers.push(RegisterDescriptor {
        id: SP,
        name: "sp".to_owned(),
        bits: 64,
        subregs: Vec::new(),
        parent: None,
    });

    let abi = Abi {
        argument_registers: (0..8).map(x).collect(),
        return_registers: (0..8).map(x).collect(),
        // x0-x7 double as scratch once the arguments die, then x9-x15
        caller_saved: (0..8).map(x).chain((9..16).map(x)).collect(),
        callee_saved: (19..29).map(x).collect(),
        stack_alignment: 16,
        max_struct_bits: 128,
    };

    TargetDescription {
        registers: RegisterInfo::new(registers, SP),
        abi,
        pointer_bits: 64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOpcode {
    AddRrr,
    AddRri,
    SubRrr,
    SubRri,
    MulRrr,
    MulRri,
    SDivRrr,
    SDivRri,
    UDivRrr,
    AndRrr,
    AndRri,
    OrrRrr,
    OrrRri,
    EorRrr,
    EorRri,
    LslRrr,
    LslRri,
    LsrRrr,
    LsrRri,
    CmpRr,
    CmpRi,
    Sxtb,
    Sxtw,
    MovRr,
    MovRc,
    Ldr,
    Ldrb,
    Str,
    Strb,
    /// `adrp` + `add :lo12:` pair materializing a global address
    AdrpAdd,
    B,
    BEq,
    BNe,
    BLt,
    BGt,
    BLe,
    BGe,
    Bl,
    Ret,
}

use OperandClass::*;
use TargetOpcode::*;

static INSTRUCTIONS: Lazy<HashMap<TargetOpcode, InstrDef>> = Lazy::new(|| {
    let mut defs = HashMap::new();

    defs.insert(AddRrr, InstrDef::new("add\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(AddRri, InstrDef::new("add\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(SubRrr, InstrDef::new("sub\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(SubRri, InstrDef::new("sub\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(MulRrr, InstrDef::new("mul\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(MulRri, InstrDef::new("mul\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(SDivRrr, InstrDef::new("sdiv\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(SDivRri, InstrDef::new("sdiv\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(UDivRrr, InstrDef::new("udiv\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(AndRrr, InstrDef::new("and\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(AndRri, InstrDef::new("and\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(OrrRrr, InstrDef::new("orr\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(OrrRri, InstrDef::new("orr\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(EorRrr, InstrDef::new("eor\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(EorRri, InstrDef::new("eor\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(LslRrr, InstrDef::new("lsl\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(LslRri, InstrDef::new("lsl\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(LsrRrr, InstrDef::new("lsr\t$1, $2, $3", &[Gpr, Gpr, Gpr]));
    defs.insert(LsrRri, InstrDef::new("lsr\t$1, $2, #$3", &[Gpr, Gpr, UImm12]));
    defs.insert(CmpRr, InstrDef::new("cmp\t$1, $2", &[Gpr, Gpr]));
    defs.insert(CmpRi, InstrDef::new("cmp\t$1, #$2", &[Gpr, UImm12]));
    defs.insert(Sxtb, InstrDef::new("sxtb\t$1, $2", &[Gpr, Gpr]));
    defs.insert(Sxtw, InstrDef::new("sxtw\t$1, $2", &[Gpr, Gpr]));
    defs.insert(MovRr, InstrDef::new("mov\t$1, $2", &[Gpr, Gpr]));
    defs.insert(MovRc, InstrDef::new("mov\t$1, #$2", &[Gpr, SImm16]));
    defs.insert(
        Ldr,
        InstrDef::with_kind("ldr\t$1, [$2, #$3]", &[Gpr, Gpr, SImm12], InstrKind::Load),
    );
    defs.insert(
        Ldrb,
        InstrDef::with_kind("ldrb\t$1, [$2, #$3]", &[Gpr, Gpr, SImm12], InstrKind::Load),
    );
    defs.insert(
        Str,
        InstrDef::with_kind("str\t$1, [$2, #$3]", &[Gpr, Gpr, SImm12], InstrKind::Store),
    );
    defs.insert(
        Strb,
        InstrDef::with_kind("strb\t$1, [$2, #$3]", &[Gpr, Gpr, SImm12], InstrKind::Store),
    );
    defs.insert(
        AdrpAdd,
        InstrDef::new("adrp\t$1, $2\n\tadd\t$1, $1, :lo12:$2", &[Gpr, Symbol]),
    );
    defs.insert(B, InstrDef::new("b\t$1", &[SImm21Lsb0]));
    defs.insert(BEq, InstrDef::new("b.eq\t$1", &[SImm21Lsb0]));
    defs.insert(BNe, InstrDef::new("b.ne\t$1", &[SImm21Lsb0]));
    defs.insert(BLt, InstrDef::new("b.lt\t$1", &[SImm21Lsb0]));
    defs.insert(BGt, InstrDef::new("b.gt\t$1", &[SImm21Lsb0]));
    defs.insert(BLe, InstrDef::new("b.le\t$1", &[SImm21Lsb0]));
    defs.insert(BGe, InstrDef::new("b.ge\t$1", &[SImm21Lsb0]));
    defs.insert(Bl, InstrDef::new("bl\t$1", &[SImm21Lsb0]));
    defs.insert(Ret, InstrDef::with_kind("ret", &[], InstrKind::Return));

    defs
});

pub fn instr_def(opcode: TargetOpcode) -> &'static InstrDef {
    &INSTRUCTIONS[&opcode]
}

const PASS: &str = "isel";

/// Widens an integer operand to the 32-bit architecture minimum for
/// general-purpose operations. Pointer operands keep their width.
fn extend_operand(operand: &mut Operand) {
    if !operand.ty.pointer && operand.ty.bits < 32 {
        operand.ty.bits = 32;
    }
}

fn expect_operands(mi: &MachineInstruction, counts: &[usize]) -> Result<(), CodegenError> {
    if counts.contains(&mi.operands.len()) {
        return Ok(());
    }
    Err(CodegenError::invalid_ir(
        PASS,
        format!(
            "{:?} expects {counts:?} operands, found {}",
            mi.opcode,
            mi.operands.len()
        ),
    ))
}

/// Rewrites one generic instruction into its AArch64 form. A two-label
/// branch expands into a conditional and an unconditional jump; the second
/// instruction is returned for the caller to append.
pub fn select(
    mi: &mut MachineInstruction,
    frame: &StackFrame,
    preceding_relation: Option<Relation>,
) -> Result<Option<MachineInstruction>, CodegenError> {
    let Opcode::Generic(generic) = mi.opcode else {
        return Ok(None); // already selected
    };

    match generic {
        GenericOpcode::Add => select_add(mi)?,
        GenericOpcode::Sub => select_three_address(mi, SubRrr, SubRri)?,
        GenericOpcode::Mul => select_three_address(mi, MulRrr, MulRri)?,
        GenericOpcode::Div => select_three_address(mi, SDivRrr, SDivRri)?,
        GenericOpcode::DivU => select_divu(mi)?,
        GenericOpcode::And => select_three_address(mi, AndRrr, AndRri)?,
        GenericOpcode::Or => select_three_address(mi, OrrRrr, OrrRri)?,
        GenericOpcode::Xor => select_three_address(mi, EorRrr, EorRri)?,
        GenericOpcode::Shl => select_three_address(mi, LslRrr, LslRri)?,
        GenericOpcode::Shr => select_three_address(mi, LsrRrr, LsrRri)?,
        GenericOpcode::Mod => {
            return Err(CodegenError::unsupported(
                PASS,
                "modulo has no direct AArch64 instruction",
            ));
        }
        GenericOpcode::Cmp => select_cmp(mi)?,
        GenericOpcode::SExt | GenericOpcode::ZExt => select_sext(mi)?,
        GenericOpcode::Trunc => select_trunc(mi)?,
        GenericOpcode::Load => select_load(mi, frame)?,
        GenericOpcode::Store => select_store(mi, frame)?,
        GenericOpcode::StackAddress => {
            expect_operands(mi, &[2])?;
            mi.set_opcode(AddRri);
        }
        GenericOpcode::GlobalAddress => {
            expect_operands(mi, &[2])?;
            mi.set_opcode(AdrpAdd);
        }
        GenericOpcode::LoadImm => select_load_imm(mi)?,
        GenericOpcode::Mov => select_mov(mi)?,
        GenericOpcode::Branch => return select_branch(mi, preceding_relation),
        GenericOpcode::Jump => mi.set_opcode(B),
        GenericOpcode::Call => mi.set_opcode(Bl),
        GenericOpcode::Ret => mi.set_opcode(Ret),
        GenericOpcode::StackAlloc => {
            return Err(CodegenError::invalid_ir(
                PASS,
                "stack allocations must be folded into the frame during lowering",
            ));
        }
    }

    Ok(None)
}

fn select_add(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[3])?;
    extend_operand(&mut mi.operands[0]);
    extend_operand(&mut mi.operands[1]);

    if let Some(value) = mi.operands[2].immediate_value() {
        // negative adjustments become subtractions
        if value < 0 {
            mi.operands[2].kind = OperandKind::Immediate(-value);
            error::check_uint(PASS, -value, 12, "sub immediate")?;
            mi.set_opcode(SubRri);
            return Ok(());
        }
        error::check_uint(PASS, value, 12, "add immediate")?;
        mi.set_opcode(AddRri);
    } else {
        mi.set_opcode(AddRrr);
    }
    Ok(())
}

fn select_three_address(
    mi: &mut MachineInstruction,
    rrr: TargetOpcode,
    rri: TargetOpcode,
) -> Result<(), CodegenError> {
    expect_operands(mi, &[3])?;
    extend_operand(&mut mi.operands[0]);
    extend_operand(&mut mi.operands[1]);

    if let Some(value) = mi.operands[2].immediate_value() {
        error::check_uint(PASS, value, 12, "alu immediate")?;
        mi.set_opcode(rri);
    } else {
        mi.set_opcode(rrr);
    }
    Ok(())
}

fn select_divu(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[3])?;
    extend_operand(&mut mi.operands[0]);
    extend_operand(&mut mi.operands[1]);

    if mi.operands[2].is_immediate() {
        return Err(CodegenError::unsupported(
            PASS,
            "unsigned division by an immediate",
        ));
    }
    mi.set_opcode(UDivRrr);
    Ok(())
}

fn select_cmp(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[3])?;
    extend_operand(&mut mi.operands[0]);
    extend_operand(&mut mi.operands[1]);

    if let Some(value) = mi.operands[2].immediate_value() {
        error::check_uint(PASS, value, 12, "cmp immediate")?;
        mi.set_opcode(CmpRi);
    } else {
        mi.set_opcode(CmpRr);
    }
    // the destination goes away, the result lives in the condition flags
    mi.remove_operand(0);
    Ok(())
}

fn select_sext(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[2])?;
    extend_operand(&mut mi.operands[0]);

    if mi.operands[1].is_immediate() {
        mi.set_opcode(MovRc);
        return Ok(());
    }
    match mi.operands[1].ty.bits {
        8 => mi.set_opcode(Sxtb),
        32 => mi.set_opcode(Sxtw),
        bits => {
            return Err(CodegenError::unsupported(
                PASS,
                format!("sign extension from {bits} bits"),
            ));
        }
    }
    Ok(())
}

fn select_trunc(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[2])?;

    if mi.operands[0].ty.bits == 8 {
        if let Some(value) = mi.operands[1].immediate_value() {
            mi.operands[1].kind = OperandKind::Immediate(value & 0xFF);
            mi.set_opcode(MovRc);
        } else {
            mi.set_opcode(AndRri);
            mi.push(Operand::immediate(0xFF, mi.operands[0].ty));
        }
        extend_operand(&mut mi.operands[0]);
        return Ok(());
    }

    // a 64 -> 32 truncation is just a move through the W sub-register
    if mi.operands[0].ty.bits == 32
        && mi.operands[1].ty.bits == 64
        && !mi.operands[1].is_immediate()
    {
        mi.set_opcode(MovRr);
        return Ok(());
    }

    Err(CodegenError::unsupported(
        PASS,
        format!(
            "truncation from {} to {} bits",
            mi.operands[1].ty.bits, mi.operands[0].ty.bits
        ),
    ))
}

fn select_load(mi: &mut MachineInstruction, frame: &StackFrame) -> Result<(), CodegenError> {
    debug_assert!(mi.is_load);
    expect_operands(mi, &[2])?;

    if mi.operands[0].ty.bits == 8 && !mi.operands[0].ty.pointer {
        mi.set_opcode(Ldrb);
        extend_operand(&mut mi.operands[0]);
        return Ok(());
    }

    if let OperandKind::StackAccess { slot, .. } = mi.operands[1].kind {
        match frame.slot_size(slot) {
            Some(1) => {
                mi.set_opcode(Ldrb);
                extend_operand(&mut mi.operands[0]);
                return Ok(());
            }
            Some(4) => {
                mi.set_opcode(Ldr);
                return Ok(());
            }
            _ => {}
        }
    }

    mi.set_opcode(Ldr);
    Ok(())
}

fn select_store(mi: &mut MachineInstruction, frame: &StackFrame) -> Result<(), CodegenError> {
    debug_assert!(mi.is_store);
    expect_operands(mi, &[2])?;

    let last = mi.operands.last().unwrap();
    let byte_sized_slot = match mi.operands[0].kind {
        OperandKind::StackAccess { slot, .. } => {
            frame.slot_size(slot) == Some(1)
        }
        _ => false,
    };

    if last.ty.bits == 8 || byte_sized_slot {
        mi.set_opcode(Strb);
    } else {
        mi.set_opcode(Str);
    }
    Ok(())
}

fn select_load_imm(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[2])?;
    let value = mi.operands[1].immediate_value().ok_or_else(|| {
        CodegenError::invalid_ir(PASS, "LOAD_IMM requires an immediate operand")
    })?;
    error::check_int(PASS, value, 16, "mov immediate")?;
    mi.set_opcode(MovRc);
    Ok(())
}

fn select_mov(mi: &mut MachineInstruction) -> Result<(), CodegenError> {
    expect_operands(mi, &[2])?;
    if let Some(value) = mi.operands[1].immediate_value() {
        error::check_int(PASS, value, 16, "mov immediate")?;
        mi.set_opcode(MovRc);
    } else {
        mi.set_opcode(MovRr);
    }
    Ok(())
}

fn select_branch(
    mi: &mut MachineInstruction,
    preceding_relation: Option<Relation>,
) -> Result<Option<MachineInstruction>, CodegenError> {
    let relation = preceding_relation.ok_or_else(|| {
        CodegenError::invalid_ir(PASS, "conditional branch without a preceding compare")
    })?;

    let opcode = match relation {
        Relation::Eq => BEq,
        Relation::Ne => BNe,
        Relation::Lt => BLt,
        Relation::Gt => BGt,
        Relation::Le => BLe,
        Relation::Ge => BGe,
    };

    if mi.is_fall_through_branch() {
        mi.set_opcode(opcode);
        mi.remove_operand(0);
        return Ok(None);
    }

    // two-label form: conditional branch to the true target, then an
    // unconditional branch to the false target
    expect_operands(mi, &[3])?;
    let false_label = mi.operands.pop().unwrap();
    mi.set_opcode(opcode);
    mi.remove_operand(0);

    let mut fallback = MachineInstruction::new(GenericOpcode::Jump);
    fallback.push(false_label);
    fallback.set_opcode(B);
    Ok(Some(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::llir::{LowLevelType, OperandKind};

    fn alu(op: GenericOpcode, imm: Option<i64>) -> MachineInstruction {
        let mut mi = MachineInstruction::new(op);
        mi.push(Operand::vreg(100, LowLevelType::int(32)));
        mi.push(Operand::vreg(101, LowLevelType::int(32)));
        match imm {
            Some(value) => mi.push(Operand::immediate(value, LowLevelType::int(32))),
            None => mi.push(Operand::vreg(102, LowLevelType::int(32))),
        }
        mi
    }

    #[test]
    fn add_folds_encodable_immediates() {
        let frame = StackFrame::default();

        let mut mi = alu(GenericOpcode::Add, Some(42));
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.opcode, Opcode::Target(AddRri));

        let mut mi = alu(GenericOpcode::Add, None);
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.opcode, Opcode::Target(AddRrr));
    }

    #[test]
    fn negative_add_immediate_becomes_sub() {
        let frame = StackFrame::default();
        let mut mi = alu(GenericOpcode::Add, Some(-16));
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.opcode, Opcode::Target(SubRri));
        assert_eq!(mi.operands[2].immediate_value(), Some(16));
    }

    #[test]
    fn unencodable_immediate_is_fatal() {
        let frame = StackFrame::default();
        let mut mi = alu(GenericOpcode::Add, Some(123456));
        let err = select(&mut mi, &frame, None).unwrap_err();
        assert!(matches!(err, CodegenError::ImmediateOutOfRange { .. }));
    }

    #[test]
    fn cmp_drops_destination() {
        let frame = StackFrame::default();
        let mut mi = alu(GenericOpcode::Cmp, None);
        mi.relation = Some(Relation::Lt);
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.opcode, Opcode::Target(CmpRr));
        assert_eq!(mi.operands.len(), 2);
    }

    #[test]
    fn narrow_operands_widen_to_32() {
        let frame = StackFrame::default();
        let mut mi = MachineInstruction::new(GenericOpcode::Add);
        mi.push(Operand::vreg(100, LowLevelType::int(8)));
        mi.push(Operand::vreg(101, LowLevelType::int(8)));
        mi.push(Operand::vreg(102, LowLevelType::int(8)));
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.operands[0].ty.bits, 32);
        assert_eq!(mi.operands[1].ty.bits, 32);
    }

    #[test]
    fn pointer_operands_keep_their_width() {
        let frame = StackFrame::default();
        let mut mi = MachineInstruction::new(GenericOpcode::Add);
        mi.push(Operand::vreg(100, LowLevelType::ptr()));
        mi.push(Operand::vreg(101, LowLevelType::ptr()));
        mi.push(Operand::immediate(8, LowLevelType::int(32)));
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.operands[0].ty, LowLevelType::ptr());
    }

    #[test]
    fn byte_loads_select_ldrb() {
        let mut frame = StackFrame::default();
        frame.insert_slot(5, 1);

        let mut mi = MachineInstruction::new(GenericOpcode::Load);
        mi.push(Operand::vreg(100, LowLevelType::int(32)));
        mi.push(Operand::stack_access(5, 0));
        select(&mut mi, &frame, None).unwrap();
        assert_eq!(mi.opcode, Opcode::Target(Ldrb));
    }

    #[test]
    fn two_label_branch_expands() {
        let frame = StackFrame::default();
        let mut mi = MachineInstruction::new(GenericOpcode::Branch);
        mi.push(Operand::vreg(100, LowLevelType::int(1)));
        mi.push(Operand::label("then"));
        mi.push(Operand::label("else"));

        let extra = select(&mut mi, &frame, Some(Relation::Gt)).unwrap().unwrap();
        assert_eq!(mi.opcode, Opcode::Target(BGt));
        assert_eq!(mi.operands.len(), 1);
        assert_eq!(mi.operands[0].kind, OperandKind::Label("then".into()));
        assert_eq!(extra.opcode, Opcode::Target(B));
        assert_eq!(extra.operands[0].kind, OperandKind::Label("else".into()));
    }

    #[test]
    fn selected_operands_match_instr_def_classes() {
        let frame = StackFrame::default();
        let mut mi = alu(GenericOpcode::Add, Some(4));
        select(&mut mi, &frame, None).unwrap();

        let Opcode::Target(opcode) = mi.opcode else {
            unreachable!()
        };
        let def = instr_def(opcode);
        for (operand, class) in mi.operands.iter().zip(def.operands) {
            match class {
                OperandClass::Gpr => assert!(operand.is_register_like()),
                OperandClass::UImm12 | OperandClass::SImm12 | OperandClass::SImm16 => {
                    assert!(operand.is_immediate())
                }
                _ => {}
            }
        }
    }
}
