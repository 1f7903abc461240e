//! The backend of the compiler lowers MIR into LLIR (Low-level Intermediate
//! Representation) and carries it down to AArch64 assembly text.
//!
//! The pipeline per function, in order:
//! 1. Lowering: MIR instructions become generic machine instructions over
//!    virtual registers; stack allocations become frame slots; the calling
//!    convention is made explicit.
//! 2. Instruction selection: generic opcodes are rewritten to target
//!    opcodes, immediates folded where the encoding allows.
//! 3. Register allocation: linear scan binds virtual registers to physical
//!    ones, promoting callee-saved registers under pressure.
//! 4. Stack lowering: abstract frame accesses become `[sp, #offset]` pairs.
//!
//! Emission then renders every function and global to GNU-syntax assembly.

use tracing::info_span;

use crate::{error::CodegenError, mir};

pub mod emit;
pub mod frame;
pub mod isel;
pub mod llir;
pub mod lowering;
pub mod pretty_print;
pub mod regalloc;
pub mod target;

/// Lowers the module to LLIR without running the later passes; this is the
/// form the `-e llir` dump shows.
pub fn lower_only(module: &mir::Module) -> Result<llir::Module, CodegenError> {
    lowering::lower_module(module, target::aarch64::target())
}

/// Runs the full pass pipeline, leaving a module of selected, allocated,
/// frame-resolved machine code ready for emission.
pub fn compile(module: &mir::Module) -> Result<llir::Module, CodegenError> {
    let td = target::aarch64::target();

    let mut lowered = {
        let _span = info_span!("lower").entered();
        lowering::lower_module(module, td)?
    };

    for function in &mut lowered.functions {
        let _span = info_span!("codegen", function = %function.name).entered();
        isel::select_instructions(function)?;
        regalloc::allocate_registers(function, td)?;
        frame::lower_stack_accesses(function, td)?;
    }

    Ok(lowered)
}

/// The whole backend: MIR in, assembly text out.
pub fn compile_to_assembly(module: &mir::Module) -> Result<String, CodegenError> {
    let compiled = compile(module)?;
    let _span = info_span!("emit").entered();
    emit::emit_assembly(&compiled, target::aarch64::target())
}
