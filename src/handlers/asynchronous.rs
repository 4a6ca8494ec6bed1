//! Interrupt handling
//!
//! Every interrupt vector of a level jumps to a small entry stub,
//! which saves the scratch registers and jumps to the level's
//! asynchronous handler body. Bodies are generated for one level at a
//! time, so they use that level's CSRs directly instead of a
//! privilege-level branch tree.

use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::handlers::{
    gen_exit, gen_save_scratch_registers, trap_csrs, AsyncHandlerClass, HandlerContext,
};
use crate::privilege::PrivilegeLevel;
use crate::sequence::Sequence;

pub fn gen_asynchronous_body<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    class: AsyncHandlerClass,
    level: PrivilegeLevel,
) -> Result<(), GenError> {
    let csrs = trap_csrs(level)?;
    asm.clear_labels("AsynchronousHandler");
    if class == AsyncHandlerClass::ClearPending {
        let s = ctx.scratch;
        let t0 = s.temps[0];
        // Drop the interrupt bit of xcause to get the interrupt number
        asm.gen_read_system_register(s.cause, csrs.cause)?;
        asm.gen_shift_left_immediate(s.cause, s.cause, 1)?;
        asm.gen_shift_right_immediate(s.cause, s.cause, 1)?;
        asm.gen_add_immediate(t0, 0, 1)?;
        asm.gen_shift_left_register(t0, t0, s.cause)?;
        asm.gen_clear_system_register_bits(csrs.ip, t0)?;
    }
    gen_exit(asm, ctx, level)?;
    asm.check_labels_resolved()
}

/// Save the scratch registers and jump to the handler body at `target`,
/// which may be in another memory bank
pub fn gen_asynchronous_entry<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    level: PrivilegeLevel,
    target: u64,
) -> Result<(), GenError> {
    gen_save_scratch_registers(asm, ctx, level)?;
    asm.gen_absolute_branch_to_address(ctx.scratch.temps[0], target)
}
