use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::handlers::{gen_handler_return, HandlerContext};
use crate::sequence::Sequence;

/// Skip the faulting instruction: advance xepc by one instruction and
/// return from the trap
pub fn gen_skip_instruction<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
) -> Result<(), GenError> {
    asm.clear_labels("SkipInstruction");
    let s = ctx.scratch;
    asm.gen_increment_exception_return_address(s.temps[0], s.priv_level, &ctx.levels)?;
    gen_handler_return(asm, ctx)?;
    asm.check_labels_resolved()
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::assembly::riscv::privilege_tree_len;
    use crate::handlers::tests::context;
    use crate::handlers::{handler_return_len, HandlerMode};
    use crate::instr::Instr;
    use crate::model::SimSequence;

    #[test]
    fn check_skip_instruction_length() {
        let ctx = context(HandlerMode::Fast);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        gen_skip_instruction(&mut asm, &ctx).unwrap();
        let expected = privilege_tree_len(2, 3) + handler_return_len(&ctx);
        assert_eq!(seq.instruction_count(), expected);
        // Fall-through arm of the return tree is the lowest level
        let last = 4 * (expected as u64 - 1);
        assert_eq!(seq.instruction_at(last), Some(&Instr::Sret));
    }
}
