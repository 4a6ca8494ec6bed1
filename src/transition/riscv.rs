//! RISC-V state transition handlers, one per element kind

use itertools::Itertools;

use super::helper_gprs::HelperGprSet;
use super::{check_batch, ElementKind, StateElement, StateElementData, StateTransitionHandler};
use crate::assembly::{AssemblyHelper, JAL_OFFSET_WIDTH};
use crate::csr::csr_address;
use crate::error::GenError;
use crate::handlers::trap_csrs;
use crate::instr::{Instr, Reg};
use crate::sequence::{Sequence, SequenceError};
use crate::utils::{fits_signed, lowest_set_bit};

/// vtype for SEW=64, LMUL=1, tail and mask undisturbed
const VTYPE_E64_M1: u32 = 0b011 << 3;

/// Handlers for every element kind
pub fn default_handlers<S: Sequence + ?Sized>() -> Vec<Box<dyn StateTransitionHandler<S>>> {
    let handlers: [Box<dyn StateTransitionHandler<S>>; 8] = [
        Box::new(MemoryHandler),
        Box::new(VmContextHandler),
        Box::new(SystemRegisterHandler),
        Box::new(VectorRegisterHandler),
        Box::new(FloatingPointRegisterHandler),
        Box::new(GprHandler),
        Box::new(PrivilegeLevelHandler),
        Box::new(PcHandler),
    ];
    handlers.into()
}

/// Run `f` with `count` helper registers, releasing them afterwards
fn with_helpers<S, F>(
    asm: &mut AssemblyHelper<S>,
    helpers: &mut HelperGprSet,
    count: usize,
    f: F,
) -> Result<(), GenError>
where
    S: Sequence + ?Sized,
    F: FnOnce(&mut AssemblyHelper<S>, &[Reg]) -> Result<(), GenError>,
{
    let regs = helpers.acquire_helper_gprs(asm.seq(), count, true)?;
    f(asm, &regs)?;
    helpers.release_helper_gprs(asm)
}

fn check_csr(name: &str) -> Result<(), GenError> {
    csr_address(name)
        .map(|_| ())
        .ok_or_else(|| GenError::UnknownRegister(name.to_string()))
}

/// Write a value to a CSR through one helper. Translation changes
/// are followed by a fence.
fn gen_write_csr_value<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    helpers: &mut HelperGprSet,
    name: &str,
    value: u64,
) -> Result<(), GenError> {
    check_csr(name)?;
    with_helpers(asm, helpers, 1, |asm, regs| {
        asm.gen_move_immediate(regs[0], value)?;
        asm.gen_write_system_register(name, regs[0])?;
        if name == "satp" {
            asm.gen_instruction(Instr::SfenceVma { rs1: 0, rs2: 0 })?;
        }
        Ok(())
    })?;
    asm.seq().set_register_value(name, value)?;
    Ok(())
}

/// Stores doublewords, reusing the base register while the next
/// address is within reach of a store offset
pub struct MemoryHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for MemoryHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::Memory
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        if element.kind() != ElementKind::Memory {
            return Ok(false);
        }
        self.process_state_elements(asm, helpers, std::slice::from_ref(element))?;
        Ok(true)
    }

    fn process_state_elements(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        elements: &[StateElement],
    ) -> Result<(), GenError> {
        check_batch(ElementKind::Memory, elements)?;
        let stores: Vec<(u64, u64)> = elements
            .iter()
            .filter_map(|e| match e.data {
                StateElementData::Memory { address, value } => Some((address, value)),
                _ => None,
            })
            .collect();
        if let Some(&(address, _)) = stores.iter().find(|(address, _)| address % 8 != 0) {
            return Err(GenError::MisalignedMemoryElement(address));
        }
        with_helpers(asm, helpers, 2, |asm, regs| {
            let (base, data) = (regs[0], regs[1]);
            let mut base_value = None;
            for (address, value) in stores {
                let reachable = base_value
                    .map(|base: u64| address.wrapping_sub(base) as i64)
                    .filter(|&offset| fits_signed(offset, 12));
                let offset = match reachable {
                    Some(offset) => offset,
                    None => {
                        asm.gen_move_immediate(base, address)?;
                        base_value = Some(address);
                        0
                    }
                };
                asm.gen_move_immediate(data, value)?;
                asm.gen_store(data, base, offset as i32)?;
            }
            Ok(())
        })
    }
}

/// Read-modify-write of virtual memory control register fields,
/// one write per register
pub struct VmContextHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for VmContextHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::VmContext
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        if element.kind() != ElementKind::VmContext {
            return Ok(false);
        }
        self.process_state_elements(asm, helpers, std::slice::from_ref(element))?;
        Ok(true)
    }

    fn process_state_elements(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        elements: &[StateElement],
    ) -> Result<(), GenError> {
        check_batch(ElementKind::VmContext, elements)?;
        let fields: Vec<(&str, &str, u64)> = elements
            .iter()
            .filter_map(|e| match &e.data {
                StateElementData::VmContext {
                    register,
                    field,
                    value,
                } => Some((register.as_str(), field.as_str(), *value)),
                _ => None,
            })
            .collect();
        for register in fields.iter().map(|&(register, _, _)| register).unique() {
            let mut combined = asm.seq().read_register(register)?;
            for &(_, field, value) in fields.iter().filter(|f| f.0 == register) {
                let mask = asm.seq().register_field_mask(register, &[field])?;
                let shift = lowest_set_bit(mask).unwrap_or(0);
                combined = (combined & !mask) | ((value << shift) & mask);
            }
            gen_write_csr_value(asm, helpers, register, combined)?;
        }
        Ok(())
    }
}

/// CSR writes. vl and vtype can only be written together, through
/// vsetvl, so the other one keeps its modelled value.
pub struct SystemRegisterHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for SystemRegisterHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::SystemRegister
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::SystemRegister { name, value } = &element.data else {
            return Ok(false);
        };
        match name.as_str() {
            "vl" | "vtype" => {
                let (avl, vtype) = if name == "vl" {
                    (*value, asm.seq().read_register("vtype")?)
                } else {
                    (asm.seq().read_register("vl")?, *value)
                };
                with_helpers(asm, helpers, 2, |asm, regs| {
                    asm.gen_move_immediate(regs[0], avl)?;
                    asm.gen_move_immediate(regs[1], vtype)?;
                    asm.gen_instruction(Instr::Vsetvl {
                        rd: 0,
                        rs1: regs[0],
                        rs2: regs[1],
                    })
                })?;
                asm.seq().set_register_value("vl", avl)?;
                asm.seq().set_register_value("vtype", vtype)?;
            }
            _ => gen_write_csr_value(asm, helpers, name, *value)?,
        }
        Ok(true)
    }
}

/// Fills a vector register one 64-bit element at a time by sliding
/// values in from the top
pub struct VectorRegisterHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for VectorRegisterHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::VectorRegister
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::VectorRegister { index, values } = &element.data else {
            return Ok(false);
        };
        let index = *index;
        if index > 31 {
            return Err(GenError::UnknownRegister(format!("v{index}")));
        }
        let expected = (asm.seq().read_register("vlenb")? / 8) as usize;
        if values.len() != expected {
            return Err(GenError::VectorElementCount {
                index,
                expected,
                actual: values.len(),
            });
        }
        with_helpers(asm, helpers, 3, |asm, regs| {
            let (vl, vtype, elem) = (regs[0], regs[1], regs[2]);
            asm.gen_read_system_register(vl, "vl")?;
            asm.gen_read_system_register(vtype, "vtype")?;
            // rd != x0 with rs1 == x0 selects VLMAX
            asm.gen_instruction(Instr::Vsetvli {
                rd: elem,
                rs1: 0,
                vtypei: VTYPE_E64_M1,
            })?;
            for &value in values {
                asm.gen_move_immediate(elem, value)?;
                asm.gen_instruction(Instr::Vslide1downVx {
                    vd: index,
                    vs2: index,
                    rs1: elem,
                })?;
            }
            asm.gen_instruction(Instr::Vsetvl {
                rd: 0,
                rs1: vl,
                rs2: vtype,
            })
        })?;
        Ok(true)
    }
}

pub struct FloatingPointRegisterHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for FloatingPointRegisterHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::FloatingPointRegister
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::FloatingPointRegister { index, value } = element.data else {
            return Ok(false);
        };
        if index > 31 {
            return Err(GenError::UnknownRegister(format!("f{index}")));
        }
        with_helpers(asm, helpers, 1, |asm, regs| {
            asm.gen_move_immediate(regs[0], value)?;
            asm.gen_instruction(Instr::FmvDX {
                fd: index,
                rs1: regs[0],
            })
        })?;
        Ok(true)
    }
}

pub struct GprHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for GprHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::Gpr
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::Gpr { index, value } = element.data else {
            return Ok(false);
        };
        if index == 0 || index > 31 {
            return Err(SequenceError::InvalidGpr(index).into());
        }
        asm.gen_move_immediate(index, value)?;
        asm.seq().set_register_value(&format!("x{index}"), value)?;
        helpers.protect(index);
        Ok(true)
    }
}

/// Drops to a lower privilege level with a trap return to the next
/// instruction
pub struct PrivilegeLevelHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for PrivilegeLevelHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::PrivilegeLevel
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::PrivilegeLevel(target) = element.data else {
            return Ok(false);
        };
        let current = asm.seq().privilege_level();
        if target == current {
            return Ok(true);
        }
        if target > current {
            return Err(GenError::UnsupportedPrivilegeSwitch {
                from: current,
                to: target,
            });
        }
        let csrs = trap_csrs(current)?;
        let mask = asm
            .seq()
            .register_field_mask(csrs.status, &[csrs.previous_privilege])?;
        let shift = lowest_set_bit(mask).unwrap_or(0);
        let cleared = asm.seq().read_register(csrs.status)? & !mask;
        let status = cleared | ((u64::from(target.value()) << shift) & mask);
        with_helpers(asm, helpers, 1, |asm, regs| {
            let t = regs[0];
            asm.gen_move_immediate(t, status)?;
            asm.gen_write_system_register(csrs.status, t)?;
            // xepc = address after the trap return
            asm.gen_instruction(Instr::Auipc { rd: t, imm20: 0 })?;
            asm.gen_add_immediate(t, t, 16)?;
            asm.gen_write_system_register(csrs.epc, t)?;
            asm.gen_instruction(csrs.ret)
        })?;
        // The trap return resets the previous privilege field
        asm.seq().set_register_value(csrs.status, cleared)?;
        asm.seq().set_privilege_level(target);
        Ok(true)
    }
}

pub struct PcHandler;

impl<S: Sequence + ?Sized> StateTransitionHandler<S> for PcHandler {
    fn element_kind(&self) -> ElementKind {
        ElementKind::Pc
    }

    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError> {
        let StateElementData::Pc(target) = element.data else {
            return Ok(false);
        };
        if target == asm.pc() {
            return Ok(true);
        }
        match asm.get_branch_offset(target, JAL_OFFSET_WIDTH) {
            Ok(offset) => asm.gen_relative_branch(offset)?,
            Err(_) => {
                let exclude = helpers.excluded();
                let reg = asm
                    .seq()
                    .arbitrary_gprs(1, &exclude)
                    .and_then(|regs| regs.first().copied())
                    .ok_or(GenError::NoJumpRegister(target))?;
                asm.gen_absolute_branch_to_address(reg, target)?;
            }
        }
        asm.seq().set_pc(target);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::instr::{CsrOp, Width};
    use crate::model::SimSequence;
    use crate::privilege::PrivilegeLevel;
    use crate::transition::{State, StateTransition, StateTransitionType};

    fn transition(seq: &mut SimSequence, state: &State) -> Result<(), GenError> {
        StateTransition::new_riscv().transition_to_state(seq, state, StateTransitionType::Explicit)
    }

    fn instrs(seq: &SimSequence) -> Vec<Instr> {
        seq.image().values().copied().collect()
    }

    fn csr_writes(seq: &SimSequence) -> Vec<u16> {
        instrs(seq)
            .into_iter()
            .filter_map(|i| match i {
                Instr::Csr {
                    op: CsrOp::Rw, csr, ..
                } => Some(csr),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn check_memory_base_reuse() {
        let mut seq = SimSequence::new(1);
        let mut state = State::new();
        state
            .add_memory(0x8000, 1, 0)
            .add_memory(0x8008, 2, 0)
            .add_memory(0x9000, 3, 0);
        transition(&mut seq, &state).unwrap();
        let offsets: Vec<i32> = instrs(&seq)
            .into_iter()
            .filter_map(|i| match i {
                Instr::Store {
                    width: Width::Double,
                    offset,
                    ..
                } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 8, 0]);
    }

    #[test]
    fn check_misaligned_memory() {
        let mut seq = SimSequence::new(1);
        let mut state = State::new();
        state.add_memory(0x8000, 1, 0).add_memory(0x8004, 2, 0);
        assert_eq!(
            transition(&mut seq, &state),
            Err(GenError::MisalignedMemoryElement(0x8004))
        );
        assert_eq!(seq.instruction_count(), 0);
    }

    #[test]
    fn check_satp_write_fenced() {
        let mut seq = SimSequence::new(1);
        let mut state = State::new();
        state.add_system_register("satp", 0x8000_0000_0008_0000, 0);
        transition(&mut seq, &state).unwrap();
        assert_eq!(instrs(&seq).last(), Some(&Instr::SfenceVma { rs1: 0, rs2: 0 }));
        assert_eq!(seq.read_register("satp").unwrap(), 0x8000_0000_0008_0000);
    }

    #[test]
    fn check_vl_keeps_modelled_vtype() {
        let mut seq = SimSequence::new(1);
        seq.set_register_value("vtype", 0x18).unwrap();
        let mut state = State::new();
        state.add_system_register("vl", 2, 0);
        transition(&mut seq, &state).unwrap();
        assert!(matches!(instrs(&seq).last(), Some(Instr::Vsetvl { rd: 0, .. })));
        assert_eq!(seq.read_register("vl").unwrap(), 2);
        assert_eq!(seq.read_register("vtype").unwrap(), 0x18);
    }

    #[test]
    fn check_vector_register_element_count() {
        let mut seq = SimSequence::new(1);
        let mut state = State::new();
        state.add_vector_register(4, vec![1, 2, 3], 0);
        assert_eq!(
            transition(&mut seq, &state),
            Err(GenError::VectorElementCount {
                index: 4,
                expected: 2,
                actual: 3
            })
        );

        let mut state = State::new();
        state.add_vector_register(4, vec![1, 2], 0);
        transition(&mut seq, &state).unwrap();
        let slides = instrs(&seq)
            .into_iter()
            .filter(|i| matches!(i, Instr::Vslide1downVx { vd: 4, vs2: 4, .. }))
            .count();
        assert_eq!(slides, 2);
    }

    #[test]
    fn check_vm_context_fields_combined() {
        let mut seq = SimSequence::new(1);
        seq.set_register_value("satp", 0x1234 << 44).unwrap();
        let mut state = State::new();
        state
            .add_vm_context("satp", "MODE", 8, 0)
            .add_vm_context("satp", "PPN", 0x80000, 0);
        transition(&mut seq, &state).unwrap();
        // One write for both fields, ASID kept
        assert_eq!(csr_writes(&seq).len(), 1);
        assert_eq!(
            seq.read_register("satp").unwrap(),
            (8 << 60) | (0x1234 << 44) | 0x80000
        );
    }

    #[test]
    fn check_gpr_protected_from_helpers() {
        let mut seq = SimSequence::new(1);
        seq.set_arbitrary_gprs([5, 6]);
        let mut state = State::new();
        state.add_gpr(5, 42, 0).add_privilege_level(PrivilegeLevel::Supervisor, 0);
        transition(&mut seq, &state).unwrap();
        assert_eq!(seq.gpr_value(5).unwrap(), 42);
        // The privilege switch used x6, not the x5 just set
        let writes_x5 = instrs(&seq)
            .into_iter()
            .filter(|i| matches!(i, Instr::OpImm { rd: 5, .. } | Instr::Lui { rd: 5, .. }))
            .count();
        assert_eq!(writes_x5, 1);
    }

    #[test]
    fn check_privilege_level_switch() {
        let mut seq = SimSequence::new(1);
        let mut state = State::new();
        state.add_privilege_level(PrivilegeLevel::Supervisor, 0);
        transition(&mut seq, &state).unwrap();
        assert_eq!(seq.privilege_level(), PrivilegeLevel::Supervisor);
        let code = instrs(&seq);
        assert_eq!(code.last(), Some(&Instr::Mret));
        let auipc = code
            .iter()
            .position(|i| matches!(i, Instr::Auipc { .. }))
            .unwrap();
        assert_eq!(code.len() - auipc, 4);

        let mut state = State::new();
        state.add_privilege_level(PrivilegeLevel::Machine, 0);
        assert_eq!(
            transition(&mut seq, &state),
            Err(GenError::UnsupportedPrivilegeSwitch {
                from: PrivilegeLevel::Supervisor,
                to: PrivilegeLevel::Machine
            })
        );
    }

    #[test]
    fn check_pc_near_and_far() {
        let mut seq = SimSequence::new(1);
        seq.set_pc(0x1000);
        let mut state = State::new();
        state.add_pc(0x2000, 0);
        transition(&mut seq, &state).unwrap();
        assert_eq!(
            seq.instruction_at(0x1000),
            Some(&Instr::Jal {
                rd: 0,
                offset: 0x1000
            })
        );
        assert_eq!(seq.pc(), 0x2000);

        let mut state = State::new();
        state.add_pc(0x1_0000_0000, 0);
        transition(&mut seq, &state).unwrap();
        assert!(matches!(
            seq.instructions_between(0x2000, 0x2100).last(),
            Some((_, Instr::Jalr { rd: 0, .. }))
        ));

        seq.set_pc(0x3000);
        seq.set_arbitrary_gprs([]);
        assert_eq!(
            transition(&mut seq, &state),
            Err(GenError::NoJumpRegister(0x1_0000_0000))
        );
    }
}
