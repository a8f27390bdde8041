//! Trap-time instruction emulation.
//!
//! A few guest kernel instructions trap with a general protection fault
//! because the guest runs without I/O privilege, and guests built for another
//! hypervisor issue `vmcall`. Both are recognized here by decoding the
//! instruction at the guest's `eip`.
use crate::{
    addressing::{Gva, PAGE_SIZE},
    segments::GUEST_PL,
    vcpu::VCpu,
    VmError,
};
use iced_x86::{Code, Decoder, DecoderOptions, Instruction};
use log::{debug, trace};

/// Longest x86 instruction.
const MAX_INSN_LEN: usize = 15;
/// `int $0x1f; nop`, same length as `vmcall`.
const HYPERCALL_TRAP_INSN: [u8; 3] = [0xcd, 0x1f, 0x90];

impl VCpu {
    /// Fetch and decode the instruction at `eip`.
    fn fetch_instruction(&self) -> Result<Instruction, VmError> {
        let eip = Gva::new(self.regs.eip);
        let mem = self.guest.memory();
        let mut bytes = [0; MAX_INSN_LEN];
        // The instruction may straddle a page boundary.
        let first = (PAGE_SIZE - eip.page_offset() as usize).min(MAX_INSN_LEN);
        mem.read(self.guest_pa(eip)?, &mut bytes[..first])?;
        let mut len = first;
        if first < MAX_INSN_LEN {
            if let Some(gpa) = self.try_guest_pa(eip + first as u32)? {
                mem.read(gpa, &mut bytes[first..])?;
                len = MAX_INSN_LEN;
            }
        }

        let mut decoder =
            Decoder::with_ip(32, &bytes[..len], eip.as_u32() as u64, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
        }
        if insn.is_invalid() {
            Err(VmError::FailedToDecodeInstruction)
        } else {
            Ok(insn)
        }
    }

    fn fetch_kernel_instruction(&self) -> Result<Option<Instruction>, VmError> {
        if self.regs.cs & 3 != GUEST_PL {
            return Ok(None);
        }
        match self.fetch_instruction() {
            Ok(insn) => Ok(Some(insn)),
            Err(VmError::FailedToDecodeInstruction) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Emulate port I/O of the guest kernel. Reads return all ones and writes
    /// go nowhere. Returns whether the instruction was handled.
    pub(crate) fn emulate_insn(&mut self) -> Result<bool, VmError> {
        let Some(insn) = self.fetch_kernel_instruction()? else {
            return Ok(false);
        };
        let eax = &mut self.regs.eax;
        match insn.code() {
            Code::In_AL_imm8 | Code::In_AL_DX => *eax |= 0xff,
            Code::In_AX_imm8 | Code::In_AX_DX => *eax |= 0xffff,
            Code::In_EAX_imm8 | Code::In_EAX_DX => *eax = u32::MAX,
            Code::Out_imm8_AL
            | Code::Out_imm8_AX
            | Code::Out_imm8_EAX
            | Code::Out_DX_AL
            | Code::Out_DX_AX
            | Code::Out_DX_EAX => {}
            _ => return Ok(false),
        }
        trace!("vcpu#{}: emulated {:?} at {:#x}", self.id, insn.code(), self.regs.eip);
        self.regs.eip = self.regs.eip.wrapping_add(insn.len() as u32);
        Ok(true)
    }

    /// Whether the guest kernel stopped on `vmcall`.
    pub(crate) fn is_hypercall(&self) -> Result<bool, VmError> {
        Ok(self
            .fetch_kernel_instruction()?
            .map_or(false, |insn| insn.code() == Code::Vmcall))
    }

    /// Patch the `vmcall` at `eip` into our hypercall trap, which the guest
    /// then executes.
    pub(crate) fn rewrite_hypercall(&mut self) -> Result<(), VmError> {
        let eip = Gva::new(self.regs.eip);
        let gpa = self.guest_pa(eip)?;
        debug!("vcpu#{}: rewriting vmcall at {}", self.id, eip);
        self.guest.memory().write(gpa, &HYPERCALL_TRAP_INSN)
    }
}
