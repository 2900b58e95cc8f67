//! ARM (Thumb-2) epilogs, decoded one halfword at a time.
//!
//! ```text
//! mov sp, r7                      46BD
//! add sp, #imm7*4                 B0xx
//! add sp, rN, #imm12              F20x 0Dxx (and the i bit variant)
//! movw/movt r12, #imm16           F24x 0Cxx / F2Cx 0Cxx, then add sp, sp, r12 (EB0D 0D0C)
//! vpop {dF..}                     ECBD/ECFD 0Bxx
//! pop {regs}                      BCxx/BDxx | E8BD mask | F85D x B04
//! ldr pc, [sp], #n                F85D FBnn
//! bx reg                          47xx
//! b.w imm                         F0xx-F7xx 9xxx/Bxxx
//! ```

use super::{EpilogOp, EpilogProgram, Expectation};
use crate::error::{Result, WalkError};
use crate::gcinfo::{ArmSavedRegs, GcInfoHeader};
use crate::regdisplay::regs::arm;
use crate::varint::VarIntReader;

const POP_PC: u16 = 1 << 15;
const POP_LR: u16 = 1 << 14;

/// 12-bit Thumb-2 modified immediate split over `i:imm3:imm8`
fn imm12(first: u16, second: u16) -> u32
{
    (u32::from((first >> 10) & 1) << 11) | (u32::from((second >> 12) & 7) << 8) | u32::from(second & 0xff)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<EpilogProgram>
{
    let mut reader = VarIntReader::new(bytes);
    let mut program = EpilogProgram::default();
    let mut scratch = 0u32;

    loop {
        let start = reader.position();
        let first = reader.read_u16()?;
        let op = if first == 0x46bd {
            EpilogOp::SetSpFromFrame {
                reg: arm::R7,
                displacement: 0,
            }
        } else if first & 0xff80 == 0xb000 {
            EpilogOp::AddSp(u32::from(first & 0x7f) << 2)
        } else if first & 0xfe00 == 0xbc00 {
            let mut mask = first & 0xff;
            if first & 0x100 != 0 {
                mask |= POP_PC;
            }
            EpilogOp::PopRegs(mask)
        } else if first & 0xff87 == 0x4700 {
            if (first & 0x78) >> 3 == u16::from(arm::LR) {
                EpilogOp::BranchToLr
            } else {
                EpilogOp::TailCall
            }
        } else {
            let second = reader.read_u16()?;
            if first & 0xfbf0 == 0xf200 && second & 0x8f00 == 0x0d00 {
                let reg = (first & 0xf) as u8;
                let amount = imm12(first, second);
                if reg == arm::SP {
                    EpilogOp::AddSp(amount)
                } else {
                    EpilogOp::SetSpFromFrame {
                        reg,
                        displacement: amount as i32,
                    }
                }
            } else if first & 0xfbf0 == 0xf240 && second & 0x8f00 == 0x0c00 {
                let value = (u32::from(first & 0xf) << 12) | imm12(first, second);
                scratch = value;
                EpilogOp::LoadImmediate(value as u16)
            } else if first & 0xfbf0 == 0xf2c0 && second & 0x8f00 == 0x0c00 {
                let value = (u32::from(first & 0xf) << 12) | imm12(first, second);
                scratch |= value << 16;
                EpilogOp::LoadImmediate(value as u16)
            } else if first == 0xeb0d && second == 0x0d0c {
                EpilogOp::AddSp(scratch)
            } else if first & !0x40 == 0xecbd && second & 0x0f01 == 0x0b00 {
                EpilogOp::PopVfp {
                    first: ((((first >> 6) & 1) << 4) | (second >> 12)) as u8,
                    count: ((second & 0xff) >> 1) as u8,
                }
            } else if first == 0xe8bd {
                EpilogOp::PopRegs(second)
            } else if first == 0xf85d && second & 0x0fff == 0x0b04 {
                EpilogOp::PopRegs(1 << (second >> 12))
            } else if first == 0xf85d && second & 0xff00 == 0xfb00 {
                EpilogOp::LoadPc(u32::from(second & 0xff))
            } else if first & 0xf800 == 0xf000 && second & 0xd000 == 0x9000 {
                EpilogOp::TailCall
            } else {
                return Err(WalkError::UnknownEpilogOpcode {
                    offset: start as u32,
                    byte: first as u8,
                });
            }
        };

        program.push(start, reader.position() - start, op);
        if op.is_terminator() {
            return Ok(program);
        }
    }
}

/// Registers the prolog pushed, as a pop mask with LR in the PC position
fn expected_pop_mask(header: &GcInfoHeader) -> u16
{
    let mut mask = (header.saved_regs & 0xff) << 4;
    if header.is_reg_saved(ArmSavedRegs::LR.bits()) {
        mask |= POP_PC;
    }
    mask
}

pub(crate) fn verify(header: &GcInfoHeader, expect: &mut Expectation<'_>) -> Result<()>
{
    let frame_size = header.frame_size;
    let r7_frame = header.has_frame_pointer;
    let mut r7_cleanup = false;
    let mut stack_pop = 0u32;

    if let Some(step) = expect.optional(|step| {
        step.len == 2
            && step.op
                == EpilogOp::SetSpFromFrame {
                    reg: arm::R7,
                    displacement: 0,
                }
    }) {
        if !r7_frame {
            return Err(expect.mismatch(step.offset));
        }
        r7_cleanup = true;
    }

    if frame_size > 0 || r7_frame {
        // movw, then an optional movt
        for _ in 0..2 {
            expect.optional(|step| matches!(step.op, EpilogOp::LoadImmediate(_)));
        }
        if let Some(step) = expect.optional(|step| matches!(step.op, EpilogOp::AddSp(_) | EpilogOp::SetSpFromFrame { .. })) {
            match step.op {
                EpilogOp::AddSp(amount) => stack_pop = amount,
                EpilogOp::SetSpFromFrame { reg, displacement } if reg == arm::R7 && r7_frame => {
                    r7_cleanup = true;
                    stack_pop = displacement as u32;
                }
                _ => return Err(expect.mismatch(step.offset)),
            }
        }
    }

    let mut vfp_first = u32::from(header.vfp_first_pushed);
    let mut vfp_count = u32::from(header.vfp_pushed_count);
    while let Some(step) = expect.optional(|step| matches!(step.op, EpilogOp::PopVfp { .. })) {
        let EpilogOp::PopVfp { first, count } = step.op else {
            continue;
        };
        if vfp_count == 0 || u32::from(first) != vfp_first || u32::from(count) > vfp_count {
            return Err(expect.mismatch(step.offset));
        }
        vfp_first += u32::from(count);
        vfp_count -= u32::from(count);
    }
    if vfp_count != 0 {
        let offset = expect.peek().map_or(0, |step| step.offset);
        return Err(expect.mismatch(offset));
    }

    let pop = expect.optional(|step| matches!(step.op, EpilogOp::PopRegs(_)));
    let pop_offset = pop.map_or(0, |step| step.offset);
    let mut popped = match pop.map(|step| step.op) {
        Some(EpilogOp::PopRegs(mask)) => mask,
        _ => 0,
    };

    // Popping low registers is another way to drop the locals.
    if stack_pop == 0 && popped & 0x0f != 0 {
        stack_pop = (popped & 0x0f).count_ones() * 4;
        popped &= !0x0f;
    }

    let frame_ok = if r7_cleanup || !r7_frame {
        stack_pop == frame_size
    } else {
        stack_pop >= frame_size
    };
    if !frame_ok {
        return Err(expect.mismatch(pop_offset));
    }

    let mut cleanup_words = header.parm_regs_pushed_count();
    let expected = expected_pop_mask(header);
    if expected == popped {
        if popped & POP_PC != 0 {
            if cleanup_words != 0 {
                return Err(expect.mismatch(pop_offset));
            }
            return Ok(());
        }
    } else {
        // LR popped instead of PC, then a `bx` or a stack cleanup
        let swapped = expected ^ (POP_PC | POP_LR);
        if swapped == popped | POP_LR && popped & POP_LR == 0 {
            cleanup_words += 1;
        } else if swapped != popped {
            return Err(expect.mismatch(pop_offset));
        }
    }

    if cleanup_words != 0 {
        let step = expect.step(|step| {
            step.op == EpilogOp::LoadPc(cleanup_words * 4)
                || (step.op == EpilogOp::AddSp(cleanup_words * 4) && step.len == 2)
        })?;
        if matches!(step.op, EpilogOp::LoadPc(_)) {
            return Ok(());
        }
    }

    expect.step(|step| matches!(step.op, EpilogOp::BranchToLr | EpilogOp::TailCall))?;
    Ok(())
}

/// Encode the usual epilog for `header`: frame cleanup, `vpop`, `pop {.., pc}`.
///
/// Methods that pushed argument registers pop LR and finish with
/// `ldr pc, [sp], #n`.
pub fn encode(header: &GcInfoHeader) -> Vec<u8>
{
    let mut halfwords: Vec<u16> = Vec::new();
    let frame_size = header.frame_size;

    if header.has_frame_pointer {
        halfwords.push(0x46bd);
    }
    if frame_size > 0 || header.has_frame_pointer {
        if frame_size < 0x200 && frame_size % 4 == 0 {
            halfwords.push(0xb000 | (frame_size >> 2) as u16);
        } else {
            let imm = frame_size & 0xfff;
            halfwords.push(0xf20d | (((imm >> 11) & 1) << 10) as u16);
            halfwords.push(0x0d00 | (((imm >> 8) & 7) << 12) as u16 | (imm & 0xff) as u16);
        }
    }
    if header.vfp_pushed_count > 0 {
        let first = u16::from(header.vfp_first_pushed);
        halfwords.push(0xecbd | ((first >> 4) & 1) << 6);
        halfwords.push(((first & 0xf) << 12) | 0x0b00 | (u16::from(header.vfp_pushed_count) << 1));
    }

    let cleanup = header.parm_regs_pushed_count();
    let mut mask = expected_pop_mask(header);
    if cleanup != 0 && mask & POP_PC != 0 {
        mask &= !POP_PC;
    }
    if mask != 0 {
        if mask & !(0xff | POP_PC) == 0 {
            halfwords.push(0xbc00 | (mask & 0xff) | if mask & POP_PC != 0 { 0x100 } else { 0 });
        } else {
            halfwords.push(0xe8bd);
            halfwords.push(mask);
        }
    }
    if cleanup != 0 {
        let words = cleanup + u32::from(header.is_reg_saved(ArmSavedRegs::LR.bits()));
        halfwords.push(0xf85d);
        halfwords.push(0xfb00 | (words * 4) as u16);
    } else if mask & POP_PC == 0 {
        halfwords.push(0x4770);
    }

    halfwords.iter().flat_map(|halfword| halfword.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;
    use crate::unwind::epilog::verify_epilog_bytes;

    fn header() -> GcInfoHeader
    {
        GcInfoHeader {
            has_frame_pointer: true,
            frame_size: 8,
            saved_regs: (ArmSavedRegs::R4 | ArmSavedRegs::R7 | ArmSavedRegs::R11 | ArmSavedRegs::LR).bits(),
            vfp_first_pushed: 8,
            vfp_pushed_count: 2,
            ..GcInfoHeader::new(Architecture::Arm)
        }
    }

    #[test]
    fn test_decode_pop_pc()
    {
        let program = decode(&encode(&header())).unwrap();
        let ops: Vec<_> = program.steps.iter().map(|step| step.op).collect();
        assert_eq!(
            ops,
            vec![
                EpilogOp::SetSpFromFrame {
                    reg: arm::R7,
                    displacement: 0,
                },
                EpilogOp::AddSp(8),
                EpilogOp::PopVfp { first: 8, count: 2 },
                EpilogOp::PopRegs(0x0890 | POP_PC),
            ]
        );
        assert_eq!(program.steps[2].offset, 4);
        assert_eq!(program.steps[3].len, 4);
    }

    #[test]
    fn test_encoded_epilogs_verify()
    {
        let mut header = header();
        verify_epilog_bytes(&header, &encode(&header)).unwrap();

        header.parm_regs_pushed = 0b0011;
        let bytes = encode(&header);
        let program = decode(&bytes).unwrap();
        assert_eq!(program.steps.last().map(|step| step.op), Some(EpilogOp::LoadPc(12)));
        verify_epilog_bytes(&header, &bytes).unwrap();
    }

    #[test]
    fn test_bx_lr_and_tail_branch()
    {
        let program = decode(&[0x10, 0xbd, 0x70, 0x47]).unwrap();
        assert_eq!(program.steps.len(), 1);
        let program = decode(&[0x10, 0xb0, 0x70, 0x47]).unwrap();
        assert_eq!(program.steps[1].op, EpilogOp::BranchToLr);
        let program = decode(&[0x00, 0xf0, 0x00, 0xb8]).unwrap();
        assert!(program.is_tail_call());
    }

    #[test]
    fn test_vfp_mismatch_rejected()
    {
        let mut expected = header();
        let bytes = encode(&expected);
        expected.vfp_pushed_count = 3;
        let err = verify_epilog_bytes(&expected, &bytes).unwrap_err();
        assert!(matches!(err, WalkError::UnknownEpilogOpcode { offset: 8, .. }));
    }
}
