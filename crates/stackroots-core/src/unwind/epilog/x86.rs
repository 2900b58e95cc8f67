//! x86 epilogs.
//!
//! EBP frames restore ESP from EBP before popping, frameless methods drop
//! their locals with `pop ecx` or `add esp`. Dynamically aligned frames then
//! switch to the EBX frame to reach the real return address.
//!
//! ```text
//! lea esp, [ebp-d]        8D 65 ib | 8D A5 id
//! mov esp, ebp            8B E5
//! mov esp, ebx            8B E3
//! add esp, imm            83 C4 ib | 81 C4 id
//! pop ecx/ebx/ebp/esi/edi 59 5B 5D 5E 5F
//! ret | rep ret | ret N   C3 | F3 C3 | C2 iw
//! jmp rel32 | jmp [m]     E9 id | FF xx xx xx xx xx
//! ```

use super::{EpilogOp, EpilogProgram, Expectation};
use crate::error::{Result, WalkError};
use crate::gcinfo::{Amd64SavedRegs, GcInfoHeader};
use crate::regdisplay::regs::x86;
use crate::varint::VarIntReader;

pub(crate) fn decode(bytes: &[u8]) -> Result<EpilogProgram>
{
    let mut reader = VarIntReader::new(bytes);
    let mut program = EpilogProgram::default();

    loop {
        let start = reader.position();
        let byte = reader.read_u8()?;
        let op = match byte {
            0x8d => match reader.read_u8()? {
                0x65 => EpilogOp::SetSpFromFrame {
                    reg: x86::EBP,
                    displacement: i32::from(reader.read_u8()? as i8),
                },
                0xa5 => EpilogOp::SetSpFromFrame {
                    reg: x86::EBP,
                    displacement: reader.read_i32()?,
                },
                _ => return Err(unknown(bytes, start)),
            },
            0x8b => match reader.read_u8()? {
                0xe5 => EpilogOp::SetSpFromFrame {
                    reg: x86::EBP,
                    displacement: 0,
                },
                0xe3 => EpilogOp::SetSpFromFrame {
                    reg: x86::EBX,
                    displacement: 0,
                },
                _ => return Err(unknown(bytes, start)),
            },
            0x83 if reader.read_u8()? == 0xc4 => EpilogOp::AddSp(u32::from(reader.read_u8()?)),
            0x81 if reader.read_u8()? == 0xc4 => EpilogOp::AddSp(reader.read_u32()?),
            0x59 | 0x5b | 0x5d | 0x5e | 0x5f => EpilogOp::Pop(byte - 0x58),
            0xc3 => EpilogOp::Return { pop_size: 0 },
            0xf3 if reader.read_u8()? == 0xc3 => EpilogOp::Return { pop_size: 0 },
            0xc2 => EpilogOp::Return {
                pop_size: u32::from(reader.read_u16()?),
            },
            0xe9 => {
                reader.skip(4)?;
                EpilogOp::TailCall
            }
            0xff => {
                reader.skip(5)?;
                EpilogOp::TailCall
            }
            _ => return Err(unknown(bytes, start)),
        };

        program.push(start, reader.position() - start, op);
        if op.is_terminator() {
            return Ok(program);
        }
    }
}

fn unknown(bytes: &[u8], offset: usize) -> WalkError
{
    WalkError::UnknownEpilogOpcode {
        offset: offset as u32,
        byte: bytes.get(offset).copied().unwrap_or(0),
    }
}

const POP_ORDER: [(Amd64SavedRegs, u8); 3] = [
    (Amd64SavedRegs::RBX, x86::EBX),
    (Amd64SavedRegs::RSI, x86::ESI),
    (Amd64SavedRegs::RDI, x86::EDI),
];

/// Register area size below EBP, not counting EBP itself
fn save_size_without_ebp(header: &GcInfoHeader) -> u32
{
    let mut size = header.preserved_regs_save_size();
    if header.has_frame_pointer {
        size = size.saturating_sub(header.arch.pointer_size() as u32);
    }
    size
}

pub(crate) fn verify(header: &GcInfoHeader, expect: &mut Expectation<'_>) -> Result<()>
{
    let frame_size = header.frame_size;

    if header.has_frame_pointer {
        let save_size = save_size_without_ebp(header);
        let distance = i64::from(frame_size + save_size);
        let localloc = matches!(expect.peek(), Some(step) if step.len >= 3
            && matches!(step.op, EpilogOp::SetSpFromFrame { reg: x86::EBP, .. }));
        if save_size > 0 || localloc {
            expect.step(|step| {
                step.op
                    == EpilogOp::SetSpFromFrame {
                        reg: x86::EBP,
                        displacement: -distance as i32,
                    }
                    && step.len == if distance <= 128 { 3 } else { 6 }
            })?;
            verify_pops(header, expect)?;
        }
        if frame_size > 0 {
            expect.step(|step| {
                step.len == 2
                    && step.op
                        == EpilogOp::SetSpFromFrame {
                            reg: x86::EBP,
                            displacement: 0,
                        }
            })?;
        }
        expect.step(|step| step.op == EpilogOp::Pop(x86::EBP))?;
        if header.has_dynamic_alignment() {
            expect.step(|step| {
                step.op
                    == EpilogOp::SetSpFromFrame {
                        reg: x86::EBX,
                        displacement: 0,
                    }
            })?;
            expect.step(|step| step.op == EpilogOp::Pop(x86::EBX))?;
        }
    } else {
        if frame_size == 4 {
            expect.step(|step| step.op == EpilogOp::Pop(x86::ECX))?;
        } else if frame_size != 0 {
            let short = i8::try_from(frame_size).is_ok();
            expect.step(|step| step.op == EpilogOp::AddSp(frame_size) && step.len == if short { 3 } else { 6 })?;
        }
        verify_pops(header, expect)?;
    }

    let pop_size = header.return_pop_size();
    expect.step(|step| match step.op {
        EpilogOp::TailCall => true,
        EpilogOp::Return { pop_size: 0 } => pop_size == 0 && step.len <= 2,
        EpilogOp::Return { pop_size: found } => found == pop_size && step.len == 3,
        _ => false,
    })?;
    Ok(())
}

fn verify_pops(header: &GcInfoHeader, expect: &mut Expectation<'_>) -> Result<()>
{
    for (mask, reg) in POP_ORDER {
        if header.is_reg_saved(mask.bits()) {
            expect.step(|step| step.op == EpilogOp::Pop(reg))?;
        }
    }
    Ok(())
}

/// Encode the epilog `header` describes, ending in `ret`/`ret N`.
pub fn encode(header: &GcInfoHeader) -> Vec<u8>
{
    let mut out = Vec::new();
    let frame_size = header.frame_size;

    if header.has_frame_pointer {
        let save_size = save_size_without_ebp(header);
        let distance = frame_size + save_size;
        if save_size > 0 {
            if distance <= 128 {
                out.extend_from_slice(&[0x8d, 0x65, (distance as i32).wrapping_neg() as u8]);
            } else {
                out.extend_from_slice(&[0x8d, 0xa5]);
                out.extend_from_slice(&(distance as i32).wrapping_neg().to_le_bytes());
            }
            encode_pops(header, &mut out);
        }
        if frame_size > 0 {
            out.extend_from_slice(&[0x8b, 0xe5]);
        }
        out.push(0x5d);
        if header.has_dynamic_alignment() {
            out.extend_from_slice(&[0x8b, 0xe3, 0x5b]);
        }
    } else {
        if frame_size == 4 {
            out.push(0x59);
        } else if let Ok(short) = i8::try_from(frame_size) {
            if short != 0 {
                out.extend_from_slice(&[0x83, 0xc4, short as u8]);
            }
        } else {
            out.extend_from_slice(&[0x81, 0xc4]);
            out.extend_from_slice(&frame_size.to_le_bytes());
        }
        encode_pops(header, &mut out);
    }

    match u16::try_from(header.return_pop_size()) {
        Ok(0) | Err(_) => out.push(0xc3),
        Ok(pop_size) => {
            out.push(0xc2);
            out.extend_from_slice(&pop_size.to_le_bytes());
        }
    }
    out
}

fn encode_pops(header: &GcInfoHeader, out: &mut Vec<u8>)
{
    for (mask, reg) in POP_ORDER {
        if header.is_reg_saved(mask.bits()) {
            out.push(0x58 + reg);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;
    use crate::unwind::epilog::verify_epilog_bytes;

    #[test]
    fn test_ebp_frame_epilog()
    {
        let header = GcInfoHeader {
            has_frame_pointer: true,
            frame_size: 0x10,
            saved_regs: (Amd64SavedRegs::RBX | Amd64SavedRegs::RSI | Amd64SavedRegs::RBP).bits(),
            return_pop_size: 8,
            ..GcInfoHeader::new(Architecture::X86)
        };
        let bytes = encode(&header);
        assert_eq!(bytes, vec![0x8d, 0x65, 0xe8, 0x5b, 0x5e, 0x8b, 0xe5, 0x5d, 0xc2, 0x08, 0x00]);
        verify_epilog_bytes(&header, &bytes).unwrap();
    }

    #[test]
    fn test_wrong_pop_size_rejected()
    {
        let header = GcInfoHeader {
            frame_size: 4,
            saved_regs: Amd64SavedRegs::RDI.bits(),
            ..GcInfoHeader::new(Architecture::X86)
        };
        verify_epilog_bytes(&header, &[0x59, 0x5f, 0xc3]).unwrap();
        let err = verify_epilog_bytes(&header, &[0x59, 0x5f, 0xc2, 0x04, 0x00]).unwrap_err();
        assert!(matches!(err, WalkError::UnknownEpilogOpcode { offset: 2, byte: 0xc2 }));
    }

    #[test]
    fn test_tail_calls()
    {
        let program = decode(&[0x5b, 0xe9, 0x10, 0x20, 0x30, 0x40]).unwrap();
        assert!(program.is_tail_call());
        assert_eq!(program.len(), 6);
        let program = decode(&[0xff, 0x25, 0, 0, 0, 0]).unwrap();
        assert_eq!(program.steps.len(), 1);
    }
}
