//! x64 epilogs.
//!
//! ```text
//! lea rsp, [rbp+d8/d32]   48 8D 65 ib | 48 8D A5 id     frame pointer methods
//! add rsp, imm8/imm32     48 83 C4 ib | 48 81 C4 id     frameless methods
//! pop r15..r12            41 5F .. 41 5C
//! pop rdi, rsi, rbx       5F 5E 5B
//! pop rbp                 5D                            frame pointer methods
//! ret | rep ret | jmp rax C3 | F3 C3 | 48 FF E0
//! ```

use super::{EpilogOp, EpilogProgram, Expectation};
use crate::error::{Result, WalkError};
use crate::gcinfo::{Amd64SavedRegs, GcInfoHeader};
use crate::regdisplay::regs::amd64;
use crate::varint::VarIntReader;

pub(crate) fn decode(bytes: &[u8]) -> Result<EpilogProgram>
{
    let mut reader = VarIntReader::new(bytes);
    let mut program = EpilogProgram::default();

    loop {
        let start = reader.position();
        let byte = reader.read_u8()?;
        let op = match byte {
            0x48 => match reader.read_u8()? {
                0x8d => match reader.read_u8()? {
                    0x65 => EpilogOp::SetSpFromFrame {
                        reg: amd64::RBP,
                        displacement: i32::from(reader.read_u8()? as i8),
                    },
                    0xa5 => EpilogOp::SetSpFromFrame {
                        reg: amd64::RBP,
                        displacement: reader.read_i32()?,
                    },
                    _ => return Err(unknown(bytes, start)),
                },
                0x83 if reader.read_u8()? == 0xc4 => EpilogOp::AddSp(u32::from(reader.read_u8()?)),
                0x81 if reader.read_u8()? == 0xc4 => EpilogOp::AddSp(reader.read_u32()?),
                0xff if reader.read_u8()? == 0xe0 => EpilogOp::TailCall,
                _ => return Err(unknown(bytes, start)),
            },
            0x41 => match reader.read_u8()? {
                pop @ 0x58..=0x5f => EpilogOp::Pop(amd64::R8 + (pop - 0x58)),
                _ => return Err(unknown(bytes, start)),
            },
            0x58..=0x5f => EpilogOp::Pop(byte - 0x58),
            0xc3 => EpilogOp::Return { pop_size: 0 },
            0xf3 if reader.read_u8()? == 0xc3 => EpilogOp::Return { pop_size: 0 },
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

/// Expected `lea rsp, [rbp+d]` displacement of a frame pointer epilog
pub(crate) fn frame_pointer_displacement(header: &GcInfoHeader) -> i64
{
    let ptr = header.arch.pointer_size() as i64;
    if header.is_frame_pointer_offset_from_sp() {
        i64::from(header.frame_size) - header.frame_pointer_offset_from_sp()
    } else {
        ptr - i64::from(header.preserved_regs_save_size())
    }
}

const POP_ORDER: [(Amd64SavedRegs, u8); 7] = [
    (Amd64SavedRegs::R15, amd64::R15),
    (Amd64SavedRegs::R14, amd64::R14),
    (Amd64SavedRegs::R13, amd64::R13),
    (Amd64SavedRegs::R12, amd64::R12),
    (Amd64SavedRegs::RDI, amd64::RDI),
    (Amd64SavedRegs::RSI, amd64::RSI),
    (Amd64SavedRegs::RBX, amd64::RBX),
];

pub(crate) fn verify(header: &GcInfoHeader, expect: &mut Expectation<'_>) -> Result<()>
{
    let frame_size = header.frame_size;
    if header.has_frame_pointer {
        let expected = frame_pointer_displacement(header);
        let short = (-128..=127).contains(&expected);
        expect.step(|step| {
            step.op
                == EpilogOp::SetSpFromFrame {
                    reg: amd64::RBP,
                    displacement: expected as i32,
                }
                && step.len == if short { 4 } else { 7 }
        })?;
    } else if frame_size != 0 {
        expect.step(|step| step.op == EpilogOp::AddSp(frame_size) && step.len == if frame_size < 128 { 4 } else { 7 })?;
    }

    for (mask, reg) in POP_ORDER {
        if header.is_reg_saved(mask.bits()) {
            expect.step(|step| step.op == EpilogOp::Pop(reg))?;
        }
    }
    if header.has_frame_pointer {
        expect.step(|step| step.op == EpilogOp::Pop(amd64::RBP))?;
    }

    expect.step(|step| matches!(step.op, EpilogOp::Return { pop_size: 0 } | EpilogOp::TailCall))?;
    Ok(())
}

/// Encode the epilog `header` describes; `tail_call` ends it with `jmp rax`.
pub fn encode(header: &GcInfoHeader, tail_call: bool) -> Vec<u8>
{
    let mut out = Vec::new();
    if header.has_frame_pointer {
        let displacement = frame_pointer_displacement(header);
        if let Ok(short) = i8::try_from(displacement) {
            out.extend_from_slice(&[0x48, 0x8d, 0x65, short as u8]);
        } else {
            out.extend_from_slice(&[0x48, 0x8d, 0xa5]);
            out.extend_from_slice(&(displacement as i32).to_le_bytes());
        }
    } else if header.frame_size != 0 {
        if header.frame_size < 128 {
            out.extend_from_slice(&[0x48, 0x83, 0xc4, header.frame_size as u8]);
        } else {
            out.extend_from_slice(&[0x48, 0x81, 0xc4]);
            out.extend_from_slice(&header.frame_size.to_le_bytes());
        }
    }
    for (mask, reg) in POP_ORDER {
        if header.is_reg_saved(mask.bits()) {
            if reg >= amd64::R8 {
                out.push(0x41);
            }
            out.push(0x58 + (reg & 7));
        }
    }
    if header.has_frame_pointer {
        out.push(0x5d);
    }
    if tail_call {
        out.extend_from_slice(&[0x48, 0xff, 0xe0]);
    } else {
        out.push(0xc3);
    }
    out
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;
    use crate::unwind::epilog::verify_epilog_bytes;

    fn frame_header() -> GcInfoHeader
    {
        GcInfoHeader {
            has_frame_pointer: true,
            frame_size: 0x20,
            saved_regs: (Amd64SavedRegs::RBX | Amd64SavedRegs::RBP | Amd64SavedRegs::R12).bits(),
            ..GcInfoHeader::new(Architecture::Amd64)
        }
    }

    #[test]
    fn test_decode_rex_pops()
    {
        let program = decode(&[0x41, 0x5c, 0x5b, 0x5d, 0xf3, 0xc3]).unwrap();
        let ops: Vec<_> = program.steps.iter().map(|step| step.op).collect();
        assert_eq!(
            ops,
            vec![
                EpilogOp::Pop(amd64::R12),
                EpilogOp::Pop(amd64::RBX),
                EpilogOp::Pop(amd64::RBP),
                EpilogOp::Return { pop_size: 0 },
            ]
        );
        assert_eq!(program.steps[3].len, 2);
    }

    #[test]
    fn test_encoded_epilog_verifies()
    {
        let header = frame_header();
        let bytes = encode(&header, false);
        assert_eq!(bytes, vec![0x48, 0x8d, 0x65, 0xf0, 0x41, 0x5c, 0x5b, 0x5d, 0xc3]);
        verify_epilog_bytes(&header, &bytes).unwrap();
        verify_epilog_bytes(&header, &encode(&header, true)).unwrap();
    }

    #[test]
    fn test_wrong_displacement_rejected()
    {
        let header = frame_header();
        let mut bytes = encode(&header, false);
        bytes[3] = 0xe8;
        let err = verify_epilog_bytes(&header, &bytes).unwrap_err();
        assert!(matches!(err, WalkError::UnknownEpilogOpcode { offset: 0, byte: 0x48 }));
    }

    #[test]
    fn test_unknown_opcode()
    {
        let err = decode(&[0x5b, 0x90, 0xc3]).unwrap_err();
        assert!(matches!(err, WalkError::UnknownEpilogOpcode { offset: 1, byte: 0x90 }));
    }
}
