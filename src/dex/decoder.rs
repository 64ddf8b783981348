//! Instruction decoding for one method's code units.
//!
//! The result has one slot per code unit. An instruction occupies the slot of
//! its first unit; continuation units and payload tables are `None`.

use log::warn;
use crate::dex::error::DexError;
use crate::dex::instructions::{DecodedInstruction, Operands, PoolRef};
use crate::dex::opcodes::{lookup, nop, ConstKind, Family, Format, Opcode, ReferenceType};

const PACKED_SWITCH_IDENT: u16 = 0x0100;
const SPARSE_SWITCH_IDENT: u16 = 0x0200;
const ARRAY_DATA_IDENT: u16 = 0x0300;

// Helpers for pulling format encoding
#[inline] fn op(inst: u16) -> u8 { (inst & 0x00ff) as u8 }
#[inline] fn a8(inst: u16) -> u16 { inst >> 8 }                  // 11x AA, 21x AA, …
#[inline] fn a4(inst: u16) -> u16 { (inst >> 8) & 0x0f }         // 12x A (low nibble of high byte)
#[inline] fn b4(inst: u16) -> u16 { (inst >> 12) & 0x0f }        // 12x B (high nibble of high byte)
#[inline] fn s4(x: u16) -> i64 { (((x as u8) << 4) as i8 >> 4) as i64 }
#[inline] fn s8(x: u16) -> i64 { (x as u8 as i8) as i64 }
#[inline] fn s16(x: u16) -> i64 { (x as i16) as i64 }
#[inline] fn u32_at(code: &[u16], pc: usize) -> u32 { (code[pc] as u32) | ((code[pc + 1] as u32) << 16) }

#[inline]
fn require_cu(code: &[u16], pc: usize, need: usize, opname: &str) -> Result<(), DexError> {
    if pc + need > code.len() {
        fail!(
            at = pc,
            "Truncated {}: need {} code units, have {}",
            opname,
            need,
            code.len().saturating_sub(pc)
        );
    }
    Ok(())
}

/// Size in code units of a payload pseudo-instruction starting at `pc`, if any.
fn payload_size(code: &[u16], pc: usize) -> Result<Option<usize>, DexError> {
    let size = match code[pc] {
        PACKED_SWITCH_IDENT => {
            require_cu(code, pc, 2, "packed-switch payload")?;
            4 + code[pc + 1] as usize * 2
        }
        SPARSE_SWITCH_IDENT => {
            require_cu(code, pc, 2, "sparse-switch payload")?;
            2 + code[pc + 1] as usize * 4
        }
        ARRAY_DATA_IDENT => {
            require_cu(code, pc, 4, "array-data payload")?;
            let width = code[pc + 1] as usize;
            let count = u32_at(code, pc + 2) as usize;
            let bytes = width
                .checked_mul(count)
                .ok_or_else(|| DexError::new("array-data overflow").at(pc))?;
            4 + bytes.div_ceil(2)
        }
        _ => return Ok(None),
    };
    require_cu(code, pc, size, "payload")?;
    Ok(Some(size))
}

fn relative(pc: usize, offset: i64, len: usize) -> Result<u32, DexError> {
    let target = pc as i64 + offset;
    if target < 0 || target >= len as i64 {
        fail!(at = pc, "Branch target {} outside method of {} code units", target, len);
    }
    Ok(target as u32)
}

fn pool_ref(reference_type: ReferenceType, index: u32, pc: usize) -> Result<PoolRef, DexError> {
    Ok(match reference_type {
        ReferenceType::String => PoolRef::String(index),
        ReferenceType::Type => PoolRef::Type(index),
        ReferenceType::Field => PoolRef::Field(index),
        ReferenceType::Method => PoolRef::Method(index),
        ReferenceType::CallSite => PoolRef::CallSite(index),
        ReferenceType::MethodProto => PoolRef::Proto(index),
        ReferenceType::MethodHandle => PoolRef::MethodHandle(index),
        ReferenceType::None => fail!(at = pc, "Opcode without reference type carries an index"),
    })
}

fn switch_payload(code: &[u16], pc: usize, payload: usize, packed: bool) -> Result<Vec<(i32, u32)>, DexError> {
    let expected = if packed { PACKED_SWITCH_IDENT } else { SPARSE_SWITCH_IDENT };
    if code[payload] != expected {
        fail!(at = payload, "Expected switch payload 0x{:04x}, found 0x{:04x}", expected, code[payload]);
    }
    let size = match payload_size(code, payload)? {
        Some(_) => code[payload + 1] as usize,
        None => fail!(at = payload, "Missing switch payload"),
    };
    let mut cases = Vec::with_capacity(size);
    if packed {
        let first_key = u32_at(code, payload + 2) as i32;
        for i in 0..size {
            let off = u32_at(code, payload + 4 + i * 2) as i32;
            cases.push((first_key.wrapping_add(i as i32), relative(pc, off as i64, code.len())?));
        }
    } else {
        let keys = payload + 2;
        let targets = keys + size * 2;
        for i in 0..size {
            let key = u32_at(code, keys + i * 2) as i32;
            let off = u32_at(code, targets + i * 2) as i32;
            cases.push((key, relative(pc, off as i64, code.len())?));
        }
    }
    Ok(cases)
}

fn array_payload(code: &[u16], payload: usize) -> Result<(u16, Vec<i64>), DexError> {
    if code[payload] != ARRAY_DATA_IDENT {
        fail!(at = payload, "Expected array-data payload, found 0x{:04x}", code[payload]);
    }
    payload_size(code, payload)?;
    let width = code[payload + 1];
    let count = u32_at(code, payload + 2) as usize;

    // Reconstruct bytes from code units (little endian)
    let bytes: Vec<u8> = code[payload + 4..]
        .iter()
        .flat_map(|cu| cu.to_le_bytes())
        .take(width as usize * count)
        .collect();

    let elements = match width {
        1 => bytes.iter().map(|b| *b as i8 as i64).collect(),
        2 => bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as i64).collect(),
        4 => bytes.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64).collect(),
        8 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        _ => fail!(at = payload, "Unsupported array-data element width {}", width),
    };
    Ok((width, elements))
}

fn decode_operands(code: &[u16], pc: usize, opcode: &Opcode) -> Result<Operands, DexError> {
    let inst = code[pc];
    let len = code.len();
    let reference = |index: u32| pool_ref(opcode.reference_type, index, pc);

    Ok(match opcode.format {
        Format::F10x => Operands::None,
        Format::F12x => Operands::Registers(vec![a4(inst), b4(inst)]),
        Format::F11n => Operands::Literal { regs: vec![a4(inst)], value: s4(b4(inst)) },
        Format::F11x => Operands::Registers(vec![a8(inst)]),
        Format::F10t => Operands::Branch { regs: vec![], target: relative(pc, s8(a8(inst)), len)? },
        Format::F20t => Operands::Branch { regs: vec![], target: relative(pc, s16(code[pc + 1]), len)? },
        Format::F22x => Operands::Registers(vec![a8(inst), code[pc + 1]]),
        Format::F21t => Operands::Branch { regs: vec![a8(inst)], target: relative(pc, s16(code[pc + 1]), len)? },
        Format::F21s => Operands::Literal { regs: vec![a8(inst)], value: s16(code[pc + 1]) },
        Format::F21h => {
            let shift = if opcode.family == Family::Const(ConstKind::Wide) { 48 } else { 16 };
            Operands::Literal { regs: vec![a8(inst)], value: s16(code[pc + 1]) << shift }
        }
        Format::F21c => Operands::Reference { regs: vec![a8(inst)], reference: reference(code[pc + 1] as u32)? },
        Format::F23x => {
            let bc = code[pc + 1];
            Operands::Registers(vec![a8(inst), bc & 0xff, bc >> 8])
        }
        Format::F22b => {
            let bc = code[pc + 1];
            Operands::Literal { regs: vec![a8(inst), bc & 0xff], value: s8(bc >> 8) }
        }
        Format::F22t => Operands::Branch { regs: vec![a4(inst), b4(inst)], target: relative(pc, s16(code[pc + 1]), len)? },
        Format::F22s => Operands::Literal { regs: vec![a4(inst), b4(inst)], value: s16(code[pc + 1]) },
        Format::F22c => Operands::Reference { regs: vec![a4(inst), b4(inst)], reference: reference(code[pc + 1] as u32)? },
        Format::F30t => Operands::Branch { regs: vec![], target: relative(pc, u32_at(code, pc + 1) as i32 as i64, len)? },
        Format::F32x => Operands::Registers(vec![code[pc + 1], code[pc + 2]]),
        Format::F31i => Operands::Literal { regs: vec![a8(inst)], value: u32_at(code, pc + 1) as i32 as i64 },
        Format::F31t => {
            let payload = relative(pc, u32_at(code, pc + 1) as i32 as i64, len)? as usize;
            let reg = a8(inst);
            if opcode.family == Family::FillArrayData {
                let (width, elements) = array_payload(code, payload)?;
                Operands::ArrayData { reg, width, elements }
            } else {
                let packed = opcode.value == 0x2b;
                Operands::Switch { reg, packed, cases: switch_payload(code, pc, payload, packed)? }
            }
        }
        Format::F31c => Operands::Reference { regs: vec![a8(inst)], reference: reference(u32_at(code, pc + 1))? },
        Format::F35c | Format::F45cc => {
            let count = b4(inst) as usize;
            if count > 5 {
                fail!(at = pc, "{} with {} argument registers", opcode.name, count);
            }
            let args = code[pc + 2];
            let all = [args & 0xf, (args >> 4) & 0xf, (args >> 8) & 0xf, (args >> 12) & 0xf, a4(inst)];
            let regs = all[..count].to_vec();
            let reference = if opcode.format == Format::F45cc {
                PoolRef::Polymorphic { method: code[pc + 1] as u32, proto: code[pc + 3] as u32 }
            } else {
                reference(code[pc + 1] as u32)?
            };
            Operands::Reference { regs, reference }
        }
        Format::F3rc | Format::F4rcc => {
            let count = a8(inst);
            let first = code[pc + 2];
            if first as u32 + count as u32 > u16::MAX as u32 + 1 {
                fail!(at = pc, "{} register range overflows", opcode.name);
            }
            let reference = if opcode.format == Format::F4rcc {
                PoolRef::Polymorphic { method: code[pc + 1] as u32, proto: code[pc + 3] as u32 }
            } else {
                reference(code[pc + 1] as u32)?
            };
            Operands::Range { first, count, reference }
        }
        Format::F51l => {
            let lo = u32_at(code, pc + 1) as u64;
            let hi = u32_at(code, pc + 3) as u64;
            Operands::Literal { regs: vec![a8(inst)], value: ((hi << 32) | lo) as i64 }
        }
    })
}

/// Every register an instruction names, including the high half of a wide
/// pair, must be below `registers_size`.
fn check_registers(insn: &DecodedInstruction, registers_size: u16) -> Result<(), DexError> {
    let limit = registers_size as u32;
    let highest = match &insn.operands {
        Operands::Range { count: 0, .. } => None,
        Operands::Range { first, count, .. } => Some(*first as u32 + *count as u32 - 1),
        operands => {
            // argument lists name both halves of wide values explicitly
            let listed = matches!(insn.opcode.format, Format::F35c | Format::F45cc);
            operands
                .registers()
                .iter()
                .enumerate()
                .map(|(i, reg)| {
                    let wide = !listed && insn.opcode.roles.get(i).map_or(false, |r| r.is_wide());
                    *reg as u32 + wide as u32
                })
                .max()
        }
    };
    match highest {
        Some(reg) if reg >= limit => Err(err!(
            kind = Structural,
            "{} names v{} but only {} registers are declared",
            insn.opcode.name,
            reg,
            registers_size
        )
        .at(insn.offset as usize)),
        _ => Ok(()),
    }
}

/// Decodes a method body into one slot per code unit.
///
/// Unknown opcodes become `nop` placeholders. Branch targets are resolved to
/// absolute code-unit positions and must land on an instruction boundary.
pub fn decode_method(code: &[u16], registers_size: u16) -> Result<Vec<Option<DecodedInstruction>>, DexError> {
    let mut slots: Vec<Option<DecodedInstruction>> = (0..code.len()).map(|_| None).collect();

    let mut pc = 0;
    while pc < code.len() {
        if let Some(size) = payload_size(code, pc)? {
            pc += size;
            continue;
        }

        let value = op(code[pc]);
        let Some(opcode) = lookup(value) else {
            warn!("Unknown opcode 0x{:02x} at {:04x}, decoding as nop", value, pc);
            slots[pc] = Some(DecodedInstruction { offset: pc as u32, opcode: nop(), operands: Operands::None, placeholder: true });
            pc += 1;
            continue;
        };

        require_cu(code, pc, opcode.format.units(), &opcode.name)?;
        let operands = decode_operands(code, pc, opcode)?;
        let insn = DecodedInstruction { offset: pc as u32, opcode, operands, placeholder: false };

        check_registers(&insn, registers_size)?;

        let at = insn.offset as usize;
        pc += opcode.format.units();
        slots[at] = Some(insn);
    }

    for insn in slots.iter().flatten() {
        for target in insn.branch_targets() {
            if slots[target as usize].is_none() {
                fail!(at = insn.offset as usize, "{} targets {:04x} which is not an instruction boundary", insn.opcode.name, target);
            }
        }
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::ErrorKind;
    use crate::dex::instructions::BinaryOperation;

    #[test]
    fn add_and_return()
    {
        // add-int v2, v0, v1; return v2
        let code = [0x0290, 0x0100, 0x020f];
        let slots = decode_method(&code, 3).unwrap();
        assert_eq!(slots.len(), 3);
        let add = slots[0].as_ref().unwrap();
        assert_eq!(add.family(), Family::Binary(BinaryOperation::AddInt));
        assert_eq!(add.registers(), vec![2, 0, 1]);
        assert!(slots[1].is_none());
        assert_eq!(slots[2].as_ref().unwrap().registers(), vec![2]);
    }

    #[test]
    fn literals_are_sign_extended()
    {
        // const/4 v1, -1; const/high16 v0, 0x4120 (10.0f); const-wide/high16 v2, 0x4024 (10.0)
        let code = [0xf112, 0x0015, 0x4120, 0x0219, 0x4024];
        let slots = decode_method(&code, 4).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().operands.literal(), Some(-1));
        assert_eq!(slots[1].as_ref().unwrap().operands.literal(), Some(0x4120_0000));
        assert_eq!(slots[3].as_ref().unwrap().operands.literal(), Some(0x4024_0000_0000_0000));
    }

    #[test]
    fn branch_targets_are_absolute()
    {
        // 0: if-eqz v0, +3; 2: const/4 v0, 1; 3: return v0
        let code = [0x0038, 0x0003, 0x1012, 0x000f];
        let slots = decode_method(&code, 1).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().branch_targets(), vec![3]);

        // goto -1 from offset 0 leaves the method
        let e = decode_method(&[0xff28], 1).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Decode);
        assert_eq!(e.offset(), Some(0));
    }

    #[test]
    fn branch_into_instruction_middle_is_rejected()
    {
        // 0: goto +2 (into the second unit of const/16); 1: const/16 v0, 5; 3: return-void
        let code = [0x0228, 0x0013, 0x0005, 0x000e];
        let e = decode_method(&code, 1).unwrap_err();
        assert!(e.message().contains("not an instruction boundary"));
    }

    #[test]
    fn unknown_opcode_is_placeholder()
    {
        let code = [0x003e, 0x000e];
        let slots = decode_method(&code, 0).unwrap();
        let first = slots[0].as_ref().unwrap();
        assert!(first.placeholder);
        assert_eq!(first.family(), Family::Nop);
        assert_eq!(slots[1].as_ref().unwrap().family(), Family::ReturnVoid);
    }

    #[test]
    fn register_out_of_range_is_structural()
    {
        let code = [0x0290, 0x0100, 0x020f];
        let e = decode_method(&code, 2).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);

        // return-wide v1 reads v1 and v2
        let e = decode_method(&[0x0110], 2).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);
    }

    #[test]
    fn packed_switch_payload()
    {
        // 0: packed-switch v0, +4; 3: return-void; 4: payload (2 cases from key 10 -> 3, 3)
        let code = [0x002b, 0x0004, 0x0000, 0x000e, 0x0100, 0x0002, 0x000a, 0x0000, 0x0003, 0x0000, 0x0003, 0x0000];
        let slots = decode_method(&code, 1).unwrap();
        match &slots[0].as_ref().unwrap().operands {
            Operands::Switch { reg, packed, cases } => {
                assert_eq!(*reg, 0);
                assert!(*packed);
                assert_eq!(cases, &vec![(10, 3), (11, 3)]);
            }
            other => panic!("unexpected operands {:?}", other),
        }
        assert!(slots[4..].iter().all(|s| s.is_none()));
    }

    #[test]
    fn fill_array_data_payload()
    {
        // 0: fill-array-data v0, +4; 3: return-void; 4: payload width 2, 3 elements
        let code = [0x0026, 0x0004, 0x0000, 0x000e, 0x0300, 0x0002, 0x0003, 0x0000, 0x0001, 0xffff, 0x0007];
        let slots = decode_method(&code, 1).unwrap();
        match &slots[0].as_ref().unwrap().operands {
            Operands::ArrayData { width, elements, .. } => {
                assert_eq!(*width, 2);
                assert_eq!(elements, &vec![1, -1, 7]);
            }
            other => panic!("unexpected operands {:?}", other),
        }
    }

    #[test]
    fn invoke_argument_lists()
    {
        // invoke-static {v3, v4}, method@7; invoke-virtual/range {v0 .. v2}, method@9
        let code = [0x2071, 0x0007, 0x0043, 0x0374, 0x0009, 0x0000];
        let slots = decode_method(&code, 5).unwrap();
        let first = slots[0].as_ref().unwrap();
        assert_eq!(first.registers(), vec![3, 4]);
        assert_eq!(first.operands.reference(), Some(PoolRef::Method(7)));
        let second = slots[3].as_ref().unwrap();
        assert_eq!(second.registers(), vec![0, 1, 2]);
        assert_eq!(second.roles().uses, vec![0, 1, 2]);
    }

    #[test]
    fn truncated_instruction()
    {
        let e = decode_method(&[0x0014, 0x0001], 1).unwrap_err();
        assert!(e.message().starts_with("Truncated const"));
        assert_eq!(e.offset(), Some(0));
    }

    #[test]
    fn range_operands_at_the_last_register()
    {
        // invoke-static/range {v2}, method@0
        let slots = decode_method(&[0x0177, 0x0000, 0x0002], 3).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().registers(), vec![2]);

        let e = decode_method(&[0x0177, 0x0000, 0x0002], 2).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);

        // {v65535} must not wrap
        let e = decode_method(&[0x0177, 0x0000, 0xffff], 1).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);
        assert!(e.message().contains("v65535"), "{}", e.message());

        // an empty range names no register
        assert!(decode_method(&[0x0077, 0x0000, 0xffff], 1).is_ok());
    }

    #[test]
    fn wide_operands_need_both_halves()
    {
        // move-wide v0, v1 reads v1 and v2
        let slots = decode_method(&[0x1004], 3).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().roles().uses, vec![1, 2]);

        let e = decode_method(&[0x1004], 2).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);
        assert_eq!(e.offset(), Some(0));

        // move-wide/16 v65535, v0
        let e = decode_method(&[0x0006, 0xffff, 0x0000], 2).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Structural);
    }
}
