//! Offset-agnostic instruction model.
//!
//! Jumps refer to their destination by instruction id, so instructions can be inserted
//! anywhere without invalidating them. Byte offsets only exist again after [`encode`], which
//! recomputes jump operands and extension chains until they are stable.

use std::collections::HashMap;

use crate::bytecode::{CodeUnit, Opcode};
use crate::error::BuildError;

/// One operation of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Stable identity, unique within one unit.
    pub id: usize,
    pub opcode: Opcode,
    /// Full logical operand. For an `ExtendedArg` this is only its own byte.
    pub arg: u32,
    /// Id of the (non `ExtendedArg`) destination of a jump.
    pub jump_to: Option<usize>,
    /// `false` for instructions added by a rewrite.
    pub original: bool,
    /// Offset in the decoded byte stream, if the instruction came from one.
    pub old_offset: Option<usize>,
    pub line: Option<u32>,
}

impl Instruction {
    pub fn new(id: usize, opcode: Opcode, arg: u32, line: Option<u32>) -> Self {
        Instruction {
            id,
            opcode,
            arg,
            jump_to: None,
            original: true,
            old_offset: None,
            line,
        }
    }

    pub fn jump(id: usize, opcode: Opcode, target: usize, line: Option<u32>) -> Self {
        Instruction {
            jump_to: Some(target),
            ..Instruction::new(id, opcode, 0, line)
        }
    }

    /// An instruction added by a rewrite.
    pub fn injected(id: usize, opcode: Opcode, arg: u32, line: Option<u32>) -> Self {
        Instruction {
            original: false,
            ..Instruction::new(id, opcode, arg, line)
        }
    }
}

/// Number of `ExtendedArg` prefixes needed to encode `value`.
fn prefixes_for(value: u32) -> usize {
    match value {
        0..=0xff => 0,
        0x100..=0xffff => 1,
        0x1_0000..=0xff_ffff => 2,
        _ => 3,
    }
}

/// Splits a unit's byte stream into instructions, keeping `ExtendedArg` prefixes as
/// separate instructions and resolving every jump to the id of its destination.
pub fn decode(unit: &CodeUnit) -> Result<Vec<Instruction>, BuildError> {
    if unit.code.len() % 2 != 0 {
        return Err(BuildError::malformed(&unit.name, "odd code length"));
    }

    let mut instructions = Vec::with_capacity(unit.code.len() / 2);
    let mut ext = 0u32;
    let mut chain = 0;
    for (index, pair) in unit.code.chunks_exact(2).enumerate() {
        let offset = index * 2;
        let opcode = Opcode::from_byte(pair[0]).ok_or_else(|| {
            BuildError::malformed(
                &unit.name,
                format!("unknown opcode {} at offset {offset}", pair[0]),
            )
        })?;
        let mut instruction = if opcode == Opcode::ExtendedArg {
            chain += 1;
            if chain > 3 {
                return Err(BuildError::malformed(
                    &unit.name,
                    format!("extension chain longer than 3 at offset {offset}"),
                ));
            }
            ext = (ext | pair[1] as u32) << 8;
            Instruction::new(index, opcode, pair[1] as u32, None)
        } else {
            let arg = ext | pair[1] as u32;
            ext = 0;
            chain = 0;
            Instruction::new(index, opcode, arg, None)
        };
        instruction.old_offset = Some(offset);
        instruction.line = Some(unit.line_for(offset));
        instructions.push(instruction);
    }
    if chain != 0 {
        return Err(BuildError::malformed(&unit.name, "dangling ExtendedArg"));
    }

    let count = instructions.len();
    for index in 0..count {
        let opcode = instructions[index].opcode;
        if !opcode.is_jump() {
            continue;
        }
        let offset = index * 2;
        let arg = instructions[index].arg as usize;
        let target = if opcode.is_jump_absolute() {
            arg
        } else {
            offset + 2 + arg
        };
        let mut target_index = target / 2;
        if target % 2 != 0 || target_index >= count {
            return Err(BuildError::malformed(
                &unit.name,
                format!("jump at offset {offset} to invalid offset {target}"),
            ));
        }
        while instructions[target_index].opcode == Opcode::ExtendedArg {
            target_index += 1;
            if target_index >= count {
                return Err(BuildError::malformed(
                    &unit.name,
                    "jump into a trailing extension chain",
                ));
            }
        }
        instructions[index].jump_to = Some(target_index);
    }
    Ok(instructions)
}

/// Lays out `instructions` into bytes.
///
/// Jump operands are recomputed from `jump_to`. Whenever an operand no longer fits the
/// prefixes in front of its instruction, `ExtendedArg` instructions are inserted and the
/// layout starts over. Prefixes are never removed, so this terminates. Surplus prefixes
/// encode zero.
pub fn encode(
    unit_name: &str,
    instructions: &mut Vec<Instruction>,
) -> Result<Vec<u8>, BuildError> {
    let mut next_id = instructions.iter().map(|i| i.id + 1).max().unwrap_or(0);
    loop {
        let index_of: HashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(index, ins)| (ins.id, index))
            .collect();

        let mut grow = None;
        for index in 0..instructions.len() {
            let ins = &instructions[index];
            if ins.opcode == Opcode::ExtendedArg {
                continue;
            }
            let value = operand(unit_name, instructions, &index_of, index)?;
            let existing = prefix_len(instructions, index);
            let needed = prefixes_for(value);
            if needed > existing {
                grow = Some((index - existing, needed - existing));
                break;
            }
        }

        match grow {
            Some((at, count)) => {
                let line = instructions[at].line;
                for _ in 0..count {
                    let prefix = Instruction::injected(next_id, Opcode::ExtendedArg, 0, line);
                    instructions.insert(at, prefix);
                    next_id += 1;
                }
            }
            None => break,
        }
    }

    let index_of: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, ins)| (ins.id, index))
        .collect();
    let mut values = Vec::with_capacity(instructions.len());
    for index in 0..instructions.len() {
        if instructions[index].opcode == Opcode::ExtendedArg {
            values.push(None);
        } else {
            values.push(Some(operand(unit_name, instructions, &index_of, index)?));
        }
    }

    let mut code = vec![0u8; instructions.len() * 2];
    for index in (0..instructions.len()).rev() {
        let Some(value) = values[index] else {
            continue;
        };
        let ins = &mut instructions[index];
        if ins.opcode.is_jump() {
            ins.arg = value;
        }
        code[index * 2] = ins.opcode as u8;
        code[index * 2 + 1] = (value & 0xff) as u8;
        let existing = prefix_len(instructions, index);
        for k in 1..=existing {
            let byte = value.checked_shr(8 * k as u32).unwrap_or(0) & 0xff;
            let prefix = index - k;
            instructions[prefix].arg = byte;
            code[prefix * 2] = Opcode::ExtendedArg as u8;
            code[prefix * 2 + 1] = byte as u8;
        }
    }
    Ok(code)
}

fn prefix_len(instructions: &[Instruction], index: usize) -> usize {
    instructions[..index]
        .iter()
        .rev()
        .take_while(|ins| ins.opcode == Opcode::ExtendedArg)
        .count()
}

/// Encoded operand of the instruction at `index` under the current layout.
fn operand(
    unit_name: &str,
    instructions: &[Instruction],
    index_of: &HashMap<usize, usize>,
    index: usize,
) -> Result<u32, BuildError> {
    let ins = &instructions[index];
    let Some(target_id) = ins.jump_to else {
        return Ok(ins.arg);
    };
    let target = *index_of.get(&target_id).ok_or_else(|| {
        BuildError::malformed(unit_name, format!("jump to unknown instruction {target_id}"))
    })?;
    // land on the first prefix of the destination
    let target_offset = (target - prefix_len(instructions, target)) * 2;
    let value = if ins.opcode.is_jump_absolute() {
        target_offset as i64
    } else {
        target_offset as i64 - (index as i64 * 2 + 2)
    };
    u32::try_from(value).map_err(|_| {
        BuildError::malformed(
            unit_name,
            format!("relative jump at offset {} goes backwards", index * 2),
        )
    })
}

/// Builds a line table from the per-instruction lines of an encoded sequence.
pub fn line_table(instructions: &[Instruction]) -> Vec<(u32, u32)> {
    let mut table: Vec<(u32, u32)> = Vec::new();
    for (index, ins) in instructions.iter().enumerate() {
        let Some(line) = ins.line else {
            continue;
        };
        if table.last().map(|&(_, l)| l) != Some(line) {
            table.push(((index * 2) as u32, line));
        }
    }
    table
}

/// Translates a line table of the decoded stream to the rewritten one.
///
/// Each entry moves to the new offset of the instruction that was at its old offset, then
/// back over the instructions injected right before it, so code added in front of an
/// instruction reports that instruction's line.
pub fn remap_lines(old: &[(u32, u32)], instructions: &[Instruction]) -> Vec<(u32, u32)> {
    let new_index: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(index, ins)| ins.old_offset.map(|offset| (offset, index)))
        .collect();

    let mut table: Vec<(u32, u32)> = Vec::with_capacity(old.len());
    for &(offset, line) in old {
        let Some(&index) = new_index.get(&(offset as usize)) else {
            continue;
        };
        let mut start = index;
        while start > 0 && !instructions[start - 1].original {
            start -= 1;
        }
        let start = (start * 2) as u32;
        match table.last_mut() {
            Some(last) if last.0 == start => last.1 = line,
            Some(last) if last.1 == line => {}
            _ => table.push((start, line)),
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(code: Vec<u8>, lines: Vec<(u32, u32)>) -> CodeUnit {
        CodeUnit {
            name: "t".into(),
            filename: "t".into(),
            first_line: 1,
            argcount: 0,
            varnames: vec![],
            cellvars: vec![],
            freevars: vec![],
            names: vec![],
            consts: vec![],
            code,
            lines,
            instrumented: false,
        }
    }

    #[test]
    fn decode_keeps_prefixes_and_resolves_targets() {
        // 0: EXT 1 / 2: LOAD_CONST 0x100 / 4: JUMP_ABSOLUTE 0 / 6: RETURN
        let code = vec![
            Opcode::ExtendedArg as u8, 1,
            Opcode::LoadConst as u8, 0,
            Opcode::JumpAbsolute as u8, 0,
            Opcode::ReturnValue as u8, 0,
        ];
        let decoded = decode(&unit(code, vec![(0, 1)])).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[1].arg, 0x100);
        // target offset 0 is the prefix, the jump resolves to the real instruction
        assert_eq!(decoded[2].jump_to, Some(1));
    }

    #[test]
    fn encode_grows_extension_chains_to_fixpoint() {
        let mut instructions: Vec<Instruction> = (0..200)
            .map(|id| Instruction::new(id, Opcode::LoadConst, 0, Some(1)))
            .collect();
        // forward jump over 199 instructions does not fit in one byte
        instructions.insert(0, Instruction::jump(1000, Opcode::JumpForward, 199, Some(1)));
        let code = encode("t", &mut instructions).unwrap();
        assert_eq!(instructions[0].opcode, Opcode::ExtendedArg);
        assert_eq!(code.len(), instructions.len() * 2);

        let redecoded = decode(&unit(code, vec![(0, 1)])).unwrap();
        let jump = redecoded.iter().position(|i| i.opcode == Opcode::JumpForward).unwrap();
        let target = redecoded[jump].jump_to.unwrap();
        // 199 LOAD_CONSTs are skipped
        assert_eq!(target, jump + 200);
    }

    #[test]
    fn large_operands_get_prefixes() {
        let mut instructions = vec![
            Instruction::new(0, Opcode::LoadConst, 0x12345, Some(1)),
            Instruction::new(1, Opcode::ReturnValue, 0, Some(1)),
        ];
        let code = encode("t", &mut instructions).unwrap();
        assert_eq!(
            code,
            vec![
                Opcode::ExtendedArg as u8, 0x01,
                Opcode::ExtendedArg as u8, 0x23,
                Opcode::LoadConst as u8, 0x45,
                Opcode::ReturnValue as u8, 0,
            ]
        );
    }

    #[test]
    fn backward_relative_jump_is_an_error() {
        let mut instructions = vec![
            Instruction::new(0, Opcode::LoadConst, 0, Some(1)),
            Instruction::jump(1, Opcode::JumpForward, 0, Some(1)),
        ];
        assert!(matches!(
            encode("t", &mut instructions),
            Err(BuildError::Malformed { .. })
        ));
    }

    #[test]
    fn remapped_lines_cover_injected_code() {
        let mut instructions = vec![
            Instruction::injected(10, Opcode::LoadGlobal, 0, Some(1)),
            Instruction::new(0, Opcode::LoadConst, 0, Some(1)),
            Instruction::injected(11, Opcode::LoadGlobal, 0, Some(2)),
            Instruction::new(1, Opcode::ReturnValue, 0, Some(2)),
        ];
        instructions[1].old_offset = Some(0);
        instructions[3].old_offset = Some(2);
        let table = remap_lines(&[(0, 1), (2, 2)], &instructions);
        assert_eq!(table, vec![(0, 1), (4, 2)]);
        assert_eq!(line_table(&instructions), table);
    }
}
