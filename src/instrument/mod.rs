//! Metering rewrite of compiled units.
//!
//! Before every original instruction the pass injects
//! `LOAD_GLOBAL __meter__; CALL_FUNCTION 0; POP_TOP`, except right after an `ExtendedArg`
//! (the chain must stay contiguous) and before the stack shuffles flagged by
//! [`Opcode::unsafe_to_precede`]. Jumps keep targeting the original instruction, so entering
//! an instruction through a jump skips its meter. A jump to itself would therefore never be
//! metered and is rejected.

pub mod instruction;

use tracing::{debug, instrument};

use crate::bytecode::{CodeUnit, Constant, Opcode};
use crate::error::BuildError;
use instruction::{decode, encode, remap_lines, Instruction};

/// Global name of the metering hook called by instrumented code.
pub const METER_NAME: &str = "__meter__";

/// Returns an instrumented copy of `unit` and of every unit nested in its constants.
#[instrument(level = "trace", skip_all, fields(unit = %unit.name))]
pub fn instrument(unit: &CodeUnit) -> Result<CodeUnit, BuildError> {
    if unit.instrumented {
        return Err(BuildError::AlreadyInstrumented(unit.name.clone()));
    }

    let mut out = unit.clone();
    for constant in &mut out.consts {
        if let Constant::Code(nested) = constant {
            *nested = Box::new(instrument(nested)?);
        }
    }

    let decoded = decode(unit)?;
    if let Some(jump) = decoded.iter().find(|ins| ins.jump_to == Some(ins.id)) {
        return Err(BuildError::SelfReferentialJump {
            unit: unit.name.clone(),
            offset: jump.old_offset.unwrap_or_default(),
        });
    }

    let meter = out.names.len() as u32;
    out.names.push(METER_NAME.to_owned());

    let original_count = decoded.len();
    let mut next_id = original_count;
    let mut rewritten = Vec::with_capacity(original_count * 4);
    let mut after_prefix = false;
    for ins in decoded {
        if !after_prefix && !ins.opcode.unsafe_to_precede() {
            for (opcode, arg) in [
                (Opcode::LoadGlobal, meter),
                (Opcode::CallFunction, 0),
                (Opcode::PopTop, 0),
            ] {
                rewritten.push(Instruction::injected(next_id, opcode, arg, ins.line));
                next_id += 1;
            }
        }
        after_prefix = ins.opcode == Opcode::ExtendedArg;
        rewritten.push(ins);
    }

    out.code = encode(&unit.name, &mut rewritten)?;
    out.lines = remap_lines(&unit.lines, &rewritten);
    out.instrumented = true;
    debug!(
        original = original_count,
        rewritten = rewritten.len(),
        "instrumented unit"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::compile_module;

    /// Decoded instructions with the injected meter sequences removed.
    fn strip_meters(unit: &CodeUnit) -> Vec<(Opcode, Option<u32>)> {
        let meter = unit.names.iter().position(|n| n == METER_NAME).unwrap() as u32;
        let decoded = decode(unit).unwrap();
        let mut out = Vec::new();
        let mut i = 0;
        while i < decoded.len() {
            if decoded[i].opcode == Opcode::LoadGlobal
                && decoded[i].arg == meter
                && decoded.get(i + 1).map(|d| d.opcode) == Some(Opcode::CallFunction)
                && decoded.get(i + 2).map(|d| d.opcode) == Some(Opcode::PopTop)
            {
                i += 3;
                continue;
            }
            if decoded[i].opcode != Opcode::ExtendedArg {
                out.push((decoded[i].opcode, decoded[i].line));
            }
            i += 1;
        }
        out
    }

    fn without_prefixes(unit: &CodeUnit) -> Vec<(Opcode, Option<u32>)> {
        decode(unit)
            .unwrap()
            .into_iter()
            .filter(|i| i.opcode != Opcode::ExtendedArg)
            .map(|i| (i.opcode, i.line))
            .collect()
    }

    const SOURCE: &str = "\
x = 0
for i in range(10):
    if i % 2 == 0:
        x += i
    elif 0 < i < 5:
        x -= 1
def f(a, b=3):
    return [a * k for k in range(b)]
try:
    y = f(2)[5]
except IndexError:
    y = None
";

    #[test]
    fn original_instructions_and_lines_survive() {
        let raw = compile_module("bot", SOURCE).unwrap();
        let metered = instrument(&raw).unwrap();
        assert!(metered.instrumented);
        assert_eq!(strip_meters(&metered), without_prefixes(&raw));
        assert!(metered.code.len() > raw.code.len() * 2);
    }

    #[test]
    fn meter_precedes_every_safe_instruction() {
        let raw = compile_module("bot", SOURCE).unwrap();
        let metered = instrument(&raw).unwrap();
        let decoded = decode(&metered).unwrap();
        let meter = (metered.names.len() - 1) as u32;
        let meters = decoded
            .iter()
            .filter(|i| i.opcode == Opcode::LoadGlobal && i.arg == meter)
            .count();
        let eligible = decode(&raw)
            .unwrap()
            .windows(2)
            .filter(|w| w[0].opcode != Opcode::ExtendedArg && !w[1].opcode.unsafe_to_precede())
            .count()
            + 1;
        assert_eq!(meters, eligible);
    }

    #[test]
    fn nested_units_are_instrumented() {
        let raw = compile_module("bot", SOURCE).unwrap();
        let metered = instrument(&raw).unwrap();
        assert!(metered.fully_instrumented());
        let def = metered.nested().next().unwrap();
        assert!(def.nested().all(|comp| comp.instrumented));
    }

    #[test]
    fn instrumenting_twice_is_rejected() {
        let raw = compile_module("bot", "x = 1\n").unwrap();
        let metered = instrument(&raw).unwrap();
        assert_eq!(
            instrument(&metered),
            Err(BuildError::AlreadyInstrumented("<module>".into()))
        );
    }

    #[test]
    fn self_referential_jump_is_rejected() {
        let mut unit = compile_module("bot", "x = 1\n").unwrap();
        let mut code = vec![Opcode::LoadConst as u8, 0];
        code.extend([Opcode::JumpAbsolute as u8, 2]);
        unit.code = code;
        unit.lines = vec![(0, 1)];
        assert_eq!(
            instrument(&unit),
            Err(BuildError::SelfReferentialJump {
                unit: "<module>".into(),
                offset: 2
            })
        );
    }
}
