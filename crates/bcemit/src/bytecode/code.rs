//! Finished output of one compilation unit and helpers to read it back.

use std::fmt;

use super::{
    buffer::{get_i16, get_i32, get_u16},
    op::{INDEX_LEN, JUMP_OFFSET_LEN, OpFormat, Opcode, instruction_length},
    srcnote::{SrcNoteIter, SrcNoteType},
    trynote::TryNote,
};
use crate::{atoms::Literal, error::EmitWarning};

/// Compiled bytecode for a script or function body.
///
/// `code` holds the prolog followed by the main section; `main_offset` is
/// where main starts. Source-note offsets count from the start of the prolog,
/// try-note offsets from the start of main.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Script {
    filename: String,
    code: Vec<u8>,
    main_offset: usize,
    notes: Vec<u8>,
    try_notes: Vec<TryNote>,
    atoms: Vec<Literal>,
    functions: Vec<Script>,
    max_stack_depth: u32,
    first_line: u32,
    warnings: Vec<EmitWarning>,
}

impl Script {
    #[expect(clippy::too_many_arguments, reason = "assembled in one place by CodeGenerator::finish")]
    pub(crate) fn new(
        filename: String,
        code: Vec<u8>,
        main_offset: usize,
        notes: Vec<u8>,
        try_notes: Vec<TryNote>,
        atoms: Vec<Literal>,
        functions: Vec<Self>,
        max_stack_depth: u32,
        first_line: u32,
        warnings: Vec<EmitWarning>,
    ) -> Self {
        Self {
            filename,
            code,
            main_offset,
            notes,
            try_notes,
            atoms,
            functions,
            max_stack_depth,
            first_line,
            warnings,
        }
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Offset of the first main-section instruction in [`Script::code`].
    #[must_use]
    pub fn main_offset(&self) -> usize {
        self.main_offset
    }

    /// Main-section code only.
    #[must_use]
    pub fn main_code(&self) -> &[u8] {
        &self.code[self.main_offset..]
    }

    /// Encoded source notes, terminated by a zero byte.
    #[must_use]
    pub fn notes(&self) -> &[u8] {
        &self.notes
    }

    #[must_use]
    pub fn try_notes(&self) -> &[TryNote] {
        &self.try_notes
    }

    #[must_use]
    pub fn atoms(&self) -> &[Literal] {
        &self.atoms
    }

    /// Nested function bodies, indexed by the operand of `lambda` and `deffun`.
    #[must_use]
    pub fn functions(&self) -> &[Self] {
        &self.functions
    }

    /// Operand-stack slots a frame running this code needs.
    #[must_use]
    pub fn max_stack_depth(&self) -> u32 {
        self.max_stack_depth
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn warnings(&self) -> &[EmitWarning] {
        &self.warnings
    }

    /// Iterates over the instructions of the whole code array.
    #[must_use]
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { code: &self.code, pc: 0 }
    }

    /// Source notes with their absolute code offsets.
    #[must_use]
    pub fn src_notes(&self) -> SrcNoteIter<'_> {
        SrcNoteIter::new(&self.notes)
    }

    /// Absolute target of the jump at `pc`, or `None` if `pc` does not hold
    /// a jump.
    #[must_use]
    pub fn jump_target(&self, pc: usize) -> Option<usize> {
        let op = Opcode::from_repr(*self.code.get(pc)?)?;
        let off = match op.format() {
            OpFormat::Jump => isize::from(get_i16(&self.code, pc + 1)),
            OpFormat::JumpX => isize::try_from(get_i32(&self.code, pc + 1)).ok()?,
            _ => return None,
        };
        pc.checked_add_signed(off)
    }

    /// Decodes the switch at `pc` into absolute targets.
    ///
    /// Table holes resolve to the default target.
    #[must_use]
    pub fn switch_targets(&self, pc: usize) -> Option<SwitchTargets> {
        let op = Opcode::from_repr(*self.code.get(pc)?)?;
        let format = op.format();
        if !format.is_switch() {
            return None;
        }
        instruction_length(&self.code, pc)?;
        let jump_len = format.jump_len()?;
        let read = |at: usize| -> Option<usize> {
            let off = if jump_len == JUMP_OFFSET_LEN {
                isize::from(get_i16(&self.code, at))
            } else {
                isize::try_from(get_i32(&self.code, at)).ok()?
            };
            pc.checked_add_signed(off)
        };

        let mut at = pc + 1;
        let default = read(at)?;
        at += jump_len;
        let mut cases = Vec::new();
        if matches!(format, OpFormat::TableSwitch | OpFormat::TableSwitchX) {
            let low = i32::from(get_i16(&self.code, at));
            let high = i32::from(get_i16(&self.code, at + JUMP_OFFSET_LEN));
            at += 2 * JUMP_OFFSET_LEN;
            for value in low..=high {
                let target = read(at)?;
                // a zero offset marks a hole
                let target = if target == pc { default } else { target };
                cases.push(SwitchCase {
                    key: CaseKey::Int(value),
                    target,
                });
                at += jump_len;
            }
        } else {
            let npairs = get_u16(&self.code, at);
            at += INDEX_LEN;
            for _ in 0..npairs {
                let index = get_u16(&self.code, at);
                at += INDEX_LEN;
                cases.push(SwitchCase {
                    key: CaseKey::Literal(index),
                    target: read(at)?,
                });
                at += jump_len;
            }
        }
        Some(SwitchTargets { default, cases })
    }

    /// Source line of the instruction at `pc`, decoded from `newline` and
    /// `setline` notes.
    #[must_use]
    pub fn line_for_pc(&self, pc: usize) -> u32 {
        let mut line = self.first_line;
        let mut offset = 0;
        for note in self.src_notes() {
            offset += note.delta;
            if offset > pc {
                break;
            }
            match note.ty {
                SrcNoteType::SetLine => line = u32::try_from(note.operands[0]).unwrap_or(u32::MAX),
                SrcNoteType::Newline => line += 1,
                _ => {}
            }
        }
        line
    }

    /// Code offsets annotated by notes of type `ty`, in order.
    #[must_use]
    pub fn note_offsets(&self, ty: SrcNoteType) -> Vec<usize> {
        let mut offset = 0;
        let mut found = Vec::new();
        for note in self.src_notes() {
            offset += note.delta;
            if note.ty == ty {
                found.push(offset);
            }
        }
        found
    }
}

/// Writes a listing, one instruction per line, with jump targets resolved.
impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for insn in self.instructions() {
            if insn.pc == self.main_offset && self.main_offset > 0 {
                writeln!(f, "main:")?;
            }
            write!(f, "{:05}: {}", insn.pc, insn.op)?;
            if let Some(target) = self.jump_target(insn.pc) {
                write!(f, " {target}")?;
            } else if let Some(switch) = self.switch_targets(insn.pc) {
                write!(f, " default {}", switch.default)?;
                for case in &switch.cases {
                    write!(f, ", {}: {}", case.key, case.target)?;
                }
            } else if insn.len == 1 + INDEX_LEN {
                write!(f, " {}", get_u16(&self.code, insn.pc + 1))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub op: Opcode,
    pub len: usize,
}

/// Iterator returned by [`Script::instructions`].
///
/// Stops early at a byte that does not start a valid instruction.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    code: &'a [u8],
    pc: usize,
}

impl Iterator for Instructions<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        let pc = self.pc;
        let op = Opcode::from_repr(*self.code.get(pc)?)?;
        let len = instruction_length(self.code, pc)?;
        self.pc += len;
        Some(Instruction { pc, op, len })
    }
}

/// Key selecting a switch arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKey {
    /// Integer key of a `tableswitch` entry.
    Int(i32),
    /// Literal-table index of a `lookupswitch` pair.
    Literal(u16),
}

impl fmt::Display for CaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Literal(index) => write!(f, "#{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchCase {
    pub key: CaseKey,
    pub target: usize,
}

/// Decoded targets of a `tableswitch` or `lookupswitch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTargets {
    pub default: usize,
    pub cases: Vec<SwitchCase>,
}
