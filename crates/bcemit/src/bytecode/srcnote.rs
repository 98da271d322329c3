//! Source notes: compact, delta-encoded annotations on bytecode offsets.
//!
//! Each note starts with a lead byte packing a 3-bit tag and a 5-bit delta,
//! the number of bytecode bytes since the previously annotated offset. Lead
//! bytes with both high bits set are extended-delta fillers that only carry
//! a 6-bit delta. Tags `0..=4` name a note type directly; tag 5 is followed by
//! a byte holding the type id. Operands come last, one or three bytes each.
//!
//! Within a [`SrcNotes`] buffer a note is addressed by the position of its
//! lead byte. Setting an operand to a value above 127 grows the note by two
//! bytes, which moves every later note, so callers set the operands of later
//! notes before those of earlier ones.

use smallvec::SmallVec;
use strum::{Display, FromRepr, IntoStaticStr};

use crate::error::{EmitError, EmitResult};

/// Largest delta a regular note's lead byte carries, plus one.
pub const SN_DELTA_LIMIT: usize = 30;
/// Largest delta an extended-delta filler carries.
pub const SN_XDELTA_MASK: usize = 0x3f;
/// Deltas below this fit one extended-delta filler.
pub const SN_XDELTA_LIMIT: usize = SN_XDELTA_MASK + 1;
/// Operand values at or above this do not fit the three-byte form.
pub const SN_OPERAND_LIMIT: usize = 1 << 23;

const SN_TAG_SHIFT: u8 = 5;
const SN_DELTA_MASK: u8 = 0x1f;
const SN_XDELTA_TAG: u8 = 0xc0;
const SN_EXTENDED_TAG: u8 = 5;
const SN_3BYTE_OFFSET_FLAG: u8 = 0x80;
const SN_3BYTE_OFFSET_MASK: usize = 0x7f;

/// Kind of a source note.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[strum(serialize_all = "lowercase")]
pub enum SrcNoteType {
    /// Terminator when written with a zero delta.
    Null,
    /// Advances the line number by one.
    Newline,
    /// Sets the line number to its operand.
    SetLine,
    /// Marks an instruction the emitter inserted on its own, such as a
    /// cleanup before a non-local jump.
    Hidden,
    /// Distance back from a call or `new` to the start of its callee.
    PcBase,
    If,
    /// Distance from the `ifeq` to the `goto` that skips the else branch.
    IfElse,
    /// Distances from the loop head to the condition, the update and the
    /// closing backward jump.
    For,
    /// Distance from the entry jump to the loop-closing branch.
    While,
    ForIn,
    Continue,
    Break,
    SwitchBreak,
    PcDelta,
    AssignOp,
    /// Distance from the conditional's `ifeq` to its `goto`.
    Cond,
    Label,
    Break2Label,
    Cont2Label,
    /// Length of the switch and, for `condswitch`, offset of the first case.
    Switch,
    FuncDef,
    /// Length of the catch block.
    Catch,
    EndBrace,
    /// Extended-delta filler.
    XDelta,
}

/// Static description of a note type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcNoteSpec {
    pub arity: usize,
    /// Added to the annotated offset before span-dependent operands apply.
    pub offset_bias: usize,
    /// `1` if the operands measure forward code distances, `-1` for backward
    /// distances, `0` if they are not code distances.
    pub span_dir: isize,
}

const fn note_spec(arity: usize, offset_bias: usize, span_dir: isize) -> SrcNoteSpec {
    SrcNoteSpec {
        arity,
        offset_bias,
        span_dir,
    }
}

impl SrcNoteType {
    #[must_use]
    pub const fn spec(self) -> SrcNoteSpec {
        match self {
            Self::Null
            | Self::Newline
            | Self::Hidden
            | Self::If
            | Self::Continue
            | Self::Break
            | Self::SwitchBreak
            | Self::AssignOp
            | Self::EndBrace
            | Self::XDelta => note_spec(0, 0, 0),
            Self::SetLine | Self::Label | Self::Break2Label | Self::Cont2Label | Self::FuncDef => note_spec(1, 0, 0),
            Self::PcBase => note_spec(1, 0, -1),
            Self::IfElse | Self::While | Self::PcDelta | Self::Cond | Self::Catch => note_spec(1, 0, 1),
            Self::ForIn | Self::Switch => note_spec(2, 0, 1),
            Self::For => note_spec(3, 1, 1),
        }
    }

    fn direct_tag(self) -> Option<u8> {
        match self {
            Self::Null | Self::Newline | Self::SetLine | Self::Hidden | Self::PcBase => Some(self as u8),
            _ => None,
        }
    }
}

/// A decoded note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcNote {
    pub ty: SrcNoteType,
    pub delta: usize,
    pub operands: SmallVec<[usize; 3]>,
}

/// Growable note buffer for one code section.
#[derive(Debug, Default, Clone)]
pub(crate) struct SrcNotes {
    bytes: Vec<u8>,
}

impl SrcNotes {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Appends a note of type `ty` annotating the offset `delta` bytes past
    /// the previous note, splitting oversized deltas into fillers.
    ///
    /// Returns the note's position; operands start out as single zero bytes.
    pub fn new_note(&mut self, ty: SrcNoteType, mut delta: usize) -> EmitResult<usize> {
        if ty == SrcNoteType::XDelta {
            return Err(EmitError::Internal("extended-delta notes are not created directly"));
        }
        while delta >= SN_DELTA_LIMIT {
            let xdelta = delta.min(SN_XDELTA_MASK);
            self.push(&[make_xdelta(xdelta)])?;
            delta -= xdelta;
        }

        let arity = ty.spec().arity;
        let index = self.bytes.len();
        // fits: delta < SN_DELTA_LIMIT
        let delta = delta as u8;
        match ty.direct_tag() {
            Some(tag) => self.push(&[(tag << SN_TAG_SHIFT) | delta])?,
            None => self.push(&[(SN_EXTENDED_TAG << SN_TAG_SHIFT) | delta, ty as u8])?,
        }
        self.bytes.try_reserve(arity)?;
        self.bytes.resize(self.bytes.len() + arity, 0);
        Ok(index)
    }

    pub fn note_type(&self, index: usize) -> Option<SrcNoteType> {
        decode_type(&self.bytes, index)
    }

    pub fn delta(&self, index: usize) -> usize {
        lead_delta(self.bytes[index])
    }

    /// Total encoded length of the note at `index`, operands included.
    pub fn note_len(&self, index: usize) -> usize {
        note_len(&self.bytes, index)
    }

    /// Reads operand `which` of the note at `index`.
    pub fn get_offset(&self, index: usize, which: usize) -> usize {
        let at = operand_position(&self.bytes, index, which);
        read_operand(&self.bytes, at).0
    }

    /// Sets operand `which` of the note at `index`, widening it to three
    /// bytes if the value needs it.
    pub fn set_offset(&mut self, index: usize, which: usize, value: usize) -> EmitResult<()> {
        if value >= SN_OPERAND_LIMIT {
            return Err(EmitError::Internal("source note operand out of range"));
        }
        let at = operand_position(&self.bytes, index, which);
        let wide = self.bytes[at] & SN_3BYTE_OFFSET_FLAG != 0;
        if value > SN_3BYTE_OFFSET_MASK || wide {
            if !wide {
                self.bytes.try_reserve(2)?;
                self.bytes.insert(at + 1, 0);
                self.bytes.insert(at + 1, 0);
            }
            self.bytes[at] = SN_3BYTE_OFFSET_FLAG | (value >> 16) as u8;
            self.bytes[at + 1] = (value >> 8) as u8;
            self.bytes[at + 2] = value as u8;
        } else {
            self.bytes[at] = value as u8;
        }
        Ok(())
    }

    /// Adds `delta` to the note at `index`.
    ///
    /// If the sum no longer fits, a filler carrying `delta` is inserted in
    /// front of the note instead. Returns the note's new position.
    pub fn add_to_delta(&mut self, index: usize, delta: usize) -> EmitResult<usize> {
        let lead = self.bytes[index];
        let limit = if is_xdelta(lead) { SN_XDELTA_LIMIT } else { SN_DELTA_LIMIT };
        let new_delta = lead_delta(lead) + delta;
        if new_delta < limit {
            self.set_delta(index, new_delta);
            return Ok(index);
        }
        if delta >= SN_XDELTA_LIMIT {
            return Err(EmitError::Internal("source note delta adjustment too large"));
        }
        self.bytes.try_reserve(1)?;
        self.bytes.insert(index, make_xdelta(delta));
        Ok(index + 1)
    }

    /// Room left in the delta of the note at `index`.
    pub fn delta_headroom(&self, index: usize) -> usize {
        let lead = self.bytes[index];
        if is_xdelta(lead) {
            SN_XDELTA_MASK - lead_delta(lead)
        } else {
            SN_DELTA_LIMIT - 1 - lead_delta(lead)
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> SrcNoteIter<'_> {
        SrcNoteIter::new(&self.bytes)
    }

    fn set_delta(&mut self, index: usize, delta: usize) {
        let lead = self.bytes[index];
        self.bytes[index] = if is_xdelta(lead) {
            SN_XDELTA_TAG | delta as u8
        } else {
            (lead & !SN_DELTA_MASK) | delta as u8
        };
    }

    fn push(&mut self, bytes: &[u8]) -> EmitResult<()> {
        self.bytes.try_reserve(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

fn make_xdelta(delta: usize) -> u8 {
    SN_XDELTA_TAG | (delta & SN_XDELTA_MASK) as u8
}

fn is_xdelta(lead: u8) -> bool {
    lead & SN_XDELTA_TAG == SN_XDELTA_TAG
}

fn lead_delta(lead: u8) -> usize {
    if is_xdelta(lead) {
        usize::from(lead) & SN_XDELTA_MASK
    } else {
        usize::from(lead & SN_DELTA_MASK)
    }
}

fn header_len(lead: u8) -> usize {
    if !is_xdelta(lead) && lead >> SN_TAG_SHIFT == SN_EXTENDED_TAG { 2 } else { 1 }
}

fn decode_type(notes: &[u8], index: usize) -> Option<SrcNoteType> {
    let lead = notes[index];
    if is_xdelta(lead) {
        Some(SrcNoteType::XDelta)
    } else if lead >> SN_TAG_SHIFT == SN_EXTENDED_TAG {
        SrcNoteType::from_repr(*notes.get(index + 1)?)
    } else {
        SrcNoteType::from_repr(lead >> SN_TAG_SHIFT)
    }
}

fn operand_position(notes: &[u8], index: usize, which: usize) -> usize {
    let mut at = index + header_len(notes[index]);
    for _ in 0..which {
        at += operand_len(notes[at]);
    }
    at
}

fn operand_len(first: u8) -> usize {
    if first & SN_3BYTE_OFFSET_FLAG != 0 { 3 } else { 1 }
}

fn read_operand(notes: &[u8], at: usize) -> (usize, usize) {
    let first = notes[at];
    if first & SN_3BYTE_OFFSET_FLAG == 0 {
        return (usize::from(first), 1);
    }
    let value = ((usize::from(first) & SN_3BYTE_OFFSET_MASK) << 16) | (usize::from(notes[at + 1]) << 8) | usize::from(notes[at + 2]);
    (value, 3)
}

fn note_len(notes: &[u8], index: usize) -> usize {
    let arity = decode_type(notes, index).map_or(0, |ty| ty.spec().arity);
    let mut at = index + header_len(notes[index]);
    for _ in 0..arity {
        at += operand_len(notes[at]);
    }
    at - index
}

/// Decodes notes from an encoded note array, stopping at the terminator.
#[derive(Debug, Clone)]
pub struct SrcNoteIter<'a> {
    notes: &'a [u8],
    pos: usize,
}

impl<'a> SrcNoteIter<'a> {
    #[must_use]
    pub fn new(notes: &'a [u8]) -> Self {
        Self { notes, pos: 0 }
    }
}

impl Iterator for SrcNoteIter<'_> {
    type Item = SrcNote;

    fn next(&mut self) -> Option<SrcNote> {
        let lead = *self.notes.get(self.pos)?;
        if lead == 0 {
            return None;
        }
        let ty = decode_type(self.notes, self.pos)?;
        let mut at = self.pos + header_len(lead);
        let mut operands = SmallVec::new();
        for _ in 0..ty.spec().arity {
            if at >= self.notes.len() {
                return None;
            }
            let (value, len) = read_operand(self.notes, at);
            operands.push(value);
            at += len;
        }
        self.pos = at;
        Some(SrcNote {
            ty,
            delta: lead_delta(lead),
            operands,
        })
    }
}
