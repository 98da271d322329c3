//! Bytecode emission.
//!
//! # Module Structure
//!
//! - `op` - opcode table: lengths, stack effects and operand formats
//! - `buffer` - growable code buffer with little-endian immediates
//! - `depth` - modelled operand-stack depth
//! - `srcnote` - source-note encoding and decoding
//! - `trynote` - exception-region records
//! - `stmt` - statement and block-scope stack
//! - `builder` - `CodeGenerator`, the per-unit emitter context
//! - `jump_targets` - balanced index of jump target offsets
//! - `span_deps` - table of span-dependent immediates
//! - `relax` - widening of short jumps that no longer fit
//! - `code` - finished `Script` and decoding helpers
//! - `compiler` - syntax-tree walker driving the builder

pub use builder::{CodeGenerator, JumpLabel, SectionKind};
pub use code::{CaseKey, Instruction, Instructions, Script, SwitchCase, SwitchTargets};
pub use compiler::{Compiler, compile_script};
pub use op::{OpFormat, Opcode, instruction_length, stack_uses};
pub use srcnote::{SrcNote, SrcNoteIter, SrcNoteType};
pub use stmt::{Chain, StmtKind};
pub use trynote::{TryNote, TryNoteKind};

mod buffer;
mod builder;
mod code;
mod compiler;
mod depth;
mod jump_targets;
mod op;
mod relax;
mod span_deps;
mod srcnote;
mod stmt;
mod trynote;
