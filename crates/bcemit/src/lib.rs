#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "narrowing casts follow range checks")]

pub mod ast;
mod atoms;
mod bytecode;
mod error;
mod limits;

pub use crate::{
    ast::{Ast, BinaryOp, Binding, Case, CatchClause, Function, LogicalOp, Node, NodeId, NodeKind, UnaryOp},
    atoms::Literal,
    bytecode::{
        CaseKey, Chain, CodeGenerator, Compiler, Instruction, Instructions, JumpLabel, OpFormat, Opcode, Script,
        SectionKind, SrcNote, SrcNoteIter, SrcNoteType, StmtKind, SwitchCase, SwitchTargets, TryNote, TryNoteKind,
        compile_script, instruction_length, stack_uses,
    },
    error::{EmitError, EmitResult, EmitWarning},
    limits::{DEFAULT_MAX_RECURSION_DEPTH, EmitLimits, MAX_LITERALS},
};
