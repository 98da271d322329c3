//! Stack of open statements and lexical scopes.
//!
//! Statements live in a vector in nesting order; the statement below entry
//! `i` is entry `i - 1`. Statements that introduce a scope are additionally
//! threaded onto a scope chain through `down_scope`, which is what lexical
//! name lookup walks.

use std::fmt;

/// Kind of an open statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtKind {
    Label,
    If,
    Else,
    Switch,
    Block,
    With,
    Catch,
    Try,
    Finally,
    /// Body of a finally clause while it runs as a subroutine.
    Subroutine,
    DoLoop,
    ForLoop,
    ForInLoop,
    WhileLoop,
}

impl StmtKind {
    /// Human-readable name used in "too large" errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Label => "label statement",
            Self::If => "if statement",
            Self::Else => "else statement",
            Self::Switch => "switch statement",
            Self::Block => "block",
            Self::With => "with statement",
            Self::Catch => "catch block",
            Self::Try => "try block",
            Self::Finally | Self::Subroutine => "finally block",
            Self::DoLoop => "do loop",
            Self::ForLoop => "for loop",
            Self::ForInLoop => "for/in loop",
            Self::WhileLoop => "while loop",
        }
    }

    #[must_use]
    pub fn is_loop(self) -> bool {
        matches!(self, Self::DoLoop | Self::ForLoop | Self::ForInLoop | Self::WhileLoop)
    }

    /// Statements whose pending jumps are owned by a finally clause and must
    /// not be patched when the statement pops.
    #[must_use]
    pub fn is_trying(self) -> bool {
        matches!(self, Self::Try | Self::Finally | Self::Subroutine)
    }
}

impl fmt::Display for StmtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which pending-jump chain of a statement a jump joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Breaks,
    Continues,
    /// Calls into a finally subroutine.
    Gosubs,
}

/// Block-scoped bindings introduced by a scope statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BlockScope {
    /// Stack depth when the block was entered; binding `i` lives in slot
    /// `depth + i`.
    pub depth: u32,
    pub names: Vec<Box<str>>,
}

impl BlockScope {
    pub fn count(&self) -> u16 {
        u16::try_from(self.names.len()).unwrap_or(u16::MAX)
    }
}

/// One open statement.
///
/// Pending chains hold the offset of the most recent jump in the chain; each
/// jump's immediate holds the distance back to the previous one.
#[derive(Debug, Clone)]
pub(crate) struct StmtInfo {
    pub kind: StmtKind,
    /// Offset of the first instruction of the statement.
    pub top: usize,
    /// Continue target for loops.
    pub update: usize,
    pub breaks: Option<usize>,
    pub continues: Option<usize>,
    pub gosubs: Option<usize>,
    /// Label name for labeled statements.
    pub label: Option<Box<str>>,
    /// Present for statements that introduce block-scoped bindings.
    pub scope: Option<BlockScope>,
    down_scope: Option<usize>,
}

impl StmtInfo {
    /// Statements that sit on the scope chain.
    pub fn links_scope(&self) -> bool {
        matches!(self.kind, StmtKind::With | StmtKind::Catch) || self.scope.is_some()
    }

    pub fn chain(&self, chain: Chain) -> Option<usize> {
        match chain {
            Chain::Breaks => self.breaks,
            Chain::Continues => self.continues,
            Chain::Gosubs => self.gosubs,
        }
    }

    pub fn set_chain(&mut self, chain: Chain, last: Option<usize>) {
        match chain {
            Chain::Breaks => self.breaks = last,
            Chain::Continues => self.continues = last,
            Chain::Gosubs => self.gosubs = last,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct StmtStack {
    stmts: Vec<StmtInfo>,
    top_scope: Option<usize>,
}

impl StmtStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    /// Opens a statement and returns its index.
    pub fn push(&mut self, kind: StmtKind, top: usize, scope: Option<BlockScope>) -> usize {
        let index = self.stmts.len();
        let mut stmt = StmtInfo {
            kind,
            top,
            update: top,
            breaks: None,
            continues: None,
            gosubs: None,
            label: None,
            scope,
            down_scope: None,
        };
        if stmt.links_scope() {
            stmt.down_scope = self.top_scope;
            self.top_scope = Some(index);
        }
        self.stmts.push(stmt);
        index
    }

    pub fn pop(&mut self) -> Option<StmtInfo> {
        let stmt = self.stmts.pop()?;
        if stmt.links_scope() {
            self.top_scope = stmt.down_scope;
        }
        Some(stmt)
    }

    pub fn top(&self) -> Option<&StmtInfo> {
        self.stmts.last()
    }

    pub fn top_index(&self) -> Option<usize> {
        self.stmts.len().checked_sub(1)
    }

    pub fn get(&self, index: usize) -> &StmtInfo {
        &self.stmts[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut StmtInfo {
        &mut self.stmts[index]
    }

    /// Name of the innermost open statement, or `"script"`.
    pub fn innermost_name(&self) -> &'static str {
        self.top().map_or("script", |stmt| stmt.kind.name())
    }

    #[cfg(test)]
    pub fn in_statement(&self, kind: StmtKind) -> bool {
        self.stmts.iter().any(|stmt| stmt.kind == kind)
    }

    /// Innermost statement satisfying `pred`, searching outward.
    pub fn find(&self, mut pred: impl FnMut(&StmtInfo) -> bool) -> Option<usize> {
        self.stmts.iter().rposition(|stmt| pred(stmt))
    }

    /// Index of the statement labeled `label`.
    pub fn find_label(&self, label: &str) -> Option<usize> {
        self.find(|stmt| stmt.kind == StmtKind::Label && stmt.label.as_deref() == Some(label))
    }

    /// Resolves a block-scoped name to its stack slot.
    ///
    /// The walk stops at a `with` statement, whose object may shadow any
    /// outer binding.
    pub fn lexical_lookup(&self, name: &str) -> Option<(usize, u32)> {
        let mut cursor = self.top_scope;
        while let Some(index) = cursor {
            let stmt = &self.stmts[index];
            if stmt.kind == StmtKind::With {
                return None;
            }
            if let Some(scope) = &stmt.scope
                && let Some(position) = scope.names.iter().position(|n| &**n == name)
            {
                let slot = scope.depth + u32::try_from(position).ok()?;
                return Some((index, slot));
            }
            cursor = stmt.down_scope;
        }
        None
    }
}
