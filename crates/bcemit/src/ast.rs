//! Arena syntax tree consumed by the bytecode compiler.
//!
//! Nodes live in one vector owned by [`Ast`] and refer to each other by
//! [`NodeId`]. Every node records the source line it starts on, which the
//! compiler turns into line-number notes.

use strum::Display;

/// Index of a node in its [`Ast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node together with the line it starts on.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub line: u32,
}

/// `name = init` inside `var` and `let`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Binding {
    pub name: Box<str>,
    pub init: Option<NodeId>,
}

/// A `case` or `default` clause of a switch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Case {
    /// `None` for `default`.
    pub test: Option<NodeId>,
    pub body: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CatchClause {
    pub param: Box<str>,
    pub body: Vec<NodeId>,
}

/// A function literal, declared or used as an expression.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Function {
    pub name: Option<Box<str>>,
    pub params: Vec<Box<str>>,
    pub body: Vec<NodeId>,
}

/// Non-short-circuit binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "<<")]
    Lsh,
    #[strum(serialize = ">>")]
    Rsh,
    #[strum(serialize = ">>>")]
    Ursh,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "===")]
    StrictEq,
    #[strum(serialize = "!==")]
    StrictNe,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "instanceof")]
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "~")]
    BitNot,
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "typeof")]
    TypeOf,
    #[strum(serialize = "void")]
    Void,
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum LogicalOp {
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    // statements
    Empty,
    Block(Vec<NodeId>),
    Expr(NodeId),
    Var(Vec<Binding>),
    If {
        cond: NodeId,
        then: NodeId,
        otherwise: Option<NodeId>,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    DoWhile {
        body: NodeId,
        cond: NodeId,
    },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        update: Option<NodeId>,
        body: NodeId,
    },
    /// `for (target in object) body`; `declare` marks `for (var x in ...)`.
    ForIn {
        declare: bool,
        target: NodeId,
        object: NodeId,
        body: NodeId,
    },
    Switch {
        discriminant: NodeId,
        cases: Vec<Case>,
    },
    Labeled {
        label: Box<str>,
        body: NodeId,
    },
    Break(Option<Box<str>>),
    Continue(Option<Box<str>>),
    Return(Option<NodeId>),
    Throw(NodeId),
    Try {
        block: Vec<NodeId>,
        catch: Option<CatchClause>,
        finally: Option<Vec<NodeId>>,
    },
    With {
        object: NodeId,
        body: NodeId,
    },
    /// `let (bindings) { body }`: block-scoped names living in stack slots.
    Let {
        bindings: Vec<Binding>,
        body: Vec<NodeId>,
    },
    FunctionDecl(Function),

    // expressions
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Box<str>),
    Name(Box<str>),
    Member {
        object: NodeId,
        property: Box<str>,
    },
    Index {
        object: NodeId,
        index: NodeId,
    },
    /// `target = value`, or `target op= value` when `op` is set.
    Assign {
        op: Option<BinaryOp>,
        target: NodeId,
        value: NodeId,
    },
    Unary {
        op: UnaryOp,
        operand: NodeId,
    },
    Binary {
        op: BinaryOp,
        left: NodeId,
        right: NodeId,
    },
    /// `a && b && c`, flattened; always at least two operands.
    Logical {
        op: LogicalOp,
        operands: Vec<NodeId>,
    },
    Conditional {
        test: NodeId,
        then: NodeId,
        otherwise: NodeId,
    },
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    New {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    Function(Function),
    Comma(Vec<NodeId>),
}

/// Node arena plus the top-level statement list of a script.
///
/// Builder helpers stamp new nodes with the line last passed to
/// [`Ast::set_line`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
    body: Vec<NodeId>,
    line: u32,
}

impl Ast {
    #[must_use]
    pub fn new() -> Self {
        Self {
            line: 1,
            ..Self::default()
        }
    }

    /// Line recorded on nodes added from now on.
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Adds a node at the current line.
    ///
    /// # Panics
    /// If the arena outgrows the u32 index space.
    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("syntax tree exceeds u32 nodes"));
        self.nodes.push(Node { kind, line: self.line });
        id
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.get(id).kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends a top-level statement.
    pub fn push(&mut self, stmt: NodeId) -> &mut Self {
        self.body.push(stmt);
        self
    }

    #[must_use]
    pub fn body(&self) -> &[NodeId] {
        &self.body
    }

    // --- expression helpers ---

    pub fn number(&mut self, value: f64) -> NodeId {
        self.add(NodeKind::Number(value))
    }

    pub fn string(&mut self, value: &str) -> NodeId {
        self.add(NodeKind::Str(value.into()))
    }

    pub fn boolean(&mut self, value: bool) -> NodeId {
        self.add(NodeKind::Bool(value))
    }

    pub fn name(&mut self, name: &str) -> NodeId {
        self.add(NodeKind::Name(name.into()))
    }

    pub fn member(&mut self, object: NodeId, property: &str) -> NodeId {
        self.add(NodeKind::Member {
            object,
            property: property.into(),
        })
    }

    pub fn index(&mut self, object: NodeId, index: NodeId) -> NodeId {
        self.add(NodeKind::Index { object, index })
    }

    pub fn assign(&mut self, target: NodeId, value: NodeId) -> NodeId {
        self.add(NodeKind::Assign { op: None, target, value })
    }

    pub fn compound_assign(&mut self, op: BinaryOp, target: NodeId, value: NodeId) -> NodeId {
        self.add(NodeKind::Assign {
            op: Some(op),
            target,
            value,
        })
    }

    pub fn unary(&mut self, op: UnaryOp, operand: NodeId) -> NodeId {
        self.add(NodeKind::Unary { op, operand })
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.add(NodeKind::Binary { op, left, right })
    }

    pub fn logical(&mut self, op: LogicalOp, operands: Vec<NodeId>) -> NodeId {
        self.add(NodeKind::Logical { op, operands })
    }

    pub fn conditional(&mut self, test: NodeId, then: NodeId, otherwise: NodeId) -> NodeId {
        self.add(NodeKind::Conditional { test, then, otherwise })
    }

    pub fn call(&mut self, callee: NodeId, args: Vec<NodeId>) -> NodeId {
        self.add(NodeKind::Call { callee, args })
    }

    /// `name(args)` in one step.
    pub fn call_name(&mut self, name: &str, args: Vec<NodeId>) -> NodeId {
        let callee = self.name(name);
        self.call(callee, args)
    }

    // --- statement helpers ---

    pub fn expr_stmt(&mut self, expr: NodeId) -> NodeId {
        self.add(NodeKind::Expr(expr))
    }

    pub fn block(&mut self, stmts: Vec<NodeId>) -> NodeId {
        self.add(NodeKind::Block(stmts))
    }

    pub fn var(&mut self, name: &str, init: Option<NodeId>) -> NodeId {
        self.add(NodeKind::Var(vec![Binding { name: name.into(), init }]))
    }

    pub fn if_else(&mut self, cond: NodeId, then: NodeId, otherwise: Option<NodeId>) -> NodeId {
        self.add(NodeKind::If { cond, then, otherwise })
    }

    pub fn while_loop(&mut self, cond: NodeId, body: NodeId) -> NodeId {
        self.add(NodeKind::While { cond, body })
    }

    pub fn break_stmt(&mut self, label: Option<&str>) -> NodeId {
        self.add(NodeKind::Break(label.map(Into::into)))
    }

    pub fn continue_stmt(&mut self, label: Option<&str>) -> NodeId {
        self.add(NodeKind::Continue(label.map(Into::into)))
    }

    pub fn labeled(&mut self, label: &str, body: NodeId) -> NodeId {
        self.add(NodeKind::Labeled {
            label: label.into(),
            body,
        })
    }

    pub fn return_stmt(&mut self, value: Option<NodeId>) -> NodeId {
        self.add(NodeKind::Return(value))
    }

    pub fn throw(&mut self, value: NodeId) -> NodeId {
        self.add(NodeKind::Throw(value))
    }

    pub fn try_stmt(&mut self, block: Vec<NodeId>, catch: Option<CatchClause>, finally: Option<Vec<NodeId>>) -> NodeId {
        self.add(NodeKind::Try { block, catch, finally })
    }

    pub fn switch(&mut self, discriminant: NodeId, cases: Vec<Case>) -> NodeId {
        self.add(NodeKind::Switch { discriminant, cases })
    }

    pub fn function_decl(&mut self, name: &str, params: &[&str], body: Vec<NodeId>) -> NodeId {
        self.add(NodeKind::FunctionDecl(Function {
            name: Some(name.into()),
            params: params.iter().map(|p| (*p).into()).collect(),
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_remember_their_line() {
        let mut ast = Ast::new();
        let one = ast.number(1.0);
        ast.set_line(4);
        let call = ast.call_name("f", vec![one]);
        let stmt = ast.expr_stmt(call);
        ast.push(stmt);
        assert_eq!(ast.get(one).line, 1);
        assert_eq!(ast.get(stmt).line, 4);
        assert_eq!(ast.body(), &[stmt]);
        assert!(matches!(ast.kind(call), NodeKind::Call { args, .. } if args == &[one]));
    }

    #[test]
    fn operators_print_as_source() {
        assert_eq!(BinaryOp::StrictNe.to_string(), "!==");
        assert_eq!(LogicalOp::Or.to_string(), "||");
        assert_eq!(UnaryOp::TypeOf.to_string(), "typeof");
    }
}
