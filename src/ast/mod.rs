use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::{Position, SourceMap};

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned { node, span: Span::UNKNOWN })
    }
}

// ---- Core AST types ----

/// Value types of the quill dialect. `Named` is a typedef reference,
/// resolved against the scope tree during lowering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Str,
    Bool,
    Void,
    Named(String),
}

/// Storage qualifier as written in source. The scope tree decides what
/// "default" means (map register at file scope, frame slot inside a body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageSpec {
    Default,
    Static,
    World,
    Global,
}

/// Linkage of a function: internal names are mangled, external names are
/// preserved so other modules and the VM host can reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// A variable declaration, at file scope or inside a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: Type,
    pub storage: StorageSpec,
    /// `name[count]` — persistent array storage.
    pub size: Option<Spanned<Expr>>,
    pub init: Option<Spanned<Expr>>,
    #[serde(skip)]
    pub span: Span,
}

/// Top-level declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    Var(VarDecl),

    /// `const int name = expr;` — a symbolic constant, never storage.
    Const {
        name: String,
        ty: Type,
        value: Spanned<Expr>,
        #[serde(skip)]
        span: Span,
    },

    /// `typedef int tick;`
    Typedef {
        name: String,
        ty: Type,
        #[serde(skip)]
        span: Span,
    },

    /// `script <number> (params) { body }`
    Script {
        number: Spanned<Expr>,
        params: Vec<Param>,
        body: Vec<Spanned<Stmt>>,
        #[serde(skip)]
        span: Span,
    },

    /// `function int f(int a) { body }` — `body` is `None` for
    /// `extern function` prototypes.
    Function {
        name: String,
        linkage: Linkage,
        return_type: Type,
        params: Vec<Param>,
        body: Option<Vec<Spanned<Stmt>>>,
        #[serde(skip)]
        span: Span,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Var(VarDecl),

    Const {
        name: String,
        ty: Type,
        value: Spanned<Expr>,
    },

    Assign {
        target: Spanned<String>,
        index: Option<Spanned<Expr>>,
        op: AssignOp,
        value: Spanned<Expr>,
    },

    If {
        cond: Spanned<Expr>,
        then_body: Vec<Spanned<Stmt>>,
        else_body: Option<Vec<Spanned<Stmt>>>,
    },

    While {
        cond: Spanned<Expr>,
        body: Vec<Spanned<Stmt>>,
    },

    For {
        init: Option<Box<Spanned<Stmt>>>,
        cond: Option<Spanned<Expr>>,
        step: Option<Box<Spanned<Stmt>>>,
        body: Vec<Spanned<Stmt>>,
    },

    Switch {
        subject: Spanned<Expr>,
        arms: Vec<SwitchArm>,
    },

    Break,
    Continue,

    /// `goto case 5;` — jump to a case of the enclosing switch, which may be
    /// defined later in the same switch.
    GotoCase(Spanned<Expr>),

    /// `goto name;` / `name:` — local goto within a function or script body.
    Goto(Spanned<String>),
    Label(String),

    Return(Option<Spanned<Expr>>),

    // Script suspension primitives ("delay class").
    Delay(Spanned<Expr>),
    Suspend,
    Terminate,
    Restart,

    Print(Vec<Spanned<Expr>>),

    Expr(Spanned<Expr>),

    Block(Vec<Spanned<Stmt>>),
}

/// One `case expr:` or `default:` arm of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchArm {
    /// `None` marks the `default:` arm.
    pub case: Option<Spanned<Expr>>,
    pub body: Vec<Spanned<Stmt>>,
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),

    /// Variable or constant reference
    Ref(String),

    /// Array element access: `arr[i]`
    Index {
        name: Spanned<String>,
        index: Box<Spanned<Expr>>,
    },

    Call {
        function: Spanned<String>,
        args: Vec<Spanned<Expr>>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },

    Binary {
        op: BinOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },

    /// `cond ? a : b`
    Ternary {
        cond: Box<Spanned<Expr>>,
        then: Box<Spanned<Expr>>,
        otherwise: Box<Spanned<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    /// `int(e)` — truncating cast.
    ToInt,
    /// `float(e)` — widening cast, only meaningful in constant expressions.
    ToFloat,
}

/// A complete compilation unit is a list of declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub declarations: Vec<Decl>,
    #[serde(skip)]
    pub source: Option<String>,
}
