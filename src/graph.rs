//! Symbolic value graph: lazily-evaluated constant expressions whose leaves
//! may be addresses the storage allocator has not assigned yet. Nodes live in
//! an append-only arena and are referenced by plain `NodeId` indices.

use std::collections::BTreeMap;

use crate::ast::{BinOp, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// A resolved constant. Mixed int/float operands promote to float, C-style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn truthy(self) -> bool {
        match self {
            Num::Int(n) => n != 0,
            Num::Float(f) => f != 0.0,
        }
    }

    /// The integer value, if this is an integer. Emitters use this; a float
    /// reaching an integer operand slot is their `EncodingError`.
    pub fn as_int(self) -> Option<i64> {
        match self {
            Num::Int(n) => Some(n),
            Num::Float(_) => None,
        }
    }

    fn as_float(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Num),
    /// Index into the instruction sequence's string table. Kept symbolic so
    /// object-file linking can rebase string indices.
    StringRef(u32),
    Unary(UnaryOp, NodeId),
    Binary(BinOp, NodeId, NodeId),
    Conditional(NodeId, NodeId, NodeId),
    SymbolRef(String),
    /// Resolves to the selected target's opcode-set id.
    OpcodeSet,
}

/// State of a named symbol: declared, defined as an expression, or bound to
/// a storage address by the allocator.
#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Pending,
    Node(NodeId),
    Address(i64),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// Retryable until the allocator pass has run; fatal afterwards.
    #[error("'{symbol}' is not resolved")]
    Unresolved { symbol: String },

    #[error("symbolic constant '{via}' resolves through itself")]
    Cycle { via: String },

    #[error("division by zero in constant expression")]
    DivisionByZero,

    #[error("modulo by zero in constant expression")]
    ModuloByZero,

    #[error("'{op}' requires integer operands")]
    IntegerOperand { op: &'static str },

    #[error("constant expression out of representable range")]
    Overflow,
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Unresolved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("symbol '{0}' is defined more than once")]
pub struct DuplicateSymbol(pub String);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValueGraph {
    nodes: Vec<Node>,
    // BTreeMap keeps object-file serialization order deterministic.
    symbols: BTreeMap<String, Symbol>,
    opcode_set: Option<i64>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Construction ----

    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn literal(&mut self, value: Num) -> NodeId {
        self.add(Node::Literal(value))
    }

    pub fn int(&mut self, value: i64) -> NodeId {
        self.literal(Num::Int(value))
    }

    pub fn string_ref(&mut self, index: u32) -> NodeId {
        self.add(Node::StringRef(index))
    }

    pub fn unary(&mut self, op: UnaryOp, operand: NodeId) -> NodeId {
        self.add(Node::Unary(op, operand))
    }

    pub fn binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.add(Node::Binary(op, lhs, rhs))
    }

    pub fn conditional(&mut self, cond: NodeId, a: NodeId, b: NodeId) -> NodeId {
        self.add(Node::Conditional(cond, a, b))
    }

    pub fn symbol_ref(&mut self, name: &str) -> NodeId {
        self.add(Node::SymbolRef(name.to_string()))
    }

    pub fn opcode_set_node(&mut self) -> NodeId {
        self.add(Node::OpcodeSet)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    // ---- Symbols ----

    pub fn declare_symbol(&mut self, name: &str) {
        self.symbols.entry(name.to_string()).or_insert(Symbol::Pending);
    }

    pub fn define_symbol(&mut self, name: &str, node: NodeId) -> Result<(), DuplicateSymbol> {
        match self.symbols.get(name) {
            Some(Symbol::Pending) | None => {
                self.symbols.insert(name.to_string(), Symbol::Node(node));
                Ok(())
            }
            Some(_) => Err(DuplicateSymbol(name.to_string())),
        }
    }

    /// Bind a symbol to its allocated storage address. Addresses are
    /// immutable once assigned.
    pub fn bind_address(&mut self, name: &str, address: i64) -> Result<(), DuplicateSymbol> {
        match self.symbols.get(name) {
            Some(Symbol::Pending) | None => {
                self.symbols.insert(name.to_string(), Symbol::Address(address));
                Ok(())
            }
            Some(_) => Err(DuplicateSymbol(name.to_string())),
        }
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.symbols.iter()
    }

    pub fn set_opcode_set(&mut self, id: i64) {
        self.opcode_set = Some(id);
    }

    pub fn opcode_set(&self) -> Option<i64> {
        self.opcode_set
    }

    // ---- Resolution ----

    /// Resolve a node to a concrete value. Pure and re-entrant: the cycle
    /// marker is per-call state, so a failed attempt leaves nothing behind
    /// and resolution may be retried once more definitions arrive.
    pub fn resolve(&self, id: NodeId) -> Result<Num, ResolveError> {
        let mut visiting = vec![false; self.nodes.len()];
        self.resolve_inner(id, &mut visiting)
    }

    fn resolve_inner(&self, id: NodeId, visiting: &mut [bool]) -> Result<Num, ResolveError> {
        let idx = id.0 as usize;
        if visiting[idx] {
            let via = match &self.nodes[idx] {
                Node::SymbolRef(name) => name.clone(),
                _ => format!("<node {}>", idx),
            };
            return Err(ResolveError::Cycle { via });
        }
        visiting[idx] = true;
        let result = match &self.nodes[idx] {
            Node::Literal(v) => Ok(*v),
            Node::StringRef(i) => Ok(Num::Int(*i as i64)),
            Node::Unary(op, operand) => {
                let v = self.resolve_inner(*operand, visiting)?;
                apply_unary(*op, v)
            }
            Node::Binary(op, lhs, rhs) => {
                let a = self.resolve_inner(*lhs, visiting)?;
                let b = self.resolve_inner(*rhs, visiting)?;
                apply_binary(*op, a, b)
            }
            Node::Conditional(cond, a, b) => {
                let c = self.resolve_inner(*cond, visiting)?;
                if c.truthy() {
                    self.resolve_inner(*a, visiting)
                } else {
                    self.resolve_inner(*b, visiting)
                }
            }
            Node::SymbolRef(name) => match self.symbols.get(name) {
                Some(Symbol::Address(addr)) => Ok(Num::Int(*addr)),
                Some(Symbol::Node(target)) => self.resolve_inner(*target, visiting),
                Some(Symbol::Pending) | None => {
                    Err(ResolveError::Unresolved { symbol: name.clone() })
                }
            },
            Node::OpcodeSet => match self.opcode_set {
                Some(v) => Ok(Num::Int(v)),
                None => Err(ResolveError::Unresolved { symbol: "<opcode set>".to_string() }),
            },
        };
        visiting[idx] = false;
        result
    }

    /// Post-allocation resolution sweep: every node must now resolve.
    /// Repeated while progress is made (bounded by node count); whatever is
    /// still unresolved afterwards is fatal.
    pub fn sweep(&self) -> Result<(), ResolveError> {
        let mut previous = usize::MAX;
        loop {
            let mut pending: Vec<ResolveError> = Vec::new();
            for i in 0..self.nodes.len() {
                match self.resolve(NodeId(i as u32)) {
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => pending.push(e),
                    Err(e) => return Err(e),
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            if pending.len() >= previous {
                return Err(pending.swap_remove(0));
            }
            previous = pending.len();
        }
    }
}

fn apply_unary(op: UnaryOp, v: Num) -> Result<Num, ResolveError> {
    match (op, v) {
        (UnaryOp::Neg, Num::Int(n)) => n.checked_neg().map(Num::Int).ok_or(ResolveError::Overflow),
        (UnaryOp::Neg, Num::Float(f)) => Ok(Num::Float(-f)),
        (UnaryOp::Not, v) => Ok(Num::Int(if v.truthy() { 0 } else { 1 })),
        (UnaryOp::BitNot, Num::Int(n)) => Ok(Num::Int(!n)),
        (UnaryOp::BitNot, Num::Float(_)) => Err(ResolveError::IntegerOperand { op: "~" }),
        (UnaryOp::ToInt, Num::Int(n)) => Ok(Num::Int(n)),
        (UnaryOp::ToInt, Num::Float(f)) => {
            if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(Num::Int(f as i64))
            } else {
                Err(ResolveError::Overflow)
            }
        }
        (UnaryOp::ToFloat, v) => Ok(Num::Float(v.as_float())),
    }
}

fn apply_binary(op: BinOp, a: Num, b: Num) -> Result<Num, ResolveError> {
    use BinOp::*;

    let float_pair = matches!(a, Num::Float(_)) || matches!(b, Num::Float(_));

    match op {
        And => return Ok(Num::Int((a.truthy() && b.truthy()) as i64)),
        Or => return Ok(Num::Int((a.truthy() || b.truthy()) as i64)),
        Eq | Ne | Lt | Le | Gt | Ge => {
            let ord = if float_pair {
                a.as_float().partial_cmp(&b.as_float())
            } else {
                Some(a.as_int().unwrap().cmp(&b.as_int().unwrap()))
            };
            let Some(ord) = ord else {
                // NaN comparison has no defined constant value.
                return Err(ResolveError::Overflow);
            };
            let hold = match op {
                Eq => ord.is_eq(),
                Ne => ord.is_ne(),
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            return Ok(Num::Int(hold as i64));
        }
        _ => {}
    }

    if float_pair {
        let (x, y) = (a.as_float(), b.as_float());
        return match op {
            Add => Ok(Num::Float(x + y)),
            Sub => Ok(Num::Float(x - y)),
            Mul => Ok(Num::Float(x * y)),
            Div => {
                if y == 0.0 {
                    Err(ResolveError::DivisionByZero)
                } else {
                    Ok(Num::Float(x / y))
                }
            }
            Mod => Err(ResolveError::IntegerOperand { op: "%" }),
            Shl => Err(ResolveError::IntegerOperand { op: "<<" }),
            Shr => Err(ResolveError::IntegerOperand { op: ">>" }),
            BitAnd => Err(ResolveError::IntegerOperand { op: "&" }),
            BitOr => Err(ResolveError::IntegerOperand { op: "|" }),
            BitXor => Err(ResolveError::IntegerOperand { op: "^" }),
            _ => unreachable!("handled above"),
        };
    }

    let (x, y) = (a.as_int().unwrap(), b.as_int().unwrap());
    match op {
        Add => x.checked_add(y).map(Num::Int).ok_or(ResolveError::Overflow),
        Sub => x.checked_sub(y).map(Num::Int).ok_or(ResolveError::Overflow),
        Mul => x.checked_mul(y).map(Num::Int).ok_or(ResolveError::Overflow),
        Div => {
            if y == 0 {
                Err(ResolveError::DivisionByZero)
            } else {
                x.checked_div(y).map(Num::Int).ok_or(ResolveError::Overflow)
            }
        }
        Mod => {
            if y == 0 {
                Err(ResolveError::ModuloByZero)
            } else {
                x.checked_rem(y).map(Num::Int).ok_or(ResolveError::Overflow)
            }
        }
        Shl => {
            if (0..64).contains(&y) {
                x.checked_shl(y as u32).map(Num::Int).ok_or(ResolveError::Overflow)
            } else {
                Err(ResolveError::Overflow)
            }
        }
        Shr => {
            if (0..64).contains(&y) {
                Ok(Num::Int(x >> y))
            } else {
                Err(ResolveError::Overflow)
            }
        }
        BitAnd => Ok(Num::Int(x & y)),
        BitOr => Ok(Num::Int(x | y)),
        BitXor => Ok(Num::Int(x ^ y)),
        _ => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_resolves() {
        let mut g = ValueGraph::new();
        let id = g.int(42);
        assert_eq!(g.resolve(id), Ok(Num::Int(42)));
    }

    #[test]
    fn binary_folds() {
        let mut g = ValueGraph::new();
        let a = g.int(2);
        let b = g.int(3);
        let sum = g.binary(BinOp::Add, a, b);
        assert_eq!(g.resolve(sum), Ok(Num::Int(5)));
    }

    #[test]
    fn mixed_pair_promotes_to_float() {
        let mut g = ValueGraph::new();
        let a = g.int(1);
        let b = g.literal(Num::Float(0.5));
        let sum = g.binary(BinOp::Add, a, b);
        assert_eq!(g.resolve(sum), Ok(Num::Float(1.5)));
    }

    #[test]
    fn to_int_truncates() {
        let mut g = ValueGraph::new();
        let f = g.literal(Num::Float(1.9));
        let t = g.unary(UnaryOp::ToInt, f);
        assert_eq!(g.resolve(t), Ok(Num::Int(1)));
    }

    #[test]
    fn division_by_zero_is_fatal_not_retryable() {
        let mut g = ValueGraph::new();
        let a = g.int(1);
        let b = g.int(0);
        let q = g.binary(BinOp::Div, a, b);
        let err = g.resolve(q).unwrap_err();
        assert_eq!(err, ResolveError::DivisionByZero);
        assert!(!err.is_retryable());
    }

    #[test]
    fn modulo_by_zero() {
        let mut g = ValueGraph::new();
        let a = g.int(7);
        let b = g.int(0);
        let m = g.binary(BinOp::Mod, a, b);
        assert_eq!(g.resolve(m), Err(ResolveError::ModuloByZero));
    }

    #[test]
    fn shift_on_float_rejected() {
        let mut g = ValueGraph::new();
        let a = g.literal(Num::Float(1.0));
        let b = g.int(2);
        let s = g.binary(BinOp::Shl, a, b);
        assert!(matches!(g.resolve(s), Err(ResolveError::IntegerOperand { .. })));
    }

    #[test]
    fn undefined_symbol_is_retryable() {
        let mut g = ValueGraph::new();
        g.declare_symbol("x");
        let r = g.symbol_ref("x");
        let err = g.resolve(r).unwrap_err();
        assert!(err.is_retryable());

        // Once the allocator binds an address the same node resolves.
        g.bind_address("x", 7).unwrap();
        assert_eq!(g.resolve(r), Ok(Num::Int(7)));
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut g = ValueGraph::new();
        let r = g.symbol_ref("addr");
        let one = g.int(1);
        let sum = g.binary(BinOp::Add, r, one);
        g.bind_address("addr", 9).unwrap();
        let first = g.resolve(sum).unwrap();
        for _ in 0..10 {
            assert_eq!(g.resolve(sum).unwrap(), first);
        }
        assert_eq!(first, Num::Int(10));
    }

    #[test]
    fn mutual_cycle_detected_without_hanging() {
        // A := B + 1; B := A + 1
        let mut g = ValueGraph::new();
        let rb = g.symbol_ref("B");
        let one = g.int(1);
        let a_val = g.binary(BinOp::Add, rb, one);
        g.define_symbol("A", a_val).unwrap();
        let ra = g.symbol_ref("A");
        let b_val = g.binary(BinOp::Add, ra, one);
        g.define_symbol("B", b_val).unwrap();

        let probe = g.symbol_ref("A");
        assert!(matches!(g.resolve(probe), Err(ResolveError::Cycle { .. })));
        // Marker state is per-call: a second attempt behaves identically.
        assert!(matches!(g.resolve(probe), Err(ResolveError::Cycle { .. })));
    }

    #[test]
    fn self_cycle_detected() {
        let mut g = ValueGraph::new();
        let r = g.symbol_ref("x");
        g.define_symbol("x", r).unwrap();
        assert!(matches!(
            g.resolve(r),
            Err(ResolveError::Cycle { via }) if via == "x"
        ));
    }

    #[test]
    fn conditional_selects_branch() {
        let mut g = ValueGraph::new();
        let c = g.int(0);
        let a = g.int(10);
        let b = g.int(20);
        let t = g.conditional(c, a, b);
        assert_eq!(g.resolve(t), Ok(Num::Int(20)));
    }

    #[test]
    fn conditional_ignores_untaken_branch_errors() {
        // The untaken branch may stay unresolved forever.
        let mut g = ValueGraph::new();
        let c = g.int(1);
        let a = g.int(10);
        let b = g.symbol_ref("never_defined");
        let t = g.conditional(c, a, b);
        assert_eq!(g.resolve(t), Ok(Num::Int(10)));
    }

    #[test]
    fn duplicate_definition_rejected() {
        let mut g = ValueGraph::new();
        let v = g.int(1);
        g.define_symbol("k", v).unwrap();
        assert!(g.define_symbol("k", v).is_err());
        assert!(g.bind_address("k", 3).is_err());
    }

    #[test]
    fn opcode_set_node_tracks_target() {
        let mut g = ValueGraph::new();
        let n = g.opcode_set_node();
        assert!(g.resolve(n).unwrap_err().is_retryable());
        g.set_opcode_set(2);
        assert_eq!(g.resolve(n), Ok(Num::Int(2)));
    }

    #[test]
    fn sweep_reports_leftover_symbol() {
        let mut g = ValueGraph::new();
        let _ = g.symbol_ref("ghost");
        let err = g.sweep().unwrap_err();
        assert_eq!(err, ResolveError::Unresolved { symbol: "ghost".to_string() });
    }

    #[test]
    fn sweep_passes_on_full_graph() {
        let mut g = ValueGraph::new();
        let a = g.int(2);
        let b = g.int(3);
        let s = g.binary(BinOp::Add, a, b);
        g.define_symbol("five", s).unwrap();
        let r = g.symbol_ref("five");
        let ten = g.binary(BinOp::Add, r, r);
        assert_eq!(g.resolve(ten), Ok(Num::Int(10)));
        g.sweep().unwrap();
    }

    #[test]
    fn shared_subexpression_is_a_dag_not_a_cycle() {
        let mut g = ValueGraph::new();
        let a = g.int(3);
        let sq = g.binary(BinOp::Mul, a, a);
        let quad = g.binary(BinOp::Add, sq, sq);
        assert_eq!(g.resolve(quad), Ok(Num::Int(18)));
    }
}
