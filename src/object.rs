//! Intermediate object files for separate compilation. A unit can be saved
//! before allocation and resolution, loaded back bit-for-bit equal, and
//! linked with other units; the linker rebases node ids and string indices
//! so merged graphs and sequences stay consistent.

use crate::ast::{BinOp, Span, UnaryOp};
use crate::code::{CodeError, CodeSeq, FunctionEntry, Instr, Operand, Pcode, ScriptEntry};
use crate::graph::{DuplicateSymbol, Node, NodeId, Num, Symbol, ValueGraph};
use crate::storage::{StorageAllocator, StorageClass, StorageDecl};

const MAGIC: &[u8; 4] = b"QOBJ";
const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObjectError {
    #[error("not an object file")]
    BadMagic,

    #[error("unsupported object file version {0}")]
    BadVersion(u8),

    #[error("truncated object file")]
    Truncated,

    #[error("malformed object file: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Duplicate(#[from] DuplicateSymbol),

    #[error(transparent)]
    Code(#[from] CodeError),
}

/// One loaded (or about-to-be-saved) compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub graph: ValueGraph,
    pub code: CodeSeq,
    pub storage: StorageAllocator,
}

// ---- Saving ----

pub fn save(graph: &ValueGraph, code: &CodeSeq, storage: &StorageAllocator) -> Vec<u8> {
    let mut w = Vec::new();
    w.extend_from_slice(MAGIC);
    w.push(VERSION);

    // Graph nodes
    put_u32(&mut w, graph.len() as u32);
    for (_, node) in graph.nodes() {
        match node {
            Node::Literal(Num::Int(v)) => {
                w.push(0);
                put_i64(&mut w, *v);
            }
            Node::Literal(Num::Float(f)) => {
                w.push(1);
                w.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Node::StringRef(i) => {
                w.push(2);
                put_u32(&mut w, *i);
            }
            Node::Unary(op, a) => {
                w.push(3);
                w.push(unop_code(*op));
                put_u32(&mut w, a.0);
            }
            Node::Binary(op, a, b) => {
                w.push(4);
                w.push(binop_code(*op));
                put_u32(&mut w, a.0);
                put_u32(&mut w, b.0);
            }
            Node::Conditional(c, a, b) => {
                w.push(5);
                put_u32(&mut w, c.0);
                put_u32(&mut w, a.0);
                put_u32(&mut w, b.0);
            }
            Node::SymbolRef(name) => {
                w.push(6);
                put_str(&mut w, name);
            }
            Node::OpcodeSet => w.push(7),
        }
    }

    match graph.opcode_set() {
        Some(v) => {
            w.push(1);
            put_i64(&mut w, v);
        }
        None => w.push(0),
    }

    // Symbols (BTreeMap order, so byte output is deterministic)
    let symbols: Vec<_> = graph.symbols().collect();
    put_u32(&mut w, symbols.len() as u32);
    for (name, symbol) in symbols {
        put_str(&mut w, name);
        match symbol {
            Symbol::Pending => w.push(0),
            Symbol::Node(id) => {
                w.push(1);
                put_u32(&mut w, id.0);
            }
            Symbol::Address(addr) => {
                w.push(2);
                put_i64(&mut w, *addr);
            }
        }
    }

    // Instructions
    put_u32(&mut w, code.len() as u32);
    for instr in code.instrs() {
        put_u16(&mut w, instr.pcode as u16);
        for operand in &instr.operands {
            match operand {
                Operand::Value(id) => {
                    w.push(0);
                    put_u32(&mut w, id.0);
                }
                Operand::Label(name) => {
                    w.push(1);
                    put_str(&mut w, name);
                }
            }
        }
        put_u64(&mut w, instr.span.start as u64);
        put_u64(&mut w, instr.span.end as u64);
        put_u16(&mut w, instr.labels.len() as u16);
        for label in &instr.labels {
            put_str(&mut w, label);
        }
    }

    // String table
    put_u32(&mut w, code.strings().len() as u32);
    for s in code.strings() {
        put_str(&mut w, s);
    }

    // Script directory
    put_u32(&mut w, code.scripts().len() as u32);
    for script in code.scripts() {
        put_u32(&mut w, script.number.0);
        put_str(&mut w, &script.entry);
        put_u32(&mut w, script.argc);
        put_u32(&mut w, script.flags);
    }

    // Function directory
    put_u32(&mut w, code.functions().len() as u32);
    for func in code.functions() {
        put_str(&mut w, &func.name);
        match &func.entry {
            Some(label) => {
                w.push(1);
                put_str(&mut w, label);
            }
            None => w.push(0),
        }
        put_u32(&mut w, func.argc);
        put_u32(&mut w, func.locals);
        w.push(func.returns as u8);
    }

    // Storage declarations
    put_u32(&mut w, storage.decls().len() as u32);
    for decl in storage.decls() {
        w.push(class_code(decl.class));
        put_str(&mut w, &decl.symbol);
        match decl.init {
            Some(id) => {
                w.push(1);
                put_u32(&mut w, id.0);
            }
            None => w.push(0),
        }
        put_u64(&mut w, decl.span.start as u64);
        put_u64(&mut w, decl.span.end as u64);
        match decl.address {
            Some(addr) => {
                w.push(1);
                put_i64(&mut w, addr);
            }
            None => w.push(0),
        }
    }

    w
}

// ---- Loading ----

pub fn load(bytes: &[u8]) -> Result<Unit, ObjectError> {
    let mut r = Reader { bytes, at: 0 };
    if r.take(4)? != MAGIC {
        return Err(ObjectError::BadMagic);
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(ObjectError::BadVersion(version));
    }

    let mut graph = ValueGraph::new();
    let node_count = r.u32()?;
    for _ in 0..node_count {
        let node = match r.u8()? {
            0 => Node::Literal(Num::Int(r.i64()?)),
            1 => Node::Literal(Num::Float(f64::from_bits(r.u64()?))),
            2 => Node::StringRef(r.u32()?),
            3 => Node::Unary(unop_from(r.u8()?)?, NodeId(r.u32()?)),
            4 => Node::Binary(binop_from(r.u8()?)?, NodeId(r.u32()?), NodeId(r.u32()?)),
            5 => Node::Conditional(NodeId(r.u32()?), NodeId(r.u32()?), NodeId(r.u32()?)),
            6 => Node::SymbolRef(r.string()?),
            7 => Node::OpcodeSet,
            _ => return Err(ObjectError::Malformed("graph node tag")),
        };
        graph.add(node);
    }

    if r.u8()? == 1 {
        graph.set_opcode_set(r.i64()?);
    }

    let symbol_count = r.u32()?;
    for _ in 0..symbol_count {
        let name = r.string()?;
        match r.u8()? {
            0 => graph.declare_symbol(&name),
            1 => graph.define_symbol(&name, NodeId(r.u32()?))?,
            2 => graph.bind_address(&name, r.i64()?)?,
            _ => return Err(ObjectError::Malformed("symbol tag")),
        }
    }

    let instr_count = r.u32()?;
    let mut instrs = Vec::with_capacity(instr_count as usize);
    for _ in 0..instr_count {
        let pcode =
            Pcode::from_number(r.u16()?).ok_or(ObjectError::Malformed("opcode number"))?;
        let mut operands = Vec::with_capacity(pcode.shape().len());
        for _ in 0..pcode.shape().len() {
            operands.push(match r.u8()? {
                0 => Operand::Value(NodeId(r.u32()?)),
                1 => Operand::Label(r.string()?),
                _ => return Err(ObjectError::Malformed("operand tag")),
            });
        }
        let span = Span { start: r.u64()? as usize, end: r.u64()? as usize };
        let label_count = r.u16()?;
        let mut labels = Vec::with_capacity(label_count as usize);
        for _ in 0..label_count {
            labels.push(r.string()?);
        }
        instrs.push(Instr { pcode, operands, span, labels });
    }

    let string_count = r.u32()?;
    let mut strings = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        strings.push(r.string()?);
    }

    let script_count = r.u32()?;
    let mut scripts = Vec::with_capacity(script_count as usize);
    for _ in 0..script_count {
        scripts.push(ScriptEntry {
            number: NodeId(r.u32()?),
            entry: r.string()?,
            argc: r.u32()?,
            flags: r.u32()?,
        });
    }

    let func_count = r.u32()?;
    let mut functions = Vec::with_capacity(func_count as usize);
    for _ in 0..func_count {
        let name = r.string()?;
        let entry = match r.u8()? {
            0 => None,
            1 => Some(r.string()?),
            _ => return Err(ObjectError::Malformed("function entry tag")),
        };
        functions.push(FunctionEntry {
            name,
            entry,
            argc: r.u32()?,
            locals: r.u32()?,
            returns: r.u8()? != 0,
        });
    }

    let decl_count = r.u32()?;
    let mut decls = Vec::with_capacity(decl_count as usize);
    for _ in 0..decl_count {
        let class = class_from(r.u8()?)?;
        let symbol = r.string()?;
        let init = match r.u8()? {
            0 => None,
            1 => Some(NodeId(r.u32()?)),
            _ => return Err(ObjectError::Malformed("initializer tag")),
        };
        let span = Span { start: r.u64()? as usize, end: r.u64()? as usize };
        let address = match r.u8()? {
            0 => None,
            1 => Some(r.i64()?),
            _ => return Err(ObjectError::Malformed("address tag")),
        };
        decls.push(StorageDecl { class, symbol, init, span, address });
    }

    Ok(Unit {
        graph,
        code: CodeSeq::from_parts(instrs, strings, scripts, functions),
        storage: StorageAllocator::from_decls(decls),
    })
}

// ---- Linking ----

/// Merge loaded units in order. Node ids and string indices of each unit are
/// rebased onto the merged tables; defining the same symbol, label or
/// function in two units is an error.
pub fn link(units: Vec<Unit>) -> Result<Unit, ObjectError> {
    let mut graph = ValueGraph::new();
    let mut code = CodeSeq::new();
    let mut storage = StorageAllocator::new();
    let mut functions: Vec<FunctionEntry> = Vec::new();

    for unit in units {
        let base = graph.len() as u32;
        let rebase = |id: NodeId| NodeId(id.0 + base);

        // Old string index -> merged string index.
        let string_map: Vec<u32> = unit.code.strings().iter().map(|s| code.intern(s)).collect();

        for (_, node) in unit.graph.nodes() {
            let node = match node {
                Node::Literal(v) => Node::Literal(*v),
                Node::StringRef(i) => Node::StringRef(
                    *string_map
                        .get(*i as usize)
                        .ok_or(ObjectError::Malformed("string index"))?,
                ),
                Node::Unary(op, a) => Node::Unary(*op, rebase(*a)),
                Node::Binary(op, a, b) => Node::Binary(*op, rebase(*a), rebase(*b)),
                Node::Conditional(c, a, b) => {
                    Node::Conditional(rebase(*c), rebase(*a), rebase(*b))
                }
                Node::SymbolRef(name) => Node::SymbolRef(name.clone()),
                Node::OpcodeSet => Node::OpcodeSet,
            };
            graph.add(node);
        }

        for (name, symbol) in unit.graph.symbols() {
            match symbol {
                Symbol::Pending => graph.declare_symbol(name),
                Symbol::Node(id) => graph.define_symbol(name, rebase(*id))?,
                Symbol::Address(addr) => graph.bind_address(name, *addr)?,
            }
        }

        for instr in unit.code.instrs() {
            let operands = instr
                .operands
                .iter()
                .map(|op| match op {
                    Operand::Value(id) => Operand::Value(rebase(*id)),
                    Operand::Label(name) => Operand::Label(name.clone()),
                })
                .collect();
            let id = code.emit(instr.pcode, operands, instr.span);
            for label in &instr.labels {
                code.attach_label(id, label)?;
            }
        }

        for script in unit.code.scripts() {
            code.add_script(ScriptEntry {
                number: rebase(script.number),
                entry: script.entry.clone(),
                argc: script.argc,
                flags: script.flags,
            });
        }

        for func in unit.code.functions() {
            // An import resolves against a definition from any other unit,
            // in either order; two definitions collide.
            match functions.iter_mut().find(|f| f.name == func.name) {
                None => functions.push(func.clone()),
                Some(existing) => match (&existing.entry, &func.entry) {
                    (_, None) => {}
                    (None, Some(_)) => *existing = func.clone(),
                    (Some(_), Some(_)) => {
                        return Err(CodeError::DuplicateFunction(func.name.clone()).into());
                    }
                },
            }
        }

        for decl in unit.storage.decls() {
            storage.declare(
                decl.class,
                &decl.symbol,
                decl.init.map(rebase),
                decl.span,
                &mut graph,
            );
        }
    }

    for func in functions {
        code.add_function(func)?;
    }

    Ok(Unit { graph, code, storage })
}

// ---- Enum codecs ----

fn binop_code(op: BinOp) -> u8 {
    BINOPS.iter().position(|o| *o == op).unwrap() as u8
}

fn binop_from(code: u8) -> Result<BinOp, ObjectError> {
    BINOPS
        .get(code as usize)
        .copied()
        .ok_or(ObjectError::Malformed("binary operator"))
}

const BINOPS: [BinOp; 18] = [
    BinOp::Add,
    BinOp::Sub,
    BinOp::Mul,
    BinOp::Div,
    BinOp::Mod,
    BinOp::Shl,
    BinOp::Shr,
    BinOp::BitAnd,
    BinOp::BitOr,
    BinOp::BitXor,
    BinOp::And,
    BinOp::Or,
    BinOp::Eq,
    BinOp::Ne,
    BinOp::Lt,
    BinOp::Le,
    BinOp::Gt,
    BinOp::Ge,
];

const UNOPS: [UnaryOp; 5] = [
    UnaryOp::Neg,
    UnaryOp::Not,
    UnaryOp::BitNot,
    UnaryOp::ToInt,
    UnaryOp::ToFloat,
];

fn unop_code(op: UnaryOp) -> u8 {
    UNOPS.iter().position(|o| *o == op).unwrap() as u8
}

fn unop_from(code: u8) -> Result<UnaryOp, ObjectError> {
    UNOPS
        .get(code as usize)
        .copied()
        .ok_or(ObjectError::Malformed("unary operator"))
}

const CLASSES: [StorageClass; 10] = [
    StorageClass::Auto,
    StorageClass::ScriptReg,
    StorageClass::Static,
    StorageClass::MapReg,
    StorageClass::WorldReg,
    StorageClass::GlobalReg,
    StorageClass::MapArray,
    StorageClass::WorldArray,
    StorageClass::GlobalArray,
    StorageClass::Constant,
];

fn class_code(class: StorageClass) -> u8 {
    CLASSES.iter().position(|c| *c == class).unwrap() as u8
}

fn class_from(code: u8) -> Result<StorageClass, ObjectError> {
    CLASSES
        .get(code as usize)
        .copied()
        .ok_or(ObjectError::Malformed("storage class"))
}

// ---- Byte plumbing ----

fn put_u16(w: &mut Vec<u8>, v: u16) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(w: &mut Vec<u8>, v: u32) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(w: &mut Vec<u8>, v: u64) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(w: &mut Vec<u8>, v: i64) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn put_str(w: &mut Vec<u8>, s: &str) {
    put_u32(w, s.len() as u32);
    w.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ObjectError> {
        let end = self.at.checked_add(n).ok_or(ObjectError::Truncated)?;
        if end > self.bytes.len() {
            return Err(ObjectError::Truncated);
        }
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ObjectError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ObjectError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ObjectError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ObjectError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, ObjectError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, ObjectError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ObjectError::Malformed("string encoding"))
    }
}
