//! Binary target emitters. Each target is a pure function from the finished
//! sequence, graph and allocator to bytes, built on one shared two-pass
//! algorithm: a layout pass fixes every instruction's encoded offset and the
//! label map, then the emit pass serializes with all operands resolved.
//!
//! All multi-byte fields are little-endian.

use std::collections::HashMap;

use crate::code::{CodeSeq, Operand, Pcode};
use crate::graph::{NodeId, Num, ResolveError, ValueGraph};
use crate::storage::StorageAllocator;

mod extended;
mod plain;
mod portable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Plain,
    Portable,
    Extended,
}

impl Target {
    /// Repertoire level; opcodes carry the minimum level that encodes them.
    pub const fn level(self) -> u8 {
        match self {
            Target::Plain => 0,
            Target::Portable => 1,
            Target::Extended => 2,
        }
    }

    /// Value of the graph's opcode-set node for this target.
    pub const fn opcode_set(self) -> i64 {
        self.level() as i64
    }

    pub const fn magic(self) -> &'static [u8; 4] {
        match self {
            Target::Plain => b"QVM0",
            Target::Portable => b"QVMP",
            Target::Extended => b"QVME",
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Target::Plain => "plain",
            Target::Portable => "portable",
            Target::Extended => "extended",
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmitError {
    #[error("opcode '{opcode}' is not in the {target} repertoire")]
    Unsupported { opcode: &'static str, target: Target },

    #[error("value {0} does not fit the target's operand width")]
    OperandWidth(i64),

    #[error("float constant reaches an integer operand")]
    FloatOperand,

    #[error("label '{0}' is not attached to any instruction")]
    UnknownLabel(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Serialize the sequence for `target`.
pub fn write(
    target: Target,
    code: &CodeSeq,
    graph: &ValueGraph,
    storage: &StorageAllocator,
) -> Result<Vec<u8>, EmitError> {
    check_repertoire(target, code)?;
    match target {
        Target::Plain => plain::write(code, graph, storage),
        Target::Portable => portable::write(code, graph, storage),
        Target::Extended => extended::write(code, graph, storage),
    }
}

fn check_repertoire(target: Target, code: &CodeSeq) -> Result<(), EmitError> {
    for instr in code.instrs() {
        if instr.pcode.level() > target.level() {
            return Err(EmitError::Unsupported {
                opcode: instr.pcode.name(),
                target,
            });
        }
    }
    Ok(())
}

/// Per-instruction byte offsets plus the resolved label map.
pub(crate) struct Layout {
    pub offsets: Vec<u32>,
    pub labels: HashMap<String, u32>,
    pub end: u32,
}

impl Layout {
    pub fn label(&self, name: &str) -> Result<u32, EmitError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| EmitError::UnknownLabel(name.to_string()))
    }
}

/// Layout for the fixed-width targets: 4 bytes of opcode plus 4 per operand,
/// starting at `base`.
pub(crate) fn fixed_layout(code: &CodeSeq, base: u32) -> Layout {
    let mut offsets = Vec::with_capacity(code.len());
    let mut labels = HashMap::new();
    let mut at = base;
    for instr in code.instrs() {
        offsets.push(at);
        for name in &instr.labels {
            labels.insert(name.clone(), at);
        }
        at += 4 + 4 * instr.pcode.shape().len() as u32;
    }
    Layout { offsets, labels, end: at }
}

/// Resolve a graph operand to an `i32`, the operand width shared by all
/// three targets.
pub(crate) fn resolve_i32(graph: &ValueGraph, id: NodeId) -> Result<i32, EmitError> {
    match graph.resolve(id)? {
        Num::Float(_) => Err(EmitError::FloatOperand),
        Num::Int(v) => i32::try_from(v).map_err(|_| EmitError::OperandWidth(v)),
    }
}

/// Resolve an operand list against layout and graph; every entry becomes one
/// 32-bit word.
pub(crate) fn resolve_words(
    operands: &[Operand],
    graph: &ValueGraph,
    layout: &Layout,
) -> Result<Vec<u32>, EmitError> {
    operands
        .iter()
        .map(|op| match op {
            Operand::Value(id) => resolve_i32(graph, *id).map(|v| v as u32),
            Operand::Label(name) => layout.label(name),
        })
        .collect()
}

/// Resolved static-initializer table as `(address, i32 value)` pairs.
pub(crate) fn init_table(
    storage: &StorageAllocator,
    graph: &ValueGraph,
) -> Result<Vec<(u32, i32)>, EmitError> {
    storage
        .static_initializers(graph)?
        .into_iter()
        .map(|(addr, value)| {
            let value = match value {
                Num::Float(_) => return Err(EmitError::FloatOperand),
                Num::Int(v) => i32::try_from(v).map_err(|_| EmitError::OperandWidth(v))?,
            };
            let addr = u32::try_from(addr).map_err(|_| EmitError::OperandWidth(addr))?;
            Ok((addr, value))
        })
        .collect()
}

// ---- Little-endian byte writing ----

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Length-prefixed UTF-8 name.
pub(crate) fn put_name(out: &mut Vec<u8>, name: &str) {
    put_u32(out, name.len() as u32);
    out.extend_from_slice(name.as_bytes());
}

/// Numeric opcode shared by all formats.
pub(crate) const fn opcode_number(pcode: Pcode) -> u16 {
    pcode as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[test]
    fn fixed_layout_offsets() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let n = graph.int(1);
        code.emit(Pcode::PushImmediate, vec![Operand::Value(n)], Span::UNKNOWN);
        let here = code.emit(Pcode::Suspend, vec![], Span::UNKNOWN);
        code.attach_label(here, "m.0").unwrap();
        code.emit(
            Pcode::Jump,
            vec![Operand::Label("m.0".to_string())],
            Span::UNKNOWN,
        );

        let layout = fixed_layout(&code, 8);
        assert_eq!(layout.offsets, vec![8, 16, 20]);
        assert_eq!(layout.label("m.0").unwrap(), 16);
        assert_eq!(layout.end, 28);
    }

    #[test]
    fn unknown_label_reported() {
        let code = CodeSeq::new();
        let layout = fixed_layout(&code, 0);
        assert_eq!(
            layout.label("ghost"),
            Err(EmitError::UnknownLabel("ghost".to_string()))
        );
    }

    #[test]
    fn operand_width_enforced() {
        let mut graph = ValueGraph::new();
        let big = graph.int(i64::from(i32::MAX) + 1);
        assert_eq!(
            resolve_i32(&graph, big),
            Err(EmitError::OperandWidth(i64::from(i32::MAX) + 1))
        );
        let ok = graph.int(-5);
        assert_eq!(resolve_i32(&graph, ok), Ok(-5));
    }

    #[test]
    fn float_operand_rejected() {
        let mut graph = ValueGraph::new();
        let f = graph.literal(Num::Float(1.5));
        assert_eq!(resolve_i32(&graph, f), Err(EmitError::FloatOperand));
    }

    #[test]
    fn repertoire_is_checked_per_target() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let n = graph.int(0);
        code.emit(Pcode::PushGlobalReg, vec![Operand::Value(n)], Span::UNKNOWN);
        let storage = StorageAllocator::new();

        let err = write(Target::Plain, &code, &graph, &storage).unwrap_err();
        assert_eq!(
            err,
            EmitError::Unsupported { opcode: "push.greg", target: Target::Plain }
        );
        assert!(write(Target::Portable, &code, &graph, &storage).is_ok());
    }
}
