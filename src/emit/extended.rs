//! The extended target: a chunked container with variable-width instruction
//! encoding and separate script/function directories.
//!
//! ```text
//! "QVME"
//! chunks, each: 4-byte tag, u32 payload length, payload
//!   CODE  instruction stream; jump operands are u32 offsets into CODE
//!   FUNC  function directory
//!   SCPT  script directory
//!   STRL  UTF-8 string table, u32 length per entry
//!   SINI  static initializers
//! ```
//!
//! Opcodes encode as one `u8`, with `0xFF` + `u16` as the escape for numbers
//! past the byte range. A `PushImmediate` whose resolved value fits in
//! 0..=255 is rewritten to the one-byte-operand `PushByte` form during
//! layout, so the offsets already account for the shorter encoding.

use std::collections::HashMap;

use super::{
    init_table, opcode_number, put_i32, put_name, put_u16, put_u32, resolve_i32, EmitError,
    Layout,
};
use crate::code::{CodeSeq, Operand, Pcode};
use crate::graph::ValueGraph;
use crate::storage::StorageAllocator;

const OPCODE_ESCAPE: u8 = 0xFF;
const IMPORTED: u32 = u32::MAX;

pub(super) fn write(
    code: &CodeSeq,
    graph: &ValueGraph,
    storage: &StorageAllocator,
) -> Result<Vec<u8>, EmitError> {
    let (layout, encodings) = variable_layout(code, graph)?;

    let mut payload = Vec::new();
    for (instr, &pcode) in code.instrs().iter().zip(&encodings) {
        put_opcode(&mut payload, pcode);
        for operand in &instr.operands {
            match operand {
                Operand::Value(id) => {
                    let v = resolve_i32(graph, *id)?;
                    if pcode == Pcode::PushByte {
                        payload.push(v as u8);
                    } else {
                        put_i32(&mut payload, v);
                    }
                }
                Operand::Label(name) => put_u32(&mut payload, layout.label(name)?),
            }
        }
    }
    debug_assert_eq!(payload.len() as u32, layout.end);

    let mut out = Vec::new();
    out.extend_from_slice(b"QVME");
    chunk(&mut out, b"CODE", &payload);

    let mut funcs = Vec::new();
    put_u32(&mut funcs, code.functions().len() as u32);
    for func in code.functions() {
        put_name(&mut funcs, &func.name);
        match &func.entry {
            Some(label) => put_u32(&mut funcs, layout.label(label)?),
            None => put_u32(&mut funcs, IMPORTED),
        }
        put_u32(&mut funcs, func.argc);
        put_u32(&mut funcs, func.locals);
        put_u32(&mut funcs, func.returns as u32);
    }
    chunk(&mut out, b"FUNC", &funcs);

    let mut scripts = Vec::new();
    put_u32(&mut scripts, code.scripts().len() as u32);
    for script in code.scripts() {
        put_u32(&mut scripts, resolve_i32(graph, script.number)? as u32);
        put_u32(&mut scripts, layout.label(&script.entry)?);
        put_u32(&mut scripts, script.argc);
        put_u32(&mut scripts, script.flags);
    }
    chunk(&mut out, b"SCPT", &scripts);

    let mut strings = Vec::new();
    put_u32(&mut strings, code.strings().len() as u32);
    for s in code.strings() {
        put_name(&mut strings, s);
    }
    chunk(&mut out, b"STRL", &strings);

    let mut inits = Vec::new();
    let table = init_table(storage, graph)?;
    put_u32(&mut inits, table.len() as u32);
    for (addr, value) in table {
        put_u32(&mut inits, addr);
        put_i32(&mut inits, value);
    }
    chunk(&mut out, b"SINI", &inits);

    Ok(out)
}

fn chunk(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    put_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

fn put_opcode(out: &mut Vec<u8>, pcode: Pcode) {
    let n = opcode_number(pcode);
    if n < OPCODE_ESCAPE as u16 {
        out.push(n as u8);
    } else {
        out.push(OPCODE_ESCAPE);
        put_u16(out, n);
    }
}

const fn opcode_width(pcode: Pcode) -> u32 {
    if opcode_number(pcode) < OPCODE_ESCAPE as u16 { 1 } else { 3 }
}

/// Layout pass: per-instruction offsets with the short-form rewrite applied.
/// Returns the effective opcode per instruction alongside the offsets.
fn variable_layout(
    code: &CodeSeq,
    graph: &ValueGraph,
) -> Result<(Layout, Vec<Pcode>), EmitError> {
    let mut offsets = Vec::with_capacity(code.len());
    let mut labels = HashMap::new();
    let mut encodings = Vec::with_capacity(code.len());
    let mut at = 0u32;

    for instr in code.instrs() {
        offsets.push(at);
        for name in &instr.labels {
            labels.insert(name.clone(), at);
        }

        let mut pcode = instr.pcode;
        if pcode == Pcode::PushImmediate {
            let Operand::Value(id) = instr.operands[0] else {
                unreachable!("push operand is a value");
            };
            if (0..=255).contains(&resolve_i32(graph, id)?) {
                pcode = Pcode::PushByte;
            }
        }

        let mut width = opcode_width(pcode);
        for operand in &instr.operands {
            width += match operand {
                Operand::Value(_) if pcode == Pcode::PushByte => 1,
                _ => 4,
            };
        }
        encodings.push(pcode);
        at += width;
    }

    Ok((Layout { offsets, labels, end: at }, encodings))
}
