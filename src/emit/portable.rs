//! The portable target: the plain instruction encoding plus the metadata a
//! linker needs to rebase the image — a function directory, script flags,
//! and a relocation record for every patched label operand.
//!
//! Directory order: scripts, functions, strings, initializers, relocations.

use super::{
    fixed_layout, init_table, opcode_number, put_i32, put_name, put_u32, resolve_i32,
    EmitError,
};
use crate::code::{CodeSeq, Operand};
use crate::graph::ValueGraph;
use crate::storage::StorageAllocator;

const HEADER_LEN: u32 = 8;

/// Entry-offset sentinel for imported functions.
const IMPORTED: u32 = u32::MAX;

pub(super) fn write(
    code: &CodeSeq,
    graph: &ValueGraph,
    storage: &StorageAllocator,
) -> Result<Vec<u8>, EmitError> {
    let layout = fixed_layout(code, HEADER_LEN);

    let mut out = Vec::new();
    out.extend_from_slice(b"QVMP");
    put_u32(&mut out, layout.end);

    // (patch site, target) pairs collected while the code is serialized.
    let mut relocations: Vec<(u32, u32)> = Vec::new();

    for (i, instr) in code.instrs().iter().enumerate() {
        put_u32(&mut out, opcode_number(instr.pcode) as u32);
        for (slot, operand) in instr.operands.iter().enumerate() {
            match operand {
                Operand::Value(id) => put_i32(&mut out, resolve_i32(graph, *id)?),
                Operand::Label(name) => {
                    let target = layout.label(name)?;
                    let site = layout.offsets[i] + 4 + 4 * slot as u32;
                    relocations.push((site, target));
                    put_u32(&mut out, target);
                }
            }
        }
    }

    // Script table, with flags
    put_u32(&mut out, code.scripts().len() as u32);
    for script in code.scripts() {
        put_u32(&mut out, resolve_i32(graph, script.number)? as u32);
        put_u32(&mut out, layout.label(&script.entry)?);
        put_u32(&mut out, script.argc);
        put_u32(&mut out, script.flags);
    }

    // Function table
    put_u32(&mut out, code.functions().len() as u32);
    for func in code.functions() {
        put_name(&mut out, &func.name);
        match &func.entry {
            Some(label) => put_u32(&mut out, layout.label(label)?),
            None => put_u32(&mut out, IMPORTED),
        }
        put_u32(&mut out, func.argc);
        put_u32(&mut out, func.locals);
        put_u32(&mut out, func.returns as u32);
    }

    // String table
    put_u32(&mut out, code.strings().len() as u32);
    let mut blob = Vec::new();
    for s in code.strings() {
        put_u32(&mut out, blob.len() as u32);
        blob.extend_from_slice(s.as_bytes());
        blob.push(0);
    }
    out.extend_from_slice(&blob);

    // Static-initializer table
    let inits = init_table(storage, graph)?;
    put_u32(&mut out, inits.len() as u32);
    for (addr, value) in inits {
        put_u32(&mut out, addr);
        put_i32(&mut out, value);
    }

    // Relocation records
    put_u32(&mut out, relocations.len() as u32);
    for (site, target) in relocations {
        put_u32(&mut out, site);
        put_u32(&mut out, target);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::code::{FunctionEntry, Operand, Pcode};

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn relocations_list_every_label_patch_site() {
        let mut code = CodeSeq::new();
        let graph = ValueGraph::new();
        code.emit(
            Pcode::Jump,
            vec![Operand::Label("m.0".to_string())],
            Span::UNKNOWN,
        );
        let target = code.emit(Pcode::Terminate, vec![], Span::UNKNOWN);
        code.attach_label(target, "m.0").unwrap();

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        assert_eq!(&bytes[0..4], b"QVMP");

        // Trailer: ..., reloc count, (site, target)
        let n = bytes.len();
        assert_eq!(u32_at(&bytes, n - 12), 1);
        assert_eq!(u32_at(&bytes, n - 8), 12); // jump operand word
        assert_eq!(u32_at(&bytes, n - 4), 16); // terminate offset
        // The patched word itself holds the resolved target.
        assert_eq!(u32_at(&bytes, 12), 16);
    }

    #[test]
    fn value_operands_are_not_relocated() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let n = graph.int(3);
        code.emit(Pcode::PushImmediate, vec![Operand::Value(n)], Span::UNKNOWN);

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        assert_eq!(u32_at(&bytes, bytes.len() - 4), 0); // reloc count
    }

    #[test]
    fn function_directory_with_imported_entry() {
        let mut code = CodeSeq::new();
        let graph = ValueGraph::new();
        let body = code.emit(Pcode::ReturnVoid, vec![], Span::UNKNOWN);
        code.attach_label(body, "m.f.0").unwrap();
        code.add_function(FunctionEntry {
            name: "fn$local".to_string(),
            entry: Some("m.f.0".to_string()),
            argc: 2,
            locals: 3,
            returns: false,
        })
        .unwrap();
        code.add_function(FunctionEntry {
            name: "puts".to_string(),
            entry: None,
            argc: 1,
            locals: 0,
            returns: true,
        })
        .unwrap();

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        let dir = u32_at(&bytes, 4) as usize;
        let funcs = dir + 4; // empty script table
        assert_eq!(u32_at(&bytes, funcs), 2);

        let mut at = funcs + 4;
        let name_len = u32_at(&bytes, at) as usize;
        assert_eq!(&bytes[at + 4..at + 4 + name_len], b"fn$local");
        at += 4 + name_len;
        assert_eq!(u32_at(&bytes, at), 8); // entry offset of ret
        assert_eq!(u32_at(&bytes, at + 4), 2); // argc
        assert_eq!(u32_at(&bytes, at + 8), 3); // locals
        assert_eq!(u32_at(&bytes, at + 12), 0); // returns
        at += 16;

        let name_len = u32_at(&bytes, at) as usize;
        assert_eq!(&bytes[at + 4..at + 4 + name_len], b"puts");
        at += 4 + name_len;
        assert_eq!(u32_at(&bytes, at), IMPORTED);
    }

    #[test]
    fn script_entries_carry_flags() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let entry = code.emit(Pcode::Terminate, vec![], Span::UNKNOWN);
        code.attach_label(entry, "m.s.0").unwrap();
        code.add_script(crate::code::ScriptEntry {
            number: graph.int(7),
            entry: "m.s.0".to_string(),
            argc: 1,
            flags: 0x2,
        });

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        let dir = u32_at(&bytes, 4) as usize;
        assert_eq!(u32_at(&bytes, dir), 1);
        assert_eq!(u32_at(&bytes, dir + 4), 7);
        assert_eq!(u32_at(&bytes, dir + 8), 8);
        assert_eq!(u32_at(&bytes, dir + 12), 1);
        assert_eq!(u32_at(&bytes, dir + 16), 0x2);
    }
}
