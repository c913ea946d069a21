//! The plain target: 4-byte fixed-width instruction words with the script,
//! string and static-initializer tables inline in a single directory.
//!
//! Layout:
//! ```text
//! "QVM0"                      magic
//! u32  directory offset
//! code ...                    u32 opcode, u32 per operand
//! directory:
//!   u32 script count, then per script: u32 number, u32 entry, u32 argc
//!   u32 string count, u32 offsets into the blob, NUL-terminated bytes
//!   u32 initializer count, then per entry: u32 address, i32 value
//! ```

use super::{
    fixed_layout, init_table, opcode_number, put_i32, put_u32, resolve_i32, resolve_words,
    EmitError,
};
use crate::code::CodeSeq;
use crate::graph::ValueGraph;
use crate::storage::StorageAllocator;

const HEADER_LEN: u32 = 8;

pub(super) fn write(
    code: &CodeSeq,
    graph: &ValueGraph,
    storage: &StorageAllocator,
) -> Result<Vec<u8>, EmitError> {
    let layout = fixed_layout(code, HEADER_LEN);

    let mut out = Vec::new();
    out.extend_from_slice(b"QVM0");
    put_u32(&mut out, layout.end);

    for instr in code.instrs() {
        put_u32(&mut out, opcode_number(instr.pcode) as u32);
        for word in resolve_words(&instr.operands, graph, &layout)? {
            put_u32(&mut out, word);
        }
    }
    debug_assert_eq!(out.len() as u32, layout.end);

    // Script table
    put_u32(&mut out, code.scripts().len() as u32);
    for script in code.scripts() {
        put_u32(&mut out, resolve_i32(graph, script.number)? as u32);
        put_u32(&mut out, layout.label(&script.entry)?);
        put_u32(&mut out, script.argc);
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

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::code::{Operand, Pcode, ScriptEntry};
    use crate::emit::Target;
    use crate::storage::{StorageClass, TargetCaps};

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn header_and_code_words() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let five = graph.int(5);
        let entry = code.emit(Pcode::PushImmediate, vec![Operand::Value(five)], Span::UNKNOWN);
        code.attach_label(entry, "m.s.0").unwrap();
        code.emit(Pcode::Terminate, vec![], Span::UNKNOWN);
        code.add_script(ScriptEntry {
            number: graph.int(1),
            entry: "m.s.0".to_string(),
            argc: 0,
            flags: 0,
        });

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        assert_eq!(&bytes[0..4], b"QVM0");

        // Code: push.imm 5 (8 bytes) + terminate (4 bytes) from offset 8.
        assert_eq!(u32_at(&bytes, 8), opcode_number(Pcode::PushImmediate) as u32);
        assert_eq!(u32_at(&bytes, 12), 5);
        assert_eq!(u32_at(&bytes, 16), opcode_number(Pcode::Terminate) as u32);

        // Directory starts right after the code.
        let dir = u32_at(&bytes, 4) as usize;
        assert_eq!(dir, 20);
        assert_eq!(u32_at(&bytes, dir), 1); // one script
        assert_eq!(u32_at(&bytes, dir + 4), 1); // number
        assert_eq!(u32_at(&bytes, dir + 8), 8); // entry offset
        assert_eq!(u32_at(&bytes, dir + 12), 0); // argc
    }

    #[test]
    fn jump_operand_becomes_target_offset() {
        let mut code = CodeSeq::new();
        let graph = ValueGraph::new();
        code.emit(
            Pcode::Jump,
            vec![Operand::Label("m.s.0".to_string())],
            Span::UNKNOWN,
        );
        code.emit(Pcode::Nop, vec![], Span::UNKNOWN);
        let target = code.emit(Pcode::Terminate, vec![], Span::UNKNOWN);
        code.attach_label(target, "m.s.0").unwrap();

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        // jump is 8 bytes at offset 8, nop 4 bytes at 16, target at 20.
        assert_eq!(u32_at(&bytes, 12), 20);
    }

    #[test]
    fn string_table_is_nul_terminated() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let a = code.intern("hi");
        let _ = code.intern("yo");
        let node = graph.string_ref(a);
        code.emit(Pcode::PushString, vec![Operand::Value(node)], Span::UNKNOWN);

        let bytes = write(&code, &graph, &StorageAllocator::new()).unwrap();
        let dir = u32_at(&bytes, 4) as usize;
        let strings = dir + 4; // skip empty script table
        assert_eq!(u32_at(&bytes, strings), 2);
        let blob = strings + 4 + 2 * 4;
        assert_eq!(u32_at(&bytes, strings + 4), 0);
        assert_eq!(u32_at(&bytes, strings + 8), 3);
        assert_eq!(&bytes[blob..blob + 6], b"hi\0yo\0");
    }

    #[test]
    fn initializer_table_carries_resolved_values() {
        let mut code = CodeSeq::new();
        let mut graph = ValueGraph::new();
        let mut storage = StorageAllocator::new();
        let two = graph.int(2);
        let three = graph.int(3);
        let sum = graph.binary(crate::ast::BinOp::Add, two, three);
        storage.declare(StorageClass::Static, "static$x", Some(sum), Span::UNKNOWN, &mut graph);
        storage
            .allocate_all(&TargetCaps::for_target(Target::Plain), &mut graph)
            .unwrap();
        code.emit(Pcode::Terminate, vec![], Span::UNKNOWN);

        let bytes = write(&code, &graph, &storage).unwrap();
        let dir = u32_at(&bytes, 4) as usize;
        // empty script table (4) + empty string table (4)
        let inits = dir + 8;
        assert_eq!(u32_at(&bytes, inits), 1);
        assert_eq!(u32_at(&bytes, inits + 4), 0); // x's address
        assert_eq!(u32_at(&bytes, inits + 8), 5); // folded 2 + 3
    }
}
