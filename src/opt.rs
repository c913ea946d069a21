//! Peephole pass over the finished instruction sequence. Runs after the
//! resolution sweep, so every graph-backed operand is expected to resolve.
//!
//! The pass keeps a window of trailing constant pushes and folds operators
//! into them. A label marks a possible external jump target: it flushes the
//! window, and a labeled instruction is never eliminated or folded away.

use crate::ast::{BinOp, UnaryOp};
use crate::code::{CodeSeq, Instr, Operand, Pcode};
use crate::graph::{NodeId, ResolveError, ValueGraph};

pub fn optimize(code: &mut CodeSeq, graph: &mut ValueGraph) -> Result<(), ResolveError> {
    let mut out: Vec<Instr> = Vec::with_capacity(code.len());
    // Graph nodes of the constant pushes at the tail of `out`, in order.
    let mut window: Vec<NodeId> = Vec::new();

    for instr in code.instrs() {
        if !instr.labels.is_empty() {
            window.clear();
            out.push(instr.clone());
            continue;
        }

        match instr.pcode {
            Pcode::Nop => continue,

            // Runtime stack cells are integers; truncation is the identity.
            Pcode::CastInt => continue,

            Pcode::PushImmediate | Pcode::PushByte => {
                let Operand::Value(id) = instr.operands[0] else {
                    unreachable!("push operand is a value");
                };
                graph.resolve(id)?;
                window.push(id);
                out.push(instr.clone());
            }

            Pcode::Drop if !window.is_empty() => {
                window.pop();
                out.pop();
            }

            _ => {
                if let Some(op) = binop_of(instr.pcode) {
                    if window.len() >= 2 {
                        let rhs = window.pop().unwrap();
                        let lhs = window.pop().unwrap();
                        out.pop();
                        out.pop();
                        let folded = graph.binary(op, lhs, rhs);
                        let value = graph.resolve(folded)?;
                        let lit = graph.literal(value);
                        window.push(lit);
                        out.push(Instr {
                            pcode: Pcode::PushImmediate,
                            operands: vec![Operand::Value(lit)],
                            span: instr.span,
                            labels: Vec::new(),
                        });
                        continue;
                    }
                } else if let Some(op) = unop_of(instr.pcode) {
                    if let Some(operand) = window.pop() {
                        out.pop();
                        let folded = graph.unary(op, operand);
                        let value = graph.resolve(folded)?;
                        let lit = graph.literal(value);
                        window.push(lit);
                        out.push(Instr {
                            pcode: Pcode::PushImmediate,
                            operands: vec![Operand::Value(lit)],
                            span: instr.span,
                            labels: Vec::new(),
                        });
                        continue;
                    }
                }

                // Anything unfoldable closes the window. Effectful opcodes
                // (assignments, calls, the delay class) land here untouched
                // and in order.
                window.clear();
                out.push(instr.clone());
            }
        }
    }

    code.replace_instrs(out);
    strip_adjacent_jumps(code);
    Ok(())
}

/// Remove unlabeled jumps whose target is the immediately following
/// instruction. Each removal can expose another, so iterate to a fixpoint;
/// the instruction count strictly decreases.
fn strip_adjacent_jumps(code: &mut CodeSeq) {
    loop {
        let mut out: Vec<Instr> = Vec::with_capacity(code.len());
        let mut changed = false;
        for (i, instr) in code.instrs().iter().enumerate() {
            if instr.pcode == Pcode::Jump && instr.labels.is_empty() {
                let Operand::Label(target) = &instr.operands[0] else {
                    unreachable!("jump operand is a label");
                };
                if code.label_target(target) == Some(crate::code::InstrId(i as u32 + 1)) {
                    changed = true;
                    continue;
                }
            }
            out.push(instr.clone());
        }
        if !changed {
            return;
        }
        code.replace_instrs(out);
    }
}

const fn binop_of(pcode: Pcode) -> Option<BinOp> {
    match pcode {
        Pcode::Add => Some(BinOp::Add),
        Pcode::Sub => Some(BinOp::Sub),
        Pcode::Mul => Some(BinOp::Mul),
        Pcode::Div => Some(BinOp::Div),
        Pcode::Mod => Some(BinOp::Mod),
        Pcode::Shl => Some(BinOp::Shl),
        Pcode::Shr => Some(BinOp::Shr),
        Pcode::BitAnd => Some(BinOp::BitAnd),
        Pcode::BitOr => Some(BinOp::BitOr),
        Pcode::BitXor => Some(BinOp::BitXor),
        Pcode::And => Some(BinOp::And),
        Pcode::Or => Some(BinOp::Or),
        Pcode::Eq => Some(BinOp::Eq),
        Pcode::Ne => Some(BinOp::Ne),
        Pcode::Lt => Some(BinOp::Lt),
        Pcode::Le => Some(BinOp::Le),
        Pcode::Gt => Some(BinOp::Gt),
        Pcode::Ge => Some(BinOp::Ge),
        _ => None,
    }
}

const fn unop_of(pcode: Pcode) -> Option<UnaryOp> {
    match pcode {
        Pcode::Neg => Some(UnaryOp::Neg),
        Pcode::Not => Some(UnaryOp::Not),
        Pcode::BitNot => Some(UnaryOp::BitNot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::graph::Num;

    fn push(code: &mut CodeSeq, graph: &mut ValueGraph, v: i64) -> crate::code::InstrId {
        let node = graph.int(v);
        code.emit(Pcode::PushImmediate, vec![Operand::Value(node)], Span::UNKNOWN)
    }

    fn resolved(code: &CodeSeq, graph: &ValueGraph, i: usize) -> Num {
        let Operand::Value(id) = code.instrs()[i].operands[0] else {
            panic!("expected a value operand");
        };
        graph.resolve(id).unwrap()
    }

    #[test]
    fn folds_binary_window() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 2);
        push(&mut code, &mut graph, 3);
        code.emit(Pcode::Add, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();

        assert_eq!(code.len(), 1);
        assert_eq!(code.instrs()[0].pcode, Pcode::PushImmediate);
        assert_eq!(resolved(&code, &graph, 0), Num::Int(5));
    }

    #[test]
    fn folds_cascading_windows() {
        // 2 3 add 4 mul => 20
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 2);
        push(&mut code, &mut graph, 3);
        code.emit(Pcode::Add, vec![], Span::UNKNOWN);
        push(&mut code, &mut graph, 4);
        code.emit(Pcode::Mul, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();

        assert_eq!(code.len(), 1);
        assert_eq!(resolved(&code, &graph, 0), Num::Int(20));
    }

    #[test]
    fn folds_unary() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 7);
        code.emit(Pcode::Neg, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();
        assert_eq!(code.len(), 1);
        assert_eq!(resolved(&code, &graph, 0), Num::Int(-7));
    }

    #[test]
    fn removes_push_drop_pair() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 1);
        code.emit(Pcode::Drop, vec![], Span::UNKNOWN);
        code.emit(Pcode::Suspend, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();
        let kinds: Vec<Pcode> = code.instrs().iter().map(|i| i.pcode).collect();
        assert_eq!(kinds, vec![Pcode::Suspend]);
    }

    #[test]
    fn removes_nop_and_noop_cast() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        code.emit(Pcode::Nop, vec![], Span::UNKNOWN);
        let node = graph.int(0);
        code.emit(Pcode::PushMapReg, vec![Operand::Value(node)], Span::UNKNOWN);
        code.emit(Pcode::CastInt, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();
        let kinds: Vec<Pcode> = code.instrs().iter().map(|i| i.pcode).collect();
        assert_eq!(kinds, vec![Pcode::PushMapReg]);
    }

    #[test]
    fn labeled_nop_survives() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        let id = code.emit(Pcode::Nop, vec![], Span::UNKNOWN);
        code.attach_label(id, "m.s.0").unwrap();
        optimize(&mut code, &mut graph).unwrap();
        assert_eq!(code.len(), 1);
        assert_eq!(code.label_target("m.s.0"), Some(crate::code::InstrId(0)));
    }

    #[test]
    fn label_boundary_blocks_folding() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 2);
        let target = push(&mut code, &mut graph, 3);
        code.attach_label(target, "m.s.0").unwrap();
        code.emit(Pcode::Add, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();
        // A jump may land on the second push; nothing is folded.
        assert_eq!(code.len(), 3);
        assert_eq!(code.instrs()[2].pcode, Pcode::Add);
    }

    #[test]
    fn effectful_opcode_flushes_window() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 2);
        push(&mut code, &mut graph, 3);
        code.emit(Pcode::Suspend, vec![], Span::UNKNOWN);
        code.emit(Pcode::Add, vec![], Span::UNKNOWN);
        optimize(&mut code, &mut graph).unwrap();
        let kinds: Vec<Pcode> = code.instrs().iter().map(|i| i.pcode).collect();
        assert_eq!(
            kinds,
            vec![Pcode::PushImmediate, Pcode::PushImmediate, Pcode::Suspend, Pcode::Add]
        );
    }

    #[test]
    fn removes_jump_to_next_instruction() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        code.emit(
            Pcode::Jump,
            vec![Operand::Label("m.s.0".to_string())],
            Span::UNKNOWN,
        );
        let next = code.emit(Pcode::Suspend, vec![], Span::UNKNOWN);
        code.attach_label(next, "m.s.0").unwrap();
        optimize(&mut code, &mut graph).unwrap();
        let kinds: Vec<Pcode> = code.instrs().iter().map(|i| i.pcode).collect();
        assert_eq!(kinds, vec![Pcode::Suspend]);
    }

    #[test]
    fn keeps_backward_jump() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        let top = code.emit(Pcode::Suspend, vec![], Span::UNKNOWN);
        code.attach_label(top, "m.s.0").unwrap();
        code.emit(
            Pcode::Jump,
            vec![Operand::Label("m.s.0".to_string())],
            Span::UNKNOWN,
        );
        optimize(&mut code, &mut graph).unwrap();
        assert_eq!(code.len(), 2);
    }

    #[test]
    fn constant_division_by_zero_propagates() {
        let mut graph = ValueGraph::new();
        let mut code = CodeSeq::new();
        push(&mut code, &mut graph, 1);
        push(&mut code, &mut graph, 0);
        code.emit(Pcode::Div, vec![], Span::UNKNOWN);
        assert_eq!(
            optimize(&mut code, &mut graph),
            Err(ResolveError::DivisionByZero)
        );
    }
}
