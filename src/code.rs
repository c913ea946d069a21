//! Abstract instruction sequence. The builder appends opcode tokens in
//! program order and never reorders or deduplicates them; jump targets stay
//! symbolic (labels) and operand values stay graph-backed until emission.

use std::collections::HashMap;

use crate::ast::Span;
use crate::graph::NodeId;

/// Abstract opcodes. One closed enum, metadata via `const fn` match — no
/// registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pcode {
    // Stack
    Nop,
    PushImmediate,
    PushString,
    /// Short form of `PushImmediate` for 0..=255.
    PushByte,
    Drop,
    Dup,
    Swap,

    // Arithmetic / logic (operate on the evaluation stack)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Truncating cast; the identity on an already-integer stack cell.
    CastInt,

    // Variable access, one pair per storage class
    PushStatic,
    AssignStatic,
    PushAuto,
    AssignAuto,
    PushScriptReg,
    AssignScriptReg,
    PushMapReg,
    AssignMapReg,
    PushWorldReg,
    AssignWorldReg,
    PushGlobalReg,
    AssignGlobalReg,
    PushMapArray,
    AssignMapArray,
    PushWorldArray,
    AssignWorldArray,
    PushGlobalArray,
    AssignGlobalArray,

    // Control transfer
    Jump,
    IfGoto,
    IfNotGoto,
    /// `CaseGoto value, label` — if the stack top equals `value`, pop it and
    /// jump; otherwise leave it for the next comparison.
    CaseGoto,

    // Calls
    Call,
    CallDiscard,
    ReturnVoid,
    ReturnVal,

    // Delay class: script suspension primitives. Serialized in sequence
    // order, never rescheduled.
    Delay,
    DelayImmediate,
    Suspend,
    Terminate,
    Restart,

    // Host print intrinsics
    PrintNumber,
    PrintString,
}

/// How many operands an opcode carries and what they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    Value,
    Label,
    /// A value followed by a label (`CaseGoto`).
    ValueLabel,
}

impl OperandShape {
    pub const fn len(self) -> usize {
        match self {
            OperandShape::None => 0,
            OperandShape::Value | OperandShape::Label => 1,
            OperandShape::ValueLabel => 2,
        }
    }
}

impl Pcode {
    pub const fn name(self) -> &'static str {
        match self {
            Pcode::Nop => "nop",
            Pcode::PushImmediate => "push.imm",
            Pcode::PushString => "push.str",
            Pcode::PushByte => "push.byte",
            Pcode::Drop => "drop",
            Pcode::Dup => "dup",
            Pcode::Swap => "swap",
            Pcode::Add => "add",
            Pcode::Sub => "sub",
            Pcode::Mul => "mul",
            Pcode::Div => "div",
            Pcode::Mod => "mod",
            Pcode::Neg => "neg",
            Pcode::Shl => "shl",
            Pcode::Shr => "shr",
            Pcode::BitAnd => "and.b",
            Pcode::BitOr => "or.b",
            Pcode::BitXor => "xor.b",
            Pcode::BitNot => "not.b",
            Pcode::And => "and.l",
            Pcode::Or => "or.l",
            Pcode::Not => "not.l",
            Pcode::Eq => "cmp.eq",
            Pcode::Ne => "cmp.ne",
            Pcode::Lt => "cmp.lt",
            Pcode::Le => "cmp.le",
            Pcode::Gt => "cmp.gt",
            Pcode::Ge => "cmp.ge",
            Pcode::CastInt => "cast.int",
            Pcode::PushStatic => "push.static",
            Pcode::AssignStatic => "set.static",
            Pcode::PushAuto => "push.auto",
            Pcode::AssignAuto => "set.auto",
            Pcode::PushScriptReg => "push.sreg",
            Pcode::AssignScriptReg => "set.sreg",
            Pcode::PushMapReg => "push.mreg",
            Pcode::AssignMapReg => "set.mreg",
            Pcode::PushWorldReg => "push.wreg",
            Pcode::AssignWorldReg => "set.wreg",
            Pcode::PushGlobalReg => "push.greg",
            Pcode::AssignGlobalReg => "set.greg",
            Pcode::PushMapArray => "push.marr",
            Pcode::AssignMapArray => "set.marr",
            Pcode::PushWorldArray => "push.warr",
            Pcode::AssignWorldArray => "set.warr",
            Pcode::PushGlobalArray => "push.garr",
            Pcode::AssignGlobalArray => "set.garr",
            Pcode::Jump => "jmp",
            Pcode::IfGoto => "jmp.if",
            Pcode::IfNotGoto => "jmp.ifnot",
            Pcode::CaseGoto => "jmp.case",
            Pcode::Call => "call",
            Pcode::CallDiscard => "call.void",
            Pcode::ReturnVoid => "ret",
            Pcode::ReturnVal => "ret.val",
            Pcode::Delay => "delay",
            Pcode::DelayImmediate => "delay.imm",
            Pcode::Suspend => "suspend",
            Pcode::Terminate => "terminate",
            Pcode::Restart => "restart",
            Pcode::PrintNumber => "print.num",
            Pcode::PrintString => "print.str",
        }
    }

    pub const fn shape(self) -> OperandShape {
        match self {
            Pcode::PushImmediate
            | Pcode::PushString
            | Pcode::PushByte
            | Pcode::PushStatic
            | Pcode::AssignStatic
            | Pcode::PushAuto
            | Pcode::AssignAuto
            | Pcode::PushScriptReg
            | Pcode::AssignScriptReg
            | Pcode::PushMapReg
            | Pcode::AssignMapReg
            | Pcode::PushWorldReg
            | Pcode::AssignWorldReg
            | Pcode::PushGlobalReg
            | Pcode::AssignGlobalReg
            | Pcode::PushMapArray
            | Pcode::AssignMapArray
            | Pcode::PushWorldArray
            | Pcode::AssignWorldArray
            | Pcode::PushGlobalArray
            | Pcode::AssignGlobalArray
            | Pcode::Call
            | Pcode::CallDiscard
            | Pcode::DelayImmediate => OperandShape::Value,
            Pcode::Jump | Pcode::IfGoto | Pcode::IfNotGoto => OperandShape::Label,
            Pcode::CaseGoto => OperandShape::ValueLabel,
            _ => OperandShape::None,
        }
    }

    /// Lowest target level whose opcode repertoire includes this opcode.
    /// The repertoires nest strictly: plain ⊂ portable ⊂ extended.
    pub const fn level(self) -> u8 {
        match self {
            // The plain format has no function directory and no global
            // register file.
            Pcode::Call
            | Pcode::CallDiscard
            | Pcode::ReturnVoid
            | Pcode::ReturnVal
            | Pcode::PushGlobalReg
            | Pcode::AssignGlobalReg
            | Pcode::PushGlobalArray
            | Pcode::AssignGlobalArray => 1,
            Pcode::PushByte | Pcode::PushMapArray | Pcode::AssignMapArray => 2,
            _ => 0,
        }
    }

    /// Every opcode, in numeric order: `ALL[p as usize] == p`. The numeric
    /// form is what the binary formats and object files store.
    pub const ALL: [Pcode; 62] = [
        Pcode::Nop,
        Pcode::PushImmediate,
        Pcode::PushString,
        Pcode::PushByte,
        Pcode::Drop,
        Pcode::Dup,
        Pcode::Swap,
        Pcode::Add,
        Pcode::Sub,
        Pcode::Mul,
        Pcode::Div,
        Pcode::Mod,
        Pcode::Neg,
        Pcode::Shl,
        Pcode::Shr,
        Pcode::BitAnd,
        Pcode::BitOr,
        Pcode::BitXor,
        Pcode::BitNot,
        Pcode::And,
        Pcode::Or,
        Pcode::Not,
        Pcode::Eq,
        Pcode::Ne,
        Pcode::Lt,
        Pcode::Le,
        Pcode::Gt,
        Pcode::Ge,
        Pcode::CastInt,
        Pcode::PushStatic,
        Pcode::AssignStatic,
        Pcode::PushAuto,
        Pcode::AssignAuto,
        Pcode::PushScriptReg,
        Pcode::AssignScriptReg,
        Pcode::PushMapReg,
        Pcode::AssignMapReg,
        Pcode::PushWorldReg,
        Pcode::AssignWorldReg,
        Pcode::PushGlobalReg,
        Pcode::AssignGlobalReg,
        Pcode::PushMapArray,
        Pcode::AssignMapArray,
        Pcode::PushWorldArray,
        Pcode::AssignWorldArray,
        Pcode::PushGlobalArray,
        Pcode::AssignGlobalArray,
        Pcode::Jump,
        Pcode::IfGoto,
        Pcode::IfNotGoto,
        Pcode::CaseGoto,
        Pcode::Call,
        Pcode::CallDiscard,
        Pcode::ReturnVoid,
        Pcode::ReturnVal,
        Pcode::Delay,
        Pcode::DelayImmediate,
        Pcode::Suspend,
        Pcode::Terminate,
        Pcode::Restart,
        Pcode::PrintNumber,
        Pcode::PrintString,
    ];

    pub fn from_number(n: u16) -> Option<Pcode> {
        Self::ALL.get(n as usize).copied()
    }

    /// Opcodes with side effects or scheduling constraints; the optimizer
    /// must not fold through or eliminate them.
    pub const fn effectful(self) -> bool {
        matches!(
            self,
            Pcode::AssignStatic
                | Pcode::AssignAuto
                | Pcode::AssignScriptReg
                | Pcode::AssignMapReg
                | Pcode::AssignWorldReg
                | Pcode::AssignGlobalReg
                | Pcode::AssignMapArray
                | Pcode::AssignWorldArray
                | Pcode::AssignGlobalArray
                | Pcode::Call
                | Pcode::CallDiscard
                | Pcode::ReturnVoid
                | Pcode::ReturnVal
                | Pcode::Delay
                | Pcode::DelayImmediate
                | Pcode::Suspend
                | Pcode::Terminate
                | Pcode::Restart
                | Pcode::PrintNumber
                | Pcode::PrintString
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Graph-backed value, resolved at emission.
    Value(NodeId),
    /// Symbolic jump target, resolved by the emitters' layout pass.
    Label(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub pcode: Pcode,
    pub operands: Vec<Operand>,
    pub span: Span,
    /// Names by which jumps may target this instruction. Multiple labels
    /// mean multiple code paths converge here.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEntry {
    /// Script number; may be a symbolic constant expression.
    pub number: NodeId,
    pub entry: String,
    pub argc: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    pub name: String,
    /// `None` for imported (extern) functions with no body in this unit.
    pub entry: Option<String>,
    pub argc: u32,
    pub locals: u32,
    pub returns: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodeError {
    #[error("label '{0}' attached twice")]
    DuplicateLabel(String),

    #[error("function '{0}' registered twice")]
    DuplicateFunction(String),
}

#[derive(Debug, Default, Clone)]
pub struct CodeSeq {
    instrs: Vec<Instr>,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    scripts: Vec<ScriptEntry>,
    functions: Vec<FunctionEntry>,
    /// Every label attached anywhere, for the global-uniqueness check.
    label_names: HashMap<String, InstrId>,
}

impl CodeSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction. `debug_assert` guards the operand shape; the
    /// shape table is the single source of truth for emitters.
    pub fn emit(&mut self, pcode: Pcode, operands: Vec<Operand>, span: Span) -> InstrId {
        debug_assert_eq!(
            operands.len(),
            pcode.shape().len(),
            "wrong operand count for {}",
            pcode.name()
        );
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instr { pcode, operands, span, labels: Vec::new() });
        id
    }

    /// Mark an instruction as the target of `name`. Label names are unique
    /// program-wide; scope-tree mangling guarantees it within one unit, and
    /// the check catches collisions when units are linked.
    pub fn attach_label(&mut self, id: InstrId, name: &str) -> Result<(), CodeError> {
        if self.label_names.contains_key(name) {
            return Err(CodeError::DuplicateLabel(name.to_string()));
        }
        self.label_names.insert(name.to_string(), id);
        self.instrs[id.0 as usize].labels.push(name.to_string());
        Ok(())
    }

    pub fn label_target(&self, name: &str) -> Option<InstrId> {
        self.label_names.get(name).copied()
    }

    /// Intern a string literal, returning its table index.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), i);
        i
    }

    pub fn add_script(&mut self, entry: ScriptEntry) {
        self.scripts.push(entry);
    }

    pub fn add_function(&mut self, entry: FunctionEntry) -> Result<u32, CodeError> {
        if self.functions.iter().any(|f| f.name == entry.name) {
            return Err(CodeError::DuplicateFunction(entry.name));
        }
        let index = self.functions.len() as u32;
        self.functions.push(entry);
        Ok(index)
    }

    /// Patch a function's frame size once its body has been built.
    pub fn set_function_locals(&mut self, index: u32, locals: u32) {
        self.functions[index as usize].locals = locals;
    }

    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u32)
    }

    // ---- Read access for the optimizer, emitters and object writer ----

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn scripts(&self) -> &[ScriptEntry] {
        &self.scripts
    }

    pub fn functions(&self) -> &[FunctionEntry] {
        &self.functions
    }

    /// Replace the instruction list wholesale. The optimizer's rewrite path;
    /// callers must preserve every attached label.
    pub(crate) fn replace_instrs(&mut self, instrs: Vec<Instr>) {
        self.label_names = instrs
            .iter()
            .enumerate()
            .flat_map(|(i, instr)| {
                instr
                    .labels
                    .iter()
                    .map(move |l| (l.clone(), InstrId(i as u32)))
            })
            .collect();
        self.instrs = instrs;
    }

    /// Rebuild from deserialized parts (object-file loading).
    pub(crate) fn from_parts(
        instrs: Vec<Instr>,
        strings: Vec<String>,
        scripts: Vec<ScriptEntry>,
        functions: Vec<FunctionEntry>,
    ) -> Self {
        let string_index = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        let mut seq = CodeSeq {
            instrs: Vec::new(),
            strings,
            string_index,
            scripts,
            functions,
            label_names: HashMap::new(),
        };
        seq.replace_instrs(instrs);
        seq
    }
}

impl PartialEq for CodeSeq {
    fn eq(&self, other: &Self) -> bool {
        // Derived caches (string_index, label_names) are functions of the
        // serialized fields and don't participate.
        self.instrs == other.instrs
            && self.strings == other.strings
            && self.scripts == other.scripts
            && self.functions == other.functions
    }
}
