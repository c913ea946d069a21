//! quillc — compiler for the quill scripting language, targeting the quill
//! stack VM family.
//!
//! Source is lexed and parsed into an AST, lowered into three cooperating
//! structures — a symbolic value graph of lazy constants, an abstract
//! instruction sequence, and a deferred storage allocator — then allocated,
//! resolved, peephole-optimized and serialized for one of three binary
//! targets. Units can also stop halfway and be saved as relocatable object
//! files, to be linked and finished later.

pub mod ast;
pub mod code;
pub mod compile;
pub mod diagnostic;
pub mod emit;
pub mod graph;
pub mod lexer;
pub mod lower;
pub mod object;
pub mod opt;
pub mod parser;
pub mod scope;
pub mod storage;

pub use compile::{CompileError, Options};
pub use emit::Target;
