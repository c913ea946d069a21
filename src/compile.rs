//! Compilation driver: wires the phases together and owns the one error
//! type the command line deals with.
//!
//! The pipeline splits at the unit boundary. `build_unit` stops before any
//! address is assigned, which is exactly the state an object file stores;
//! `finish` takes a unit (freshly built or linked) through allocation, the
//! resolution sweep, the peephole pass and serialization.

use crate::ast::Program;
use crate::code::CodeSeq;
use crate::emit::{self, EmitError, Target};
use crate::graph::{DuplicateSymbol, ResolveError, ValueGraph};
use crate::lexer::{self, LexError};
use crate::lower::{self, LowerError};
use crate::object::{self, ObjectError, Unit};
use crate::opt;
use crate::parser::{self, ParseError};
use crate::storage::{StorageAllocator, StorageError, TargetCaps};

#[derive(Debug, Clone)]
pub struct Options {
    pub target: Target,
    /// Module tag, the first component of every mangled label.
    pub module: String,
    /// Append parameter-type letters to internal function symbols.
    pub mangle_types: bool,
    pub optimize: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            target: Target::Extended,
            module: "main".to_string(),
            mangle_types: false,
            optimize: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Lower(#[from] LowerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Symbol(#[from] DuplicateSymbol),
}

pub fn parse_source(source: &str) -> Result<Program, CompileError> {
    Ok(parser::parse(lexer::lex(source)?)?)
}

/// Lower one source file to an unallocated unit. Storage addresses stay
/// symbolic so the result can be saved as an object file and linked later.
pub fn build_unit(source: &str, options: &Options) -> Result<Unit, CompileError> {
    let program = parse_source(source)?;
    let caps = TargetCaps::for_target(options.target);
    let mut graph = ValueGraph::new();
    let mut code = CodeSeq::new();
    let mut storage = StorageAllocator::new();
    lower::lower(
        &program,
        &options.module,
        &caps,
        options.mangle_types,
        &mut graph,
        &mut code,
        &mut storage,
    )?;
    Ok(Unit { graph, code, storage })
}

/// Allocate storage, resolve every graph node, optimize and serialize for
/// the selected target.
pub fn finish(unit: Unit, options: &Options) -> Result<Vec<u8>, CompileError> {
    let Unit { mut graph, mut code, mut storage } = unit;
    let caps = TargetCaps::for_target(options.target);
    storage.allocate_all(&caps, &mut graph)?;
    // Function symbols resolve to directory indices, final only now that
    // linking can no longer reorder the directory.
    for (i, func) in code.functions().iter().enumerate() {
        graph.bind_address(&func.name, i as i64)?;
    }
    graph.set_opcode_set(options.target.opcode_set());
    graph.sweep()?;
    if options.optimize {
        opt::optimize(&mut code, &mut graph)?;
    }
    Ok(emit::write(options.target, &code, &graph, &storage)?)
}

/// Source straight to target bytes.
pub fn compile(source: &str, options: &Options) -> Result<Vec<u8>, CompileError> {
    finish(build_unit(source, options)?, options)
}

/// Source to a relocatable object file.
pub fn compile_object(source: &str, options: &Options) -> Result<Vec<u8>, CompileError> {
    let unit = build_unit(source, options)?;
    Ok(object::save(&unit.graph, &unit.code, &unit.storage))
}

/// Link saved object files and finish the merged unit.
pub fn link_objects(inputs: &[Vec<u8>], options: &Options) -> Result<Vec<u8>, CompileError> {
    let units = inputs
        .iter()
        .map(|bytes| object::load(bytes))
        .collect::<Result<Vec<Unit>, ObjectError>>()?;
    finish(object::link(units)?, options)
}
