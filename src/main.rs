use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use quillc::ast::SourceMap;
use quillc::compile::{self, Options};
use quillc::diagnostic::{self, Diagnostic};
use quillc::emit::Target;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum TargetArg {
    Plain,
    Portable,
    Extended,
}

impl From<TargetArg> for Target {
    fn from(t: TargetArg) -> Target {
        match t {
            TargetArg::Plain => Target::Plain,
            TargetArg::Portable => Target::Portable,
            TargetArg::Extended => Target::Extended,
        }
    }
}

#[derive(Parser)]
#[command(name = "quillc", version, about = "Compile quill sources to VM bytecode")]
struct Cli {
    /// A source file to compile, or object files to link.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output path. Defaults to the first input's stem with the
    /// target-appropriate extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = TargetArg::Extended)]
    target: TargetArg,

    /// Emit a relocatable object file instead of a finished binary.
    #[arg(short = 'c', long)]
    object: bool,

    /// Print the parsed AST as JSON and exit.
    #[arg(long)]
    emit_ast: bool,

    /// Module tag used in mangled labels. Defaults to the input file stem.
    #[arg(long)]
    module: Option<String>,

    /// Append parameter-type letters to internal function symbols.
    #[arg(long)]
    mangle_types: bool,

    /// Skip the peephole pass.
    #[arg(long)]
    no_opt: bool,

    /// Render diagnostics as JSON, one object per line.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let options = Options {
        target: cli.target.into(),
        module: cli
            .module
            .clone()
            .unwrap_or_else(|| stem(&cli.inputs[0])),
        mangle_types: cli.mangle_types,
        optimize: !cli.no_opt,
    };

    let first = read_bytes(&cli.inputs[0])?;
    if cli.inputs.len() > 1 || first.starts_with(b"QOBJ") {
        return link(cli, first, &options);
    }

    let path = &cli.inputs[0];
    let source = String::from_utf8(first)
        .map_err(|_| format!("error: {} is not UTF-8 source", path.display()))?;
    let map = SourceMap::new(path.display().to_string(), &source);
    let report = |e: &compile::CompileError| render(cli, &Diagnostic::from(e), &map);

    if cli.emit_ast {
        let program = compile::parse_source(&source).map_err(|e| report(&e))?;
        let json = serde_json::to_string_pretty(&program)
            .map_err(|e| format!("error: serializing AST: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let (bytes, extension) = if cli.object {
        (compile::compile_object(&source, &options).map_err(|e| report(&e))?, "qo")
    } else {
        (compile::compile(&source, &options).map_err(|e| report(&e))?, "qvm")
    };
    write_output(cli, path, extension, &bytes)
}

fn link(cli: &Cli, first: Vec<u8>, options: &Options) -> Result<(), String> {
    let mut objects = vec![first];
    for path in &cli.inputs[1..] {
        objects.push(read_bytes(path)?);
    }
    for (path, bytes) in cli.inputs.iter().zip(&objects) {
        if !bytes.starts_with(b"QOBJ") {
            return Err(format!(
                "error: {} is not an object file; link inputs must all be objects",
                path.display()
            ));
        }
    }

    let empty = SourceMap::new("<link>", "");
    let bytes = compile::link_objects(&objects, options)
        .map_err(|e| render(cli, &Diagnostic::from(&e), &empty))?;
    write_output(cli, &cli.inputs[0], "qvm", &bytes)
}

fn render(cli: &Cli, d: &Diagnostic, map: &SourceMap) -> String {
    if cli.json {
        diagnostic::json::render(d, Some(map))
    } else {
        d.render(map)
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|e| format!("error: reading {}: {e}", path.display()))
}

fn write_output(cli: &Cli, input: &Path, extension: &str, bytes: &[u8]) -> Result<(), String> {
    let path = match &cli.output {
        Some(path) => path.clone(),
        None => input.with_extension(extension),
    };
    fs::write(&path, bytes).map_err(|e| format!("error: writing {}: {e}", path.display()))
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string())
}
