//! `elr` — read-compile-eval-print loop for el.
//!
//! One line in, one value out: each line is compiled and run as a single
//! top-level form via `elc`'s analyzer/backend pipeline, with definitions
//! and macro registrations persisting across lines through one shared
//! `AnalyzerState`/`LlvmTextBackend` pair for the whole session — a
//! repeated `def` in a later line simply rebinds the same global slot. No
//! split-pane IR view, no vi motions: just line editing via `rustyline`,
//! matching the teacher's "line reading only" choice for this crate's
//! dependency stack.
//!
//! Commands:
//!   :quit, :q    exit
//!   :help        show this message

use std::path::PathBuf;

use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use el_core::TaggedValue;
use elc::{AnalyzerState, Backend, CompilerConfig, LlvmTextBackend, MacroExpanderCache};
use el_runtime::value as rt_value;

#[derive(ClapParser)]
#[command(name = "elr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "el read-compile-eval-print loop", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (see `elc`'s config format)
    #[arg(long)]
    config: Option<PathBuf>,
}

const HELP: &str = "\
:quit, :q    exit the REPL
:help        show this message";

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CompilerConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }),
        None => CompilerConfig::default(),
    };

    el_runtime::gc::init(config.gc_mode.into());
    let exit_code = run(&config);
    el_runtime::gc::deinit();
    std::process::exit(exit_code);
}

fn run(config: &CompilerConfig) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Failed to start line editor: {e}");
            return 1;
        }
    };

    let work_dir = std::env::temp_dir().join(format!("elr-{}", std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        eprintln!("Failed to create scratch directory: {e}");
        return 1;
    }

    let mut state = AnalyzerState::new();
    state.current_ns = config.default_namespace.clone();
    let mut backend = LlvmTextBackend::new(work_dir.clone(), &config.default_namespace);
    let mut cache = MacroExpanderCache::default();
    let mut unit_counter = 0usize;

    println!("el {} — :help for commands, :quit to exit", env!("CARGO_PKG_VERSION"));

    loop {
        match editor.readline("el> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                editor.add_history_entry(trimmed).ok();
                match trimmed {
                    ":quit" | ":q" => break,
                    ":help" => {
                        println!("{HELP}");
                        continue;
                    }
                    _ => {}
                }
                match eval_line(&mut state, &mut backend, &mut cache, trimmed, &mut unit_counter) {
                    Ok(Some(value)) => println!("{}", format_value(value)),
                    Ok(None) => {}
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }

    std::fs::remove_dir_all(&work_dir).ok();
    0
}

/// Compiles and runs one line as a single top-level form against the
/// session's persistent analyzer/backend state. Returns `None` for forms
/// with no runtime effect (`defmacro`, `in-ns`).
fn eval_line(
    state: &mut AnalyzerState,
    backend: &mut LlvmTextBackend,
    cache: &mut MacroExpanderCache,
    line: &str,
    unit_counter: &mut usize,
) -> Result<Option<TaggedValue>, elc::CompileError> {
    let arena = el_core::arena::TextArena::new();
    let tokens = elc::lexer::lex(line, &arena, "<repl>")?;
    let nodes = elc::parser::parse(tokens)?;

    let mut last = None;
    for node in &nodes {
        let mut ir = elc::analyzer::analyze(state, node, 0, elc::ir::Phase::LOAD_TIME)?;
        elc::analyzer::collect_closed_overs(&mut ir);
        if matches!(ir.kind, elc::ir::IrKind::DefMacro { .. }) {
            continue;
        }
        let expanded = elc::macro_engine::fully_expand(state, backend, cache, ir)?;
        *unit_counter += 1;
        let symbol = format!("el_repl_unit_{unit_counter}");
        backend.emit_top_level_init(&symbol, &expanded)?;
        let fn_ptr = backend.link_and_resolve(&symbol)?;
        let init: extern "C" fn() -> TaggedValue = unsafe { std::mem::transmute(fn_ptr) };
        last = Some(init());
    }
    Ok(last)
}

fn format_value(value: TaggedValue) -> String {
    if value.is_integer() {
        value.as_integer().to_string()
    } else if value.is_true() {
        "true".to_string()
    } else if value.is_false() {
        "false".to_string()
    } else if value.is_nil() {
        "nil".to_string()
    } else if rt_value::rt_is_float(value) {
        rt_value::rt_float_value(value).to_string()
    } else if rt_value::rt_is_string(value) {
        format!("\"{}\"", cstr(rt_value::rt_string_value(value)))
    } else if rt_value::rt_is_symbol(value) {
        cstr(rt_value::rt_symbol_extract_string(value))
    } else if rt_value::rt_is_keyword(value) {
        format!(":{}", cstr(rt_value::rt_keyword_extract_string(value)))
    } else if rt_value::rt_is_pair(value) {
        let mut parts = Vec::new();
        let mut cursor = value;
        loop {
            if cursor.is_nil() {
                break;
            }
            if !rt_value::rt_is_pair(cursor) {
                parts.push(format!(". {}", format_value(cursor)));
                break;
            }
            parts.push(format_value(rt_value::rt_car(cursor)));
            cursor = rt_value::rt_cdr(cursor);
        }
        format!("({})", parts.join(" "))
    } else if rt_value::rt_is_function(value) {
        "#<function>".to_string()
    } else {
        format!("#<object {:#x}>", value.0)
    }
}

fn cstr(ptr: *const std::os::raw::c_char) -> String {
    unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
