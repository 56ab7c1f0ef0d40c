//! `elc` CLI — §6 "(AMBIENT — CLI)". Two subcommands: `Build` compiles a
//! source file to a native shared object via the backend, `Eval` compiles
//! and runs a single top-level form and prints its value, the same
//! primitive the `el-repl` crate's read-compile-eval-print loop uses per
//! form.

use std::path::PathBuf;
use std::process;

use clap::{Parser as ClapParser, Subcommand};
use el_core::TaggedValue;
use elc::{Backend, CompilerConfig};
use el_runtime::value as rt_value;

#[derive(ClapParser)]
#[command(name = "elc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "el compiler - compile and run el programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an el source file to a native shared object
    Build {
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long = "ffi-manifest", value_name = "PATH")]
        ffi_manifests: Vec<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compile and run a single top-level form, printing its value
    Eval {
        /// The form to evaluate, e.g. `(+ 1 2)`
        expression: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            ffi_manifests,
            config,
        } => run_build(&input, output, &ffi_manifests, config.as_deref()),
        Commands::Eval { expression, config } => run_eval(&expression, config.as_deref()),
    }
}

fn load_config(path: Option<&std::path::Path>, ffi_manifests: &[PathBuf]) -> CompilerConfig {
    let mut config = match path {
        Some(path) => CompilerConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            process::exit(1);
        }),
        None => CompilerConfig::default(),
    };
    config = config.with_ffi_manifests(ffi_manifests.iter().cloned());
    config
}

fn run_build(input: &std::path::Path, output: Option<PathBuf>, ffi_manifests: &[PathBuf], config_path: Option<&std::path::Path>) {
    let config = load_config(config_path, ffi_manifests);

    let source = std::fs::read_to_string(input).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {e}", input.display());
        process::exit(1);
    });

    let output = output.unwrap_or_else(|| {
        let stem = input.file_stem().unwrap_or_default();
        PathBuf::from(stem).with_extension("so")
    });
    let work_dir = output.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));

    el_runtime::gc::init(config.gc_mode.into());
    let result = elc::compile_source(&source, &input.display().to_string(), &config, work_dir.clone());
    el_runtime::gc::deinit();

    match result {
        Ok(mut program) => {
            // Forces a link so the caller ends up with a ready-to-load
            // shared object at `output`, not just accumulated IR text.
            if let Some(first) = program.units.first() {
                if let Err(e) = program.backend.link_and_resolve(&first.symbol) {
                    eprintln!("Error: {e}");
                    process::exit(1);
                }
            }
            println!("Compiled {} -> {}", input.display(), work_dir.join("el_module.so").display());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn run_eval(expression: &str, config_path: Option<&std::path::Path>) {
    let config = load_config(config_path, &[]);
    let work_dir = std::env::temp_dir().join(format!("elc-eval-{}", process::id()));
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        eprintln!("Failed to create scratch directory: {e}");
        process::exit(1);
    }

    el_runtime::gc::init(config.gc_mode.into());
    let result = elc::eval_source(expression, "<eval>", &config, work_dir.clone());

    match result {
        Ok(value) => println!("{}", format_value(value)),
        Err(e) => {
            eprintln!("Error: {e}");
            el_runtime::gc::deinit();
            std::fs::remove_dir_all(&work_dir).ok();
            process::exit(1);
        }
    }
    el_runtime::gc::deinit();
    std::fs::remove_dir_all(&work_dir).ok();
}

/// Printed representation for `Eval`'s output — §6's "Value printing"
/// contract: integers and floats print as numeric literals, strings quoted,
/// symbols/keywords bare, lists parenthesized, booleans/nil as the reader
/// would accept them back.
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
