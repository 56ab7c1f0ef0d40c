//! el compiler library.
//!
//! Provides the full source-to-native-code pipeline described in §2:
//! lex → parse → analyze (building IR, one top-level form at a time) →
//! macro expansion → backend emission → link. [`compile_source`] and
//! [`eval_source`] are the two entry points `elc`'s CLI (`Build`/`Eval`)
//! and the REPL crate build on.

pub mod analyzer;
pub mod ast;
pub mod backend;
pub mod config;
pub mod error;
pub mod ffi;
pub mod ir;
pub mod lexer;
pub mod macro_engine;
pub mod namespace;
pub mod parser;

pub use analyzer::AnalyzerState;
pub use backend::{Backend, LlvmTextBackend};
pub use config::CompilerConfig;
pub use error::CompileError;
pub use macro_engine::MacroExpanderCache;

use std::path::PathBuf;

use el_core::arena::TextArena;
use el_core::TaggedValue;

use crate::ir::{IrNode, Phase};

/// One compiled top-level form with its init function symbol, ready to be
/// linked and run in source order.
pub struct CompiledUnit {
    pub symbol: String,
}

/// Everything a compile of a whole source file produces: the backend
/// (holding the accumulated module text and, once linked, the loaded
/// library) and the init symbols to run in order.
pub struct CompiledProgram {
    pub backend: LlvmTextBackend,
    pub units: Vec<CompiledUnit>,
}

/// Lexes, parses, and analyzes `source` into a flat sequence of top-level
/// IR nodes — shared by [`compile_source`] and [`eval_source`]. `file`
/// labels every position recorded in the resulting IR and any errors.
fn analyze_source(
    state: &mut AnalyzerState,
    source: &str,
    file: &str,
) -> Result<Vec<IrNode>, CompileError> {
    let arena = TextArena::new();
    let tokens = lexer::lex(source, &arena, file)?;
    let nodes = parser::parse(tokens)?;

    let mut analyzed = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let mut ir = analyzer::analyze(state, node, 0, Phase::LOAD_TIME)?;
        analyzer::collect_closed_overs(&mut ir);
        analyzed.push(ir);
    }
    Ok(analyzer::collapse_top_level_forms(analyzed))
}

/// Compiles `source` as a whole program: every top-level form becomes one
/// init function, emitted and (on the final form) linked into a single
/// shared object. `work_dir` holds the generated `.ll`/`.so` files. `file`
/// is the source's display name, carried into every `SourcePosition`.
pub fn compile_source(
    source: &str,
    file: &str,
    config: &CompilerConfig,
    work_dir: PathBuf,
) -> Result<CompiledProgram, CompileError> {
    if config.gc_mode == config::GcModeConfig::CompilerOwned {
        return Err(CompileError::Config(
            "gc-mode = compiler-owned is not supported: this backend never emits the \
             rt_enter_gc safepoints or populates the statepoint tables CompilerOwned root \
             discovery requires, so selecting it would run with the collector blind to every \
             on-stack root. Use interpreter-owned (the default)."
                .to_string(),
        ));
    }

    let mut state = AnalyzerState::new();
    state.current_ns = config.default_namespace.clone();
    let mut backend = LlvmTextBackend::new(work_dir, &config.default_namespace);
    let mut cache = MacroExpanderCache::default();

    if !config.ffi_manifest_paths.is_empty() {
        let flags = ffi::load_manifests(&config.ffi_manifest_paths)
            .map_err(|e| CompileError::Link(error::LinkError {
                symbol: String::new(),
                reason: e,
            }))?;
        backend.add_link_flags(flags);
    }

    let top_level = analyze_source(&mut state, source, file)?;

    let mut units = Vec::new();
    for (index, node) in top_level.into_iter().enumerate() {
        // `DefMacro` has already registered itself in `state` during
        // analysis (§4.3); it has no runtime effect of its own and never
        // reaches the backend.
        if matches!(node.kind, ir::IrKind::DefMacro { .. }) {
            continue;
        }
        let expanded = macro_engine::fully_expand(&mut state, &mut backend, &mut cache, node)?;
        let symbol = format!("el_top_level_{index}");
        backend.emit_top_level_init(&symbol, &expanded)?;
        units.push(CompiledUnit { symbol });
    }

    Ok(CompiledProgram { backend, units })
}

/// Compiles `source` and runs every top-level unit in order, returning the
/// final unit's value — the `Eval` subcommand's primitive. `source` is
/// expected to be a single top-level form for "compile-and-run one form",
/// but any number of forms compiles and runs in sequence, returning the
/// last one's result (nil if `source` was empty).
pub fn eval_source(
    source: &str,
    file: &str,
    config: &CompilerConfig,
    work_dir: PathBuf,
) -> Result<TaggedValue, CompileError> {
    let mut program = compile_source(source, file, config, work_dir)?;
    let mut result = TaggedValue::NIL;
    for unit in &program.units {
        let fn_ptr = program.backend.link_and_resolve(&unit.symbol)?;
        let init: extern "C" fn() -> TaggedValue = unsafe { std::mem::transmute(fn_ptr) };
        result = init();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_source_flattens_a_do_block_at_top_level() {
        let mut state = AnalyzerState::new();
        let nodes = analyze_source(&mut state, "(do 1 2 3)", "<test>").unwrap();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn analyze_source_registers_a_macro_without_emitting_a_unit() {
        let mut state = AnalyzerState::new();
        let nodes = analyze_source(&mut state, "(defmacro m [x] x)", "<test>").unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(matches!(nodes[0].kind, ir::IrKind::DefMacro { .. }));
        assert!(state.macro_by_name("m").is_some());
    }

    #[test]
    fn compile_source_rejects_compiler_owned_gc_mode_before_compiling_anything() {
        let config = CompilerConfig::new().with_gc_mode(config::GcModeConfig::CompilerOwned);
        let work_dir = tempfile::tempdir().unwrap();
        let err = compile_source("1234", "<test>", &config, work_dir.path().to_path_buf())
            .expect_err("compiler-owned gc mode has no working root-discovery path");
        assert!(matches!(err, CompileError::Config(_)));
        assert!(err.to_string().contains("compiler-owned"));
    }
}
