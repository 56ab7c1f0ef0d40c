//! Compiler configuration — §6 "(AMBIENT — configuration)". Mirrors the
//! teacher's `CompilerConfig` builder pattern but scoped to what this
//! language's driver actually needs: GC mode, macro expansion depth limit,
//! default namespace name, and extra FFI manifest paths for
//! `def-ffi-fn*`. Loadable from TOML via `toml`, the teacher's own
//! dependency for this.

use std::path::PathBuf;

use serde::Deserialize;

use crate::analyzer::MAX_MACRO_EXPANSION_DEPTH;
use crate::namespace::DEFAULT_NAMESPACE;

/// Mirrors `el_runtime::GcMode` without depending on the runtime crate's
/// enum layout directly in a serde-derived type — kept as a thin, separately
/// deserializable twin and converted at the point `gc::init` is called.
///
/// `CompilerOwned` parses from TOML like any other variant (so a config file
/// naming it is never a parse error) but `compile_source` rejects it before
/// compiling anything: this backend never emits the `rt_enter_gc` safepoints
/// or populates the statepoint tables that mode's stack walk depends on, so
/// running with it selected would silently collect against zero roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcModeConfig {
    CompilerOwned,
    InterpreterOwned,
}

impl Default for GcModeConfig {
    fn default() -> Self {
        GcModeConfig::InterpreterOwned
    }
}

impl From<GcModeConfig> for el_runtime::GcMode {
    fn from(mode: GcModeConfig) -> Self {
        match mode {
            GcModeConfig::CompilerOwned => el_runtime::GcMode::CompilerOwned,
            GcModeConfig::InterpreterOwned => el_runtime::GcMode::InterpreterOwned,
        }
    }
}

/// Configuration for a compile, loadable from a TOML file via [`CompilerConfig::load`]
/// or built programmatically via the `with_*` builder methods.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub gc_mode: GcModeConfig,
    pub macro_expansion_depth_limit: usize,
    pub default_namespace: String,
    pub ffi_manifest_paths: Vec<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            gc_mode: GcModeConfig::default(),
            macro_expansion_depth_limit: MAX_MACRO_EXPANSION_DEPTH,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            ffi_manifest_paths: Vec::new(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Parses a TOML configuration file. Missing fields fall back to
    /// [`CompilerConfig::default`] via `#[serde(default)]`.
    pub fn load(path: &std::path::Path) -> Result<CompilerConfig, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("failed to parse config file {}: {e}", path.display()))
    }

    pub fn with_gc_mode(mut self, mode: GcModeConfig) -> Self {
        self.gc_mode = mode;
        self
    }

    pub fn with_macro_expansion_depth_limit(mut self, limit: usize) -> Self {
        self.macro_expansion_depth_limit = limit;
        self
    }

    pub fn with_default_namespace(mut self, ns: impl Into<String>) -> Self {
        self.default_namespace = ns.into();
        self
    }

    pub fn with_ffi_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffi_manifest_paths.push(path.into());
        self
    }

    pub fn with_ffi_manifests(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.ffi_manifest_paths.extend(paths);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_spec_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.default_namespace, "el.user");
        assert_eq!(config.macro_expansion_depth_limit, MAX_MACRO_EXPANSION_DEPTH);
        assert_eq!(config.gc_mode, GcModeConfig::InterpreterOwned);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = CompilerConfig::new()
            .with_macro_expansion_depth_limit(10)
            .with_default_namespace("my.ns")
            .with_ffi_manifest("extra.toml");
        assert_eq!(config.macro_expansion_depth_limit, 10);
        assert_eq!(config.default_namespace, "my.ns");
        assert_eq!(config.ffi_manifest_paths, vec![PathBuf::from("extra.toml")]);
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("el.toml");
        std::fs::write(&path, "default-namespace = \"scratch\"\n").unwrap();
        let config = CompilerConfig::load(&path).unwrap();
        assert_eq!(config.default_namespace, "scratch");
        assert_eq!(config.macro_expansion_depth_limit, MAX_MACRO_EXPANSION_DEPTH);
    }
}
