//! FFI manifests consumed by `def-ffi-fn*` (§6's "a path to extra FFI
//! manifests"). A manifest names the native libraries a source file's
//! `def-ffi-fn*` declarations need linked in and, optionally, pre-declares
//! the external symbols those declarations bind to — the declarations
//! themselves still come from the source text; a manifest only supplies the
//! linker flags and type checking the compiler can't infer from a bare
//! `extern` name.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

/// A primitive type name as it appears in a `def-ffi-fn*` form's
/// `return_type`/`arg_types` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiType {
    Int,
    Float,
    Bool,
    Str,
    Ptr,
    Void,
}

impl FfiType {
    pub fn parse(name: &str) -> Result<FfiType, String> {
        match name {
            "Int" => Ok(FfiType::Int),
            "Float" => Ok(FfiType::Float),
            "Bool" => Ok(FfiType::Bool),
            "String" => Ok(FfiType::Str),
            "Ptr" => Ok(FfiType::Ptr),
            "Void" => Ok(FfiType::Void),
            other => Err(format!("unknown FFI type '{other}'")),
        }
    }
}

/// One external function a manifest's library exposes, for cross-checking
/// against a source file's `def-ffi-fn*` declarations.
#[derive(Debug, Clone, Deserialize)]
pub struct FfiFunction {
    pub c_name: String,
    #[serde(default)]
    pub arg_types: Vec<String>,
    pub return_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfiLibrary {
    pub name: String,
    /// Linker flag, e.g. `readline` for `-lreadline`.
    pub link: String,
    #[serde(rename = "function", default)]
    pub functions: Vec<FfiFunction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfiManifest {
    #[serde(rename = "library")]
    pub libraries: Vec<FfiLibrary>,
}

impl FfiManifest {
    pub fn parse(content: &str) -> Result<FfiManifest, String> {
        let manifest: FfiManifest =
            toml::from_str(content).map_err(|e| format!("failed to parse FFI manifest: {e}"))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<FfiManifest, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read FFI manifest {}: {e}", path.display()))?;
        FfiManifest::parse(&content)
    }

    fn validate(&self) -> Result<(), String> {
        if self.libraries.is_empty() {
            return Err("FFI manifest must define at least one library".to_string());
        }
        for lib in &self.libraries {
            if lib.name.trim().is_empty() {
                return Err("FFI library has an empty name".to_string());
            }
            if lib.link.trim().is_empty() {
                return Err(format!("FFI library '{}' has an empty linker flag", lib.name));
            }
            // Security: the linker flag is interpolated into a `clang`
            // command line as `-l<flag>`; reject anything but a bare
            // library name so a manifest can't smuggle in extra flags.
            for c in lib.link.chars() {
                if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
                    return Err(format!(
                        "FFI library '{}' has an invalid character '{}' in linker flag '{}'",
                        lib.name, c, lib.link
                    ));
                }
            }
            for func in &lib.functions {
                if func.c_name.trim().is_empty() {
                    return Err(format!("FFI function in library '{}' has an empty c_name", lib.name));
                }
                FfiType::parse(&func.return_type)?;
                for arg in &func.arg_types {
                    FfiType::parse(arg)?;
                }
            }
        }
        Ok(())
    }

    pub fn linker_flags(&self) -> Vec<String> {
        self.libraries.iter().map(|lib| lib.link.clone()).collect()
    }

    pub fn external_names(&self) -> HashSet<String> {
        self.libraries
            .iter()
            .flat_map(|lib| lib.functions.iter())
            .map(|f| f.c_name.clone())
            .collect()
    }
}

/// Loads every manifest in `paths`, returning the union of their linker
/// flags. A missing or malformed manifest fails the whole build rather than
/// silently dropping a library the source depends on.
pub fn load_manifests(paths: &[std::path::PathBuf]) -> Result<Vec<String>, String> {
    let mut flags = Vec::new();
    for path in paths {
        let manifest = FfiManifest::load(path)?;
        flags.extend(manifest.linker_flags());
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_manifest() {
        let content = r#"
[[library]]
name = "readline"
link = "readline"

[[library.function]]
c_name = "readline"
arg_types = ["String"]
return_type = "String"
"#;
        let manifest = FfiManifest::parse(content).unwrap();
        assert_eq!(manifest.libraries.len(), 1);
        assert_eq!(manifest.linker_flags(), vec!["readline".to_string()]);
        assert!(manifest.external_names().contains("readline"));
    }

    #[test]
    fn rejects_an_empty_manifest() {
        let result = FfiManifest::parse("library = []");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("at least one library"));
    }

    #[test]
    fn rejects_a_linker_flag_with_shell_metacharacters() {
        let content = r#"
[[library]]
name = "evil"
link = "evil -Wl,-rpath,/tmp"
"#;
        let result = FfiManifest::parse(content);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("invalid character"));
    }

    #[test]
    fn rejects_an_unknown_type_name() {
        let content = r#"
[[library]]
name = "mylib"
link = "mylib"

[[library.function]]
c_name = "mystery"
return_type = "Frobnicator"
"#;
        let result = FfiManifest::parse(content);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("unknown FFI type"));
    }
}
