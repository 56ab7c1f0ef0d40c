//! Namespace manager — §4.5. Grounded on `original_source/src/compiler/
//! NamespaceManager.h`, fully wired into the analyzer's symbol resolution
//! from the start (resolved Open Question 3 in SPEC_FULL.md §9): unqualified
//! lookup checks locals, then current-namespace globals, then imports, then
//! qualified imports.

use std::collections::HashMap;

use crate::ir::Phase;

/// Names `backend::builtin_op` dispatches directly to a runtime primitive by
/// symbol (§6.3's "implement calls to runtime primitives by symbol name"),
/// registered here so ordinary symbol resolution finds them without a user
/// `def` — callers never reach the backend's fast path at all if the
/// analyzer already rejected the symbol as unbound.
const BUILTIN_OPERATORS: &[&str] =
    &["+", "-", "*", "/", "=", "or", "not", "nil?", "car", "cdr", "exception", "throw"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionType {
    Function,
    Macro,
    Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub definition_type: DefinitionType,
    pub phase: Phase,
    pub ns: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Namespace {
    pub name: String,
    pub definitions: HashMap<String, Definition>,
    /// `(target_ns, alias)` pairs imported wholesale via `ns-import`-style
    /// directives; alias defaults to the target namespace's own name.
    pub ns_imports: Vec<(String, Option<String>)>,
    /// `local_name -> (source_ns, original_name)` for individually imported
    /// symbols.
    pub symbol_imports: HashMap<String, (String, String)>,
}

impl Namespace {
    fn new(name: &str) -> Namespace {
        Namespace {
            name: name.to_string(),
            definitions: HashMap::new(),
            ns_imports: Vec::new(),
            symbol_imports: HashMap::new(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ImportSymbolResult {
    Ok,
    NotFound,
    AlreadyExists,
}

/// Owns every namespace created during a compile. The analyzer holds one
/// instance inside `AnalyzerState` rather than behind a global — §5's
/// "Global analyzer state" design note asks for one explicit owned value.
#[derive(Debug, Default)]
pub struct NamespaceManager {
    namespaces: HashMap<String, Namespace>,
}

pub const DEFAULT_NAMESPACE: &str = "el.user";

impl NamespaceManager {
    pub fn new() -> NamespaceManager {
        let mut manager = NamespaceManager {
            namespaces: HashMap::new(),
        };
        manager.get_or_create(DEFAULT_NAMESPACE);
        // Visible at both phases so a macro body can call `+`/`car`/etc.
        // on its own arguments during expansion, not just at load time.
        let builtin_phase = Phase::COMPILE_TIME.union(Phase::LOAD_TIME);
        for name in BUILTIN_OPERATORS {
            manager.add_global(DEFAULT_NAMESPACE, name, DefinitionType::Function, builtin_phase);
        }
        manager
    }

    /// Idempotent: returns the existing namespace if present, else creates
    /// an empty one.
    pub fn get_or_create(&mut self, name: &str) -> &mut Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// Returns `false` if `name` is already defined in `ns` — duplicate
    /// definition is an error to the caller, per §4.5.
    pub fn add_global(
        &mut self,
        ns: &str,
        name: &str,
        definition_type: DefinitionType,
        phase: Phase,
    ) -> bool {
        let namespace = self.get_or_create(ns);
        if namespace.definitions.contains_key(name) {
            return false;
        }
        namespace.definitions.insert(
            name.to_string(),
            Definition {
                definition_type,
                phase,
                ns: ns.to_string(),
                name: name.to_string(),
            },
        );
        true
    }

    /// Returns `false` if `source` was already imported into `target`.
    pub fn import_ns(&mut self, source: &str, target: &str, alias: Option<String>) -> bool {
        self.get_or_create(source);
        let namespace = self.get_or_create(target);
        if namespace.ns_imports.iter().any(|(ns, _)| ns == source) {
            return false;
        }
        namespace.ns_imports.push((source.to_string(), alias));
        true
    }

    pub fn import_symbol(
        &mut self,
        dest: &str,
        source: &str,
        name: &str,
        alias: Option<String>,
    ) -> ImportSymbolResult {
        let exists = self
            .namespaces
            .get(source)
            .map(|ns| ns.definitions.contains_key(name))
            .unwrap_or(false);
        if !exists {
            return ImportSymbolResult::NotFound;
        }
        let local_name = alias.unwrap_or_else(|| name.to_string());
        let namespace = self.get_or_create(dest);
        if namespace.symbol_imports.contains_key(&local_name)
            || namespace.definitions.contains_key(&local_name)
        {
            return ImportSymbolResult::AlreadyExists;
        }
        namespace
            .symbol_imports
            .insert(local_name, (source.to_string(), name.to_string()));
        ImportSymbolResult::Ok
    }

    /// Resolution order (§4.5): unqualified — current ns globals, then
    /// imported symbols, then every wholesale `ns_imports` target searched
    /// by alias/name; qualified — look in imports matching the qualifier,
    /// then fall back to a direct namespace lookup by that name.
    pub fn lookup(
        &self,
        ns: &str,
        qualifying_ns: Option<&str>,
        name: &str,
    ) -> Option<&Definition> {
        let namespace = self.namespaces.get(ns)?;

        if let Some(qualifier) = qualifying_ns {
            for (target, alias) in &namespace.ns_imports {
                let matches = alias.as_deref() == Some(qualifier) || target == qualifier;
                if matches {
                    if let Some(def) = self.namespaces.get(target).and_then(|n| n.definitions.get(name)) {
                        return Some(def);
                    }
                }
            }
            return self.namespaces.get(qualifier).and_then(|n| n.definitions.get(name));
        }

        if let Some(def) = namespace.definitions.get(name) {
            return Some(def);
        }
        if let Some((source_ns, original_name)) = namespace.symbol_imports.get(name) {
            return self.namespaces.get(source_ns).and_then(|n| n.definitions.get(original_name));
        }
        for (target, _) in &namespace.ns_imports {
            if let Some(def) = self.namespaces.get(target).and_then(|n| n.definitions.get(name)) {
                return Some(def);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let mut mgr = NamespaceManager::new();
        mgr.get_or_create("foo");
        assert!(mgr.get("foo").is_some());
        mgr.add_global("foo", "x", DefinitionType::Variable, Phase::LOAD_TIME);
        mgr.get_or_create("foo");
        assert!(mgr.get("foo").unwrap().definitions.contains_key("x"));
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let mut mgr = NamespaceManager::new();
        assert!(mgr.add_global("el.user", "x", DefinitionType::Variable, Phase::LOAD_TIME));
        assert!(!mgr.add_global("el.user", "x", DefinitionType::Variable, Phase::LOAD_TIME));
    }

    #[test]
    fn unqualified_lookup_falls_through_to_imports() {
        let mut mgr = NamespaceManager::new();
        mgr.add_global("math", "square", DefinitionType::Function, Phase::LOAD_TIME);
        mgr.import_ns("math", "el.user", None);
        let def = mgr.lookup("el.user", None, "square").unwrap();
        assert_eq!(def.ns, "math");
    }

    #[test]
    fn qualified_lookup_uses_alias() {
        let mut mgr = NamespaceManager::new();
        mgr.add_global("math", "square", DefinitionType::Function, Phase::LOAD_TIME);
        mgr.import_ns("math", "el.user", Some("m".to_string()));
        let def = mgr.lookup("el.user", Some("m"), "square").unwrap();
        assert_eq!(def.name, "square");
    }

    #[test]
    fn import_symbol_reports_not_found() {
        let mut mgr = NamespaceManager::new();
        let result = mgr.import_symbol("el.user", "math", "square", None);
        assert_eq!(result, ImportSymbolResult::NotFound);
    }
}
