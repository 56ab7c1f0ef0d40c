//! Semantic analyzer — §4.3. Turns AST into IR: special form recognition,
//! lexical scope tracking, macro-expansion-site detection, namespace
//! resolution, and the post-passes that run once the whole program's IR
//! exists (closed-over collection, top-level flattening).
//!
//! All analyzer state lives in one `AnalyzerState` value owned by the
//! compile driver (`lib.rs`), per SPEC_FULL.md §5's reading of the
//! "Global analyzer state" design note — no statics, no thread-locals.
//! Depth and phase are threaded as explicit parameters through `analyze`
//! rather than pushed onto stacks inside `AnalyzerState`, since both are
//! scoped purely by the recursion itself; lexical scope and the quoting/
//! macro flags *do* need push/pop discipline (a scope can outlive the call
//! that pushed it only via held references, which Rust's ownership already
//! forbids), so those go through `with_scope`/`with_flag` helpers that
//! guarantee release on every exit path, including analysis failure.

use std::collections::{HashMap, HashSet};

use crate::ast::{Ast, Node};
use crate::error::{AnalysisError, AnalysisErrorKind};
use crate::ir::{Catch, ConstListElement, ConstValue, IrKind, IrNode, Phase};
use crate::lexer::SourcePosition;
use crate::namespace::{DefinitionType, NamespaceManager, DEFAULT_NAMESPACE};

pub const MAX_MACRO_EXPANSION_DEPTH: usize = 512;

pub struct AnalyzerState {
    pub namespaces: NamespaceManager,
    pub current_ns: String,
    local_envs: Vec<HashSet<String>>,
    global_macros: HashMap<String, IrNode>,
    is_quoting: bool,
    in_macro: bool,
}

impl AnalyzerState {
    pub fn new() -> AnalyzerState {
        AnalyzerState {
            namespaces: NamespaceManager::new(),
            current_ns: DEFAULT_NAMESPACE.to_string(),
            local_envs: Vec::new(),
            global_macros: HashMap::new(),
            is_quoting: false,
            in_macro: false,
        }
    }

    fn is_bound_locally(&self, name: &str) -> bool {
        self.local_envs.iter().rev().any(|frame| frame.contains(name))
    }

    pub fn macro_by_name(&self, name: &str) -> Option<&IrNode> {
        self.global_macros.get(name)
    }
}

impl Default for AnalyzerState {
    fn default() -> Self {
        AnalyzerState::new()
    }
}

fn with_scope<T>(
    state: &mut AnalyzerState,
    names: HashSet<String>,
    f: impl FnOnce(&mut AnalyzerState) -> Result<T, AnalysisError>,
) -> Result<T, AnalysisError> {
    state.local_envs.push(names);
    let result = f(state);
    state.local_envs.pop();
    result
}

fn with_quoting<T>(
    state: &mut AnalyzerState,
    quoting: bool,
    f: impl FnOnce(&mut AnalyzerState) -> Result<T, AnalysisError>,
) -> Result<T, AnalysisError> {
    let previous = state.is_quoting;
    state.is_quoting = quoting;
    let result = f(state);
    state.is_quoting = previous;
    result
}

fn with_in_macro<T>(
    state: &mut AnalyzerState,
    f: impl FnOnce(&mut AnalyzerState) -> Result<T, AnalysisError>,
) -> Result<T, AnalysisError> {
    let previous = state.in_macro;
    state.in_macro = true;
    let result = f(state);
    state.in_macro = previous;
    result
}

fn malformed(position: SourcePosition, what: &str) -> AnalysisError {
    AnalysisError {
        position,
        kind: AnalysisErrorKind::MalformedSpecialForm(what.to_string()),
    }
}

fn wrong_arity(position: SourcePosition, form: &str, expected: &str) -> AnalysisError {
    AnalysisError {
        position,
        kind: AnalysisErrorKind::WrongArity {
            form: form.to_string(),
            expected: expected.to_string(),
        },
    }
}

/// Entry point: `analyze(ast, depth, phase) → IR`, per §4.3.
pub fn analyze(
    state: &mut AnalyzerState,
    node: &Node,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    let position = node.position.clone();
    match &node.ast {
        Ast::Integer(i) => Ok(finish(IrKind::Const(ConstValue::Int(*i)), position, depth, phase)),
        Ast::Float(f) => Ok(finish(IrKind::Const(ConstValue::Float(*f)), position, depth, phase)),
        Ast::Boolean(b) => Ok(finish(IrKind::Const(ConstValue::Bool(*b)), position, depth, phase)),
        Ast::String(s) => Ok(finish(IrKind::Const(ConstValue::Str(s.clone())), position, depth, phase)),
        Ast::Keyword(k) => Ok(finish(IrKind::Const(ConstValue::Kw(k.clone())), position, depth, phase)),
        Ast::Nil => Ok(finish(IrKind::Const(ConstValue::Nil), position, depth, phase)),
        Ast::Symbol(name) => analyze_symbol(state, name, position, depth, phase),
        Ast::List(items) if items.is_empty() => {
            Ok(finish(IrKind::Const(ConstValue::Nil), position, depth, phase))
        }
        Ast::List(items) => analyze_list(state, items, node, depth, phase),
    }
}

fn finish(kind: IrKind, position: SourcePosition, depth: usize, phase: Phase) -> IrNode {
    let mut ir = IrNode::new(kind, position, depth);
    ir.evaluation_phase = phase;
    ir
}

fn analyze_symbol(
    state: &mut AnalyzerState,
    name: &str,
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if state.is_quoting {
        return Ok(finish(IrKind::Const(ConstValue::Sym(name.to_string())), position, depth, phase));
    }
    if state.is_bound_locally(name) {
        return Ok(finish(
            IrKind::VarLookup {
                name: name.to_string(),
                is_global: false,
                qualifying_ns: None,
            },
            position,
            depth,
            phase,
        ));
    }

    let (qualifying_ns, local_name) = match name.split_once('/') {
        Some((ns, n)) => (Some(ns.to_string()), n),
        None => (None, name),
    };

    let definition = state
        .namespaces
        .lookup(&state.current_ns, qualifying_ns.as_deref(), local_name);

    let Some(definition) = definition else {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::UnboundSymbol(name.to_string()),
        });
    };

    if state.in_macro && !definition.phase.contains(Phase::COMPILE_TIME) {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::NotVisibleToCompiler(name.to_string()),
        });
    }

    Ok(finish(
        IrKind::VarLookup {
            name: name.to_string(),
            is_global: true,
            qualifying_ns,
        },
        position,
        depth,
        phase,
    ))
}

fn analyze_list(
    state: &mut AnalyzerState,
    items: &[Node],
    whole: &Node,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    let position = whole.position.clone();

    if state.is_quoting {
        return analyze_quoted_list(state, items, position, depth, phase);
    }

    if let Some(head) = whole.head_symbol() {
        if state.global_macros.contains_key(head) {
            let args = with_quoting(state, true, |state| {
                items[1..]
                    .iter()
                    .map(|arg| analyze(state, arg, depth + 1, phase))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            return Ok(finish(
                IrKind::MacroExpand {
                    macro_ref: head.to_string(),
                    args,
                },
                position,
                depth,
                phase,
            ));
        }

        match head {
            "quote" => return analyze_quote(state, items, position, depth, phase),
            "quasiquote" => return analyze_quasiquote(state, items, position, depth, phase),
            "if" => return analyze_if(state, items, position, depth, phase),
            "do" => return analyze_do(state, items, position, depth, phase),
            "lambda" => return analyze_lambda(state, items, position, depth, phase),
            "let" => return analyze_let(state, items, position, depth, phase, false),
            "let*" => return analyze_let(state, items, position, depth, phase, true),
            "def" => return analyze_def(state, items, position, depth, phase),
            "defmacro" => return analyze_defmacro(state, items, position, depth, phase),
            "def-ffi-fn*" => return analyze_def_ffi_fn(state, items, position, depth, phase),
            "set!" => return analyze_set_bang(state, items, position, depth, phase),
            "while" => return analyze_while(state, items, position, depth, phase),
            "try" => return analyze_try(state, items, position, depth, phase),
            "in-ns" => return analyze_in_ns(state, items, position, depth, phase),
            "eval-when" => return analyze_eval_when(state, items, position, depth, phase),
            _ => {}
        }
    }

    let function = analyze(state, &items[0], depth + 1, phase)?;
    let args = items[1..]
        .iter()
        .map(|arg| analyze(state, arg, depth + 1, phase))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(finish(
        IrKind::MaybeInvoke {
            function: Box::new(function),
            args,
        },
        position,
        depth,
        phase,
    ))
}

fn analyze_quote(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 2 {
        return Err(wrong_arity(position, "quote", "exactly one operand"));
    }
    with_quoting(state, true, |state| analyze(state, &items[1], depth + 1, phase))
}

fn analyze_quoted_list(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    let elements = items
        .iter()
        .map(|item| -> Result<ConstListElement, AnalysisError> {
            Ok(ConstListElement {
                node: Box::new(analyze(state, item, depth + 1, phase)?),
                spliced: false,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(finish(IrKind::ConstList { elements }, position, depth, phase))
}

/// Quasiquote: list elements become `ConstList`; `unquote` elements are
/// analyzed as ordinary (non-quoted) expressions; `unquote-splice`
/// behaves the same but its element is flagged `spliced`. This is the
/// concrete semantics SPEC_FULL.md §9 settles (the source this is
/// grounded on left quasiquote's `is_quasi_quoting_` flag unused).
fn analyze_quasiquote(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 2 {
        return Err(wrong_arity(position, "quasiquote", "exactly one operand"));
    }
    analyze_quasiquoted(state, &items[1], depth, phase)
}

fn analyze_quasiquoted(
    state: &mut AnalyzerState,
    node: &Node,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    let position = node.position.clone();
    match &node.ast {
        Ast::List(items) if !items.is_empty() => {
            match items[0].as_symbol() {
                Some("unquote") if items.len() == 2 => {
                    return analyze(state, &items[1], depth + 1, phase);
                }
                Some("unquote-splice") if items.len() == 2 => {
                    // The element itself is the spliced expression's IR;
                    // the caller wraps it with `spliced: true`.
                    return analyze(state, &items[1], depth + 1, phase);
                }
                _ => {}
            }
            let elements = items
                .iter()
                .map(|item| quasiquoted_element(state, item, depth, phase))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(finish(IrKind::ConstList { elements }, position, depth, phase))
        }
        Ast::List(_) => Ok(finish(IrKind::Const(ConstValue::Nil), position, depth, phase)),
        Ast::Symbol(name) => Ok(finish(IrKind::Const(ConstValue::Sym(name.clone())), position, depth, phase)),
        _ => with_quoting(state, true, |state| analyze(state, node, depth + 1, phase)),
    }
}

fn quasiquoted_element(
    state: &mut AnalyzerState,
    node: &Node,
    depth: usize,
    phase: Phase,
) -> Result<ConstListElement, AnalysisError> {
    let spliced = node
        .as_list()
        .and_then(|items| items.first())
        .and_then(Node::as_symbol)
        == Some("unquote-splice");
    Ok(ConstListElement {
        node: Box::new(analyze_quasiquoted(state, node, depth + 1, phase)?),
        spliced,
    })
}

fn analyze_if(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 3 && items.len() != 4 {
        return Err(wrong_arity(position, "if", "2 or 3 operand forms"));
    }
    let cond = analyze(state, &items[1], depth + 1, phase)?;
    let consequent = analyze(state, &items[2], depth + 1, phase)?;
    let alternative = items
        .get(3)
        .map(|node| analyze(state, node, depth + 1, phase))
        .transpose()?;
    Ok(finish(
        IrKind::If {
            cond: Box::new(cond),
            consequent: Box::new(consequent),
            alternative: alternative.map(Box::new),
        },
        position,
        depth,
        phase,
    ))
}

/// Builds a `Do` from `forms` (`n ≥ 1` required by the caller). `Do`'s
/// children share its own depth (§4.3 post-pass 2), not `depth + 1`.
fn build_do(
    state: &mut AnalyzerState,
    forms: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
    form_name: &str,
) -> Result<IrNode, AnalysisError> {
    if forms.is_empty() {
        return Err(wrong_arity(position, form_name, "at least one body form"));
    }
    let (last, rest) = forms.split_last().expect("checked non-empty above");
    let statements = rest
        .iter()
        .map(|form| analyze(state, form, depth, phase))
        .collect::<Result<Vec<_>, _>>()?;
    let return_value = analyze(state, last, depth, phase)?;
    Ok(finish(
        IrKind::Do {
            statements,
            return_value: Box::new(return_value),
        },
        position,
        depth,
        phase,
    ))
}

fn analyze_do(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    build_do(state, &items[1..], position, depth, phase, "do")
}

struct ArgList {
    names: Vec<String>,
    has_rest: bool,
    rest_name: Option<String>,
}

fn parse_arg_list(node: &Node, position: SourcePosition) -> Result<ArgList, AnalysisError> {
    let items = node
        .as_list()
        .ok_or_else(|| malformed(position, "expected an argument list"))?;
    let mut names = Vec::new();
    let mut has_rest = false;
    let mut rest_name = None;
    let mut iter = items.iter();
    while let Some(item) = iter.next() {
        let symbol = item
            .as_symbol()
            .ok_or_else(|| malformed(position, "argument list must contain only symbols"))?;
        if symbol == "&" {
            has_rest = true;
            let rest = iter
                .next()
                .and_then(Node::as_symbol)
                .ok_or_else(|| malformed(position, "`&` must be followed by a rest parameter name"))?;
            rest_name = Some(rest.to_string());
            break;
        }
        names.push(symbol.to_string());
    }
    Ok(ArgList { names, has_rest, rest_name })
}

fn analyze_lambda(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() < 2 {
        return Err(wrong_arity(position, "lambda", "an argument list and a body"));
    }
    let arg_list = parse_arg_list(&items[1], position)?;
    let mut scope: HashSet<String> = arg_list.names.iter().cloned().collect();
    if let Some(rest) = &arg_list.rest_name {
        scope.insert(rest.clone());
    }
    let body = with_scope(state, scope, |state| {
        build_do(state, &items[2..], position, depth + 1, phase, "lambda")
    })?;
    Ok(finish(
        IrKind::Lambda {
            arg_names: arg_list.names,
            has_rest: arg_list.has_rest,
            rest_name: arg_list.rest_name,
            body: Box::new(body),
        },
        position,
        depth,
        phase,
    ))
}

fn analyze_let(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
    sequential: bool,
) -> Result<IrNode, AnalysisError> {
    let form_name = if sequential { "let*" } else { "let" };
    if items.len() < 2 {
        return Err(wrong_arity(position, form_name, "a binding list and a body"));
    }
    let binding_forms = items[1]
        .as_list()
        .ok_or_else(|| malformed(position, "expected a binding list"))?;

    let mut bindings = Vec::new();
    if sequential {
        for binding_form in binding_forms {
            let pair = binding_form
                .as_list()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| malformed(position, "each `let*` binding must be `(name value)`"))?;
            let name = pair[0]
                .as_symbol()
                .ok_or_else(|| malformed(position, "binding name must be a symbol"))?
                .to_string();
            let scope: HashSet<String> = bindings
                .iter()
                .map(|(n, _): &(String, IrNode)| n.clone())
                .collect();
            let value = with_scope(state, scope, |state| analyze(state, &pair[1], depth + 1, phase))?;
            bindings.push((name, value));
        }
    } else {
        for binding_form in binding_forms {
            let pair = binding_form
                .as_list()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| malformed(position, "each `let` binding must be `(name value)`"))?;
            let name = pair[0]
                .as_symbol()
                .ok_or_else(|| malformed(position, "binding name must be a symbol"))?
                .to_string();
            let value = analyze(state, &pair[1], depth + 1, phase)?;
            bindings.push((name, value));
        }
    }

    let scope: HashSet<String> = bindings.iter().map(|(n, _)| n.clone()).collect();
    let body = with_scope(state, scope, |state| {
        build_do(state, &items[2..], position, depth + 1, phase, form_name)
    })?;

    Ok(finish(
        IrKind::Let {
            bindings,
            body: Box::new(body),
            sequential,
        },
        position,
        depth,
        phase,
    ))
}

fn analyze_def(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 3 {
        return Err(wrong_arity(position, "def", "a name and a value"));
    }
    let name = items[1]
        .as_symbol()
        .ok_or_else(|| malformed(position, "def name must be a symbol"))?
        .to_string();
    if !state
        .namespaces
        .add_global(&state.current_ns.clone(), &name, DefinitionType::Variable, phase)
    {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::DuplicateDefinition(name),
        });
    }
    let value = analyze(state, &items[2], depth + 1, phase)?;
    Ok(finish(IrKind::Def { name, value: Box::new(value) }, position, depth, phase))
}

fn analyze_defmacro(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() < 3 {
        return Err(wrong_arity(position, "defmacro", "a name, an argument list, and a body"));
    }
    let name = items[1]
        .as_symbol()
        .ok_or_else(|| malformed(position, "defmacro name must be a symbol"))?
        .to_string();
    let arg_list = parse_arg_list(&items[2], position)?;
    let mut scope: HashSet<String> = arg_list.names.iter().cloned().collect();
    if let Some(rest) = &arg_list.rest_name {
        scope.insert(rest.clone());
    }
    let macro_phase = Phase::COMPILE_TIME.union(Phase::LOAD_TIME);
    let body = with_in_macro(state, |state| {
        with_scope(state, scope, |state| {
            build_do(state, &items[3..], position, depth + 1, macro_phase, "defmacro")
        })
    })?;
    if !state.namespaces.add_global(
        &state.current_ns.clone(),
        &name,
        DefinitionType::Macro,
        macro_phase,
    ) {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::DuplicateDefinition(name),
        });
    }
    let ir = finish(
        IrKind::DefMacro {
            name: name.clone(),
            arg_names: arg_list.names,
            has_rest: arg_list.has_rest,
            rest_name: arg_list.rest_name,
            body: Box::new(body),
        },
        position,
        depth,
        macro_phase,
    );
    state.global_macros.insert(name, ir.clone());
    Ok(ir)
}

fn analyze_def_ffi_fn(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 5 {
        return Err(wrong_arity(
            position,
            "def-ffi-fn*",
            "binding, external name, return keyword, and argument keyword list",
        ));
    }
    let binding = items[1]
        .as_symbol()
        .ok_or_else(|| malformed(position, "def-ffi-fn* binding must be a symbol"))?
        .to_string();
    let external_name = items[2]
        .as_symbol()
        .ok_or_else(|| malformed(position, "def-ffi-fn* external name must be a symbol"))?
        .to_string();
    let return_type = match &items[3].ast {
        Ast::Keyword(k) => k.clone(),
        _ => {
            return Err(AnalysisError {
                position,
                kind: AnalysisErrorKind::UnknownFfiType("(expected a keyword)".to_string()),
            })
        }
    };
    let arg_nodes = items[4]
        .as_list()
        .ok_or_else(|| malformed(position, "def-ffi-fn* argument types must be a list"))?;
    let arg_types = arg_nodes
        .iter()
        .map(|node| match &node.ast {
            Ast::Keyword(k) => Ok(k.clone()),
            _ => Err(AnalysisError {
                position,
                kind: AnalysisErrorKind::UnknownFfiType("(expected a keyword)".to_string()),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    // An FFI binding is a declaration, not executed code — it names an
    // external symbol that already exists before compilation starts, so
    // unlike `def` it is visible at both phases regardless of the
    // enclosing `eval-when` (if any). This is what lets a macro body call
    // straight through to a `def-ffi-fn*` binding declared alongside it at
    // plain top level, per §8 scenario 5.
    if !state.namespaces.add_global(
        &state.current_ns.clone(),
        &binding,
        DefinitionType::Function,
        Phase::COMPILE_TIME.union(Phase::LOAD_TIME),
    ) {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::DuplicateDefinition(binding),
        });
    }

    Ok(finish(
        IrKind::DefFfiFn { binding, external_name, return_type, arg_types },
        position,
        depth,
        phase,
    ))
}

fn analyze_set_bang(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() != 3 {
        return Err(wrong_arity(position, "set!", "a name and a value"));
    }
    let name = items[1]
        .as_symbol()
        .ok_or_else(|| malformed(position, "set! target must be a symbol"))?
        .to_string();
    let locally_bound = state.is_bound_locally(&name);
    if !locally_bound && state.namespaces.lookup(&state.current_ns, None, &name).is_none() {
        return Err(AnalysisError {
            position,
            kind: AnalysisErrorKind::UnboundSymbol(name),
        });
    }
    let value = analyze(state, &items[2], depth + 1, phase)?;
    Ok(finish(IrKind::SetBang { name, value: Box::new(value) }, position, depth, phase))
}

fn analyze_while(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if items.len() < 2 {
        return Err(wrong_arity(position, "while", "a condition and a body"));
    }
    let condition = analyze(state, &items[1], depth + 1, phase)?;
    let body = build_do(state, &items[2..], position, depth + 1, phase, "while")?;
    Ok(finish(
        IrKind::While { condition: Box::new(condition), body: Box::new(body) },
        position,
        depth,
        phase,
    ))
}

fn analyze_try(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    let split = items[1..]
        .iter()
        .position(|item| item.head_symbol() == Some("catch"))
        .ok_or_else(|| malformed(position, "try requires at least one catch clause"))?;
    let body_forms = &items[1..1 + split];
    let catch_forms = &items[1 + split..];
    if catch_forms.is_empty() {
        return Err(malformed(position, "try requires at least one catch clause"));
    }
    let body = build_do(state, body_forms, position, depth + 1, phase, "try")?;

    let catches = catch_forms
        .iter()
        .map(|catch_form| {
            let catch_items = catch_form
                .as_list()
                .ok_or_else(|| malformed(position, "catch must be a list"))?;
            if catch_items.len() < 3 {
                return Err(wrong_arity(position, "catch", "a (type binding) pair and a body"));
            }
            let pair = catch_items[1]
                .as_list()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| malformed(position, "catch clause must start with `(type binding)`"))?;
            let type_name = pair[0]
                .as_symbol()
                .ok_or_else(|| malformed(position, "catch type must be a symbol"))?
                .to_string();
            let binding = pair[1]
                .as_symbol()
                .ok_or_else(|| malformed(position, "catch binding must be a symbol"))?
                .to_string();
            let mut scope = HashSet::new();
            scope.insert(binding.clone());
            let catch_body = with_scope(state, scope, |state| {
                build_do(state, &catch_items[2..], position, depth + 1, phase, "catch")
            })?;
            Ok(Catch { type_name, binding, body: Box::new(catch_body) })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(finish(IrKind::Try { body: Box::new(body), catches }, position, depth, phase))
}

fn analyze_in_ns(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if depth != 0 {
        return Err(AnalysisError { position, kind: AnalysisErrorKind::EvalWhenNotTopLevel });
    }
    if items.len() != 2 {
        return Err(wrong_arity(position, "in-ns", "exactly one namespace name"));
    }
    // Accepts both `(in-ns 'foo)` (quoted symbol desugars to `(quote foo)`)
    // and a bare symbol, matching how `'ns-name` reads in practice.
    let name = match &items[1].ast {
        Ast::Symbol(s) => s.clone(),
        Ast::List(inner) if inner.len() == 2 && inner[0].as_symbol() == Some("quote") => inner[1]
            .as_symbol()
            .ok_or_else(|| malformed(position, "in-ns target must name a namespace"))?
            .to_string(),
        _ => return Err(malformed(position, "in-ns target must name a namespace")),
    };
    state.namespaces.get_or_create(&name);
    state.current_ns = name.clone();
    Ok(finish(IrKind::InNs { name }, position, depth, phase))
}

fn analyze_eval_when(
    state: &mut AnalyzerState,
    items: &[Node],
    position: SourcePosition,
    depth: usize,
    phase: Phase,
) -> Result<IrNode, AnalysisError> {
    if depth != 0 {
        return Err(AnalysisError { position, kind: AnalysisErrorKind::EvalWhenNotTopLevel });
    }
    if items.len() < 2 {
        return Err(wrong_arity(position, "eval-when", "a phase list and a body"));
    }
    let phase_keywords = items[1]
        .as_list()
        .ok_or_else(|| malformed(position, "eval-when expects a phase keyword list"))?;
    let mut phases = Phase::NONE;
    for kw in phase_keywords {
        match &kw.ast {
            Ast::Keyword(k) if k == "compile" => phases = phases.union(Phase::COMPILE_TIME),
            Ast::Keyword(k) if k == "load" => phases = phases.union(Phase::LOAD_TIME),
            _ => return Err(malformed(position, "eval-when phases must be :compile or :load")),
        }
    }
    let body = build_do(state, &items[2..], position, depth, phases, "eval-when")?;
    Ok(finish(IrKind::EvalWhen { phases, body: Box::new(body) }, position, depth, phase))
}

/// Post-pass 1: closed-over collection. Walks the tree bottom-up; a
/// non-global `VarLookup` contributes its own name, a `Lambda` subtracts
/// its own arg names (and rest name) before the result propagates upward.
/// Every node's `closed_overs` is memoized in place.
pub fn collect_closed_overs(node: &mut IrNode) -> HashSet<String> {
    let mut set = HashSet::new();
    match &mut node.kind {
        IrKind::VarLookup { name, is_global: false, .. } => {
            set.insert(name.clone());
        }
        IrKind::VarLookup { .. } | IrKind::Const(_) | IrKind::InNs { .. } => {}
        IrKind::ConstList { elements } => {
            for element in elements {
                set.extend(collect_closed_overs(&mut element.node));
            }
        }
        IrKind::If { cond, consequent, alternative } => {
            set.extend(collect_closed_overs(cond));
            set.extend(collect_closed_overs(consequent));
            if let Some(alt) = alternative {
                set.extend(collect_closed_overs(alt));
            }
        }
        IrKind::Do { statements, return_value } => {
            for stmt in statements {
                set.extend(collect_closed_overs(stmt));
            }
            set.extend(collect_closed_overs(return_value));
        }
        IrKind::Lambda { arg_names, rest_name, body, .. } => {
            let mut inner = collect_closed_overs(body);
            for arg in arg_names.iter() {
                inner.remove(arg);
            }
            if let Some(rest) = rest_name {
                inner.remove(rest);
            }
            set.extend(inner);
        }
        IrKind::DefMacro { arg_names, rest_name, body, .. } => {
            let mut inner = collect_closed_overs(body);
            for arg in arg_names.iter() {
                inner.remove(arg);
            }
            if let Some(rest) = rest_name {
                inner.remove(rest);
            }
            set.extend(inner);
        }
        IrKind::Def { value, .. } => set.extend(collect_closed_overs(value)),
        IrKind::MaybeInvoke { function, args } => {
            set.extend(collect_closed_overs(function));
            for arg in args {
                set.extend(collect_closed_overs(arg));
            }
        }
        IrKind::MacroExpand { args, .. } => {
            for arg in args {
                set.extend(collect_closed_overs(arg));
            }
        }
        IrKind::DefFfiFn { .. } => {}
        IrKind::Let { bindings, body, .. } => {
            let mut bound_names = HashSet::new();
            for (name, value) in bindings.iter_mut() {
                set.extend(collect_closed_overs(value));
                bound_names.insert(name.clone());
            }
            let mut inner = collect_closed_overs(body);
            for name in &bound_names {
                inner.remove(name);
            }
            set.extend(inner);
        }
        IrKind::SetBang { value, .. } => set.extend(collect_closed_overs(value)),
        IrKind::While { condition, body } => {
            set.extend(collect_closed_overs(condition));
            set.extend(collect_closed_overs(body));
        }
        IrKind::Try { body, catches } => {
            set.extend(collect_closed_overs(body));
            for catch in catches {
                let mut inner = collect_closed_overs(&mut catch.body);
                inner.remove(&catch.binding);
                set.extend(inner);
            }
        }
        IrKind::EvalWhen { body, .. } => set.extend(collect_closed_overs(body)),
    }
    node.closed_overs = set.clone();
    set
}

/// Post-pass 5: `collapse_top_level_forms` — recursively unwraps `Do` and
/// `EvalWhen` at depth 0 into a flat sequence, the unit the compile driver
/// iterates over.
pub fn collapse_top_level_forms(nodes: Vec<IrNode>) -> Vec<IrNode> {
    let mut flat = Vec::new();
    for node in nodes {
        if node.depth != 0 {
            flat.push(node);
            continue;
        }
        match node.kind {
            IrKind::Do { statements, return_value } => {
                let mut children = statements;
                children.push(*return_value);
                flat.extend(collapse_top_level_forms(children));
            }
            IrKind::EvalWhen { phases, body } => {
                let body = *body;
                let mut children = match body.kind {
                    IrKind::Do { statements, return_value } => {
                        let mut c = statements;
                        c.push(*return_value);
                        c
                    }
                    other => vec![IrNode { kind: other, ..body }],
                };
                for child in &mut children {
                    child.evaluation_phase = phases;
                }
                flat.extend(collapse_top_level_forms(children));
            }
            other => flat.push(IrNode { kind: other, ..node }),
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;
    use el_core::arena::TextArena;

    fn analyze_source(source: &str) -> Vec<IrNode> {
        let arena = TextArena::new();
        let tokens = lex(source, &arena, "<test>").unwrap();
        let forms = parse(tokens).unwrap();
        let mut state = AnalyzerState::new();
        forms
            .iter()
            .map(|f| analyze(&mut state, f, 0, Phase::default()).unwrap())
            .collect()
    }

    #[test]
    fn if_requires_two_or_three_operands() {
        let arena = TextArena::new();
        let tokens = lex("(if #t)", &arena, "<test>").unwrap();
        let forms = parse(tokens).unwrap();
        let mut state = AnalyzerState::new();
        let err = analyze(&mut state, &forms[0], 0, Phase::default()).unwrap_err();
        assert!(matches!(err.kind, AnalysisErrorKind::WrongArity { .. }));
    }

    #[test]
    fn unbound_symbol_is_an_error() {
        let arena = TextArena::new();
        let tokens = lex("undefined-name", &arena, "<test>").unwrap();
        let forms = parse(tokens).unwrap();
        let mut state = AnalyzerState::new();
        let err = analyze(&mut state, &forms[0], 0, Phase::default()).unwrap_err();
        assert!(matches!(err.kind, AnalysisErrorKind::UnboundSymbol(_)));
    }

    #[test]
    fn lambda_arg_is_a_local_var_lookup() {
        let irs = analyze_source("(lambda (x) x)");
        match &irs[0].kind {
            IrKind::Lambda { body, .. } => match &body.kind {
                IrKind::Do { return_value, .. } => {
                    assert!(matches!(
                        return_value.kind,
                        IrKind::VarLookup { is_global: false, .. }
                    ));
                }
                _ => panic!("expected Do body"),
            },
            _ => panic!("expected Lambda"),
        }
    }

    #[test]
    fn closed_overs_excludes_lambda_args() {
        // scenario 3 from spec §8: the outer arg is captured by the inner
        // lambda, but the inner lambda's own (empty) arg list isn't in it.
        let mut irs = analyze_source("(lambda (x) (lambda () x))");
        collect_closed_overs(&mut irs[0]);
        match &irs[0].kind {
            IrKind::Lambda { body, .. } => match &body.kind {
                IrKind::Do { return_value, .. } => {
                    assert!(return_value.closed_overs.contains("x"));
                }
                _ => panic!(),
            },
            _ => panic!(),
        }
        assert!(irs[0].closed_overs.is_empty());
    }

    #[test]
    fn eval_when_below_top_level_is_rejected() {
        // `if` increases depth (unlike `do`), so an `eval-when` nested
        // inside one of its branches is no longer at top level.
        let arena = TextArena::new();
        let tokens = lex("(if #t (eval-when (:load) 1) 2)", &arena, "<test>").unwrap();
        let forms = parse(tokens).unwrap();
        let mut state = AnalyzerState::new();
        let err = analyze(&mut state, &forms[0], 0, Phase::default()).unwrap_err();
        assert!(matches!(err.kind, AnalysisErrorKind::EvalWhenNotTopLevel));
    }

    #[test]
    fn eval_when_nested_only_under_do_stays_top_level() {
        // scenario 7's shape: `do` doesn't increase depth, so an
        // `eval-when` directly inside a top-level `do` is still valid.
        let irs = analyze_source("(do (eval-when (:load) 1) 2)");
        assert!(matches!(irs[0].kind, IrKind::EvalWhen { .. }));
    }

    /// Universal invariant from spec §8: `depth(child) >= depth(parent) - 1`;
    /// `Do`/`EvalWhen` children share the parent's depth, every other kind's
    /// children are exactly one deeper. Walks a tree exercising most IR
    /// variants at once rather than one test per variant.
    #[test]
    fn depth_shares_under_do_and_increases_elsewhere() {
        fn children_with_sharing(node: &IrNode) -> Vec<(&IrNode, bool)> {
            match &node.kind {
                IrKind::Do { statements, return_value } => {
                    let mut v: Vec<(&IrNode, bool)> = statements.iter().map(|s| (s, true)).collect();
                    v.push((return_value.as_ref(), true));
                    v
                }
                IrKind::EvalWhen { body, .. } => vec![(body.as_ref(), true)],
                IrKind::If { cond, consequent, alternative } => {
                    let mut v = vec![(cond.as_ref(), false), (consequent.as_ref(), false)];
                    if let Some(alt) = alternative {
                        v.push((alt.as_ref(), false));
                    }
                    v
                }
                IrKind::Lambda { body, .. } | IrKind::DefMacro { body, .. } => vec![(body.as_ref(), false)],
                IrKind::Def { value, .. } | IrKind::SetBang { value, .. } => vec![(value.as_ref(), false)],
                IrKind::MaybeInvoke { function, args } => {
                    let mut v = vec![(function.as_ref(), false)];
                    v.extend(args.iter().map(|a| (a, false)));
                    v
                }
                IrKind::MacroExpand { args, .. } => args.iter().map(|a| (a, false)).collect(),
                IrKind::ConstList { elements } => elements.iter().map(|e| (e.node.as_ref(), false)).collect(),
                IrKind::Let { bindings, body, .. } => {
                    let mut v: Vec<(&IrNode, bool)> = bindings.iter().map(|(_, val)| (val, false)).collect();
                    v.push((body.as_ref(), false));
                    v
                }
                IrKind::While { condition, body } => vec![(condition.as_ref(), false), (body.as_ref(), false)],
                IrKind::Try { body, catches } => {
                    let mut v = vec![(body.as_ref(), false)];
                    v.extend(catches.iter().map(|c| (c.body.as_ref(), false)));
                    v
                }
                IrKind::VarLookup { .. }
                | IrKind::Const(_)
                | IrKind::InNs { .. }
                | IrKind::DefFfiFn { .. } => vec![],
            }
        }

        fn check(node: &IrNode) {
            for (child, shares_depth) in children_with_sharing(node) {
                let expected = if shares_depth { node.depth } else { node.depth + 1 };
                assert_eq!(
                    child.depth, expected,
                    "expected depth {expected} under parent depth {}, got {}",
                    node.depth, child.depth
                );
                check(child);
            }
        }

        let irs = analyze_source(
            "(do \
               (if true 1 2) \
               (lambda (x) (let ((y x)) (while true (set! y y)))) \
               (try (+ 1 2) (catch (a e) 3)))",
        );
        for ir in &irs {
            check(ir);
        }
    }

    #[test]
    fn macro_body_sees_compile_time_definitions_only() {
        // scenario 7 from spec §8.
        let arena = TextArena::new();
        let tokens = lex(
            "(do (eval-when (:load) (def t 1)) (defmacro m () t))",
            &arena,
            "<test>",
        )
        .unwrap();
        let forms = parse(tokens).unwrap();
        let mut state = AnalyzerState::new();
        let err = analyze(&mut state, &forms[0], 0, Phase::default()).unwrap_err();
        assert!(matches!(err.kind, AnalysisErrorKind::NotVisibleToCompiler(_)));
    }

    #[test]
    fn collapse_flattens_nested_do_at_top_level() {
        let irs = analyze_source("(do 123 456 789)");
        let flat = collapse_top_level_forms(irs);
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn def_registers_before_value_is_analyzed_enabling_recursion() {
        let irs = analyze_source("(def f (lambda (n) (f n)))");
        assert!(matches!(irs[0].kind, IrKind::Def { .. }));
    }
}
