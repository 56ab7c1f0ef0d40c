//! Macro engine — §4.4. The compile driver (`lib.rs`) emits and invokes
//! `DefMacro` bodies through this module as it walks flattened top-level
//! IR, re-analyzing whatever AST a macro returns until no `MacroExpand`
//! nodes remain.
//!
//! The runtime↔AST round-trip goes through `el-runtime`'s own value
//! constructors and accessors (§4.7) — this crate links `el-runtime` as an
//! ordinary dependency, so the conversion is a normal Rust function call,
//! not an FFI boundary. Only the macro *body* itself runs as JIT-emitted
//! machine code (via `Backend`); everything else in this module is plain
//! analyzer-side bookkeeping.

use std::collections::HashMap;
use std::ffi::CString;

use el_core::TaggedValue;
use el_runtime::apply;
use el_runtime::value as rt_value;

use crate::analyzer::{AnalyzerState, MAX_MACRO_EXPANSION_DEPTH};
use crate::ast::{Ast, Node};
use crate::backend::Backend;
use crate::error::{AnalysisError, AnalysisErrorKind, CompileError};
use crate::ir::{ConstValue, IrKind, IrNode, Phase};
use crate::lexer::SourcePosition;

/// A placeholder position for IR synthesized by the macro engine itself
/// (round-tripped runtime values, internal arity/depth errors) rather than
/// read from source.
fn synthetic_position() -> SourcePosition {
    SourcePosition { file: std::rc::Rc::from("<macro-expansion>"), line: 0, column: 0 }
}

/// Caches the compiled closure for each macro name so a macro invoked at
/// several call sites is only emitted/linked once per compile.
#[derive(Default)]
pub struct MacroExpanderCache {
    compiled: HashMap<String, TaggedValue>,
}

fn malformed(what: &str) -> AnalysisError {
    AnalysisError {
        position: synthetic_position(),
        kind: AnalysisErrorKind::MalformedSpecialForm(what.to_string()),
    }
}

/// Converts an analyzed constant (`Const` or `ConstList`, the only shapes
/// `is_quoting` analysis ever produces) into the runtime value a compiled
/// macro body receives as an argument.
fn const_ir_to_value(ir: &IrNode) -> Result<TaggedValue, AnalysisError> {
    match &ir.kind {
        IrKind::Const(ConstValue::Int(i)) => Ok(rt_value::rt_make_integer(*i)),
        IrKind::Const(ConstValue::Float(f)) => Ok(rt_value::rt_make_float(*f)),
        IrKind::Const(ConstValue::Bool(b)) => Ok(TaggedValue::from_bool(*b)),
        IrKind::Const(ConstValue::Str(s)) => Ok(rt_value::make_string(s)),
        IrKind::Const(ConstValue::Sym(s)) => Ok(make_symbol_value(s)),
        IrKind::Const(ConstValue::Kw(k)) => Ok(make_keyword_value(k)),
        IrKind::Const(ConstValue::Nil) => Ok(TaggedValue::NIL),
        IrKind::ConstList { elements } => {
            let mut tail = TaggedValue::NIL;
            for element in elements.iter().rev() {
                let value = const_ir_to_value(&element.node)?;
                if element.spliced {
                    tail = splice_onto(value, tail)?;
                } else {
                    tail = rt_value::make_pair(value, tail);
                }
            }
            Ok(tail)
        }
        _ => Err(malformed("macro argument must be a quoted constant")),
    }
}

fn make_symbol_value(text: &str) -> TaggedValue {
    let c = CString::new(text).unwrap_or_default();
    unsafe { rt_value::rt_make_symbol(c.as_ptr()) }
}

fn make_keyword_value(text: &str) -> TaggedValue {
    let c = CString::new(text).unwrap_or_default();
    unsafe { rt_value::rt_make_keyword(c.as_ptr()) }
}

/// Prepends every element of the proper list `list` onto `tail`, in order
/// — `unquote-splice`'s "flattened one level into the enclosing cons
/// chain" semantics (SPEC_FULL.md §9, Open Question 1).
fn splice_onto(list: TaggedValue, tail: TaggedValue) -> Result<TaggedValue, AnalysisError> {
    let mut elements = Vec::new();
    let mut cursor = list;
    loop {
        if cursor.is_nil() {
            break;
        }
        if !rt_value::rt_is_pair(cursor) {
            return Err(malformed("unquote-splice value must be a proper list"));
        }
        elements.push(rt_value::rt_car(cursor));
        cursor = rt_value::rt_cdr(cursor);
    }
    let mut result = tail;
    for value in elements.into_iter().rev() {
        result = rt_value::make_pair(value, result);
    }
    Ok(result)
}

fn cstr_to_string(ptr: *const std::os::raw::c_char) -> String {
    unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Converts a runtime value (whatever a macro expander returned) back into
/// surface AST, so it can be re-analyzed like any other source form.
fn value_to_node(value: TaggedValue) -> Result<Node, AnalysisError> {
    let ast = if value.is_integer() {
        Ast::Integer(value.as_integer())
    } else if value.is_true() {
        Ast::Boolean(true)
    } else if value.is_false() {
        Ast::Boolean(false)
    } else if value.is_nil() {
        Ast::Nil
    } else if rt_value::rt_is_float(value) {
        Ast::Float(rt_value::rt_float_value(value))
    } else if rt_value::rt_is_string(value) {
        Ast::String(cstr_to_string(rt_value::rt_string_value(value)))
    } else if rt_value::rt_is_symbol(value) {
        Ast::Symbol(cstr_to_string(rt_value::rt_symbol_extract_string(value)))
    } else if rt_value::rt_is_keyword(value) {
        Ast::Keyword(cstr_to_string(rt_value::rt_keyword_extract_string(value)))
    } else if rt_value::rt_is_pair(value) {
        let mut items = Vec::new();
        let mut cursor = value;
        loop {
            if cursor.is_nil() {
                break;
            }
            if !rt_value::rt_is_pair(cursor) {
                return Err(malformed("macro returned an improper (dotted) list"));
            }
            items.push(value_to_node(rt_value::rt_car(cursor))?);
            cursor = rt_value::rt_cdr(cursor);
        }
        Ast::List(items)
    } else {
        return Err(malformed("macro returned a value with no surface syntax"));
    };
    Ok(Node::new(ast, synthetic_position()))
}

/// Emits and links the compiled closure for a `DefMacro` node, caching the
/// result by name.
fn compiled_macro(
    cache: &mut MacroExpanderCache,
    backend: &mut dyn Backend,
    macro_def: &IrNode,
) -> Result<TaggedValue, CompileError> {
    let IrKind::DefMacro { name, arg_names, has_rest, rest_name, body } = &macro_def.kind else {
        return Err(CompileError::Analysis(malformed("not a macro definition")));
    };
    if let Some(closure) = cache.compiled.get(name) {
        return Ok(*closure);
    }
    let arity = arg_names.len() as u32 + u32::from(*has_rest);
    let symbol = format!("__macro_{name}");
    let mut params = arg_names.clone();
    if let Some(rest) = rest_name {
        params.push(rest.clone());
    }
    backend.emit_function(&symbol, body, &params, *has_rest)?;
    let fn_ptr = backend.link_and_resolve(&symbol)?;
    let closure = rt_value::make_compiled_function(arity, *has_rest, fn_ptr, 0);
    cache.compiled.insert(name.clone(), closure);
    Ok(closure)
}

/// Dispatches to the matching `rt_apply_N` shim for `args.len()`. Macro
/// argument lists beyond 20 hit the same ceiling `rt_apply_N` itself
/// imposes.
fn invoke_closure(closure: TaggedValue, args: &[TaggedValue]) -> Result<TaggedValue, CompileError> {
    let result = match args.len() {
        0 => apply::rt_apply_0(closure),
        1 => apply::rt_apply_1(closure, args[0]),
        2 => apply::rt_apply_2(closure, args[0], args[1]),
        3 => apply::rt_apply_3(closure, args[0], args[1], args[2]),
        4 => apply::rt_apply_4(closure, args[0], args[1], args[2], args[3]),
        5 => apply::rt_apply_5(closure, args[0], args[1], args[2], args[3], args[4]),
        6 => apply::rt_apply_6(closure, args[0], args[1], args[2], args[3], args[4], args[5]),
        7 => apply::rt_apply_7(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6],
        ),
        8 => apply::rt_apply_8(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
        ),
        9 => apply::rt_apply_9(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8],
        ),
        10 => apply::rt_apply_10(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9],
        ),
        11 => apply::rt_apply_11(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10],
        ),
        12 => apply::rt_apply_12(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11],
        ),
        13 => apply::rt_apply_13(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12],
        ),
        14 => apply::rt_apply_14(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13],
        ),
        15 => apply::rt_apply_15(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14],
        ),
        16 => apply::rt_apply_16(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14], args[15],
        ),
        17 => apply::rt_apply_17(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14], args[15],
            args[16],
        ),
        18 => apply::rt_apply_18(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14], args[15],
            args[16], args[17],
        ),
        19 => apply::rt_apply_19(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14], args[15],
            args[16], args[17], args[18],
        ),
        20 => apply::rt_apply_20(
            closure, args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7],
            args[8], args[9], args[10], args[11], args[12], args[13], args[14], args[15],
            args[16], args[17], args[18], args[19],
        ),
        n => {
            return Err(CompileError::Analysis(AnalysisError {
                position: synthetic_position(),
                kind: AnalysisErrorKind::WrongArity {
                    form: "macro call".to_string(),
                    expected: format!("at most 20 arguments, got {n}"),
                },
            }))
        }
    };
    Ok(result)
}

/// Expands one `MacroExpand` node: compiles (or reuses) the macro's
/// closure, invokes it with the quoted argument values, converts the
/// result back to AST, and re-analyzes it at the call site's depth and
/// phase. `expansion_depth` bounds re-expansion (a macro expanding to a
/// form containing another macro call) per §9's "Circular macro
/// expansion" concern.
#[allow(clippy::too_many_arguments)]
pub fn expand_macro_call(
    state: &mut AnalyzerState,
    backend: &mut dyn Backend,
    cache: &mut MacroExpanderCache,
    macro_name: &str,
    args: &[IrNode],
    depth: usize,
    phase: Phase,
    expansion_depth: usize,
) -> Result<IrNode, CompileError> {
    if expansion_depth > MAX_MACRO_EXPANSION_DEPTH {
        return Err(CompileError::Analysis(AnalysisError {
            position: synthetic_position(),
            kind: AnalysisErrorKind::MacroExpansionTooDeep(macro_name.to_string()),
        }));
    }
    let macro_def = state
        .macro_by_name(macro_name)
        .cloned()
        .ok_or_else(|| {
            CompileError::Analysis(AnalysisError {
                position: synthetic_position(),
                kind: AnalysisErrorKind::UnknownMacro(macro_name.to_string()),
            })
        })?;
    let closure = compiled_macro(cache, backend, &macro_def)?;
    let arg_values = args
        .iter()
        .map(const_ir_to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(CompileError::Analysis)?;
    let result_value = invoke_closure(closure, &arg_values)?;
    let node = value_to_node(result_value).map_err(CompileError::Analysis)?;
    let reanalyzed = crate::analyzer::analyze(state, &node, depth, phase)?;
    Ok(reanalyzed)
}

/// Repeatedly expands `node` while it (or its re-analysis) is itself a
/// `MacroExpand`, so `(ml 1 2 3)` expanding to another macro call
/// terminates in one driver call rather than requiring the caller to loop.
pub fn fully_expand(
    state: &mut AnalyzerState,
    backend: &mut dyn Backend,
    cache: &mut MacroExpanderCache,
    mut node: IrNode,
) -> Result<IrNode, CompileError> {
    let mut depth_counter = 0;
    loop {
        let IrKind::MacroExpand { macro_ref, args } = &node.kind else {
            return Ok(node);
        };
        depth_counter += 1;
        node = expand_macro_call(
            state,
            backend,
            cache,
            macro_ref,
            args,
            node.depth,
            node.evaluation_phase,
            depth_counter,
        )?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ConstListElement;

    #[test]
    fn const_ir_round_trips_through_runtime_values() {
        el_runtime::gc::init(el_runtime::GcMode::InterpreterOwned);
        let pos = SourcePosition::test(1, 1);
        let ir = IrNode::new(IrKind::Const(ConstValue::Int(42)), pos, 0);
        let value = const_ir_to_value(&ir).unwrap();
        assert_eq!(rt_value::rt_integer_value(value), 42);
        let node = value_to_node(value).unwrap();
        assert_eq!(node.ast, Ast::Integer(42));
        el_runtime::gc::deinit();
    }

    #[test]
    fn const_list_builds_a_proper_cons_chain() {
        el_runtime::gc::init(el_runtime::GcMode::InterpreterOwned);
        let pos = SourcePosition::test(1, 1);
        let elements = vec![
            ConstListElement { node: Box::new(IrNode::new(IrKind::Const(ConstValue::Int(1)), pos.clone(), 0)), spliced: false },
            ConstListElement { node: Box::new(IrNode::new(IrKind::Const(ConstValue::Int(2)), pos.clone(), 0)), spliced: false },
        ];
        let ir = IrNode::new(IrKind::ConstList { elements }, pos, 0);
        let value = const_ir_to_value(&ir).unwrap();
        let node = value_to_node(value).unwrap();
        match node.ast {
            Ast::List(items) => {
                assert_eq!(items[0].ast, Ast::Integer(1));
                assert_eq!(items[1].ast, Ast::Integer(2));
            }
            _ => panic!("expected a list"),
        }
        el_runtime::gc::deinit();
    }
}
