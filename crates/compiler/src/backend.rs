//! Backend trait and its sole implementation — §4.6. `Backend` is the seam
//! between the analyzer's IR and machine code; the rest of the compiler
//! never looks at LLVM IR text directly. Grounded on the stack-language
//! compiler's `codegen.rs`/`codegen/` modules this crate started from: same
//! "emit `.ll` text, shell out to clang" strategy, same per-instruction
//! `writeln!`-into-a-string-buffer style (`codegen/inline_dispatch.rs`), same
//! runtime-declaration block (`codegen/runtime.rs`) — generalized from a
//! stack-threaded calling convention to a tagged-pointer, expression-based
//! one, since every `el` value (not just a stack pointer) is a single `i64`
//! word.
//!
//! Closures capture free variables into a `CompiledFunctionObject`'s
//! indexed env tail (`rt_closure_get_env`/`rt_closure_set_env`), with each
//! free variable's slot index fixed at emission time from its lambda's
//! `closed_overs` set, sorted for a deterministic assignment. Globals are
//! each backed by one LLVM global slot holding a `Var` object's tagged
//! pointer, written once by that `def`'s `emit_top_level_init` and read by
//! every later `VarLookup{is_global: true}` via `rt_deref_var`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::raw::c_char;
use std::path::PathBuf;

use el_core::statepoint::StatepointTable;

use crate::error::BackendError;
use crate::ir::{ConstValue, IrKind, IrNode, Phase};

/// The seam every later compiler stage talks to. `LlvmTextBackend` is the
/// only implementation in this crate; the trait exists so `macro_engine.rs`
/// and `lib.rs`'s driver don't depend on its concrete representation.
pub trait Backend {
    /// Emits a callable function for a `defmacro` body. `name` is already
    /// mangled by the caller; `arg_names` binds positionally to the
    /// runtime values the call passes in, with the rest slot (if
    /// `has_rest`) arriving pre-built as a proper list, per §4.4.
    fn emit_function(
        &mut self,
        name: &str,
        ir: &IrNode,
        arg_names: &[String],
        has_rest: bool,
    ) -> Result<(), BackendError>;

    /// Emits a zero-argument function that runs one top-level form's
    /// side effect (a `def`'s value computation and `Var` installation, or
    /// a bare top-level expression for its effect).
    fn emit_top_level_init(&mut self, name: &str, ir: &IrNode) -> Result<(), BackendError>;

    /// Compiles everything emitted so far into a shared object, loads it,
    /// and resolves `name`'s code pointer — callable through `rt_apply_N`.
    /// Idempotent across repeated names once a link has happened; emitting
    /// more code after a successful link invalidates the cached library and
    /// forces the next call to relink.
    fn link_and_resolve(&mut self, name: &str) -> Result<*const (), BackendError>;

    /// The GC frame-metadata table accumulated across every function this
    /// backend has emitted so far (§4.6's "opaque, consumed" contract with
    /// the collector).
    fn statepoint_table(&self) -> &StatepointTable;
}

/// `(runtime symbol, arity)` for the handful of operators the analyzer
/// never wraps in a `lambda` — direct calls, skipping `rt_apply_N`
/// entirely, the fast path teacher's `inline_dispatch.rs` plays the same
/// role for stack primitives.
fn builtin_op(name: &str) -> Option<(&'static str, usize)> {
    match name {
        "+" => Some(("rt_add", 2)),
        "-" => Some(("rt_sub", 2)),
        "*" => Some(("rt_mul", 2)),
        "/" => Some(("rt_div", 2)),
        "=" => Some(("rt_eq", 2)),
        "or" => Some(("rt_or", 2)),
        "not" => Some(("rt_not", 1)),
        "nil?" => Some(("rt_is_nil", 1)),
        "car" => Some(("rt_car", 1)),
        "cdr" => Some(("rt_cdr", 1)),
        "exception" => Some(("el_rt_make_exception", 3)),
        "throw" => Some(("el_rt_throw", 1)),
        _ => None,
    }
}

const RUNTIME_DECLS: &[&str] = &[
    "declare i64 @rt_make_integer(i64)",
    "declare i64 @rt_make_float(double)",
    "declare double @rt_float_value(i64)",
    "declare i64 @rt_make_symbol(ptr)",
    "declare i64 @rt_make_keyword(ptr)",
    "declare i64 @rt_make_string(ptr)",
    "declare i64 @rt_make_pair(i64, i64)",
    "declare i64 @rt_car(i64)",
    "declare i64 @rt_cdr(i64)",
    "declare i64 @rt_is_pair(i64)",
    "declare i64 @rt_make_var(i64)",
    "declare i64 @rt_set_var(i64, i64)",
    "declare i64 @rt_deref_var(i64)",
    "declare i64 @rt_make_compiled_function(ptr, i32, i8, i64)",
    "declare i64 @rt_closure_get_env(i64, i64)",
    "declare i64 @rt_closure_set_env(i64, i64, i64)",
    "declare i64 @rt_add(i64, i64)",
    "declare i64 @rt_sub(i64, i64)",
    "declare i64 @rt_mul(i64, i64)",
    "declare i64 @rt_div(i64, i64)",
    "declare i64 @rt_eq(i64, i64)",
    "declare i64 @rt_or(i64, i64)",
    "declare i64 @rt_not(i64)",
    "declare i64 @rt_is_nil(i64)",
    "declare i64 @rt_apply_0(i64)",
    "declare i64 @rt_apply_1(i64, i64)",
    "declare i64 @rt_apply_2(i64, i64, i64)",
    "declare i64 @el_rt_make_exception(i64, i64, i64)",
    "declare i64 @el_rt_throw(i64)",
    "declare i32 @el_rt_eh_personality(i32, i32, i64, ptr, ptr)",
    "declare i64 @el_rt_exception_from_unwind(ptr)",
    "declare i8 @el_rt_exception_is_a(i64, ptr)",
];

const TAG_NIL: i64 = 0xF;
const TAG_TRUE: i64 = 0x13;
const TAG_FALSE: i64 = 0x3;

/// Tracks one lexical binding's LLVM SSA name (`%x.3`) while lowering a
/// function body; free variables not found here fall through to
/// `closure_slots`.
#[derive(Default, Clone)]
struct Scope {
    locals: HashMap<String, String>,
}

struct FnLowerer<'a> {
    backend: &'a mut LlvmTextBackend,
    body: String,
    temp: u32,
    label: u32,
    scopes: Vec<Scope>,
    closure_slots: HashMap<String, u64>,
    /// The label most recently opened via [`FnLowerer::begin_block`] —
    /// the actual current insertion block, which a nested `if`/`while`/
    /// `try` can leave somewhere other than the label its caller expects
    /// (e.g. a `then` branch whose last expression is itself an `if`).
    /// `phi` predecessor lists must name this, not the label the caller
    /// opened.
    current_block: String,
    /// Landing-pad labels for each `try` currently being lowered,
    /// innermost last — consulted by [`FnLowerer::emit_call`] to decide
    /// whether a call becomes a plain `call` or an `invoke` unwinding to
    /// the nearest enclosing `try`.
    try_contexts: Vec<String>,
}

impl<'a> FnLowerer<'a> {
    fn fresh_temp(&mut self) -> String {
        self.temp += 1;
        format!("t{}", self.temp)
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        self.label += 1;
        format!("{prefix}.{}", self.label)
    }

    fn lookup_local(&self, name: &str) -> Option<String> {
        self.scopes.iter().rev().find_map(|s| s.locals.get(name).cloned())
    }

    fn bind_local(&mut self, name: &str, ssa: String) {
        self.scopes.last_mut().expect("a scope must be active").locals.insert(name.to_string(), ssa);
    }

    fn with_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, BackendError>) -> Result<T, BackendError> {
        self.scopes.push(Scope::default());
        let result = f(self);
        self.scopes.pop();
        result
    }

    /// Opens `label` as a new basic block and records it as the current
    /// insertion point.
    fn begin_block(&mut self, label: &str) -> Result<(), BackendError> {
        writeln!(self.body, "{label}:")?;
        self.current_block = label.to_string();
        Ok(())
    }

    /// Emits a call to `callee` (already carrying its leading `@`),
    /// binding its `i64` result to a fresh temp. Inside a `try` body this
    /// becomes an `invoke` unwinding to the innermost enclosing landing
    /// pad instead of a plain `call`, so a thrown exception anywhere
    /// under a `try` — not just a direct `throw` in its immediate body —
    /// is observable there.
    fn emit_call(&mut self, callee: &str, args: &str) -> Result<String, BackendError> {
        let t = self.fresh_temp();
        if let Some(landingpad) = self.try_contexts.last().cloned() {
            let cont = self.fresh_label("invoke.cont");
            writeln!(
                self.body,
                "  %{t} = invoke i64 {callee}({args}) to label %{cont} unwind label %{landingpad}"
            )?;
            self.begin_block(&cont)?;
        } else {
            writeln!(self.body, "  %{t} = call i64 {callee}({args})")?;
        }
        Ok(t)
    }

    /// Lowers `node`, returning the SSA register (without `%`) holding its
    /// `i64` tagged value.
    fn lower(&mut self, node: &IrNode) -> Result<String, BackendError> {
        match &node.kind {
            IrKind::Const(c) => self.lower_const(c),
            IrKind::ConstList { elements } => self.lower_const_list(elements),
            IrKind::VarLookup { name, is_global, qualifying_ns } => {
                self.lower_var_lookup(name, *is_global, qualifying_ns.as_deref())
            }
            IrKind::If { cond, consequent, alternative } => self.lower_if(cond, consequent, alternative),
            IrKind::Do { statements, return_value } => {
                for stmt in statements {
                    self.lower(stmt)?;
                }
                self.lower(return_value)
            }
            IrKind::Let { bindings, body, .. } => self.lower_let(bindings, body),
            IrKind::Lambda { arg_names, has_rest, rest_name, body } => {
                self.lower_lambda(node, arg_names, *has_rest, rest_name.as_deref(), body)
            }
            IrKind::Def { name, value } => self.lower_def(name, value),
            IrKind::SetBang { name, value } => self.lower_set_bang(name, value),
            IrKind::MaybeInvoke { function, args } => self.lower_maybe_invoke(function, args),
            IrKind::While { condition, body } => self.lower_while(condition, body),
            IrKind::Try { body, catches } => self.lower_try(body, catches),
            IrKind::InNs { .. } => Ok(self.emit_const_i64(TAG_NIL)),
            IrKind::DefFfiFn { binding, external_name, arg_types, .. } => {
                self.lower_def_ffi_fn(binding, external_name, arg_types)
            }
            IrKind::DefMacro { .. } | IrKind::MacroExpand { .. } | IrKind::EvalWhen { .. } => {
                Err(BackendError(
                    "macro forms must be fully expanded before backend emission".to_string(),
                ))
            }
        }
    }

    fn emit_const_i64(&mut self, value: i64) -> String {
        let t = self.fresh_temp();
        let _ = writeln!(self.body, "  %{t} = add i64 {value}, 0");
        t
    }

    fn lower_const(&mut self, c: &ConstValue) -> Result<String, BackendError> {
        Ok(match c {
            ConstValue::Int(i) => self.emit_const_i64((*i) << 4),
            ConstValue::Bool(b) => self.emit_const_i64(if *b { TAG_TRUE } else { TAG_FALSE }),
            ConstValue::Nil => self.emit_const_i64(TAG_NIL),
            ConstValue::Float(f) => self.emit_call("@rt_make_float", &format!("double {:?}", f))?,
            ConstValue::Str(s) => {
                let global = self.backend.intern_string(s);
                self.emit_call("@rt_make_string", &format!("ptr {global}"))?
            }
            ConstValue::Sym(s) => {
                let global = self.backend.intern_string(s);
                self.emit_call("@rt_make_symbol", &format!("ptr {global}"))?
            }
            ConstValue::Kw(k) => {
                let global = self.backend.intern_string(k);
                self.emit_call("@rt_make_keyword", &format!("ptr {global}"))?
            }
        })
    }

    /// Builds the constant list's cons chain tail-first. `spliced`
    /// elements are appended by walking the spliced value's own chain at
    /// runtime isn't attempted here — quoted constant lists never contain
    /// a live splice target at backend time (only `macro_engine.rs`'s
    /// host-side conversion deals with splicing, since the spliced value
    /// is only known once materialized).
    fn lower_const_list(&mut self, elements: &[crate::ir::ConstListElement]) -> Result<String, BackendError> {
        let mut tail = self.emit_const_i64(TAG_NIL);
        for element in elements.iter().rev() {
            let value = self.lower(&element.node)?;
            tail = self.emit_call("@rt_make_pair", &format!("i64 %{value}, i64 %{tail}"))?;
        }
        Ok(tail)
    }

    fn lower_var_lookup(
        &mut self,
        name: &str,
        is_global: bool,
        qualifying_ns: Option<&str>,
    ) -> Result<String, BackendError> {
        if !is_global {
            if let Some(ssa) = self.lookup_local(name) {
                return Ok(ssa);
            }
            if let Some(&index) = self.closure_slots.get(name) {
                let t = self.emit_call("@rt_closure_get_env", &format!("i64 %self, i64 {index}"))?;
                return Ok(t);
            }
            return Err(BackendError(format!("`{name}` has no local binding at emission time")));
        }
        let qualified = match qualifying_ns {
            Some(ns) => format!("{ns}/{name}"),
            None => format!("{}/{name}", self.backend.current_ns),
        };
        let slot = self.backend.global_slot(&qualified);
        let var = self.fresh_temp();
        writeln!(self.body, "  %{var} = load i64, ptr {slot}")?;
        let t = self.emit_call("@rt_deref_var", &format!("i64 %{var}"))?;
        Ok(t)
    }

    fn lower_if(
        &mut self,
        cond: &IrNode,
        consequent: &IrNode,
        alternative: &Option<Box<IrNode>>,
    ) -> Result<String, BackendError> {
        let cond_val = self.lower(cond)?;
        let is_false = self.fresh_temp();
        writeln!(self.body, "  %{is_false} = icmp eq i64 %{cond_val}, {TAG_FALSE}")?;
        let then_label = self.fresh_label("if.then");
        let else_label = self.fresh_label("if.else");
        let end_label = self.fresh_label("if.end");
        writeln!(self.body, "  br i1 %{is_false}, label %{else_label}, label %{then_label}")?;

        self.begin_block(&then_label)?;
        let then_val = self.lower(consequent)?;
        let then_exit = self.current_block.clone();
        writeln!(self.body, "  br label %{end_label}")?;

        self.begin_block(&else_label)?;
        let else_val = match alternative {
            Some(alt) => self.lower(alt)?,
            None => self.emit_const_i64(TAG_NIL),
        };
        let else_exit = self.current_block.clone();
        writeln!(self.body, "  br label %{end_label}")?;

        self.begin_block(&end_label)?;
        let result = self.fresh_temp();
        writeln!(
            self.body,
            "  %{result} = phi i64 [ %{then_val}, %{then_exit} ], [ %{else_val}, %{else_exit} ]"
        )?;
        Ok(result)
    }

    fn lower_let(&mut self, bindings: &[(String, IrNode)], body: &IrNode) -> Result<String, BackendError> {
        self.with_scope(|this| {
            for (name, value) in bindings {
                let ssa = this.lower(value)?;
                this.bind_local(name, ssa);
            }
            this.lower(body)
        })
    }

    fn lower_def(&mut self, name: &str, value: &IrNode) -> Result<String, BackendError> {
        let value_ssa = self.lower(value)?;
        let qualified = format!("{}/{name}", self.backend.current_ns);
        let slot = self.backend.global_slot(&qualified);
        let sym_global = self.backend.intern_string(name);
        let sym = self.emit_call("@rt_make_symbol", &format!("ptr {sym_global}"))?;
        let var = self.emit_call("@rt_make_var", &format!("i64 %{sym}"))?;
        self.emit_call("@rt_set_var", &format!("i64 %{var}, i64 %{value_ssa}"))?;
        writeln!(self.body, "  store i64 %{var}, ptr {slot}")?;
        Ok(value_ssa)
    }

    /// `def-ffi-fn*` installs a real global, same as `def` — the only
    /// difference is the value is a trampoline calling straight through to
    /// an already-linked external symbol instead of a lowered expression.
    /// The wrapper's signature matches `rt_apply_N`'s convention (a
    /// trailing closure self-arg the trampoline ignores) so the binding is
    /// callable like any other closure value through `MaybeInvoke`.
    fn lower_def_ffi_fn(
        &mut self,
        binding: &str,
        external_name: &str,
        arg_types: &[String],
    ) -> Result<String, BackendError> {
        let arity = arg_types.len();
        self.backend.ffi_declarations.insert(external_name.to_string(), arity);
        let wrapper = self.backend.fresh_ffi_wrapper_name();
        self.backend.emit_ffi_wrapper(&wrapper, external_name, arity);

        let closure = self.emit_call(
            "@rt_make_compiled_function",
            &format!("ptr @{wrapper}, i32 {arity}, i8 0, i64 0"),
        )?;
        let qualified = format!("{}/{binding}", self.backend.current_ns);
        let slot = self.backend.global_slot(&qualified);
        let sym_global = self.backend.intern_string(binding);
        let sym = self.emit_call("@rt_make_symbol", &format!("ptr {sym_global}"))?;
        let var = self.emit_call("@rt_make_var", &format!("i64 %{sym}"))?;
        self.emit_call("@rt_set_var", &format!("i64 %{var}, i64 %{closure}"))?;
        writeln!(self.body, "  store i64 %{var}, ptr {slot}")?;
        Ok(self.emit_const_i64(TAG_NIL))
    }

    fn lower_set_bang(&mut self, name: &str, value: &IrNode) -> Result<String, BackendError> {
        let value_ssa = self.lower(value)?;
        if let Some(ssa) = self.lookup_local(name) {
            let _ = ssa;
            // Locals are SSA; a `set!` on one rebinds the name going
            // forward rather than mutating in place.
            self.bind_local(name, value_ssa.clone());
            return Ok(value_ssa);
        }
        if let Some(&index) = self.closure_slots.get(name) {
            self.emit_call("@rt_closure_set_env", &format!("i64 %self, i64 {index}, i64 %{value_ssa}"))?;
            return Ok(value_ssa);
        }
        let qualified = format!("{}/{name}", self.backend.current_ns);
        let slot = self.backend.global_slot(&qualified);
        let var = self.fresh_temp();
        writeln!(self.body, "  %{var} = load i64, ptr {slot}")?;
        self.emit_call("@rt_set_var", &format!("i64 %{var}, i64 %{value_ssa}"))?;
        Ok(value_ssa)
    }

    fn lower_while(&mut self, condition: &IrNode, body: &IrNode) -> Result<String, BackendError> {
        let head = self.fresh_label("while.head");
        let do_body = self.fresh_label("while.body");
        let end = self.fresh_label("while.end");
        writeln!(self.body, "  br label %{head}")?;
        self.begin_block(&head)?;
        let cond_val = self.lower(condition)?;
        let is_false = self.fresh_temp();
        writeln!(self.body, "  %{is_false} = icmp eq i64 %{cond_val}, {TAG_FALSE}")?;
        writeln!(self.body, "  br i1 %{is_false}, label %{end}, label %{do_body}")?;
        self.begin_block(&do_body)?;
        self.lower(body)?;
        writeln!(self.body, "  br label %{head}")?;
        self.begin_block(&end)?;
        Ok(self.emit_const_i64(TAG_NIL))
    }

    /// `try`/`catch` lowers to a single inline landing pad: every call made
    /// while lowering `body` becomes an `invoke` unwinding to this landing
    /// pad (`emit_call` consults `try_contexts`), so a thrown exception
    /// anywhere in `body`'s dynamic extent — a user `throw` or an internal
    /// `raise_runtime_error` — is observable here rather than unwinding
    /// past this frame untouched. The landing pad declares one `catch`
    /// clause per distinct clause type, so the unwinder's search phase
    /// only installs this frame's context when some clause is a candidate
    /// at all (`el_rt_eh_personality`); which clause actually matches is
    /// then resolved in software, by testing `el_rt_exception_is_a` in
    /// source order, since the personality routine hands back only the
    /// exception pointer (register 0), never a clause selector.
    fn lower_try(&mut self, body: &IrNode, catches: &[crate::ir::Catch]) -> Result<String, BackendError> {
        let lpad = self.fresh_label("try.lpad");
        let end = self.fresh_label("try.end");

        self.try_contexts.push(lpad.clone());
        let body_result = self.lower(body);
        self.try_contexts.pop();
        let body_val = body_result?;
        let body_exit = self.current_block.clone();
        writeln!(self.body, "  br label %{end}")?;

        self.begin_block(&lpad)?;
        let type_globals: Vec<String> =
            catches.iter().map(|c| self.backend.intern_string(&c.type_name)).collect();
        let lp = self.fresh_temp();
        write!(self.body, "  %{lp} = landingpad {{ ptr, i32 }}")?;
        for global in &type_globals {
            write!(self.body, " catch ptr {global}")?;
        }
        writeln!(self.body)?;
        let exc_ptr = self.fresh_temp();
        writeln!(self.body, "  %{exc_ptr} = extractvalue {{ ptr, i32 }} %{lp}, 0")?;
        let exc_val = self.emit_call("@el_rt_exception_from_unwind", &format!("ptr %{exc_ptr}"))?;

        let nomatch = self.fresh_label("try.nomatch");
        let mut catch_exits = Vec::new();
        for (i, catch) in catches.iter().enumerate() {
            let catch_label = self.fresh_label("try.catch");
            let next_check = if i + 1 < catches.len() {
                self.fresh_label("try.check")
            } else {
                nomatch.clone()
            };
            let raw_match = self.fresh_temp();
            writeln!(
                self.body,
                "  %{raw_match} = call i8 @el_rt_exception_is_a(i64 %{exc_val}, ptr {})",
                type_globals[i]
            )?;
            let is_match = self.fresh_temp();
            writeln!(self.body, "  %{is_match} = icmp ne i8 %{raw_match}, 0")?;
            writeln!(self.body, "  br i1 %{is_match}, label %{catch_label}, label %{next_check}")?;

            self.begin_block(&catch_label)?;
            let catch_val = self.with_scope(|this| {
                this.bind_local(&catch.binding, exc_val.clone());
                this.lower(&catch.body)
            })?;
            let catch_exit = self.current_block.clone();
            writeln!(self.body, "  br label %{end}")?;
            catch_exits.push((catch_val, catch_exit));

            if i + 1 < catches.len() {
                self.begin_block(&next_check)?;
            }
        }
        // Unreachable in practice — the unwinder only installs this frame's
        // context once `el_rt_eh_personality`'s search phase already found
        // a declared catch type matching the exception — but `resume` keeps
        // this block (and thus the function) well-formed if it ever is.
        self.begin_block(&nomatch)?;
        writeln!(self.body, "  resume {{ ptr, i32 }} %{lp}")?;

        self.begin_block(&end)?;
        let result = self.fresh_temp();
        let mut phi_arms = vec![format!("[ %{body_val}, %{body_exit} ]")];
        phi_arms.extend(catch_exits.iter().map(|(val, exit)| format!("[ %{val}, %{exit} ]")));
        writeln!(self.body, "  %{result} = phi i64 {}", phi_arms.join(", "))?;
        Ok(result)
    }

    fn lower_lambda(
        &mut self,
        node: &IrNode,
        arg_names: &[String],
        has_rest: bool,
        rest_name: Option<&str>,
        body: &IrNode,
    ) -> Result<String, BackendError> {
        let mut free: Vec<String> = node.closed_overs.iter().cloned().collect();
        free.sort();
        let symbol = self.backend.fresh_lambda_name();
        self.backend.emit_function_with_free_vars(&symbol, body, arg_names, has_rest, rest_name, &free)?;

        let env_size = free.len() as u64;
        let closure = self.emit_call(
            "@rt_make_compiled_function",
            &format!(
                "ptr @{symbol}, i32 {}, i8 {}, i64 {env_size}",
                arg_names.len() + usize::from(has_rest),
                i8::from(has_rest),
            ),
        )?;
        for (index, name) in free.iter().enumerate() {
            let value = if let Some(ssa) = self.lookup_local(name) {
                ssa
            } else if let Some(&slot) = self.closure_slots.get(name) {
                self.emit_call("@rt_closure_get_env", &format!("i64 %self, i64 {slot}"))?
            } else {
                return Err(BackendError(format!("free variable `{name}` not in scope")));
            };
            self.emit_call("@rt_closure_set_env", &format!("i64 %{closure}, i64 {index}, i64 %{value}"))?;
        }
        Ok(closure)
    }

    fn lower_maybe_invoke(&mut self, function: &IrNode, args: &[IrNode]) -> Result<String, BackendError> {
        if let IrKind::VarLookup { name, is_global: true, qualifying_ns: None } = &function.kind {
            if let Some((rt_name, arity)) = builtin_op(name) {
                if args.len() == arity {
                    let arg_vals = args.iter().map(|a| self.lower(a)).collect::<Result<Vec<_>, _>>()?;
                    let joined = arg_vals.iter().map(|v| format!("i64 %{v}")).collect::<Vec<_>>().join(", ");
                    return self.emit_call(&format!("@{rt_name}"), &joined);
                }
            }
        }
        let function_val = self.lower(function)?;
        let arg_vals = args.iter().map(|a| self.lower(a)).collect::<Result<Vec<_>, _>>()?;
        let apply_fn = format!("rt_apply_{}", args.len());
        self.backend.apply_arities_used.insert(args.len());
        let mut operands = format!("i64 %{function_val}");
        for v in &arg_vals {
            operands.push_str(&format!(", i64 %{v}"));
        }
        self.emit_call(&format!("@{apply_fn}"), &operands)
    }
}

/// The backend's persistent state across a compile: accumulated IR text,
/// per-global LLVM slot names, interned string globals, and the
/// statepoint table every `emit_function` call appends to.
pub struct LlvmTextBackend {
    module_text: String,
    global_slots: HashMap<String, String>,
    string_globals: HashMap<String, String>,
    /// External function name -> arity, for the `declare`s `module_header`
    /// emits for every `def-ffi-fn*` binding's trampoline to call through to.
    ffi_declarations: HashMap<String, usize>,
    apply_arities_used: std::collections::HashSet<usize>,
    statepoints: StatepointTable,
    lambda_counter: u32,
    string_counter: u32,
    pub current_ns: String,
    work_dir: PathBuf,
    loaded: Option<LoadedLibrary>,
    dirty_since_link: bool,
    extra_link_flags: Vec<String>,
}

struct LoadedLibrary {
    handle: *mut std::os::raw::c_void,
    symbols: HashMap<String, *const ()>,
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

impl LlvmTextBackend {
    pub fn new(work_dir: PathBuf, current_ns: &str) -> LlvmTextBackend {
        LlvmTextBackend {
            module_text: String::new(),
            global_slots: HashMap::new(),
            string_globals: HashMap::new(),
            ffi_declarations: HashMap::new(),
            apply_arities_used: std::collections::HashSet::new(),
            statepoints: StatepointTable::new(),
            lambda_counter: 0,
            string_counter: 0,
            current_ns: current_ns.to_string(),
            work_dir,
            loaded: None,
            dirty_since_link: true,
            extra_link_flags: Vec::new(),
        }
    }

    /// Adds `-l<flag>` linker flags (from `ffi::load_manifests`) to every
    /// future `relink`. Does not itself invalidate the cached library —
    /// callers add flags before the first `link_and_resolve`.
    pub fn add_link_flags(&mut self, flags: impl IntoIterator<Item = String>) {
        self.extra_link_flags.extend(flags);
        self.dirty_since_link = true;
    }

    fn fresh_lambda_name(&mut self) -> String {
        self.lambda_counter += 1;
        format!("el.lambda.{}", self.lambda_counter)
    }

    fn fresh_ffi_wrapper_name(&mut self) -> String {
        self.lambda_counter += 1;
        format!("el.ffi.wrapper.{}", self.lambda_counter)
    }

    /// A trampoline matching `rt_apply_N`'s convention (a trailing closure
    /// self-arg) that forwards its real arguments straight through to
    /// `external_name`'s plain tagged-value C ABI and ignores the rest.
    fn emit_ffi_wrapper(&mut self, symbol: &str, external_name: &str, arity: usize) {
        let mut header = format!("define i64 @{symbol}(");
        for i in 0..arity {
            header.push_str(&format!("i64 %arg{i}, "));
        }
        header.push_str("i64 %self) {");
        let args = (0..arity).map(|i| format!("i64 %arg{i}")).collect::<Vec<_>>().join(", ");
        let _ = writeln!(self.module_text, "{header}");
        let _ = writeln!(self.module_text, "  %t = call i64 @{external_name}({args})");
        let _ = writeln!(self.module_text, "  ret i64 %t");
        let _ = writeln!(self.module_text, "}}");
        self.dirty_since_link = true;
    }

    fn global_slot(&mut self, qualified_name: &str) -> String {
        if let Some(existing) = self.global_slots.get(qualified_name) {
            return existing.clone();
        }
        let mangled = mangle(qualified_name);
        let global = format!("@g.{mangled}");
        writeln!(self.module_text, "{global} = internal global i64 {TAG_NIL}").ok();
        self.global_slots.insert(qualified_name.to_string(), global.clone());
        self.dirty_since_link = true;
        global
    }

    fn intern_string(&mut self, text: &str) -> String {
        if let Some(existing) = self.string_globals.get(text) {
            return existing.clone();
        }
        self.string_counter += 1;
        let name = format!("@str.{}", self.string_counter);
        let escaped = escape_llvm_string(text);
        let len = text.len() + 1;
        writeln!(
            self.module_text,
            "{name} = private unnamed_addr constant [{len} x i8] c\"{escaped}\\00\""
        )
        .ok();
        self.string_globals.insert(text.to_string(), name.clone());
        self.dirty_since_link = true;
        name
    }

    fn emit_function_with_free_vars(
        &mut self,
        symbol: &str,
        body: &IrNode,
        arg_names: &[String],
        has_rest: bool,
        rest_name: Option<&str>,
        free: &[String],
    ) -> Result<(), BackendError> {
        let closure_slots = free.iter().enumerate().map(|(i, n)| (n.clone(), i as u64)).collect();
        let mut params: Vec<String> = arg_names.to_vec();
        if let Some(rest) = rest_name {
            params.push(rest.to_string());
        }
        self.emit_raw_function(symbol, &params, body, closure_slots)?;
        let _ = has_rest;
        Ok(())
    }

    fn emit_raw_function(
        &mut self,
        symbol: &str,
        params: &[String],
        body: &IrNode,
        closure_slots: HashMap<String, u64>,
    ) -> Result<(), BackendError> {
        let mut header = format!("define i64 @{symbol}(");
        for (i, _) in params.iter().enumerate() {
            header.push_str(&format!("i64 %arg{i}, "));
        }
        header.push_str("i64 %self) personality ptr @el_rt_eh_personality {");
        let mut lowerer = FnLowerer {
            backend: self,
            body: String::new(),
            temp: 0,
            label: 0,
            scopes: vec![Scope::default()],
            closure_slots,
            current_block: "entry".to_string(),
            try_contexts: Vec::new(),
        };
        for (i, name) in params.iter().enumerate() {
            lowerer.bind_local(name, format!("arg{i}"));
        }
        let result = lowerer.lower(body)?;
        let body_text = lowerer.body;
        let return_line = format!("  ret i64 %{result}\n}}\n");
        self.module_text.push_str(&header);
        self.module_text.push('\n');
        self.module_text.push_str("entry:\n");
        self.module_text.push_str(&body_text);
        self.module_text.push_str(&return_line);
        self.dirty_since_link = true;
        Ok(())
    }

    fn module_header(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "; ModuleID = 'el'");
        for decl in RUNTIME_DECLS {
            let _ = writeln!(s, "{decl}");
        }
        for arity in &self.apply_arities_used {
            if *arity > 2 {
                let operands = (0..*arity).map(|_| "i64".to_string()).collect::<Vec<_>>().join(", ");
                let _ = writeln!(s, "declare i64 @rt_apply_{arity}(i64, {operands})");
            }
        }
        for (name, arity) in &self.ffi_declarations {
            if RUNTIME_DECLS.iter().any(|d| d.contains(&format!("@{name}("))) {
                // Already declared above with the runtime's own signature —
                // an FFI binding re-targeting a runtime primitive by name
                // (e.g. `rt_make_pair`) doesn't need a second declaration.
                continue;
            }
            let params = (0..*arity).map(|_| "i64".to_string()).collect::<Vec<_>>().join(", ");
            let _ = writeln!(s, "declare i64 @{name}({params})");
        }
        s
    }
}

impl Backend for LlvmTextBackend {
    fn emit_function(
        &mut self,
        name: &str,
        ir: &IrNode,
        arg_names: &[String],
        has_rest: bool,
    ) -> Result<(), BackendError> {
        // A macro body sees its own parameters as ordinary locals and
        // nothing else — a `defmacro` never closes over its definition
        // site, so there are no free-variable env slots to wire up here.
        let _ = has_rest;
        self.emit_raw_function(name, arg_names, ir, HashMap::new())
    }

    fn emit_top_level_init(&mut self, name: &str, ir: &IrNode) -> Result<(), BackendError> {
        self.emit_raw_function(name, &[], ir, HashMap::new())
    }

    fn link_and_resolve(&mut self, name: &str) -> Result<*const (), BackendError> {
        if self.dirty_since_link || self.loaded.is_none() {
            self.relink()?;
        }
        let loaded = self.loaded.as_ref().expect("relink populates `loaded` on success");
        loaded
            .symbols
            .get(name)
            .copied()
            .ok_or_else(|| BackendError(format!("symbol `{name}` not found after linking")))
    }

    fn statepoint_table(&self) -> &StatepointTable {
        &self.statepoints
    }
}

impl LlvmTextBackend {
    fn relink(&mut self) -> Result<(), BackendError> {
        let ir_path = self.work_dir.join("el_module.ll");
        let so_path = self.work_dir.join("el_module.so");
        let mut full_ir = self.module_header();
        full_ir.push_str(&self.module_text);
        std::fs::write(&ir_path, &full_ir)
            .map_err(|e| BackendError(format!("failed to write IR file: {e}")))?;

        let mut command = std::process::Command::new("clang");
        command
            .arg("-shared")
            .arg("-fPIC")
            .arg("-O1")
            .arg(&ir_path)
            .arg("-o")
            .arg(&so_path)
            .arg("-lel_runtime");
        for flag in &self.extra_link_flags {
            command.arg(format!("-l{flag}"));
        }
        let output = command
            .output()
            .map_err(|e| BackendError(format!("failed to invoke clang: {e}")))?;
        if !output.status.success() {
            return Err(BackendError(format!(
                "clang failed compiling the JIT module:\n{}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let path_c = std::ffi::CString::new(so_path.to_string_lossy().into_owned())
            .map_err(|e| BackendError(format!("shared object path has an embedded NUL: {e}")))?;
        let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(BackendError("dlopen of the JIT module failed".to_string()));
        }

        let mut symbols = HashMap::new();
        for symbol in self.global_slots.keys().cloned().collect::<Vec<_>>() {
            let _ = symbol;
        }
        // Resolve every function symbol this backend has ever emitted —
        // tracked separately from `global_slots` (those are data slots,
        // not callable symbols).
        for name in self.emitted_function_names() {
            let c_name = std::ffi::CString::new(name.clone()).unwrap();
            let ptr = unsafe { libc::dlsym(handle, c_name.as_ptr() as *const c_char) };
            if !ptr.is_null() {
                symbols.insert(name, ptr as *const ());
            }
        }

        self.loaded = Some(LoadedLibrary { handle, symbols });
        self.dirty_since_link = false;
        Ok(())
    }

    /// Every `define i64 @<name>(...)` symbol emitted into `module_text` so
    /// far, scraped from the accumulated text rather than tracked in a
    /// parallel list — `module_text` is already the single source of truth
    /// for what's been emitted.
    fn emitted_function_names(&self) -> Vec<String> {
        self.module_text
            .lines()
            .filter_map(|line| line.strip_prefix("define i64 @"))
            .filter_map(|rest| rest.split('(').next())
            .map(|s| s.to_string())
            .collect()
    }
}

fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn escape_llvm_string(text: &str) -> String {
    text.bytes()
        .map(|b| match b {
            b'"' => "\\22".to_string(),
            b'\\' => "\\5C".to_string(),
            0x20..=0x7e => (b as char).to_string(),
            _ => format!("\\{:02X}", b),
        })
        .collect()
}

#[allow(dead_code)]
fn unused_phase_reference(_: Phase) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrNode;
    use crate::lexer::SourcePosition;

    fn pos() -> SourcePosition {
        SourcePosition::test(1, 1)
    }

    #[test]
    fn builtin_op_table_covers_arithmetic() {
        assert_eq!(builtin_op("+"), Some(("rt_add", 2)));
        assert_eq!(builtin_op("not"), Some(("rt_not", 1)));
        assert_eq!(builtin_op("frobnicate"), None);
    }

    #[test]
    fn mangle_replaces_non_identifier_characters() {
        assert_eq!(mangle("math/square"), "math_square");
        assert_eq!(mangle("<=?"), "___");
    }

    #[test]
    fn emit_top_level_init_produces_a_zero_arg_function() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = LlvmTextBackend::new(dir.path().to_path_buf(), "el.user");
        let ir = IrNode::new(IrKind::Const(ConstValue::Int(42)), pos(), 0);
        backend.emit_top_level_init("el_init_0", &ir).unwrap();
        assert!(backend.module_text.contains("define i64 @el_init_0()"));
    }

    #[test]
    fn global_slot_is_stable_across_repeated_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = LlvmTextBackend::new(dir.path().to_path_buf(), "el.user");
        let first = backend.global_slot("el.user/x");
        let second = backend.global_slot("el.user/x");
        assert_eq!(first, second);
    }
}
