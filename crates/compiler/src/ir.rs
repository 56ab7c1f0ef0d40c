//! The analyzer's output: a typed intermediate representation (§3's "IR
//! node (AnalyzerNode)"). `IrKind`'s variant ordering starts from the
//! source this was distilled from (`If, Constant, Do, Lambda, DefMacro,
//! Def, VarLookup, MaybeInvoke, MacroExpand, DefFFIFunction, ConstantList`)
//! and is extended with `Let`, `SetBang`, `While`, `Try`, `InNs`, `EvalWhen`
//! — forms the source's analyzer never finished wiring but the spec
//! requires fully implemented.

use std::collections::HashSet;

use crate::lexer::SourcePosition;

/// A bitmask over `{CompileTime, LoadTime}`. Plain constants rather than
/// the `bitflags` crate — the set has two members and the teacher workspace
/// doesn't carry that dependency for anything this small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase(pub u8);

impl Phase {
    pub const COMPILE_TIME: Phase = Phase(0b01);
    pub const LOAD_TIME: Phase = Phase(0b10);
    pub const NONE: Phase = Phase(0b00);

    pub fn contains(self, other: Phase) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Phase) -> Phase {
        Phase(self.0 | other.0)
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::LOAD_TIME
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Sym(String),
    Kw(String),
    Nil,
}

/// One element of an analyzed constant list (the product of `quote` /
/// `quasiquote`). `spliced` marks an `unquote-splice` element: the constant
/// list can't be flattened at analysis time (the splice target is only
/// known once the list is materialized into a runtime value, at macro
/// expansion or quote time), so the flag rides along until then.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstListElement {
    pub node: Box<IrNode>,
    pub spliced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub type_name: String,
    pub binding: String,
    pub body: Box<IrNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrKind {
    If {
        cond: Box<IrNode>,
        consequent: Box<IrNode>,
        alternative: Option<Box<IrNode>>,
    },
    Const(ConstValue),
    Do {
        statements: Vec<IrNode>,
        return_value: Box<IrNode>,
    },
    Lambda {
        arg_names: Vec<String>,
        has_rest: bool,
        rest_name: Option<String>,
        body: Box<IrNode>,
    },
    DefMacro {
        name: String,
        arg_names: Vec<String>,
        has_rest: bool,
        rest_name: Option<String>,
        body: Box<IrNode>,
    },
    Def {
        name: String,
        value: Box<IrNode>,
    },
    VarLookup {
        name: String,
        is_global: bool,
        qualifying_ns: Option<String>,
    },
    MaybeInvoke {
        function: Box<IrNode>,
        args: Vec<IrNode>,
    },
    MacroExpand {
        macro_ref: String,
        args: Vec<IrNode>,
    },
    DefFfiFn {
        binding: String,
        external_name: String,
        return_type: String,
        arg_types: Vec<String>,
    },
    ConstList {
        elements: Vec<ConstListElement>,
    },
    Let {
        bindings: Vec<(String, IrNode)>,
        body: Box<IrNode>,
        sequential: bool,
    },
    SetBang {
        name: String,
        value: Box<IrNode>,
    },
    While {
        condition: Box<IrNode>,
        body: Box<IrNode>,
    },
    Try {
        body: Box<IrNode>,
        catches: Vec<Catch>,
    },
    InNs {
        name: String,
    },
    EvalWhen {
        phases: Phase,
        body: Box<IrNode>,
    },
}

/// Every IR node carries its analyzed kind plus the three cross-cutting
/// attributes the post-passes in §4.3 compute: `depth` (lexical nesting,
/// for the top-level-only checks on `EvalWhen`/`InNs`), `evaluation_phase`
/// (default `LoadTime`, overridden under `EvalWhen`), and `closed_overs`
/// (free variables, populated by the closed-over collection pass — empty
/// until that pass runs).
#[derive(Debug, Clone, PartialEq)]
pub struct IrNode {
    pub kind: IrKind,
    pub position: SourcePosition,
    pub depth: usize,
    pub evaluation_phase: Phase,
    pub closed_overs: HashSet<String>,
}

impl IrNode {
    pub fn new(kind: IrKind, position: SourcePosition, depth: usize) -> IrNode {
        IrNode {
            kind,
            position,
            depth,
            evaluation_phase: Phase::default(),
            closed_overs: HashSet::new(),
        }
    }

    /// `Do` and `EvalWhen` don't add lexical depth (§4.3 post-pass 2); every
    /// other constructor does.
    pub fn increases_depth(&self) -> bool {
        !matches!(self.kind, IrKind::Do { .. } | IrKind::EvalWhen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_union_and_contains() {
        let both = Phase::COMPILE_TIME.union(Phase::LOAD_TIME);
        assert!(both.contains(Phase::COMPILE_TIME));
        assert!(both.contains(Phase::LOAD_TIME));
        assert!(!Phase::COMPILE_TIME.contains(Phase::LOAD_TIME));
    }

    #[test]
    fn do_and_eval_when_do_not_increase_depth() {
        let pos = SourcePosition::test(1, 1);
        let do_node = IrNode::new(
            IrKind::Do {
                statements: vec![],
                return_value: Box::new(IrNode::new(IrKind::Const(ConstValue::Nil), pos.clone(), 0)),
            },
            pos,
            0,
        );
        assert!(!do_node.increases_depth());
    }
}
