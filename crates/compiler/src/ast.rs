//! The parser's output: a recursive sum mirroring surface syntax exactly
//! (§3's "AST node"). Reader macros are desugared here into list forms with
//! a leading symbol (`quote`, `quasiquote`, `unquote`, `unquote-splice`) so
//! every later pass only has to understand lists, not a separate syntax for
//! sugar.

use crate::lexer::SourcePosition;

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Symbol(String),
    Keyword(String),
    Nil,
    List(Vec<Node>),
}

/// An AST node paired with the source position of the form that produced
/// it. Position is carried alongside rather than inside `Ast` so leaf
/// variants (reused when desugaring reader macros into synthetic symbols)
/// don't need a position field duplicated per-variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub ast: Ast,
    pub position: SourcePosition,
}

impl Node {
    pub fn new(ast: Ast, position: SourcePosition) -> Node {
        Node { ast, position }
    }

    pub fn symbol(name: &str, position: SourcePosition) -> Node {
        Node::new(Ast::Symbol(name.to_string()), position)
    }

    /// Wrap `inner` in `(head inner)`, the desugaring every reader macro
    /// prefix produces.
    pub fn wrap(head: &str, inner: Node, position: SourcePosition) -> Node {
        Node::new(
            Ast::List(vec![Node::symbol(head, position.clone()), inner]),
            position,
        )
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match &self.ast {
            Ast::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.ast {
            Ast::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// The head symbol of a list form, if this node is a non-empty list
    /// whose first element is a symbol — used throughout the analyzer to
    /// dispatch on special forms.
    pub fn head_symbol(&self) -> Option<&str> {
        self.as_list()?.first()?.as_symbol()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_produces_a_two_element_list() {
        let pos = SourcePosition::test(1, 1);
        let inner = Node::symbol("x", pos.clone());
        let wrapped = Node::wrap("quote", inner.clone(), pos.clone());
        assert_eq!(wrapped.as_list().unwrap(), &[Node::symbol("quote", pos), inner]);
    }

    #[test]
    fn head_symbol_of_non_list_is_none() {
        let pos = SourcePosition::test(1, 1);
        let leaf = Node::new(Ast::Integer(1), pos);
        assert_eq!(leaf.head_symbol(), None);
    }
}
