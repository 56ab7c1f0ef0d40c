//! Lexer: UTF-8 source bytes to a batched token stream.
//!
//! Lexing is batched rather than lazy (`lex` returns the full `Vec<Token>`)
//! since the parser always consumes the whole sequence up front — matching
//! §4.1's "lazy or batched is implementer's choice; the parser consumes the
//! full sequence."

use crate::error::LexError;
use el_core::arena::TextArena;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub file: Rc<str>,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[cfg(test)]
impl SourcePosition {
    /// Builds a position carrying a placeholder file name, for tests that
    /// only care about line/column.
    pub fn test(line: usize, column: usize) -> SourcePosition {
        SourcePosition { file: Rc::from("<test>"), line, column }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    LParen,
    RParen,
    Quote,
    QuasiQuote,
    Unquote,
    SpliceUnquote,
    Symbol(&'a str),
    Keyword(&'a str),
    String(&'a str),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Nil,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub position: SourcePosition,
}

/// A character is part of a symbol if it isn't whitespace, a paren, a
/// string quote, or one of the reader-macro prefix characters. This is the
/// "permissive identifier class" of §4.1: `->`, `+`, `<=?`, and non-ASCII
/// letters are all valid symbol characters.
fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | '\'' | '`' | ',' | ';')
}

struct Lexer<'a> {
    arena: &'a TextArena,
    file: Rc<str>,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &str, arena: &'a TextArena, file: Rc<str>) -> Self {
        Lexer {
            arena,
            file,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn position(&self) -> SourcePosition {
        SourcePosition {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_string(&mut self, start: SourcePosition) -> Result<Token<'a>, LexError> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(LexError {
                        position: start,
                        reason: "unterminated string literal".to_string(),
                    })
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(other) => text.push(other),
                    None => {
                        return Err(LexError {
                            position: start,
                            reason: "unterminated escape in string literal".to_string(),
                        })
                    }
                },
                Some(c) => text.push(c),
            }
        }
        Ok(Token {
            kind: TokenKind::String(self.arena.intern(&text)),
            position: start,
        })
    }

    fn lex_symbolic(&mut self, start: SourcePosition) -> Token<'a> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if !is_symbol_char(c) {
                break;
            }
            text.push(c);
            self.advance();
        }
        let kind = classify_symbolic(self.arena.intern(&text));
        Token { kind, position: start }
    }
}

/// Distinguishes integer/float/boolean/nil/keyword literals from plain
/// symbols once the raw symbolic run has been collected — numeric literals
/// are told apart from integers by the presence of a `.`, per §4.1.
fn classify_symbolic(text: &str) -> TokenKind<'_> {
    match text {
        "#t" | "#true" => return TokenKind::Boolean(true),
        "#f" | "#false" => return TokenKind::Boolean(false),
        "nil" => return TokenKind::Nil,
        _ => {}
    }
    if let Some(rest) = text.strip_prefix(':') {
        if !rest.is_empty() {
            return TokenKind::Keyword(rest);
        }
    }
    if let Ok(i) = text.parse::<i64>() {
        return TokenKind::Integer(i);
    }
    if text.contains('.') && text.parse::<f64>().is_ok() {
        return TokenKind::Float(text.parse().unwrap());
    }
    TokenKind::Symbol(text)
}

/// Lex `source` into a batched token sequence, interning owned text
/// (string-literal contents, symbol/keyword text) into `arena`. `file`
/// labels every position in the returned tokens, per §3's data model.
pub fn lex<'a>(
    source: &str,
    arena: &'a TextArena,
    file: impl Into<Rc<str>>,
) -> Result<Vec<Token<'a>>, LexError> {
    let mut lexer = Lexer::new(source, arena, file.into());
    let mut tokens = Vec::new();
    loop {
        lexer.skip_whitespace_and_comments();
        let start = lexer.position();
        let Some(c) = lexer.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                position: start,
            });
            break;
        };
        let token = match c {
            '(' => {
                lexer.advance();
                Token { kind: TokenKind::LParen, position: start }
            }
            ')' => {
                lexer.advance();
                Token { kind: TokenKind::RParen, position: start }
            }
            '\'' => {
                lexer.advance();
                Token { kind: TokenKind::Quote, position: start }
            }
            '`' => {
                lexer.advance();
                Token { kind: TokenKind::QuasiQuote, position: start }
            }
            ',' => {
                lexer.advance();
                if lexer.peek() == Some('@') {
                    lexer.advance();
                    Token { kind: TokenKind::SpliceUnquote, position: start }
                } else {
                    Token { kind: TokenKind::Unquote, position: start }
                }
            }
            '"' => lexer.lex_string(start)?,
            _ => lexer.lex_symbolic(start),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_atoms_and_parens() {
        let arena = TextArena::new();
        let tokens = lex("(+ 1 2.5 :kw #t nil)", &arena, "<test>").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LParen,
                TokenKind::Symbol("+"),
                TokenKind::Integer(1),
                TokenKind::Float(2.5),
                TokenKind::Keyword("kw"),
                TokenKind::Boolean(true),
                TokenKind::Nil,
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_reader_macro_prefixes() {
        let arena = TextArena::new();
        let tokens = lex("'x `y ,z ,@w", &arena, "<test>").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Quote,
                TokenKind::Symbol("x"),
                TokenKind::QuasiQuote,
                TokenKind::Symbol("y"),
                TokenKind::Unquote,
                TokenKind::Symbol("z"),
                TokenKind::SpliceUnquote,
                TokenKind::Symbol("w"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn permissive_symbol_class_admits_operator_names() {
        let arena = TextArena::new();
        let tokens = lex("-> + <=? foo-bar?", &arena, "<test>").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Symbol("->"),
                TokenKind::Symbol("+"),
                TokenKind::Symbol("<=?"),
                TokenKind::Symbol("foo-bar?"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_literal_handles_escapes() {
        let arena = TextArena::new();
        let tokens = lex(r#" "a\nb\"c" "#, &arena, "<test>").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::String("a\nb\"c"));
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let arena = TextArena::new();
        let err = lex(r#" "unterminated"#, &arena, "<test>").unwrap_err();
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn token_stream_covers_whole_source_modulo_whitespace() {
        // Universal invariant from spec §8: concatenating lexemes in
        // order (with separating whitespace) reproduces the source.
        let arena = TextArena::new();
        let source = "(foo 1 2)";
        let tokens = lex(source, &arena, "<test>").unwrap();
        let mut rebuilt = String::new();
        for tok in &tokens {
            match &tok.kind {
                TokenKind::LParen => rebuilt.push('('),
                TokenKind::RParen => rebuilt.push(')'),
                TokenKind::Symbol(s) => {
                    if !rebuilt.is_empty() && !rebuilt.ends_with('(') {
                        rebuilt.push(' ');
                    }
                    rebuilt.push_str(s);
                }
                TokenKind::Integer(i) => {
                    rebuilt.push(' ');
                    rebuilt.push_str(&i.to_string());
                }
                TokenKind::Eof => {}
                _ => {}
            }
        }
        assert_eq!(rebuilt, source);
    }
}
