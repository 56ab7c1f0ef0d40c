//! Per-stage error types, one manual enum per pipeline stage, each with a
//! hand-written `Display` and `std::error::Error` impl (no `thiserror`, no
//! `anyhow`), in the style of the runtime crate's `exceptions.rs` and the
//! stack-language compiler's `codegen/error.rs` this crate started from.
//!
//! Lex/parse/analysis/link errors are distinct types so each stage can be
//! tested in isolation; `CompileError` is the top-level sum the driver in
//! `lib.rs` actually returns, with a `From` conversion from each stage.

use crate::lexer::SourcePosition;

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub position: SourcePosition,
    pub reason: String,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.position, self.reason)
    }
}

impl std::error::Error for LexError {}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub position: SourcePosition,
    pub reason: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.position, self.reason)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisErrorKind {
    UnboundSymbol(String),
    NotVisibleToCompiler(String),
    MalformedSpecialForm(String),
    WrongArity { form: String, expected: String },
    EvalWhenNotTopLevel,
    UnknownFfiType(String),
    DuplicateDefinition(String),
    MacroExpansionTooDeep(String),
    UnknownMacro(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisError {
    pub position: SourcePosition,
    pub kind: AnalysisErrorKind,
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use AnalysisErrorKind::*;
        let msg = match &self.kind {
            UnboundSymbol(name) => format!("unbound symbol `{name}`"),
            NotVisibleToCompiler(name) => {
                format!("symbol `{name}` not visible to compiler")
            }
            MalformedSpecialForm(what) => format!("malformed special form: {what}"),
            WrongArity { form, expected } => {
                format!("`{form}` expects {expected}")
            }
            EvalWhenNotTopLevel => "eval-when is only valid at top level".to_string(),
            UnknownFfiType(kw) => format!("unknown FFI type keyword `{kw}`"),
            DuplicateDefinition(name) => format!("`{name}` is already defined"),
            MacroExpansionTooDeep(name) => {
                format!("macro `{name}` exceeded the maximum expansion depth")
            }
            UnknownMacro(name) => format!("no macro named `{name}`"),
        };
        write!(f, "{}: {}", self.position, msg)
    }
}

impl std::error::Error for AnalysisError {}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkError {
    pub symbol: String,
    pub reason: String,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link error for `{}`: {}", self.symbol, self.reason)
    }
}

impl std::error::Error for LinkError {}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<std::fmt::Error> for BackendError {
    fn from(e: std::fmt::Error) -> Self {
        BackendError(format!("IR generation error: {e}"))
    }
}

/// The top-level error the compile driver returns. Each stage's error wraps
/// in without losing its own `Display`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Lex(LexError),
    Parse(ParseError),
    Analysis(AnalysisError),
    Link(LinkError),
    Backend(BackendError),
    /// Rejected before compilation starts: a [`crate::config::CompilerConfig`]
    /// setting this build cannot honor, e.g. a GC mode the backend never
    /// emits safepoints for.
    Config(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Lex(e) => write!(f, "lex error: {e}"),
            CompileError::Parse(e) => write!(f, "parse error: {e}"),
            CompileError::Analysis(e) => write!(f, "analysis error: {e}"),
            CompileError::Link(e) => write!(f, "{e}"),
            CompileError::Backend(e) => write!(f, "backend error: {e}"),
            CompileError::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError::Lex(e)
    }
}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        CompileError::Parse(e)
    }
}

impl From<AnalysisError> for CompileError {
    fn from(e: AnalysisError) -> Self {
        CompileError::Analysis(e)
    }
}

impl From<LinkError> for CompileError {
    fn from(e: LinkError) -> Self {
        CompileError::Link(e)
    }
}

impl From<BackendError> for CompileError {
    fn from(e: BackendError) -> Self {
        CompileError::Backend(e)
    }
}
