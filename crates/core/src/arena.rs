//! Bump-allocated text storage for lexer lexemes and source file paths.
//!
//! The lexer borrows slices of the original source buffer where possible,
//! but escape-processed string literals and synthesized symbol text (e.g.
//! names built during macro expansion) need an owner. A `TextArena` gives
//! them one without forcing every token to carry a heap `String`.

use bumpalo::Bump;

pub struct TextArena {
    bump: Bump,
}

impl TextArena {
    pub fn new() -> TextArena {
        TextArena { bump: Bump::new() }
    }

    /// Copy `text` into the arena and return a `'static`-looking borrow that
    /// is actually only valid for the arena's lifetime. Callers tie the
    /// lifetime back down via the borrow checker (the returned `&str`
    /// borrows `self`).
    pub fn intern<'a>(&'a self, text: &str) -> &'a str {
        self.bump.alloc_str(text)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

impl Default for TextArena {
    fn default() -> Self {
        TextArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_preserves_content() {
        let arena = TextArena::new();
        let a = arena.intern("hello");
        let b = arena.intern("world");
        assert_eq!(a, "hello");
        assert_eq!(b, "world");
    }
}
