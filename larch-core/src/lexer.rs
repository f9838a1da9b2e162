//! Scanner for Larch source text.
//!
//! Larch blocks are delimited by indentation, not braces. The scanner
//! resolves leading-whitespace depth into explicit `BlockBegin` /
//! `BlockEnd` markers using an indentation stack, so the parser never
//! has to look at whitespace. Within a line it tokenizes with
//! longest-match rules over a fixed operator table.
//!
//! All scanning errors are reported through the [`ErrorManager`] and
//! scanning resumes at the next line boundary; a malformed token never
//! aborts the scan.

use crate::diagnostic::ErrorManager;
use crate::error::CoreError;
use crate::span::{FileId, Pos};

/// Kind of a token produced by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Special
    Eof,
    /// Statement boundary at the end of a line.
    Newline,
    /// Indentation increased by one unit.
    BlockBegin,
    /// Indentation dropped back to an enclosing level.
    BlockEnd,

    // Identifiers and literals
    Ident,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    RawStringLiteral,
    CharLiteral,
    RegexLiteral,
    BoolLiteral,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    FatArrow, // =>
    Ellipsis, // ...

    /// Prefix or infix operator from the fixed operator table; the
    /// token text tells them apart.
    Op,

    // Keywords
    Class,
    Interface,
    Fn,
    Let,
    Static,
    If,
    Elif,
    Else,
    While,
    Return,
    Break,
    Continue,
}

/// A single token: kind, raw lexeme text and source position.
///
/// The text is the exact source slice (string literals keep their
/// quotes); decoding escape sequences is the parser's job. Layout
/// tokens have empty text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: Pos,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Spaces per indentation level.
    pub indent_width: u32,
    /// Whether a contentless line emits a statement boundary.
    pub blank_line_is_boundary: bool,
}

impl Default for ScanConfig {
    fn default() -> ScanConfig {
        ScanConfig {
            indent_width: 4,
            blank_line_is_boundary: false,
        }
    }
}

/// Scan a source file into tokens.
///
/// Lexical errors are recorded in `errs`; the returned sequence is
/// always well-formed (balanced block markers, trailing `Eof`).
pub fn scan(
    file: FileId,
    source: &str,
    config: &ScanConfig,
    errs: &mut ErrorManager,
) -> Result<Vec<Token>, CoreError> {
    let scanner = Scanner {
        file,
        chars: source.chars().collect(),
        index: 0,
        line: 1,
        col: 1,
        config: config.clone(),
        stack: vec![0],
        tokens: Vec::new(),
    };
    scanner.run(errs)
}

/// Rebuild a source text from a token sequence, placing each token at
/// its recorded position. Layout tokens are zero-width and skipped.
/// Re-scanning the result reproduces the original token sequence.
pub fn reconstruct(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut line = 1u32;
    let mut col = 1u32;
    for tok in tokens {
        if tok.text.is_empty() {
            continue;
        }
        while line < tok.pos.line {
            out.push('\n');
            line += 1;
            col = 1;
        }
        while col < tok.pos.col {
            out.push(' ');
            col += 1;
        }
        for ch in tok.text.chars() {
            out.push(ch);
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
    }
    // Trailing newlines are invisible to the loop above; the Eof
    // token's line says how many the source had.
    if let Some(eof) = tokens.iter().find(|t| t.kind == TokenKind::Eof) {
        while line < eof.pos.line {
            out.push('\n');
            line += 1;
        }
    }
    out
}

struct Scanner {
    file: FileId,
    chars: Vec<char>,
    index: usize,
    line: u32,
    col: u32,
    config: ScanConfig,
    /// Indentation stack holding leading-space counts, bottom is 0.
    stack: Vec<u32>,
    tokens: Vec<Token>,
}

impl Scanner {
    fn run(mut self, errs: &mut ErrorManager) -> Result<Vec<Token>, CoreError> {
        while self.start_line(errs)? {
            self.scan_line(errs)?;
        }
        let eof = self.pos();
        while self.stack.len() > 1 {
            self.stack.pop();
            self.push_marker(TokenKind::BlockEnd, eof);
        }
        self.push_marker(TokenKind::Eof, eof);
        Ok(self.tokens)
    }

    /// Consume leading whitespace of the next content line and apply
    /// the layout rules. Blank and comment-only lines are skipped
    /// (optionally emitting a boundary) and never close blocks.
    /// Returns false once the input is exhausted.
    fn start_line(&mut self, errs: &mut ErrorManager) -> Result<bool, CoreError> {
        loop {
            let line_start = self.pos();
            let mut width = 0u32;
            let mut saw_tab = false;
            while let Some(ch) = self.peek() {
                match ch {
                    ' ' => {
                        width += 1;
                        self.advance();
                    }
                    '\t' => {
                        saw_tab = true;
                        // A tab counts as one full indent unit.
                        width += self.config.indent_width;
                        self.advance();
                    }
                    '\r' => {
                        self.advance();
                    }
                    _ => break,
                }
            }
            if saw_tab {
                errs.lexical_error("tab character in indentation", line_start)?;
            }

            // Leading block comments do not contribute to layout.
            while self.peek() == Some('/') && self.peek_at(1) == Some('*') {
                self.consume_block_comment(errs)?;
                while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
                    self.advance();
                }
            }

            match self.peek() {
                None => return Ok(false),
                Some('\n') => {
                    self.advance();
                    self.blank_line(line_start);
                    continue;
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                    if self.peek() == Some('\n') {
                        self.advance();
                    }
                    self.blank_line(line_start);
                    continue;
                }
                Some(_) => {
                    self.apply_layout(width, line_start, errs)?;
                    return Ok(true);
                }
            }
        }
    }

    fn blank_line(&mut self, line_start: Pos) {
        if self.config.blank_line_is_boundary {
            self.push_marker(TokenKind::Newline, Pos::new(self.file, line_start.line, 1));
        }
    }

    fn apply_layout(&mut self, width: u32, pos: Pos, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let top = *self.stack.last().unwrap_or(&0);
        if width > top {
            if width != top + self.config.indent_width {
                errs.lexical_error(
                    format!(
                        "indentation of {} spaces does not open exactly one new block (expected {})",
                        width,
                        top + self.config.indent_width
                    ),
                    pos,
                )?;
            }
            // Recover by opening a single layer at the observed width.
            self.stack.push(width);
            self.push_marker(TokenKind::BlockBegin, pos);
        } else if width < top {
            while self.stack.last().is_some_and(|&d| d > width) && self.stack.len() > 1 {
                self.stack.pop();
                self.push_marker(TokenKind::BlockEnd, pos);
            }
            if *self.stack.last().unwrap_or(&0) != width {
                // Dedent matches no open layer: continue at the
                // nearest lower stack entry.
                errs.lexical_error(
                    format!("inconsistent dedent to {} spaces", width),
                    pos,
                )?;
            }
        }
        Ok(())
    }

    /// Tokenize the rest of the current line, consuming the
    /// terminating newline and emitting a `Newline` boundary.
    fn scan_line(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        loop {
            while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
                self.advance();
            }
            let pos = self.pos();
            match self.peek() {
                None => {
                    self.push_marker(TokenKind::Newline, pos);
                    return Ok(());
                }
                Some('\n') => {
                    self.advance();
                    self.push_marker(TokenKind::Newline, pos);
                    return Ok(());
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.consume_block_comment(errs)?;
                }
                Some('"') => self.scan_string(errs)?,
                Some('\'') => self.scan_char(errs)?,
                Some('#') if self.peek_at(1) == Some('"') => self.scan_regex(errs)?,
                Some(c) if c.is_ascii_digit() => self.scan_number(),
                Some(c) if is_ident_start(c) => self.scan_ident(),
                Some(_) => self.scan_operator(errs)?,
            }
        }
    }

    fn scan_string(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let start = self.pos();
        let from = self.index;
        if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
            // Raw multi-line string, no escapes.
            self.advance();
            self.advance();
            self.advance();
            loop {
                match self.peek() {
                    None => {
                        errs.lexical_error("unterminated raw string literal", start)?;
                        return Ok(());
                    }
                    Some('"') if self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') => {
                        self.advance();
                        self.advance();
                        self.advance();
                        self.push_text(TokenKind::RawStringLiteral, from, start);
                        return Ok(());
                    }
                    Some(_) => {
                        self.advance();
                    }
                }
            }
        }
        self.advance(); // opening quote
        loop {
            match self.peek() {
                None | Some('\n') => {
                    // Resume at the line boundary, no token emitted.
                    errs.lexical_error("unterminated string literal", start)?;
                    return Ok(());
                }
                Some('\\') => {
                    let esc_pos = self.pos();
                    self.advance();
                    self.consume_escape(esc_pos, errs)?;
                }
                Some('"') => {
                    self.advance();
                    self.push_text(TokenKind::StringLiteral, from, start);
                    return Ok(());
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn consume_escape(&mut self, esc_pos: Pos, errs: &mut ErrorManager) -> Result<(), CoreError> {
        match self.peek() {
            Some('n' | 't' | 'r' | '\\' | '"' | '\'' | '0') => {
                self.advance();
                Ok(())
            }
            Some('u') => {
                self.advance();
                if self.peek() == Some('{') {
                    self.advance();
                    while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                        self.advance();
                    }
                    if self.peek() == Some('}') {
                        self.advance();
                        return Ok(());
                    }
                }
                errs.lexical_error("invalid unicode escape", esc_pos)
            }
            _ => {
                if self.peek().is_some_and(|c| c != '\n') {
                    self.advance();
                }
                errs.lexical_error("invalid escape sequence", esc_pos)
            }
        }
    }

    fn scan_char(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let start = self.pos();
        let from = self.index;
        self.advance(); // opening quote
        match self.peek() {
            None | Some('\n') => {
                return errs.lexical_error("unterminated char literal", start);
            }
            Some('\\') => {
                let esc_pos = self.pos();
                self.advance();
                self.consume_escape(esc_pos, errs)?;
            }
            Some(_) => {
                self.advance();
            }
        }
        if self.peek() == Some('\'') {
            self.advance();
            self.push_text(TokenKind::CharLiteral, from, start);
            Ok(())
        } else {
            errs.lexical_error("unterminated char literal", start)
        }
    }

    fn scan_regex(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let start = self.pos();
        let from = self.index;
        self.advance(); // '#'
        self.advance(); // '"'
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return errs.lexical_error("unterminated regex literal", start);
                }
                Some('"') if self.peek_at(1) == Some('#') => {
                    self.advance();
                    self.advance();
                    self.push_text(TokenKind::RegexLiteral, from, start);
                    return Ok(());
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn scan_number(&mut self) {
        let start = self.pos();
        let from = self.index;
        let mut is_float = false;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.advance();
            }
            if self.peek() == Some('L') {
                self.advance();
            }
            self.push_text(TokenKind::IntLiteral, from, start);
            return;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.advance();
            }
        }
        match self.peek() {
            Some('f') | Some('d') => {
                is_float = true;
                self.advance();
            }
            Some('L') if !is_float => {
                self.advance();
            }
            _ => {}
        }
        let kind = if is_float {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        };
        self.push_text(kind, from, start);
    }

    fn scan_ident(&mut self) {
        let start = self.pos();
        let from = self.index;
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        let text: String = self.chars[from..self.index].iter().collect();
        let kind = match text.as_str() {
            "class" => TokenKind::Class,
            "interface" => TokenKind::Interface,
            "fn" => TokenKind::Fn,
            "let" => TokenKind::Let,
            "static" => TokenKind::Static,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "true" | "false" => TokenKind::BoolLiteral,
            _ => TokenKind::Ident,
        };
        self.tokens.push(Token {
            kind,
            text,
            pos: start,
        });
    }

    fn scan_operator(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let start = self.pos();
        let from = self.index;

        // Maximal munch: three-char operators first, then two, then one.
        for len in (1..=3usize).rev() {
            let candidate: String = self.chars[self.index..(self.index + len).min(self.chars.len())]
                .iter()
                .collect();
            if candidate.chars().count() < len {
                continue;
            }
            if let Some(kind) = operator_kind(&candidate) {
                for _ in 0..len {
                    self.advance();
                }
                self.push_text(kind, from, start);
                return Ok(());
            }
        }

        let ch = self.peek().unwrap_or('\0');
        self.advance();
        errs.lexical_error(format!("unknown token '{}'", ch), start)
    }

    fn consume_block_comment(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let start = self.pos();
        self.advance(); // '/'
        self.advance(); // '*'
        loop {
            match self.peek() {
                None => {
                    return errs.lexical_error("unterminated block comment", start);
                }
                Some('*') if self.peek_at(1) == Some('/') => {
                    self.advance();
                    self.advance();
                    return Ok(());
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn push_marker(&mut self, kind: TokenKind, pos: Pos) {
        self.tokens.push(Token {
            kind,
            text: String::new(),
            pos,
        });
    }

    fn push_text(&mut self, kind: TokenKind, from: usize, pos: Pos) {
        let text: String = self.chars[from..self.index].iter().collect();
        self.tokens.push(Token { kind, text, pos });
    }

    fn pos(&self) -> Pos {
        Pos::new(self.file, self.line, self.col)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(&ch) = self.chars.get(self.index) {
            self.index += 1;
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }
}

fn operator_kind(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "(" => TokenKind::LParen,
        ")" => TokenKind::RParen,
        "[" => TokenKind::LBracket,
        "]" => TokenKind::RBracket,
        "," => TokenKind::Comma,
        ":" => TokenKind::Colon,
        "." => TokenKind::Dot,
        "=>" => TokenKind::FatArrow,
        "..." => TokenKind::Ellipsis,
        ">>>" | "<<" | ">>" | "<=" | ">=" | "==" | "!=" | "&&" | "||" => TokenKind::Op,
        "+" | "-" | "*" | "/" | "%" | "<" | ">" | "!" | "~" | "&" | "|" | "^" | "=" => TokenKind::Op,
        _ => return None,
    };
    Some(kind)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_ok(source: &str) -> Vec<Token> {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, source, &ScanConfig::default(), &mut errs).expect("scan");
        assert!(
            !errs.has_errors(),
            "unexpected errors: {:?}",
            errs.diagnostics()
        );
        tokens
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    fn count(tokens: &[Token], kind: TokenKind) -> usize {
        tokens.iter().filter(|t| t.kind == kind).count()
    }

    #[test]
    fn balanced_sources_balance_block_markers() {
        let source = "class A\n    fn f()\n        return 1\n    fn g()\n        return 2\nclass B\n    fn h()\n        return 3\n";
        let tokens = scan_ok(source);
        assert_eq!(
            count(&tokens, TokenKind::BlockBegin),
            count(&tokens, TokenKind::BlockEnd)
        );
    }

    #[test]
    fn rescanning_reconstruction_is_stable() {
        let source = "class Point(x: int, y: int)\n    fn norm(): int\n        return x * x + y * y\n\nlet p = Point(3, 4)\n";
        let tokens = scan_ok(source);
        let rebuilt = reconstruct(&tokens);
        let again = scan_ok(&rebuilt);
        assert_eq!(tokens, again);
    }

    #[test]
    fn scans_numeric_literal_variants() {
        let tokens = scan_ok("1 42L 0x1F 0xffL 1.5 2f 3.25d");
        let texts: Vec<_> = tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::IntLiteral | TokenKind::FloatLiteral))
            .map(|t| (t.kind, t.text.as_str()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (TokenKind::IntLiteral, "1"),
                (TokenKind::IntLiteral, "42L"),
                (TokenKind::IntLiteral, "0x1F"),
                (TokenKind::IntLiteral, "0xffL"),
                (TokenKind::FloatLiteral, "1.5"),
                (TokenKind::FloatLiteral, "2f"),
                (TokenKind::FloatLiteral, "3.25d"),
            ]
        );
    }

    #[test]
    fn maximal_munch_over_operator_table() {
        let tokens = scan_ok("a >>> b >> c > d => e ... f");
        let ops: Vec<_> = tokens
            .iter()
            .filter(|t| {
                matches!(
                    t.kind,
                    TokenKind::Op | TokenKind::FatArrow | TokenKind::Ellipsis
                )
            })
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec![">>>", ">>", ">", "=>", "..."]);
    }

    #[test]
    fn unterminated_string_recovers_at_line_boundary() {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, "let s = \"oops\nlet t = 1\n", &ScanConfig::default(), &mut errs)
            .expect("scan");
        assert_eq!(errs.error_count(), 1);
        let diag = &errs.diagnostics()[0];
        assert!(diag.message.contains("unterminated string"));
        assert_eq!((diag.pos.line, diag.pos.col), (1, 9));
        // The second line still scans normally.
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Ident && t.text == "t"));
    }

    #[test]
    fn invalid_escape_is_reported_and_scanning_continues() {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, "let s = \"a\\qb\"\n", &ScanConfig::default(), &mut errs).expect("scan");
        assert_eq!(errs.error_count(), 1);
        assert!(errs.diagnostics()[0].message.contains("invalid escape"));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::StringLiteral));
    }

    #[test]
    fn tabs_in_indentation_are_an_error() {
        let mut errs = ErrorManager::new(false);
        scan(0, "if x\n\treturn 1\n", &ScanConfig::default(), &mut errs).expect("scan");
        assert_eq!(errs.error_count(), 1);
        assert!(errs.diagnostics()[0].message.contains("tab character"));
    }

    #[test]
    fn inconsistent_dedent_recovers_to_nearest_layer() {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(
            0,
            "if a\n    if b\n        x\n  y\nz\n",
            &ScanConfig::default(),
            &mut errs,
        )
        .expect("scan");
        assert_eq!(errs.error_count(), 1);
        assert!(errs.diagnostics()[0].message.contains("inconsistent dedent"));
        // Markers still balance after recovery.
        assert_eq!(
            count(&tokens, TokenKind::BlockBegin),
            count(&tokens, TokenKind::BlockEnd)
        );
    }

    #[test]
    fn comments_do_not_close_blocks() {
        let source = "if a\n    x\n// note at column zero\n    y\n";
        let tokens = scan_ok(source);
        assert_eq!(count(&tokens, TokenKind::BlockBegin), 1);
        assert_eq!(count(&tokens, TokenKind::BlockEnd), 1);
        // Both x and y are inside the same block.
        let begin = tokens.iter().position(|t| t.kind == TokenKind::BlockBegin).unwrap();
        let end = tokens.iter().position(|t| t.kind == TokenKind::BlockEnd).unwrap();
        let x = tokens.iter().position(|t| t.text == "x").unwrap();
        let y = tokens.iter().position(|t| t.text == "y").unwrap();
        assert!(begin < x && x < y && y < end);
    }

    #[test]
    fn blank_line_boundary_is_configurable() {
        let config = ScanConfig {
            blank_line_is_boundary: true,
            ..ScanConfig::default()
        };
        let mut errs = ErrorManager::new(false);
        let with = scan(0, "a\n\nb\n", &config, &mut errs).expect("scan");
        let without = scan_ok("a\n\nb\n");
        assert_eq!(count(&with, TokenKind::Newline), count(&without, TokenKind::Newline) + 1);
    }

    #[test]
    fn keywords_and_bools_are_recognized() {
        let tokens = scan_ok("class interface fn let static if elif else while return break continue true false name");
        let expect = vec![
            TokenKind::Class,
            TokenKind::Interface,
            TokenKind::Fn,
            TokenKind::Let,
            TokenKind::Static,
            TokenKind::If,
            TokenKind::Elif,
            TokenKind::Else,
            TokenKind::While,
            TokenKind::Return,
            TokenKind::Break,
            TokenKind::Continue,
            TokenKind::BoolLiteral,
            TokenKind::BoolLiteral,
            TokenKind::Ident,
            TokenKind::Newline,
            TokenKind::Eof,
        ];
        assert_eq!(kinds(&tokens), expect);
    }

    #[test]
    fn raw_strings_span_lines() {
        let tokens = scan_ok("let s = \"\"\"one\ntwo\"\"\"\n");
        let raw = tokens
            .iter()
            .find(|t| t.kind == TokenKind::RawStringLiteral)
            .expect("raw string token");
        assert!(raw.text.contains('\n'));
        // Round trip still holds with a multi-line token in play.
        let again = scan_ok(&reconstruct(&tokens));
        assert_eq!(tokens, again);
    }

    #[test]
    fn regex_literals_are_single_tokens() {
        let tokens = scan_ok("let r = #\"a+b*\"#\n");
        let regex = tokens
            .iter()
            .find(|t| t.kind == TokenKind::RegexLiteral)
            .expect("regex token");
        assert_eq!(regex.text, "#\"a+b*\"#");
    }
}
