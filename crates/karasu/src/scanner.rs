//! Character-level scanner producing the compiler's token stream.
//!
//! The scanner reports indentation as a leading `Indentation` token carrying
//! the character count of leading whitespace on each non-blank line, emits
//! `Eol` at logical line ends (suppressed inside brackets and after `\`
//! continuations), supports one-token pushback, and can save/restore its full
//! state so the compiler can rewind to an earlier position for its
//! reparse-based constructs (multi-assignment, ternary, comprehensions).

use strum::Display;

/// Token kinds. String tokens keep their prefix and quotes in the lexeme;
/// the compiler's literal handlers do the unescaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TokenKind {
    // Literals
    Identifier,
    Number,
    Str,
    FStr,
    BytesLit,

    // Layout
    Indentation,
    Eol,
    Eof,
    Error,

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Arrow,

    // Operators
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    At,
    Caret,
    Amp,
    Pipe,
    Tilde,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    BangEqual,
    LeftShift,
    RightShift,
    Equal,
    PlusEqual,
    MinusEqual,
    StarEqual,
    StarStarEqual,
    SlashEqual,
    SlashSlashEqual,
    PercentEqual,
    AtEqual,
    CaretEqual,
    AmpEqual,
    PipeEqual,
    LeftShiftEqual,
    RightShiftEqual,

    // Keywords
    And,
    As,
    Assert,
    Async,
    Await,
    Break,
    Class,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    False,
    Finally,
    For,
    From,
    If,
    Import,
    In,
    Is,
    Lambda,
    None,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    Super,
    True,
    Try,
    While,
    With,
    Yield,
}

/// One scanned token with its source position.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    /// The lexeme, sliced out of the source buffer.
    pub text: &'src str,
    /// 1-based source line.
    pub line: u32,
    /// 0-based column of the first character.
    pub column: u32,
    /// Visible width in characters.
    pub width: u32,
    /// Byte offset of the first character of the token's line.
    pub line_start: usize,
}

impl<'src> Token<'src> {
    /// Indentation width for `Indentation` tokens.
    #[must_use]
    pub fn indent_width(&self) -> usize {
        self.width as usize
    }
}

/// Saved scanner position for the compiler's rewind-and-reparse.
#[derive(Debug, Clone, Copy)]
pub struct ScannerState<'src> {
    current: usize,
    line: u32,
    line_start: usize,
    bracket_depth: u32,
    at_line_start: bool,
    eof_eol_emitted: bool,
    pushback: Option<Token<'src>>,
}

/// The scanner itself. Cloning is cheap and gives an independent cursor,
/// which the compiler uses for token-level lookahead.
#[derive(Debug, Clone)]
pub struct Scanner<'src> {
    source: &'src str,
    current: usize,
    line: u32,
    line_start: usize,
    bracket_depth: u32,
    at_line_start: bool,
    eof_eol_emitted: bool,
    pushback: Option<Token<'src>>,
    /// Explanation for the most recent `Error` token.
    error_message: &'static str,
}

impl<'src> Scanner<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            current: 0,
            line: 1,
            line_start: 0,
            bracket_depth: 0,
            at_line_start: true,
            eof_eol_emitted: false,
            pushback: None,
            error_message: "",
        }
    }

    #[must_use]
    pub fn source(&self) -> &'src str {
        self.source
    }

    #[must_use]
    pub fn error_message(&self) -> &'static str {
        self.error_message
    }

    /// Snapshot the full scanner state.
    #[must_use]
    pub fn save(&self) -> ScannerState<'src> {
        ScannerState {
            current: self.current,
            line: self.line,
            line_start: self.line_start,
            bracket_depth: self.bracket_depth,
            at_line_start: self.at_line_start,
            eof_eol_emitted: self.eof_eol_emitted,
            pushback: self.pushback,
        }
    }

    /// Rewind to a previously saved state.
    pub fn restore(&mut self, state: ScannerState<'src>) {
        self.current = state.current;
        self.line = state.line;
        self.line_start = state.line_start;
        self.bracket_depth = state.bracket_depth;
        self.at_line_start = state.at_line_start;
        self.eof_eol_emitted = state.eof_eol_emitted;
        self.pushback = state.pushback;
    }

    /// Pushes one token back; the next `scan_token` returns it.
    pub fn unget(&mut self, token: Token<'src>) {
        debug_assert!(self.pushback.is_none(), "double pushback");
        self.pushback = Some(token);
    }

    /// Produces the next token.
    pub fn scan_token(&mut self) -> Token<'src> {
        if let Some(token) = self.pushback.take() {
            return token;
        }

        if self.at_line_start && self.bracket_depth == 0 {
            if let Some(token) = self.scan_indentation() {
                return token;
            }
        }

        self.skip_inline_whitespace();

        let start = self.current;
        let Some(ch) = self.advance() else {
            if !self.eof_eol_emitted {
                self.eof_eol_emitted = true;
                return self.make_token(TokenKind::Eol, start);
            }
            return self.make_token(TokenKind::Eof, start);
        };

        match ch {
            '\n' => {
                let token = self.make_token_at(TokenKind::Eol, start, self.current - 1);
                self.new_line();
                if self.bracket_depth > 0 {
                    // Implicit line joining inside brackets.
                    self.scan_token()
                } else {
                    self.at_line_start = true;
                    token
                }
            }
            '#' => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
                self.scan_token()
            }
            '\\' => {
                if self.peek() == Some('\n') {
                    self.advance();
                    self.new_line();
                    self.scan_token()
                } else {
                    self.error_token(start, "unexpected character after line continuation")
                }
            }
            '(' => {
                self.bracket_depth += 1;
                self.make_token(TokenKind::LeftParen, start)
            }
            ')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(TokenKind::RightParen, start)
            }
            '[' => {
                self.bracket_depth += 1;
                self.make_token(TokenKind::LeftBracket, start)
            }
            ']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(TokenKind::RightBracket, start)
            }
            '{' => {
                self.bracket_depth += 1;
                self.make_token(TokenKind::LeftBrace, start)
            }
            '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(TokenKind::RightBrace, start)
            }
            ',' => self.make_token(TokenKind::Comma, start),
            '.' => self.make_token(TokenKind::Dot, start),
            ':' => self.make_token(TokenKind::Colon, start),
            ';' => self.make_token(TokenKind::Semicolon, start),
            '~' => self.make_token(TokenKind::Tilde, start),
            '+' => self.with_equal(start, TokenKind::Plus, TokenKind::PlusEqual),
            '-' => {
                if self.match_char('>') {
                    self.make_token(TokenKind::Arrow, start)
                } else {
                    self.with_equal(start, TokenKind::Minus, TokenKind::MinusEqual)
                }
            }
            '*' => {
                if self.match_char('*') {
                    self.with_equal(start, TokenKind::StarStar, TokenKind::StarStarEqual)
                } else {
                    self.with_equal(start, TokenKind::Star, TokenKind::StarEqual)
                }
            }
            '/' => {
                if self.match_char('/') {
                    self.with_equal(start, TokenKind::SlashSlash, TokenKind::SlashSlashEqual)
                } else {
                    self.with_equal(start, TokenKind::Slash, TokenKind::SlashEqual)
                }
            }
            '%' => self.with_equal(start, TokenKind::Percent, TokenKind::PercentEqual),
            '@' => self.with_equal(start, TokenKind::At, TokenKind::AtEqual),
            '^' => self.with_equal(start, TokenKind::Caret, TokenKind::CaretEqual),
            '&' => self.with_equal(start, TokenKind::Amp, TokenKind::AmpEqual),
            '|' => self.with_equal(start, TokenKind::Pipe, TokenKind::PipeEqual),
            '=' => self.with_equal(start, TokenKind::Equal, TokenKind::EqualEqual),
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual, start)
                } else {
                    self.error_token(start, "unexpected character '!'")
                }
            }
            '<' => {
                if self.match_char('<') {
                    self.with_equal(start, TokenKind::LeftShift, TokenKind::LeftShiftEqual)
                } else {
                    self.with_equal(start, TokenKind::Less, TokenKind::LessEqual)
                }
            }
            '>' => {
                if self.match_char('>') {
                    self.with_equal(start, TokenKind::RightShift, TokenKind::RightShiftEqual)
                } else {
                    self.with_equal(start, TokenKind::Greater, TokenKind::GreaterEqual)
                }
            }
            '\'' | '"' => self.scan_string(start, ch, StrPrefix::Plain),
            c if c.is_ascii_digit() => self.scan_number(start),
            c if is_identifier_start(c) => self.scan_identifier_or_prefixed_string(start),
            _ => self.error_token(start, "unexpected character"),
        }
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// Measures leading whitespace; returns an `Indentation` token for the
    /// first non-blank line found, silently consuming blank lines.
    fn scan_indentation(&mut self) -> Option<Token<'src>> {
        loop {
            let start = self.current;
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                if c == ' ' || c == '\t' {
                    self.advance();
                    width += 1;
                } else {
                    break;
                }
            }
            match self.peek() {
                Some('\n') => {
                    // Blank line: no tokens.
                    self.advance();
                    self.new_line();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Option::None => {
                    self.at_line_start = false;
                    return Option::None;
                }
                Some(_) => {
                    self.at_line_start = false;
                    let text = &self.source[start..self.current];
                    return Some(Token {
                        kind: TokenKind::Indentation,
                        text,
                        line: self.line,
                        column: 0,
                        width: width as u32,
                        line_start: self.line_start,
                    });
                }
            }
        }
    }

    fn skip_inline_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == ' ' || c == '\t' || c == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    fn scan_identifier_or_prefixed_string(&mut self, start: usize) -> Token<'src> {
        // b"..." / f"..." prefixed strings.
        let first = self.source[start..].chars().next().unwrap_or('\0');
        if matches!(first, 'b' | 'B' | 'f' | 'F') {
            if let Some(quote @ ('\'' | '"')) = self.peek() {
                self.advance();
                let prefix = if matches!(first, 'b' | 'B') {
                    StrPrefix::Bytes
                } else {
                    StrPrefix::Format
                };
                return self.scan_string(start, quote, prefix);
            }
        }

        while let Some(c) = self.peek() {
            if is_identifier_continue(c) {
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.source[start..self.current];
        self.make_token_at(keyword_kind(text), start, self.current)
    }

    fn scan_string(&mut self, start: usize, quote: char, prefix: StrPrefix) -> Token<'src> {
        // Triple quote?
        let triple = self.peek() == Some(quote) && self.peek_next() == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }
        loop {
            let Some(c) = self.advance() else {
                return self.error_token(start, "unterminated string literal");
            };
            match c {
                '\\' => {
                    // Keep escapes raw; the compiler decodes them.
                    if self.advance().is_none() {
                        return self.error_token(start, "unterminated string literal");
                    }
                }
                '\n' => {
                    if triple {
                        self.new_line();
                    } else {
                        return self.error_token(start, "unterminated string literal");
                    }
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_next() == Some(quote) {
                        self.advance();
                        self.advance();
                        break;
                    }
                }
                _ => {}
            }
        }
        let kind = match prefix {
            StrPrefix::Plain => TokenKind::Str,
            StrPrefix::Format => TokenKind::FStr,
            StrPrefix::Bytes => TokenKind::BytesLit,
        };
        self.make_token_at(kind, start, self.current)
    }

    fn scan_number(&mut self, start: usize) -> Token<'src> {
        let radix_prefix = self.source[start..].chars().next() == Some('0')
            && matches!(self.peek(), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        if radix_prefix {
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
            return self.make_token_at(TokenKind::Number, start, self.current);
        }

        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
            self.advance();
        }
        // Fraction; careful not to eat the dot of `1 .attr` style chains:
        // only consume when a digit follows.
        if self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let mark = self.current;
            self.advance();
            if matches!(self.peek(), Some('+' | '-')) {
                self.advance();
            }
            if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
            } else {
                self.current = mark;
            }
        }
        self.make_token_at(TokenKind::Number, start, self.current)
    }

    // ------------------------------------------------------------------
    // Low-level helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.current += c.len_utf8();
        Some(c)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn new_line(&mut self) {
        self.line += 1;
        self.line_start = self.current;
    }

    fn with_equal(&mut self, start: usize, plain: TokenKind, augmented: TokenKind) -> Token<'src> {
        if self.match_char('=') {
            self.make_token(augmented, start)
        } else {
            self.make_token(plain, start)
        }
    }

    fn make_token(&mut self, kind: TokenKind, start: usize) -> Token<'src> {
        self.make_token_at(kind, start, self.current)
    }

    fn make_token_at(&mut self, kind: TokenKind, start: usize, end: usize) -> Token<'src> {
        let text = &self.source[start..end];
        Token {
            kind,
            text,
            line: self.line,
            column: (start - self.line_start.min(start)) as u32,
            width: text.chars().count() as u32,
            line_start: self.line_start,
        }
    }

    fn error_token(&mut self, start: usize, message: &'static str) -> Token<'src> {
        self.error_message = message;
        self.make_token(TokenKind::Error, start)
    }
}

/// String prefix variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrPrefix {
    Plain,
    Format,
    Bytes,
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_identifier_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn keyword_kind(text: &str) -> TokenKind {
    match text {
        "and" => TokenKind::And,
        "as" => TokenKind::As,
        "assert" => TokenKind::Assert,
        "async" => TokenKind::Async,
        "await" => TokenKind::Await,
        "break" => TokenKind::Break,
        "class" => TokenKind::Class,
        "continue" => TokenKind::Continue,
        "def" => TokenKind::Def,
        "del" => TokenKind::Del,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "except" => TokenKind::Except,
        "False" => TokenKind::False,
        "finally" => TokenKind::Finally,
        "for" => TokenKind::For,
        "from" => TokenKind::From,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "in" => TokenKind::In,
        "is" => TokenKind::Is,
        "lambda" => TokenKind::Lambda,
        "None" => TokenKind::None,
        "not" => TokenKind::Not,
        "or" => TokenKind::Or,
        "pass" => TokenKind::Pass,
        "raise" => TokenKind::Raise,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "True" => TokenKind::True,
        "try" => TokenKind::Try,
        "while" => TokenKind::While,
        "with" => TokenKind::With,
        "yield" => TokenKind::Yield,
        _ => TokenKind::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::Eof {
                break;
            }
        }
        out
    }

    #[test]
    fn simple_expression() {
        assert_eq!(
            kinds("x = 1 + 2"),
            vec![
                TokenKind::Indentation,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn indentation_width_reported() {
        let mut scanner = Scanner::new("if x:\n    pass\n");
        let first = scanner.scan_token();
        assert_eq!(first.kind, TokenKind::Indentation);
        assert_eq!(first.indent_width(), 0);
        // Skip to second line's indentation.
        loop {
            let token = scanner.scan_token();
            if token.kind == TokenKind::Eol {
                break;
            }
        }
        let indent = scanner.scan_token();
        assert_eq!(indent.kind, TokenKind::Indentation);
        assert_eq!(indent.indent_width(), 4);
    }

    #[test]
    fn blank_and_comment_lines_produce_nothing() {
        assert_eq!(
            kinds("x\n\n# comment only\n\ny"),
            vec![
                TokenKind::Indentation,
                TokenKind::Identifier,
                TokenKind::Eol,
                TokenKind::Indentation,
                TokenKind::Identifier,
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn brackets_join_lines() {
        let tokens = kinds("f(1,\n  2)");
        assert!(!tokens[..tokens.len() - 2].contains(&TokenKind::Eol));
    }

    #[test]
    fn line_continuation_filtered() {
        assert_eq!(
            kinds("x = 1 + \\\n    2"),
            vec![
                TokenKind::Indentation,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_prefixes() {
        let mut scanner = Scanner::new("b'ab' f'x{y}' 'plain'");
        scanner.scan_token(); // indentation
        assert_eq!(scanner.scan_token().kind, TokenKind::BytesLit);
        assert_eq!(scanner.scan_token().kind, TokenKind::FStr);
        assert_eq!(scanner.scan_token().kind, TokenKind::Str);
    }

    #[test]
    fn triple_quoted_spans_lines() {
        let mut scanner = Scanner::new("'''a\nb'''");
        scanner.scan_token(); // indentation
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Str);
        assert!(token.text.contains('\n'));
    }

    #[test]
    fn pushback_and_save_restore() {
        let mut scanner = Scanner::new("a b c");
        scanner.scan_token(); // indentation
        let a = scanner.scan_token();
        let saved = scanner.save();
        let b = scanner.scan_token();
        assert_eq!(b.text, "b");
        scanner.unget(b);
        assert_eq!(scanner.scan_token().text, "b");
        scanner.restore(saved);
        assert_eq!(scanner.scan_token().text, "b");
        assert_eq!(a.text, "a");
    }

    #[test]
    fn number_forms() {
        let mut scanner = Scanner::new("0x1f 0o17 0b101 3.5 1e10 42");
        scanner.scan_token(); // indentation
        for expected in ["0x1f", "0o17", "0b101", "3.5", "1e10", "42"] {
            let token = scanner.scan_token();
            assert_eq!(token.kind, TokenKind::Number, "for {expected}");
            assert_eq!(token.text, expected);
        }
    }

    #[test]
    fn operators_scan_greedily() {
        let mut scanner = Scanner::new("** // <<= >>= != <= //=");
        scanner.scan_token(); // indentation
        let expected = [
            TokenKind::StarStar,
            TokenKind::SlashSlash,
            TokenKind::LeftShiftEqual,
            TokenKind::RightShiftEqual,
            TokenKind::BangEqual,
            TokenKind::LessEqual,
            TokenKind::SlashSlashEqual,
        ];
        for kind in expected {
            assert_eq!(scanner.scan_token().kind, kind);
        }
    }
}
