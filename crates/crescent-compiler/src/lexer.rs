//! Pull-based lexer for Lua 5.1 source.

use crate::token::{Span, SpannedToken, Token};
use crescent_core::string::StringPool;
use std::fmt;

/// Lexer error.
#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    current: Option<Result<SpannedToken, LexError>>,
    pub strings: &'a mut StringPool,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer interning names and string literals into the
    /// given pool (the state's own pool, so constants intern once).
    pub fn new(source: &'a [u8], strings: &'a mut StringPool) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            column: 1,
            current: None,
            strings,
        };
        // Prime the first token
        lexer.current = Some(lexer.scan_token());
        lexer
    }

    /// Peek at the current token without consuming.
    pub fn current(&self) -> Result<&SpannedToken, &LexError> {
        match &self.current {
            Some(Ok(tok)) => Ok(tok),
            Some(Err(e)) => Err(e),
            None => unreachable!("lexer should always have a current token"),
        }
    }

    /// Consume the current token and advance to the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        let prev = self.current.take().unwrap();
        self.current = Some(self.scan_token());
        prev
    }

    /// Get current line number.
    pub fn line(&self) -> u32 {
        self.line
    }

    // ---- Internal scanning ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance_char(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            if self.peek() == Some(b'\r') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else if ch == b'\r' {
            if self.peek() == Some(b'\n') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, msg: impl Into<String>) -> LexError {
        LexError {
            message: msg.into(),
            line: self.line,
            column: self.column,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                    self.advance_char();
                } else {
                    break;
                }
            }

            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.advance_char();
                self.advance_char();
                if self.peek() == Some(b'[') {
                    if let Some(level) = self.check_long_bracket() {
                        // Long comment
                        self.open_long_bracket(level);
                        self.scan_long_content(level)?;
                        continue;
                    }
                }
                // Short comment: skip to end of line
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.advance_char();
                }
                continue;
            }

            return Ok(());
        }
    }

    /// Check if the current position starts a long bracket `[=*[`.
    /// Returns the level if so.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            level += 1;
            offset += 1;
        }
        if self.peek_at(offset) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    /// Consume the opening `[=*[` of a long bracket.
    fn open_long_bracket(&mut self, level: usize) {
        for _ in 0..level + 2 {
            self.advance_char();
        }
        // A newline right after the opening bracket is skipped
        if self.peek() == Some(b'\n') || self.peek() == Some(b'\r') {
            self.advance_char();
        }
    }

    /// Consume long-bracket content through the matching `]=*]`,
    /// returning the bytes between.
    fn scan_long_content(&mut self, level: usize) -> Result<Vec<u8>, LexError> {
        let mut content = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished long string/comment")),
                Some(b']') => {
                    let mut offset = 1;
                    let mut eq = 0;
                    while self.peek_at(offset) == Some(b'=') {
                        eq += 1;
                        offset += 1;
                    }
                    if eq == level && self.peek_at(offset) == Some(b']') {
                        for _ in 0..level + 2 {
                            self.advance_char();
                        }
                        return Ok(content);
                    }
                    content.push(b']');
                    self.advance_char();
                }
                Some(ch) => {
                    content.push(ch);
                    self.advance_char();
                }
            }
        }
    }

    fn scan_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_whitespace_and_comments()?;

        let span = Span {
            line: self.line,
            column: self.column,
        };
        let tok = |token| SpannedToken { token, span };

        let ch = match self.peek() {
            Some(ch) => ch,
            None => return Ok(tok(Token::Eof)),
        };

        match ch {
            b'+' => {
                self.advance_char();
                Ok(tok(Token::Plus))
            }
            b'-' => {
                self.advance_char();
                Ok(tok(Token::Minus))
            }
            b'*' => {
                self.advance_char();
                Ok(tok(Token::Star))
            }
            b'/' => {
                self.advance_char();
                Ok(tok(Token::Slash))
            }
            b'%' => {
                self.advance_char();
                Ok(tok(Token::Percent))
            }
            b'^' => {
                self.advance_char();
                Ok(tok(Token::Caret))
            }
            b'#' => {
                self.advance_char();
                Ok(tok(Token::Hash))
            }
            b'(' => {
                self.advance_char();
                Ok(tok(Token::LParen))
            }
            b')' => {
                self.advance_char();
                Ok(tok(Token::RParen))
            }
            b'{' => {
                self.advance_char();
                Ok(tok(Token::LBrace))
            }
            b'}' => {
                self.advance_char();
                Ok(tok(Token::RBrace))
            }
            b']' => {
                self.advance_char();
                Ok(tok(Token::RBracket))
            }
            b';' => {
                self.advance_char();
                Ok(tok(Token::Semi))
            }
            b':' => {
                self.advance_char();
                Ok(tok(Token::Colon))
            }
            b',' => {
                self.advance_char();
                Ok(tok(Token::Comma))
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    self.open_long_bracket(level);
                    let content = self.scan_long_content(level)?;
                    let id = self.strings.intern(&content);
                    Ok(tok(Token::String(id)))
                } else {
                    self.advance_char();
                    Ok(tok(Token::LBracket))
                }
            }
            b'=' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::Equal))
                } else {
                    Ok(tok(Token::Assign))
                }
            }
            b'~' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::NotEqual))
                } else {
                    Err(self.error("unexpected symbol near '~'"))
                }
            }
            b'<' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::LessEq))
                } else {
                    Ok(tok(Token::Less))
                }
            }
            b'>' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    Ok(tok(Token::GreaterEq))
                } else {
                    Ok(tok(Token::Greater))
                }
            }
            b'.' => {
                if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                    return self.scan_number().map(|t| tok(t));
                }
                self.advance_char();
                if self.peek() == Some(b'.') {
                    self.advance_char();
                    if self.peek() == Some(b'.') {
                        self.advance_char();
                        Ok(tok(Token::DotDotDot))
                    } else {
                        Ok(tok(Token::DotDot))
                    }
                } else {
                    Ok(tok(Token::Dot))
                }
            }
            b'"' | b'\'' => self.scan_short_string(ch).map(|t| tok(t)),
            b'0'..=b'9' => self.scan_number().map(|t| tok(t)),
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
                {
                    self.advance_char();
                }
                let bytes = &self.source[start..self.pos];
                let text = std::str::from_utf8(bytes).unwrap_or("");
                if let Some(kw) = Token::keyword_from_str(text) {
                    Ok(tok(kw))
                } else {
                    let id = self.strings.intern(bytes);
                    Ok(tok(Token::Name(id)))
                }
            }
            _ => Err(self.error(format!("unexpected symbol near '{}'", ch as char))),
        }
    }

    fn scan_short_string(&mut self, quote: u8) -> Result<Token, LexError> {
        self.advance_char(); // opening quote
        let mut bytes = Vec::new();
        loop {
            let ch = match self.peek() {
                Some(ch) => ch,
                None => return Err(self.error("unfinished string")),
            };
            match ch {
                b'\n' | b'\r' => return Err(self.error("unfinished string")),
                c if c == quote => {
                    self.advance_char();
                    let id = self.strings.intern(&bytes);
                    return Ok(Token::String(id));
                }
                b'\\' => {
                    self.advance_char();
                    let esc = match self.peek() {
                        Some(e) => e,
                        None => return Err(self.error("unfinished string")),
                    };
                    match esc {
                        b'n' => {
                            bytes.push(b'\n');
                            self.advance_char();
                        }
                        b't' => {
                            bytes.push(b'\t');
                            self.advance_char();
                        }
                        b'r' => {
                            bytes.push(b'\r');
                            self.advance_char();
                        }
                        b'a' => {
                            bytes.push(0x07);
                            self.advance_char();
                        }
                        b'b' => {
                            bytes.push(0x08);
                            self.advance_char();
                        }
                        b'f' => {
                            bytes.push(0x0C);
                            self.advance_char();
                        }
                        b'v' => {
                            bytes.push(0x0B);
                            self.advance_char();
                        }
                        b'\\' => {
                            bytes.push(b'\\');
                            self.advance_char();
                        }
                        b'"' => {
                            bytes.push(b'"');
                            self.advance_char();
                        }
                        b'\'' => {
                            bytes.push(b'\'');
                            self.advance_char();
                        }
                        b'\n' | b'\r' => {
                            bytes.push(b'\n');
                            self.advance_char();
                        }
                        b'0'..=b'9' => {
                            // Up to three decimal digits
                            let mut val: u32 = 0;
                            let mut count = 0;
                            while count < 3 && self.peek().is_some_and(|c| c.is_ascii_digit()) {
                                val = val * 10 + (self.peek().unwrap() - b'0') as u32;
                                self.advance_char();
                                count += 1;
                            }
                            if val > 255 {
                                return Err(self.error("decimal escape too large"));
                            }
                            bytes.push(val as u8);
                        }
                        _ => {
                            return Err(self.error(format!(
                                "invalid escape sequence '\\{}'",
                                esc as char
                            )));
                        }
                    }
                }
                _ => {
                    bytes.push(ch);
                    self.advance_char();
                }
            }
        }
    }

    fn scan_number(&mut self) -> Result<Token, LexError> {
        let start = self.pos;

        // Hex literal
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.advance_char();
            self.advance_char();
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance_char();
            }
            if self.pos == digits_start {
                return Err(self.error("malformed number"));
            }
            let text = std::str::from_utf8(&self.source[digits_start..self.pos]).unwrap_or("");
            let mut val: f64 = 0.0;
            for c in text.chars() {
                val = val * 16.0 + c.to_digit(16).unwrap() as f64;
            }
            return Ok(Token::Number(val));
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance_char();
        }
        // A '.' starting a '..' operator is not part of the number.
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            self.advance_char();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.advance_char();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance_char();
            }
            let exp_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance_char();
            }
            if self.pos == exp_start {
                return Err(self.error("malformed number"));
            }
        }

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
        match text.parse::<f64>() {
            Ok(n) => Ok(Token::Number(n)),
            Err(_) => Err(self.error(format!("malformed number near '{text}'"))),
        }
    }
}
