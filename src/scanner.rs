//! Hand-written scanner. It owns nothing beyond the source slice and a
//! cursor; `scan_token` is called on demand by the compiler, one token at a
//! time, exactly the contract the core spec treats as external.

use crate::token::{keyword_kind, Token, TokenKind};

pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source,
            bytes: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.bytes[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.current + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.current];
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn lexeme(&self) -> &'src str {
        &self.source[self.start..self.current]
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token::new(kind, self.lexeme(), self.line)
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token::new(TokenKind::Error, message, self.line)
    }

    /// Skips whitespace and comments. Returns the unclosed-comment error
    /// token in place, rather than letting the caller fall through to EOF,
    /// when a block comment never finds its closing `*/`.
    fn skip_whitespace(&mut self) -> Result<(), Token<'src>> {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.at_end() {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'*' => {
                    self.advance();
                    self.advance();
                    loop {
                        if self.at_end() {
                            return Err(self.error("Unclosed multi-line comment."));
                        }
                        if self.peek() == b'*' && self.peek_next() == b'/' {
                            self.advance();
                            self.advance();
                            break;
                        }
                        if self.peek() == b'\n' {
                            self.line += 1;
                        }
                        self.advance();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.at_end() {
            return self.error("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }
        let kind = keyword_kind(self.lexeme()).unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        if let Err(error) = self.skip_whitespace() {
            return error;
        }
        self.start = self.current;

        if self.at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b'-' => self.make(TokenKind::Minus),
            b'+' => self.make(TokenKind::Plus),
            b';' => self.make(TokenKind::Semicolon),
            b'*' => self.make(TokenKind::Star),
            b'/' => self.make(TokenKind::Slash),
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make(kind)
            }
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = vec![];
        loop {
            let t = s.scan_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) { } , . - + ; * / ! != = == < <= > >="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let mut s = Scanner::new("// comment\n1 /* block\ncomment */ + 2");
        assert_eq!(s.scan_token().kind, TokenKind::Number);
        assert_eq!(s.scan_token().kind, TokenKind::Plus);
        assert_eq!(s.scan_token().kind, TokenKind::Number);
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let mut s = Scanner::new("\"abc");
        let t = s.scan_token();
        assert_eq!(t.kind, TokenKind::Error);
    }

    #[test]
    fn unclosed_block_comment_is_error_token_not_eof() {
        let mut s = Scanner::new("/* never closed");
        let t = s.scan_token();
        assert_eq!(t.kind, TokenKind::Error);
        assert_eq!(t.lexeme, "Unclosed multi-line comment.");
    }

    #[test]
    fn keywords_vs_identifiers() {
        assert_eq!(kinds("class orchid").first(), Some(&TokenKind::Class));
        assert_eq!(kinds("class orchid")[1], TokenKind::Identifier);
    }

    #[test]
    fn numbers_with_fraction() {
        let mut s = Scanner::new("3.14");
        let t = s.scan_token();
        assert_eq!(t.kind, TokenKind::Number);
        assert_eq!(t.lexeme, "3.14");
    }

    #[test]
    fn line_tracking_across_newlines() {
        let mut s = Scanner::new("1\n2\n3");
        assert_eq!(s.scan_token().line, 1);
        assert_eq!(s.scan_token().line, 2);
        assert_eq!(s.scan_token().line, 3);
    }
}
