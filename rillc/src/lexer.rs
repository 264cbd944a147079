use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, line: usize) -> Self {
        Self { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,

    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    Let,
    Struct,
    Fn,
    True,
    False,
    For,
    In,
    While,
    If,
    Else,
    Null,
    Return,
    SelfKw,
    Disp,
    Spawn,
    Select,
    Default,
    Close,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semicolon,
    Question,
    Colon,
    Arrow,     // ->
    FatArrow,  // =>
    LeftArrow, // <-

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    Greater,
    Less,

    Tilde,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,

    Assign,
    EqualEqual,
    BangEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    GreaterEqual,
    LessEqual,

    PlusPlus,
    MinusMinus,
}

#[derive(Debug, Clone)]
pub struct LexerError {
    pub message: String,
    pub line: usize,
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}", self.message, self.line)
    }
}

impl std::error::Error for LexerError {}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexerError> {
    Lexer::new(source).tokenize()
}

struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: usize,
    output: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            output: Vec::new(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, LexerError> {
        while let Some(c) = self.peek_char(0) {
            if c == '\n' {
                self.line += 1;
                self.index += 1;
                continue;
            }
            if c.is_whitespace() {
                self.index += 1;
                continue;
            }
            if c == '/' && self.peek_char(1) == Some('/') {
                self.skip_line_comment();
                continue;
            }
            if c == '/' && self.peek_char(1) == Some('*') {
                self.skip_block_comment()?;
                continue;
            }
            if c == '"' {
                let token = self.lex_string()?;
                self.output.push(token);
                continue;
            }
            if c.is_ascii_digit() {
                let token = self.lex_number()?;
                self.output.push(token);
                continue;
            }
            if is_ident_start(c) {
                let token = self.lex_ident_or_keyword();
                self.output.push(token);
                continue;
            }
            let token = self.lex_punct()?;
            self.output.push(token);
        }

        self.output.push(Token::new(TokenKind::Eof, self.line));
        Ok(self.output)
    }

    fn lex_string(&mut self) -> Result<Token, LexerError> {
        let start_line = self.line;
        self.index += 1;
        let mut value = String::new();
        while let Some(c) = self.peek_char(0) {
            match c {
                '"' => {
                    self.index += 1;
                    return Ok(Token::new(TokenKind::Str(value), start_line));
                }
                '\n' => {
                    return Err(self.error("Unterminated string literal", start_line));
                }
                '\\' => {
                    let escaped = match self.peek_char(1) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        Some(other) => other,
                        None => {
                            return Err(self.error("Unterminated string escape", start_line));
                        }
                    };
                    value.push(escaped);
                    self.index += 2;
                }
                _ => {
                    value.push(c);
                    self.index += 1;
                }
            }
        }
        Err(self.error("Unterminated string literal", start_line))
    }

    fn lex_number(&mut self) -> Result<Token, LexerError> {
        let start_line = self.line;
        let mut raw = String::new();
        let mut has_dot = false;

        while let Some(c) = self.peek_char(0) {
            if c.is_ascii_digit() {
                raw.push(c);
                self.index += 1;
                continue;
            }
            if c == '.'
                && !has_dot
                && self
                    .peek_char(1)
                    .map(|d| d.is_ascii_digit())
                    .unwrap_or(false)
            {
                has_dot = true;
                raw.push(c);
                self.index += 1;
                continue;
            }
            break;
        }

        if has_dot {
            let value = raw
                .parse::<f64>()
                .map_err(|_| self.error("Invalid float literal", start_line))?;
            Ok(Token::new(TokenKind::Float(value), start_line))
        } else {
            let value = raw
                .parse::<i64>()
                .map_err(|_| self.error("Invalid integer literal", start_line))?;
            Ok(Token::new(TokenKind::Int(value), start_line))
        }
    }

    fn lex_ident_or_keyword(&mut self) -> Token {
        let start_line = self.line;
        let mut ident = String::new();
        while let Some(c) = self.peek_char(0) {
            if is_ident_continue(c) {
                ident.push(c);
                self.index += 1;
            } else {
                break;
            }
        }

        let kind = match ident.as_str() {
            "let" => TokenKind::Let,
            "struct" => TokenKind::Struct,
            "fn" => TokenKind::Fn,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "while" => TokenKind::While,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "null" => TokenKind::Null,
            "return" => TokenKind::Return,
            "self" => TokenKind::SelfKw,
            "disp" => TokenKind::Disp,
            "spawn" => TokenKind::Spawn,
            "select" => TokenKind::Select,
            "default" => TokenKind::Default,
            "close" => TokenKind::Close,
            _ => TokenKind::Ident(ident),
        };

        Token::new(kind, start_line)
    }

    fn lex_punct(&mut self) -> Result<Token, LexerError> {
        let start_line = self.line;
        let c = self.peek_char(0).unwrap();
        let next = self.peek_char(1);
        let kind = match (c, next) {
            ('-', Some('>')) => {
                self.index += 2;
                TokenKind::Arrow
            }
            ('-', Some('-')) => {
                self.index += 2;
                TokenKind::MinusMinus
            }
            ('-', Some('=')) => {
                self.index += 2;
                TokenKind::MinusEqual
            }
            ('+', Some('+')) => {
                self.index += 2;
                TokenKind::PlusPlus
            }
            ('+', Some('=')) => {
                self.index += 2;
                TokenKind::PlusEqual
            }
            ('*', Some('=')) => {
                self.index += 2;
                TokenKind::StarEqual
            }
            ('/', Some('=')) => {
                self.index += 2;
                TokenKind::SlashEqual
            }
            ('%', Some('=')) => {
                self.index += 2;
                TokenKind::PercentEqual
            }
            ('=', Some('=')) => {
                self.index += 2;
                TokenKind::EqualEqual
            }
            ('=', Some('>')) => {
                self.index += 2;
                TokenKind::FatArrow
            }
            ('!', Some('=')) => {
                self.index += 2;
                TokenKind::BangEqual
            }
            ('<', Some('-')) => {
                self.index += 2;
                TokenKind::LeftArrow
            }
            ('<', Some('=')) => {
                self.index += 2;
                TokenKind::LessEqual
            }
            ('<', Some('<')) => {
                self.index += 2;
                TokenKind::Shl
            }
            ('>', Some('=')) => {
                self.index += 2;
                TokenKind::GreaterEqual
            }
            ('>', Some('>')) => {
                self.index += 2;
                TokenKind::Shr
            }
            ('&', Some('&')) => {
                self.index += 2;
                TokenKind::AndAnd
            }
            ('|', Some('|')) => {
                self.index += 2;
                TokenKind::OrOr
            }
            _ => {
                self.index += 1;
                match c {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    ',' => TokenKind::Comma,
                    '.' => TokenKind::Dot,
                    ';' => TokenKind::Semicolon,
                    '?' => TokenKind::Question,
                    ':' => TokenKind::Colon,
                    '=' => TokenKind::Assign,
                    '+' => TokenKind::Plus,
                    '-' => TokenKind::Minus,
                    '*' => TokenKind::Star,
                    '/' => TokenKind::Slash,
                    '%' => TokenKind::Percent,
                    '!' => TokenKind::Bang,
                    '<' => TokenKind::Less,
                    '>' => TokenKind::Greater,
                    '~' => TokenKind::Tilde,
                    '&' => TokenKind::Amp,
                    '|' => TokenKind::Pipe,
                    '^' => TokenKind::Caret,
                    _ => {
                        return Err(self.error(
                            &format!("Unexpected character '{}'", c),
                            start_line,
                        ));
                    }
                }
            }
        };
        Ok(Token::new(kind, start_line))
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek_char(0) {
            if c == '\n' {
                break;
            }
            self.index += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), LexerError> {
        let start_line = self.line;
        self.index += 2;
        while let Some(c) = self.peek_char(0) {
            if c == '*' && self.peek_char(1) == Some('/') {
                self.index += 2;
                return Ok(());
            }
            if c == '\n' {
                self.line += 1;
            }
            self.index += 1;
        }
        Err(self.error("Unterminated block comment", start_line))
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn error(&self, message: &str, line: usize) -> LexerError {
        LexerError {
            message: message.to_string(),
            line,
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
