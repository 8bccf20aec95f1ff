use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Bare identifier or keyword.
    Ident(String),
    /// Double-quoted identifier, unescaped.
    QuotedIdent(String),
    /// Single-quoted string; `raw` keeps the quotes as written.
    Str { raw: String, value: String },
    /// `/pattern/` regex literal; `raw` keeps the slashes.
    Regex { raw: String, pattern: String },
    Number(String),
    /// Integer with unit suffix(es), e.g. `5m` or `1h30m`.
    Duration(String),
    Op(String),
    LParen,
    RParen,
    Comma,
    Star,
    Plus,
    Minus,
    /// Any other punctuation (arithmetic in field expressions, `;`, ...).
    Other(char),
}

impl Token {
    pub(crate) fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Ident(s) | Token::Number(s) | Token::Duration(s) | Token::Op(s) => s.clone(),
            Token::QuotedIdent(s) => format!("\"{s}\""),
            Token::Str { raw, .. } | Token::Regex { raw, .. } => raw.clone(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Star => "*".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Other(c) => c.to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn is_unit_char(c: char) -> bool {
    c.is_ascii_alphabetic() || c == 'µ'
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '\'' => {
                let (value, end) = read_quoted(&chars, i, '\'').ok_or(ParseError::Unterminated("string"))?;
                let raw: String = chars[i..end].iter().collect();
                tokens.push(Token::Str { raw, value });
                i = end;
            }
            '"' => {
                let (value, end) =
                    read_quoted(&chars, i, '"').ok_or(ParseError::Unterminated("identifier"))?;
                tokens.push(Token::QuotedIdent(value));
                i = end;
            }
            // A slash opens a regex literal only where a comparison operand is expected.
            '/' if matches!(tokens.last(), Some(Token::Op(_))) => {
                let (pattern, end) = read_quoted(&chars, i, '/').ok_or(ParseError::Unterminated("regex"))?;
                let raw: String = chars[i..end].iter().collect();
                tokens.push(Token::Regex { raw, pattern });
                i = end;
            }
            '=' | '!' | '<' | '>' | '~' => {
                let start = i;
                while i < chars.len() && matches!(chars[i], '=' | '!' | '<' | '>' | '~') {
                    i += 1;
                }
                tokens.push(Token::Op(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() => {
                let (token, end) = read_number(&chars, i);
                tokens.push(token);
                i = end;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                tokens.push(Token::Other(other));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Read a literal delimited by `quote` starting at `start`. Backslash escapes
/// the next character. Returns the unescaped body and the index past the
/// closing delimiter.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                // Regex bodies keep their escapes except for the delimiter itself.
                if quote == '/' && next != '/' {
                    value.push('\\');
                }
                value.push(next);
                i += 2;
            }
            c if c == quote => return Some((value, i + 1)),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    None
}

fn read_number(chars: &[char], start: usize) -> (Token, usize) {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }

    if i < chars.len() && is_unit_char(chars[i]) && !matches!(chars[i], 'e' | 'E') {
        // Duration: alternating digit runs and unit runs.
        while i < chars.len() && (chars[i].is_ascii_digit() || is_unit_char(chars[i])) {
            i += 1;
        }
        return (Token::Duration(chars[start..i].iter().collect()), i);
    }

    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && matches!(chars[i], 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j], '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    (Token::Number(chars[start..i].iter().collect()), i)
}
