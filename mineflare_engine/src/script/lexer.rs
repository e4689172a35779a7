//! Tokenizer for program sources
//!
//! Produces a flat token stream for the reader. Commas are whitespace and
//! `;` starts a line comment. Atoms are read greedily and classified
//! afterwards: numbers, `true`/`false`/`nil`, `:keywords`, and symbols
//! (which may contain dots, so `actions.navigate.goto` is one symbol).

use mineflare_core::error::ProgramError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Str(String),
    Num(f64),
    Bool(bool),
    Nil,
    Keyword(String),
    Sym(String),
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ProgramError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() || c == ',' => {
                chars.next();
            }
            ';' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(read_string(&mut chars, &mut line)?));
            }
            _ => {
                let atom = read_atom(&mut chars);
                tokens.push(classify_atom(atom, line)?);
            }
        }
    }
    Ok(tokens)
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: &mut usize,
) -> Result<String, ProgramError> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(ProgramError::runtime(format!(
                    "unterminated string literal at line {line}"
                )));
            }
            Some('"') => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                other => {
                    return Err(ProgramError::runtime(format!(
                        "invalid string escape {other:?} at line {line}"
                    )));
                }
            },
            Some('\n') => {
                *line += 1;
                out.push('\n');
            }
            Some(c) => out.push(c),
        }
    }
}

fn read_atom(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut atom = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '[' | ']' | '{' | '}' | '"') {
            break;
        }
        atom.push(c);
        chars.next();
    }
    atom
}

fn classify_atom(atom: String, line: usize) -> Result<Token, ProgramError> {
    match atom.as_str() {
        "true" => return Ok(Token::Bool(true)),
        "false" => return Ok(Token::Bool(false)),
        "nil" => return Ok(Token::Nil),
        _ => {}
    }
    if let Some(name) = atom.strip_prefix(':') {
        if name.is_empty() {
            return Err(ProgramError::runtime(format!(
                "empty keyword at line {line}"
            )));
        }
        return Ok(Token::Keyword(name.to_string()));
    }
    let Some(leading) = atom.chars().next() else {
        return Err(ProgramError::runtime(format!("empty atom at line {line}")));
    };
    if leading.is_ascii_digit()
        || (matches!(leading, '-' | '+')
            && atom.chars().nth(1).is_some_and(|c| c.is_ascii_digit()))
    {
        return atom
            .parse::<f64>()
            .map(Token::Num)
            .map_err(|_| ProgramError::runtime(format!("invalid number {atom:?} at line {line}")));
    }
    Ok(Token::Sym(atom))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_forms_and_literals() {
        let tokens = tokenize(r#"(def r 8.5) [:a -2] {"k" nil} true"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::LParen,
                Token::Sym("def".into()),
                Token::Sym("r".into()),
                Token::Num(8.5),
                Token::RParen,
                Token::LBracket,
                Token::Keyword("a".into()),
                Token::Num(-2.0),
                Token::RBracket,
                Token::LBrace,
                Token::Str("k".into()),
                Token::Nil,
                Token::RBrace,
                Token::Bool(true),
            ]
        );
    }

    #[test]
    fn dotted_symbols_are_single_tokens() {
        let tokens = tokenize("(actions.navigate.goto target)").unwrap();
        assert_eq!(tokens[1], Token::Sym("actions.navigate.goto".into()));
    }

    #[test]
    fn comments_and_commas_are_whitespace() {
        let tokens = tokenize("; header\n(a, b) ; trailing\n").unwrap();
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""line\nbreak \"quoted\"""#).unwrap();
        assert_eq!(tokens, vec![Token::Str("line\nbreak \"quoted\"".into())]);
        assert!(tokenize(r#""unterminated"#).is_err());
    }

    #[test]
    fn minus_is_a_symbol_unless_numeric() {
        let tokens = tokenize("(- 5 -5)").unwrap();
        assert_eq!(tokens[1], Token::Sym("-".into()));
        assert_eq!(tokens[3], Token::Num(-5.0));
    }
}
