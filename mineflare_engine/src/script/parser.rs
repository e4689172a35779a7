//! Reader: token stream to expression trees

use mineflare_core::error::ProgramError;

use super::lexer::{Token, tokenize};

/// A parsed expression. Program sources are sequences of top-level
/// expressions; the value of the last one is the program definition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    Keyword(String),
    Sym(String),
    Vector(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    List(Vec<Expr>),
}

/// Parses a full source text into top-level expressions.
pub fn parse(source: &str) -> Result<Vec<Expr>, ProgramError> {
    let tokens = tokenize(source)?;
    let mut reader = Reader {
        tokens: &tokens,
        pos: 0,
    };
    let mut forms = Vec::new();
    while !reader.at_end() {
        forms.push(reader.read()?);
    }
    if forms.is_empty() {
        return Err(ProgramError::invalid_argument(
            "program source contains no expressions",
        ));
    }
    Ok(forms)
}

struct Reader<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Reader<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next(&mut self) -> Result<&Token, ProgramError> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| ProgramError::runtime("unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn read(&mut self) -> Result<Expr, ProgramError> {
        match self.next()? {
            Token::Nil => Ok(Expr::Nil),
            Token::Bool(b) => Ok(Expr::Bool(*b)),
            Token::Num(n) => Ok(Expr::Num(*n)),
            Token::Str(s) => Ok(Expr::Str(s.clone())),
            Token::Keyword(k) => Ok(Expr::Keyword(k.clone())),
            Token::Sym(s) => Ok(Expr::Sym(s.clone())),
            Token::LParen => self.read_seq(&Token::RParen).map(Expr::List),
            Token::LBracket => self.read_seq(&Token::RBracket).map(Expr::Vector),
            Token::LBrace => self.read_map(),
            unexpected => Err(ProgramError::runtime(format!(
                "unexpected token {unexpected:?}"
            ))),
        }
    }

    fn read_seq(&mut self, terminator: &Token) -> Result<Vec<Expr>, ProgramError> {
        let mut items = Vec::new();
        loop {
            let token = self
                .tokens
                .get(self.pos)
                .ok_or_else(|| ProgramError::runtime("unterminated form"))?;
            if token == terminator {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.read()?);
        }
    }

    fn read_map(&mut self) -> Result<Expr, ProgramError> {
        let items = self.read_seq(&Token::RBrace)?;
        if items.len() % 2 != 0 {
            return Err(ProgramError::runtime(
                "map literal requires an even number of forms",
            ));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(Expr::Map(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_forms() {
        let forms = parse("(defineProgram {:name \"probe\" :run (fn [ctx] 1)})").unwrap();
        assert_eq!(forms.len(), 1);
        let Expr::List(items) = &forms[0] else {
            panic!("expected list");
        };
        assert_eq!(items[0], Expr::Sym("defineProgram".into()));
        let Expr::Map(pairs) = &items[1] else {
            panic!("expected map");
        };
        assert_eq!(pairs[0].0, Expr::Keyword("name".into()));
        assert_eq!(pairs[0].1, Expr::Str("probe".into()));
    }

    #[test]
    fn rejects_unbalanced_forms() {
        assert!(parse("(def x 1").is_err());
        assert!(parse("{:a}").is_err());
        assert!(parse(")").is_err());
    }

    #[test]
    fn rejects_empty_source() {
        assert!(parse("; only a comment\n").is_err());
    }

    #[test]
    fn multiple_top_level_forms() {
        let forms = parse("(def a 1) (def b 2) b").unwrap();
        assert_eq!(forms.len(), 3);
        assert_eq!(forms[2], Expr::Sym("b".into()));
    }
}
