//! Lexer for filter expressions.
//!
//! Tokenises with the logos lexer generator. The grammar is small:
//! comparison and boolean operators, literals, identifiers, calls.

use logos::Logos;

use super::eval::EvalError;

#[derive(Clone, Debug, Logos, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("!")]
    Bang,
    #[token("-")]
    Minus,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\]|\\.)*""#, unescape)]
    Str(String),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),
}

fn unescape(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let raw = lex.slice();
    let inner = raw.get(1..raw.len() - 1)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            }
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

/// Tokenises `source` into a flat token list.
///
/// # Errors
///
/// Returns [`EvalError::Parse`] pointing at the first unrecognised input.
pub fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push(token),
            Err(()) => {
                return Err(EvalError::Parse {
                    message: format!(
                        "unexpected input {:?} at offset {}",
                        lexer.slice(),
                        lexer.span().start
                    ),
                });
            }
        }
    }
    Ok(tokens)
}
