//! Boolean filter expressions over instance metadata.
//!
//! An expression is parsed once and evaluated against a per-instance
//! [`Context`]. The language covers literals, identifiers, comparisons,
//! boolean combinators, and function calls; domain functions such as
//! `contains` and `ispublic` are registered on the context. Evaluation is
//! asynchronous because `ispublic` consults the network cache.

mod context;
mod eval;
mod funcs;
mod parser;
mod token;
mod value;

pub use context::instance_context;
pub use eval::{Context, EvalError, FilterFn, FuncFuture};
pub use funcs::contains_filter;
pub use parser::Expr;
pub use value::Value;

use parser::Parser;
use token::tokenize;

/// A parsed filter expression.
#[derive(Clone, Debug)]
pub struct Evaluator {
    source: String,
    root: Expr,
}

impl Evaluator {
    /// Parses `input`, applying the bareword shorthand first: a lone word
    /// that is not `true`/`false` and does not open a string literal is
    /// rewritten to `name == "WORD"`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Parse`] when the expression does not lex or
    /// parse.
    pub fn parse(input: &str) -> Result<Self, EvalError> {
        let source = shorthand(input).unwrap_or_else(|| input.trim().to_owned());
        let tokens = tokenize(&source)?;
        let root = Parser::new(tokens).parse()?;
        Ok(Self { source, root })
    }

    /// The expression text actually compiled, after shorthand rewriting.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against `context`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError`] when evaluation fails or the expression does
    /// not yield a boolean.
    pub async fn matches(&self, context: &Context) -> Result<bool, EvalError> {
        match eval::eval(&self.root, context).await? {
            Value::Bool(value) => Ok(value),
            other => Err(EvalError::NotBoolean {
                value: other.to_string(),
            }),
        }
    }
}

/// Rewrites a bareword filter to a name comparison, mirroring the common
/// `tool 'machine-name' ::: cmd` invocation.
fn shorthand(input: &str) -> Option<String> {
    let word = input.trim();
    if word.is_empty() || word == "true" || word == "false" || word.starts_with('"') {
        return None;
    }
    word.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
        .then(|| format!("name == \"{word}\""))
}
