//! Tree-walking evaluator for filter expressions.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use super::funcs::contains_filter;
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::value::Value;

/// Errors raised while parsing or evaluating a filter expression. These are
/// fatal for a run: they indicate a mistake in the user's filter.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvalError {
    /// The expression did not lex or parse.
    #[error("cannot parse expression: {message}")]
    Parse {
        /// Parser description of the problem.
        message: String,
    },
    /// An identifier is not present in the evaluation context.
    #[error("unknown variable: {name}")]
    UnknownVariable {
        /// Identifier that failed to resolve.
        name: String,
    },
    /// A call names a function that is not registered.
    #[error("unknown function: {name}")]
    UnknownFunction {
        /// Function name from the expression.
        name: String,
    },
    /// An operator was applied to operands it does not support.
    #[error("type error: {message}")]
    Type {
        /// Description of the mismatch.
        message: String,
    },
    /// A registered function rejected its arguments.
    #[error("{name}: {message}")]
    Function {
        /// Function that failed.
        name: String,
        /// Function-provided description.
        message: String,
    },
    /// The expression evaluated to something other than a boolean.
    #[error("not a boolean value: {value}")]
    NotBoolean {
        /// Rendered offending value.
        value: String,
    },
}

/// Future returned by a registered filter function.
pub type FuncFuture = Pin<Box<dyn Future<Output = Result<Value, EvalError>> + Send>>;

/// A function callable from filter expressions.
pub type FilterFn = Arc<dyn Fn(Vec<Value>) -> FuncFuture + Send + Sync>;

/// Per-instance evaluation context: variables plus registered functions.
///
/// `contains` is always available; domain functions such as `ispublic` are
/// registered by the caller.
#[derive(Clone)]
pub struct Context {
    vars: BTreeMap<String, Value>,
    funcs: HashMap<String, FilterFn>,
}

impl Context {
    /// Creates a context over the given variables with the standard
    /// function set.
    #[must_use]
    pub fn new(vars: BTreeMap<String, Value>) -> Self {
        let mut context = Self {
            vars,
            funcs: HashMap::new(),
        };
        context.register("contains", contains_filter());
        context
    }

    /// Registers (or replaces) a filter function under `name`.
    pub fn register(&mut self, name: &str, func: FilterFn) {
        self.funcs.insert(name.to_owned(), func);
    }

    fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn func(&self, name: &str) -> Option<&FilterFn> {
        self.funcs.get(name)
    }
}

/// Evaluates `expr` against `context`. Boxed for recursion.
pub(super) fn eval<'a>(
    expr: &'a Expr,
    context: &'a Context,
) -> Pin<Box<dyn Future<Output = Result<Value, EvalError>> + Send + 'a>> {
    Box::pin(async move {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => context.var(name).cloned().ok_or_else(|| {
                EvalError::UnknownVariable { name: name.clone() }
            }),
            Expr::Call { name, args } => {
                let func = context
                    .func(name)
                    .ok_or_else(|| EvalError::UnknownFunction { name: name.clone() })?
                    .clone();
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(eval(arg, context).await?);
                }
                func(values).await
            }
            Expr::Unary { op, operand } => {
                let value = eval(operand, context).await?;
                apply_unary(*op, value)
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And => {
                    if !boolean(eval(lhs, context).await?, "&&")? {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(boolean(eval(rhs, context).await?, "&&")?))
                }
                BinaryOp::Or => {
                    if boolean(eval(lhs, context).await?, "||")? {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(boolean(eval(rhs, context).await?, "||")?))
                }
                BinaryOp::Eq => {
                    let lhs = eval(lhs, context).await?;
                    let rhs = eval(rhs, context).await?;
                    Ok(Value::Bool(lhs.loosely_equals(&rhs)))
                }
                BinaryOp::Ne => {
                    let lhs = eval(lhs, context).await?;
                    let rhs = eval(rhs, context).await?;
                    Ok(Value::Bool(!lhs.loosely_equals(&rhs)))
                }
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let lhs = eval(lhs, context).await?;
                    let rhs = eval(rhs, context).await?;
                    compare(*op, &lhs, &rhs)
                }
            },
        }
    })
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(value)) => Ok(Value::Bool(!value)),
        (UnaryOp::Neg, Value::Int(value)) => Ok(Value::Int(-value)),
        (UnaryOp::Neg, Value::Float(value)) => Ok(Value::Float(-value)),
        (UnaryOp::Not, other) => Err(EvalError::Type {
            message: format!("! requires a boolean, found {}", other.type_name()),
        }),
        (UnaryOp::Neg, other) => Err(EvalError::Type {
            message: format!("unary - requires a number, found {}", other.type_name()),
        }),
    }
}

fn boolean(value: Value, operator: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(value) => Ok(value),
        other => Err(EvalError::Type {
            message: format!("{operator} requires booleans, found {}", other.type_name()),
        }),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = if let (Some(lhs), Some(rhs)) = (lhs.as_f64(), rhs.as_f64()) {
        lhs.partial_cmp(&rhs)
    } else if let (Value::Str(lhs), Value::Str(rhs)) = (lhs, rhs) {
        Some(lhs.cmp(rhs))
    } else {
        return Err(EvalError::Type {
            message: format!(
                "cannot order {} against {}",
                lhs.type_name(),
                rhs.type_name()
            ),
        });
    };

    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!("compare only handles ordering operators"),
    };
    Ok(Value::Bool(result))
}
