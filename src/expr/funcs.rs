//! Built-in filter functions.

use std::sync::Arc;

use super::eval::{EvalError, FilterFn};
use super::value::Value;

fn function_error(message: impl Into<String>) -> EvalError {
    EvalError::Function {
        name: String::from("contains"),
        message: message.into(),
    }
}

/// Builds the `contains` filter function.
///
/// Forms:
/// - `contains(map, key)` — key presence;
/// - `contains(map, k1, v1, k2, v2, …)` — all listed keys map to the
///   listed values;
/// - `contains(c1, …, cN, target)` — any candidate equals the target;
///   only string and integer comparisons are supported.
#[must_use]
pub fn contains_filter() -> FilterFn {
    Arc::new(|args: Vec<Value>| Box::pin(async move { contains(&args) }))
}

fn contains(args: &[Value]) -> Result<Value, EvalError> {
    if args.len() < 2 {
        return Err(function_error(
            "wrong number of argument(s) on contains(LIST, OBJECT)",
        ));
    }

    if let Value::Map(map) = &args[0] {
        if args.len() == 2 {
            let Value::Str(key) = &args[1] else {
                return Err(function_error(format!(
                    "non-string keys are not supported: {}",
                    args[1].type_name()
                )));
            };
            return Ok(Value::Bool(map.contains_key(key)));
        }

        if (args.len() - 1) % 2 != 0 {
            return Err(function_error(
                "wrong number of argument(s) on contains(MAP, KEY, VALUE, ...)",
            ));
        }
        for pair in args[1..].chunks(2) {
            let Value::Str(key) = &pair[0] else {
                return Err(function_error(format!(
                    "non-string keys are not supported: {}",
                    pair[0].type_name()
                )));
            };
            let matched = map
                .get(key)
                .is_some_and(|found| found.loosely_equals(&pair[1]));
            if !matched {
                return Ok(Value::Bool(false));
            }
        }
        return Ok(Value::Bool(true));
    }

    let Some((target, candidates)) = args.split_last() else {
        return Ok(Value::Bool(false));
    };
    for candidate in candidates {
        match candidate {
            Value::Str(candidate) => {
                let Value::Str(target) = target else {
                    return Err(function_error(format!(
                        "cannot convert {target} to a string"
                    )));
                };
                if candidate == target {
                    return Ok(Value::Bool(true));
                }
            }
            Value::Int(candidate) => {
                let Value::Int(target) = target else {
                    return Err(function_error(format!(
                        "cannot convert {target} to an int"
                    )));
                };
                if candidate == target {
                    return Ok(Value::Bool(true));
                }
            }
            other => {
                return Err(function_error(format!(
                    "type {} is not supported",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::Bool(false))
}
