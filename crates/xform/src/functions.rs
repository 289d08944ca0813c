//! The built-in function library.
//!
//! Every function receives its arguments exactly as the argument expressions
//! evaluated: usually sequences, but integer literals arrive as plain
//! integers and string literals as single items. The helpers below normalize
//! the common shapes and report [`ErrorKind::InvalidArgument`] on misuse.

use std::sync::Arc;
use tracing::info;

use crate::item::Item;
use crate::runtime::{Error, FunctionRegistry, XformFunction};
use crate::sequence::{Sequence, Value};
use crate::tree::GValue;

/// Registry holding the complete built-in set.
pub fn default_function_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    let builtins: [Arc<dyn XformFunction>; 12] = [
        Arc::new(Count),
        Arc::new(Last),
        Arc::new(Empty),
        Arc::new(IsNull),
        Arc::new(PassThrough),
        Arc::new(Subsequence),
        Arc::new(Concat),
        Arc::new(UpperCase),
        Arc::new(LowerCase),
        Arc::new(SubString),
        Arc::new(Lines),
        Arc::new(Similar),
    ];
    for function in builtins {
        registry.register(function);
    }
    registry
}

/// View an argument as a sequence. A bare item counts as a singleton.
fn sequence_arg(function: &str, args: &[Value], index: usize) -> Result<Sequence, Error> {
    match args.get(index) {
        Some(Value::Seq(seq)) => Ok(seq.clone()),
        Some(Value::Item(item)) => Ok(Sequence::singleton(item.clone())),
        Some(Value::Int(_)) => Err(Error::invalid_argument(
            function,
            format!("argument {} must be a sequence", index + 1),
        )),
        None => Err(Error::invalid_argument(
            function,
            format!("missing argument {}", index + 1),
        )),
    }
}

/// View an argument as an integer, unwrapping a singleton sequence.
fn int_arg(function: &str, args: &[Value], index: usize) -> Result<i64, Error> {
    let found = match args.get(index) {
        Some(Value::Int(value)) => Some(*value),
        Some(Value::Seq(seq)) if seq.len() == 1 => seq.first().and_then(Value::as_int),
        _ => None,
    };
    found.ok_or_else(|| {
        Error::invalid_argument(function, format!("argument {} must be an integer", index + 1))
    })
}

/// The string payload of the first element of a sequence.
fn string_head(function: &str, seq: &Sequence) -> Result<String, Error> {
    if let Some(Value::Item(item)) = seq.first() {
        if let GValue::Text(text) = item.value() {
            return Ok(text.clone());
        }
    }
    Err(Error::invalid_argument(
        function,
        "expected a sequence starting with a string item",
    ))
}

fn string_singleton(text: String) -> Value {
    Value::Seq(Sequence::singleton(Item::new(GValue::Text(text))))
}

/// `count(seq)`: number of elements in the sequence.
pub struct Count;

impl XformFunction for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("count", args, 0)?;
        Ok(Value::Int(seq.len() as i64))
    }
}

/// `last(seq)`: number of elements in the sequence.
pub struct Last;

impl XformFunction for Last {
    fn name(&self) -> &str {
        "last"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("last", args, 0)?;
        Ok(Value::Int(seq.len() as i64))
    }
}

/// `empty(seq)`: the items whose node payload has no children.
pub struct Empty;

impl XformFunction for Empty {
    fn name(&self) -> &str {
        "empty"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("empty", args, 0)?;
        let mut childless = Sequence::new();
        for value in seq.flat_iter() {
            if let Value::Item(item) = value {
                if let GValue::Node(node) = item.value() {
                    if node.is_empty() {
                        childless.add(item.clone());
                    }
                }
            }
        }
        Ok(Value::Seq(childless))
    }
}

/// `isNull(seq)`: the argument if it holds only null items, else empty.
pub struct IsNull;

impl XformFunction for IsNull {
    fn name(&self) -> &str {
        "isNull"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("isNull", args, 0)?;
        for value in seq.flat_iter() {
            let null = matches!(value, Value::Item(item) if item.value().is_null());
            if !null {
                return Ok(Value::Seq(Sequence::new()));
            }
        }
        Ok(Value::Seq(seq))
    }
}

/// `testFunction(args…)`: returns its first argument unchanged.
pub struct PassThrough;

impl XformFunction for PassThrough {
    fn name(&self) -> &str {
        "testFunction"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        args.first()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("testFunction", "missing argument 1"))
    }
}

/// `subsequence(seq, start, end)`: the elements in the 1-based inclusive
/// position range. Positions outside the sequence are ignored.
pub struct Subsequence;

impl XformFunction for Subsequence {
    fn name(&self) -> &str {
        "subsequence"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("subsequence", args, 0)?;
        let start = int_arg("subsequence", args, 1)?;
        let end = int_arg("subsequence", args, 2)?;
        let mut range = Sequence::new();
        for position in start.max(1)..=end {
            match seq.get(position as usize - 1) {
                Some(value) => {
                    range.add(value.clone());
                }
                None => break,
            }
        }
        Ok(Value::Seq(range))
    }
}

/// `concat(a, b, …)`: concatenation of each argument's leading string item,
/// as a singleton.
pub struct Concat;

impl XformFunction for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let mut joined = String::new();
        for index in 0..args.len() {
            let seq = sequence_arg("concat", args, index)?;
            joined.push_str(&string_head("concat", &seq)?);
        }
        Ok(string_singleton(joined))
    }
}

/// `uppercase(seq)`: the leading string item converted to upper case.
pub struct UpperCase;

impl XformFunction for UpperCase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("uppercase", args, 0)?;
        let text = string_head("uppercase", &seq)?;
        Ok(string_singleton(text.to_uppercase()))
    }
}

/// `lowercase(seq)`: the leading string item converted to lower case.
pub struct LowerCase;

impl XformFunction for LowerCase {
    fn name(&self) -> &str {
        "lowercase"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("lowercase", args, 0)?;
        let text = string_head("lowercase", &seq)?;
        Ok(string_singleton(text.to_lowercase()))
    }
}

/// `substring(seq, start[, length])`: a 0-based substring of the leading
/// string item, counted in characters.
pub struct SubString;

impl XformFunction for SubString {
    fn name(&self) -> &str {
        "substring"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("substring", args, 0)?;
        let text = string_head("substring", &seq)?;
        let start = int_arg("substring", args, 1)?;
        let start = usize::try_from(start)
            .map_err(|_| Error::invalid_argument("substring", "start must not be negative"))?;
        let tail = text.chars().skip(start);
        let result: String = if args.len() > 2 {
            let length = int_arg("substring", args, 2)?;
            let length = usize::try_from(length)
                .map_err(|_| Error::invalid_argument("substring", "length must not be negative"))?;
            tail.take(length).collect()
        } else {
            tail.collect()
        };
        Ok(string_singleton(result))
    }
}

/// `lines(seq)`: reports the source location of each node item and returns
/// the argument unchanged.
pub struct Lines;

impl XformFunction for Lines {
    fn name(&self) -> &str {
        "lines"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let seq = sequence_arg("lines", args, 0)?;
        for value in seq.flat_iter() {
            if let Value::Item(item) = value {
                if let GValue::Node(node) = item.value() {
                    match node.location() {
                        Some(location) => info!("{}: {}", node.name(), location),
                        None => info!("{}: unknown location", node.name()),
                    }
                }
            }
        }
        Ok(Value::Seq(seq))
    }
}

/// `similar(candidates, values)`: the items of `candidates` whose payload
/// equals the payload of at least one item of `values`, regardless of tree
/// position.
pub struct Similar;

impl XformFunction for Similar {
    fn name(&self) -> &str {
        "similar"
    }

    fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        let candidates = sequence_arg("similar", args, 0)?;
        let values = sequence_arg("similar", args, 1)?;
        let mut similar = Sequence::new();
        for candidate in candidates.flat_iter() {
            if let Value::Item(item) = candidate {
                for value in values.flat_iter() {
                    if let Value::Item(other) = value {
                        if item.value() == other.value() {
                            similar.add(item.clone());
                        }
                    }
                }
            }
        }
        Ok(Value::Seq(similar))
    }
}
