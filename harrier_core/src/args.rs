use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Parameter names whose text suggests a collection-valued argument.
/// Matched case-insensitively as substrings; `arg` also covers `args`.
const SEQUENCE_NAME_HINTS: &[&str] = &[
    "arg",
    "list",
    "array",
    "items",
    "values",
    "options",
    "commands",
    "parameters",
];

/// Explicit delimiters tried when an input must be split positionally.
/// `||` is matched before `|`.
const POSITIONAL_DELIMITERS: &[&str] = &["||", "::", "|"];

/// Whether a parameter expects a single scalar or a sequence of values.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ParamShape {
    #[default]
    Scalar,
    Sequence,
}

/// Per-parameter shape metadata supplied by the harness configuration.
///
/// A descriptor entry always wins; without one, the fixed name-hint set
/// decides; otherwise the parameter is scalar.
#[derive(Debug, Clone, Default)]
pub struct ShapeDescriptor {
    shapes: HashMap<String, ParamShape>,
}

impl ShapeDescriptor {
    pub fn new(shapes: HashMap<String, ParamShape>) -> Self {
        Self { shapes }
    }

    pub fn shape_of(&self, param_name: &str) -> ParamShape {
        if let Some(shape) = self.shapes.get(param_name) {
            return *shape;
        }
        if name_hints_sequence(param_name) {
            ParamShape::Sequence
        } else {
            ParamShape::Scalar
        }
    }
}

fn name_hints_sequence(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let lowered = name.to_ascii_lowercase();
    SEQUENCE_NAME_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Callables are always invoked with at least one argument.
pub fn expected_arity(param_names: &[String]) -> usize {
    param_names.len().max(1)
}

/// Turns one opaque textual input into exactly `arity` positional arguments.
///
/// Decoding priority for multi-parameter targets: a JSON array or object is
/// spread positionally; otherwise the input is split on newlines, then on the
/// explicit delimiters, each accepted only when it yields at least `arity`
/// segments; otherwise the raw input is repeated until arity is satisfied.
pub fn prepare_arguments(
    raw_input: &str,
    arity: usize,
    param_names: &[String],
    shapes: &ShapeDescriptor,
) -> Vec<Value> {
    if arity <= 1 {
        let shape = param_names
            .first()
            .map(|name| shapes.shape_of(name))
            .unwrap_or(ParamShape::Scalar);
        return vec![coerce_token(Value::String(raw_input.to_string()), shape)];
    }

    let trimmed = raw_input.trim();
    let mut args: Vec<Value> = Vec::new();

    if looks_like_json_container(trimmed) {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(elements)) => args.extend(elements),
            Ok(Value::Object(map)) => args.extend(map.into_iter().map(|(_, v)| v)),
            _ => {}
        }
    }

    if args.is_empty() {
        let lines: Vec<&str> = trimmed
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
            .collect();
        if lines.len() >= arity {
            args.extend(lines.iter().take(arity).map(|l| Value::String(l.to_string())));
        } else {
            let segments = split_on_delimiters(trimmed);
            if segments.len() >= arity {
                args.extend(segments.into_iter().take(arity).map(Value::String));
            }
        }
    }

    while args.len() < arity {
        args.push(Value::String(raw_input.to_string()));
    }
    args.truncate(arity);

    args.into_iter()
        .enumerate()
        .map(|(idx, value)| {
            let shape = param_names
                .get(idx)
                .map(|name| shapes.shape_of(name))
                .unwrap_or(ParamShape::Scalar);
            coerce_token(value, shape)
        })
        .collect()
}

/// Coerces a single positional token according to its parameter shape.
///
/// Non-string values pass through unchanged. Strings are trimmed; a
/// sequence-shaped parameter tries a JSON array literal, then a comma split,
/// then a whitespace split.
pub fn coerce_token(value: Value, shape: ParamShape) -> Value {
    let Value::String(text) = value else {
        return value;
    };
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        return Value::String(trimmed);
    }
    if shape == ParamShape::Sequence {
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            if let Ok(Value::Array(elements)) = serde_json::from_str::<Value>(&trimmed) {
                return Value::Array(elements);
            }
        }
        if trimmed.contains(',') {
            return Value::Array(
                trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            );
        }
        return Value::Array(
            trimmed
                .split_whitespace()
                .map(|part| Value::String(part.to_string()))
                .collect(),
        );
    }
    Value::String(trimmed)
}

/// Reconciles a prepared argument list against the target's arity and enforces
/// the scalar-vs-sequence decision per position: scalars become one-element
/// sequences where a sequence is expected, and sequences collapse to their
/// first element (or the empty string) where a scalar is expected.
pub fn coerce_arguments(
    prepared: Vec<Value>,
    arity: usize,
    param_names: &[String],
    shapes: &ShapeDescriptor,
) -> Vec<Value> {
    let mut normalized = prepared;
    normalized.truncate(arity);
    while normalized.len() < arity {
        normalized.push(Value::String(String::new()));
    }

    for (idx, slot) in normalized.iter_mut().enumerate() {
        let shape = param_names
            .get(idx)
            .map(|name| shapes.shape_of(name))
            .unwrap_or(ParamShape::Scalar);
        match shape {
            ParamShape::Sequence => {
                if !slot.is_array() {
                    *slot = to_sequence(std::mem::take(slot));
                }
            }
            ParamShape::Scalar => {
                if let Value::Array(elements) = slot {
                    *slot = elements
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new()));
                }
            }
        }
    }
    normalized
}

fn to_sequence(value: Value) -> Value {
    match value {
        Value::Null => Value::Array(Vec::new()),
        Value::String(text) => {
            let comma_parts: Vec<&str> = text
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect();
            if comma_parts.len() > 1 {
                return Value::Array(
                    comma_parts
                        .into_iter()
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                );
            }
            let white_parts: Vec<&str> = text.split_whitespace().collect();
            if white_parts.is_empty() {
                Value::Array(vec![Value::String(text)])
            } else {
                Value::Array(
                    white_parts
                        .into_iter()
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                )
            }
        }
        other => Value::Array(vec![other]),
    }
}

fn looks_like_json_container(trimmed: &str) -> bool {
    (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'))
}

fn split_on_delimiters(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = input;
    loop {
        let mut earliest: Option<(usize, usize)> = None;
        for delim in POSITIONAL_DELIMITERS {
            if let Some(pos) = rest.find(delim) {
                let replace = match earliest {
                    None => true,
                    Some((best_pos, _)) => pos < best_pos,
                };
                if replace {
                    earliest = Some((pos, delim.len()));
                }
            }
        }
        match earliest {
            Some((pos, len)) => {
                parts.push(rest[..pos].trim().to_string());
                rest = &rest[pos + len..];
            }
            None => {
                parts.push(rest.trim().to_string());
                break;
            }
        }
    }
    parts.retain(|part| !part.is_empty());
    parts
}
