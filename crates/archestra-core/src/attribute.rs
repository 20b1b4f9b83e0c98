//! Attribute-path evaluator.
//!
//! Paths are dot-separated segments; a segment is a field name, a field name
//! suffixed with `[*]` (descend then iterate the array), or a bare `[*]`
//! (iterate the current array). `emails[*].from` reaches the `from` field of
//! every element of `emails`. Evaluation collects the reachable scalar
//! values and tests each against an operator/value pair; a malformed path or
//! an operator/type mismatch fails the match without raising.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators supported by trust and invocation policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "notEqual",
            Operator::Contains => "contains",
            Operator::NotContains => "notContains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::GreaterThan => "greaterThan",
            Operator::LessThan => "lessThan",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "equal" => Some(Operator::Equal),
            "notEqual" => Some(Operator::NotEqual),
            "contains" => Some(Operator::Contains),
            "notContains" => Some(Operator::NotContains),
            "startsWith" => Some(Operator::StartsWith),
            "endsWith" => Some(Operator::EndsWith),
            "greaterThan" => Some(Operator::GreaterThan),
            "lessThan" => Some(Operator::LessThan),
            _ => None,
        }
    }
}

/// Outcome of evaluating one path/operator/value triple against a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeMatch {
    /// True iff any reached value satisfies the operator/value pair.
    pub matched: bool,
    /// The reached values that satisfied the pair.
    pub matched_values: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    /// Descend into a named field.
    Field(String),
    /// Descend into a named field, then iterate its array elements.
    FieldAll(String),
    /// Iterate the elements of the current array.
    All,
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    if path.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for raw in path.split('.') {
        if raw == "[*]" {
            segments.push(Segment::All);
            continue;
        }

        let (name, iterate) = match raw.strip_suffix("[*]") {
            Some(name) => (name, true),
            None => (raw, false),
        };

        // Stray brackets anywhere else make the path malformed.
        if name.is_empty() || name.contains('[') || name.contains(']') {
            return None;
        }

        segments.push(if iterate {
            Segment::FieldAll(name.to_string())
        } else {
            Segment::Field(name.to_string())
        });
    }

    Some(segments)
}

fn collect<'a>(value: &'a Value, segments: &[Segment], out: &mut Vec<&'a Value>) {
    let Some((segment, rest)) = segments.split_first() else {
        if is_scalar(value) {
            out.push(value);
        }
        return;
    };

    match segment {
        Segment::Field(name) => {
            if let Some(inner) = value.get(name.as_str()) {
                collect(inner, rest, out);
            }
        }
        Segment::FieldAll(name) => {
            if let Some(Value::Array(items)) = value.get(name.as_str()) {
                for item in items {
                    collect(item, rest, out);
                }
            }
        }
        Segment::All => {
            if let Value::Array(items) = value {
                for item in items {
                    collect(item, rest, out);
                }
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null
    )
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_finite_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn satisfies(value: &Value, operator: Operator, expected: &str) -> bool {
    let actual = scalar_string(value);

    match operator {
        Operator::Equal | Operator::NotEqual => {
            let equal = match (as_finite_number(&actual), as_finite_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => actual == expected,
            };
            if operator == Operator::Equal {
                equal
            } else {
                !equal
            }
        }
        Operator::Contains => actual.contains(expected),
        Operator::NotContains => !actual.contains(expected),
        Operator::StartsWith => actual.starts_with(expected),
        Operator::EndsWith => actual.ends_with(expected),
        Operator::GreaterThan | Operator::LessThan => {
            match (as_finite_number(&actual), as_finite_number(expected)) {
                (Some(a), Some(b)) => {
                    if operator == Operator::GreaterThan {
                        a > b
                    } else {
                        a < b
                    }
                }
                _ => {
                    tracing::warn!(
                        operator = operator.as_str(),
                        value = %actual,
                        expected,
                        "numeric operator applied to non-numeric operand; treating as no match"
                    );
                    false
                }
            }
        }
    }
}

/// Evaluate `path` against `document` and test every reached scalar with
/// `operator`/`expected`. The primitive both policy engines build on.
pub fn evaluate_attribute(
    document: &Value,
    path: &str,
    operator: Operator,
    expected: &str,
) -> AttributeMatch {
    let Some(segments) = parse_path(path) else {
        tracing::warn!(path, "malformed attribute path; treating as no match");
        return AttributeMatch::default();
    };

    let mut reached = Vec::new();
    collect(document, &segments, &mut reached);

    let matched_values: Vec<Value> = reached
        .into_iter()
        .filter(|value| satisfies(value, operator, expected))
        .cloned()
        .collect();

    AttributeMatch {
        matched: !matched_values.is_empty(),
        matched_values,
    }
}
