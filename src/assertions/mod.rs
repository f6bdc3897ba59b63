//! # AssertionEvaluator (C3)
//!
//! A pure function: compares `ExpectedResult` matchers against one HTTP
//! response and produces `AssertionResult`s. Nothing here performs I/O or
//! mutates the context — `HttpStepExecutor` (C2) is the only caller.

use serde_json::Value;

use crate::domain::{AssertionResult, ExpectedResult, FieldMatcher};

/// A single step of a parsed JSON path: either an object key or an array
/// index from a `[i]` subscript.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parses a dotted path with optional `[i]` integer subscripts, e.g.
/// `user.addresses[0].city`.
fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        match rest.find('[') {
            None => segments.push(PathSegment::Key(rest.to_string())),
            Some(bracket_pos) => {
                let key = &rest[..bracket_pos];
                if !key.is_empty() {
                    segments.push(PathSegment::Key(key.to_string()));
                }
                rest = &rest[bracket_pos..];
                while let Some(stripped) = rest.strip_prefix('[') {
                    match stripped.find(']') {
                        Some(close) => {
                            if let Ok(idx) = stripped[..close].parse::<usize>() {
                                segments.push(PathSegment::Index(idx));
                            }
                            rest = &stripped[close + 1..];
                        }
                        None => break,
                    }
                }
            }
        }
    }
    segments
}

/// Reads a JSON path from `root`. Evaluation is null-safe: any missing
/// intermediate node causes the value to be treated as absent (`None`),
/// never an error.
pub fn get_json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in parse_path(path) {
        current = match segment {
            PathSegment::Key(k) => current.as_object()?.get(&k)?,
            PathSegment::Index(i) => current.as_array()?.get(i)?,
        };
    }
    Some(current)
}

/// Stringifies a JSON value the way `Exact`/`OneOf` comparisons expect:
/// strings compare by their raw content, everything else by its JSON text.
fn compare_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn evaluate_matcher(path: &str, matcher: &FieldMatcher, body: &Value) -> AssertionResult {
    let actual = get_json_path(body, path);
    let (passed, message) = match matcher {
        FieldMatcher::Exact { value } => match actual {
            Some(a) if compare_string(a) == compare_string(value) => (true, None),
            Some(a) => (
                false,
                Some(format!("expected {} == {} at '{}', got {}", path, value, path, a)),
            ),
            None => (false, Some(format!("path '{}' not found", path))),
        },
        FieldMatcher::AnyPresent | FieldMatcher::NotNull => match actual {
            Some(Value::Null) | None => (false, Some(format!("path '{}' is null or missing", path))),
            Some(_) => (true, None),
        },
        FieldMatcher::IsNull => match actual {
            Some(Value::Null) | None => (true, None),
            Some(a) => (false, Some(format!("path '{}' expected null, got {}", path, a))),
        },
        FieldMatcher::Regex { pattern } => match actual.and_then(|a| a.as_str()) {
            Some(s) => match regex::Regex::new(pattern) {
                Ok(re) => {
                    let ok = re.is_match(s);
                    (ok, (!ok).then(|| format!("'{}' does not match /{}/", s, pattern)))
                }
                Err(e) => (false, Some(format!("invalid regex '{}': {}", pattern, e))),
            },
            None => (false, Some(format!("path '{}' is not a string", path))),
        },
        FieldMatcher::GreaterThan { value } => match actual.and_then(as_f64) {
            Some(n) if n > *value => (true, None),
            Some(n) => (false, Some(format!("{} is not > {}", n, value))),
            None => (false, Some(format!("path '{}' is not numeric", path))),
        },
        FieldMatcher::LessThan { value } => match actual.and_then(as_f64) {
            Some(n) if n < *value => (true, None),
            Some(n) => (false, Some(format!("{} is not < {}", n, value))),
            None => (false, Some(format!("path '{}' is not numeric", path))),
        },
        FieldMatcher::OneOf { values } => match actual {
            Some(a) => {
                let s = compare_string(a);
                let ok = values.iter().any(|v| compare_string(v) == s);
                (ok, (!ok).then(|| format!("{} not in declared set", s)))
            }
            None => (false, Some(format!("path '{}' not found", path))),
        },
    };

    AssertionResult {
        kind: matcher_label(matcher).to_string(),
        field: Some(path.to_string()),
        expected: matcher_expected_value(matcher),
        actual: actual.cloned(),
        passed,
        message,
    }
}

fn matcher_label(matcher: &FieldMatcher) -> &'static str {
    match matcher {
        FieldMatcher::Exact { .. } => "BODY_FIELD_EXACT",
        FieldMatcher::AnyPresent => "BODY_FIELD_EXISTS",
        FieldMatcher::Regex { .. } => "BODY_FIELD_REGEX",
        FieldMatcher::GreaterThan { .. } => "BODY_FIELD_GREATER_THAN",
        FieldMatcher::LessThan { .. } => "BODY_FIELD_LESS_THAN",
        FieldMatcher::OneOf { .. } => "BODY_FIELD_ONE_OF",
        FieldMatcher::NotNull => "BODY_FIELD_NOT_NULL",
        FieldMatcher::IsNull => "BODY_FIELD_NULL",
    }
}

fn matcher_expected_value(matcher: &FieldMatcher) -> Option<Value> {
    match matcher {
        FieldMatcher::Exact { value } => Some(value.clone()),
        FieldMatcher::Regex { pattern } => Some(Value::String(pattern.clone())),
        FieldMatcher::GreaterThan { value } | FieldMatcher::LessThan { value } => {
            serde_json::Number::from_f64(*value).map(Value::Number)
        }
        FieldMatcher::OneOf { values } => Some(Value::Array(values.clone())),
        FieldMatcher::AnyPresent | FieldMatcher::NotNull | FieldMatcher::IsNull => None,
    }
}

/// Evaluates every constraint in `expected` against one HTTP response.
/// `request_headers` are the step's *resolved* outgoing headers (per §4.3,
/// the header matcher checks the request, not the response).
pub fn evaluate(
    expected: &ExpectedResult,
    actual_status: u16,
    raw_body: &str,
    body: &Value,
    request_headers: &[(String, String)],
) -> Vec<AssertionResult> {
    let mut results = Vec::new();

    if let Some(status) = expected.status {
        results.push(AssertionResult {
            kind: "STATUS".to_string(),
            field: None,
            expected: Some(Value::from(status)),
            actual: Some(Value::from(actual_status)),
            passed: actual_status == status,
            message: (actual_status != status)
                .then(|| format!("expected status {}, got {}", status, actual_status)),
        });
    }

    if let Some((lo, hi)) = expected.status_range {
        let passed = actual_status >= lo && actual_status <= hi;
        results.push(AssertionResult {
            kind: "STATUS_RANGE".to_string(),
            field: None,
            expected: Some(Value::String(format!("{}..={}", lo, hi))),
            actual: Some(Value::from(actual_status)),
            passed,
            message: (!passed).then(|| {
                format!("status {} not in range {}..={}", actual_status, lo, hi)
            }),
        });
    }

    for needle in &expected.body_contains {
        let passed = raw_body.contains(needle.as_str());
        results.push(AssertionResult {
            kind: "BODY_CONTAINS".to_string(),
            field: None,
            expected: Some(Value::String(needle.clone())),
            actual: None,
            passed,
            message: (!passed).then(|| format!("body does not contain '{}'", needle)),
        });
    }

    for (path, matcher) in &expected.field_matchers {
        results.push(evaluate_matcher(path, matcher, body));
    }

    for (name, expected_value) in &expected.headers {
        let actual_value = request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str());
        let passed = actual_value == Some(expected_value.as_str());
        results.push(AssertionResult {
            kind: "HEADER".to_string(),
            field: Some(name.clone()),
            expected: Some(Value::String(expected_value.clone())),
            actual: actual_value.map(|v| Value::String(v.to_string())),
            passed,
            message: (!passed).then(|| {
                format!(
                    "header '{}' expected '{}', got {:?}",
                    name, expected_value, actual_value
                )
            }),
        });
    }

    results
}
