// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Query paths over Envoy payloads
//!
//! Metrics are declared as short path expressions such as
//! `production_json.consumption[?(@.measurementType=='total-consumption' && @.activeCount > 0)].wNow`.
//! An expression is parsed once into a [`PathExpr`] and evaluated against the
//! raw endpoint store on every read.
//!
//! Supported syntax:
//! - `a.b` field access, `a[0]` / `a[-1]` indexing, `a[*]` / `a.*` wildcard
//! - `a[?(@.f=='x' && @.n > 1)]` filters with `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - `a.[b,c]` field union (every listed field that exists)
//! - a trailing `:` flattens list matches one level

use crate::errors::{EnvoyError, EnvoyResult};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(String),
    Index(i64),
    Wildcard,
    Filter(Vec<Condition>),
    Union(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// `@.field` with no operator: the field is present and truthy
    Truthy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    field: Vec<String>,
    op: CompareOp,
    literal: Literal,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    source: String,
    steps: Vec<Step>,
    flatten: bool,
}

impl PathExpr {
    pub fn parse(expr: &str) -> EnvoyResult<Self> {
        let invalid = |reason: &str| EnvoyError::InvalidPath {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expr.trim();
        let (body, flatten) = match trimmed.strip_suffix(':') {
            Some(body) => (body, true),
            None => (trimmed, false),
        };
        if body.is_empty() {
            return Err(invalid("empty expression"));
        }

        let chars: Vec<char> = body.chars().collect();
        let mut steps = Vec::new();
        let mut pos = 0;

        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    if pos >= chars.len() {
                        return Err(invalid("trailing '.'"));
                    }
                    if chars[pos] == '.' {
                        return Err(invalid("recursive descent is not supported"));
                    }
                }
                '[' => {
                    let end = find_closing_bracket(&chars, pos)
                        .ok_or_else(|| invalid("unterminated '['"))?;
                    let inner: String = chars[pos + 1..end].iter().collect();
                    steps.push(parse_bracket(inner.trim()).map_err(|reason| invalid(&reason))?);
                    pos = end + 1;
                }
                '*' => {
                    steps.push(Step::Wildcard);
                    pos += 1;
                }
                ']' | ')' => return Err(invalid("unbalanced bracket")),
                _ => {
                    let start = pos;
                    while pos < chars.len() && chars[pos] != '.' && chars[pos] != '[' {
                        pos += 1;
                    }
                    let name: String = chars[start..pos].iter().collect();
                    steps.push(Step::Field(name.trim().to_string()));
                }
            }
        }

        if steps.is_empty() {
            return Err(invalid("no path segments"));
        }

        Ok(Self {
            source: expr.to_string(),
            steps,
            flatten,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Leading field name; for store lookups this is the endpoint name.
    pub fn head(&self) -> Option<&str> {
        match self.steps.first() {
            Some(Step::Field(name)) => Some(name),
            _ => None,
        }
    }

    /// Every node the expression selects, in document order.
    pub fn matches<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        self.finish(walk(vec![root], &self.steps))
    }

    /// Evaluate against a map whose keys act as the first path segment.
    pub fn matches_in<'a>(&self, root: &'a Map<String, Value>) -> Vec<&'a Value> {
        match self.steps.split_first() {
            Some((Step::Field(name), rest)) => root
                .get(name)
                .map(|value| self.finish(walk(vec![value], rest)))
                .unwrap_or_default(),
            Some((Step::Wildcard, rest)) => self.finish(walk(root.values().collect(), rest)),
            _ => Vec::new(),
        }
    }

    /// Resolve with the single-match unwrap rule: no match gives `default`,
    /// exactly one match gives that node, more give a list.
    pub fn resolve(&self, root: &Value, default: Value) -> Value {
        unwrap_matches(self.matches(root), default)
    }

    pub fn resolve_in(&self, root: &Map<String, Value>, default: Value) -> Value {
        unwrap_matches(self.matches_in(root), default)
    }

    fn finish<'a>(&self, found: Vec<&'a Value>) -> Vec<&'a Value> {
        if !self.flatten {
            return found;
        }
        let mut flat = Vec::with_capacity(found.len());
        for value in found {
            match value {
                Value::Array(items) => flat.extend(items.iter()),
                other => flat.push(other),
            }
        }
        flat
    }
}

impl FromStr for PathExpr {
    type Err = EnvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and resolve in one call.
pub fn resolve(document: &Value, expr: &str, default: Value) -> EnvoyResult<Value> {
    Ok(PathExpr::parse(expr)?.resolve(document, default))
}

/// Parse and return the raw match list, without the single-match unwrap.
pub fn resolve_all(document: &Value, expr: &str) -> EnvoyResult<Vec<Value>> {
    Ok(PathExpr::parse(expr)?
        .matches(document)
        .into_iter()
        .cloned()
        .collect())
}

fn unwrap_matches(found: Vec<&Value>, default: Value) -> Value {
    match found.as_slice() {
        [] => default,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    }
}

fn walk<'a>(mut current: Vec<&'a Value>, steps: &[Step]) -> Vec<&'a Value> {
    for step in steps {
        if current.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for value in current {
            apply_step(step, value, &mut next);
        }
        current = next;
    }
    current
}

fn apply_step<'a>(step: &Step, value: &'a Value, out: &mut Vec<&'a Value>) {
    match step {
        Step::Field(name) => {
            if let Some(found) = value.get(name.as_str()) {
                out.push(found);
            }
        }
        Step::Index(index) => {
            if let Value::Array(items) = value {
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let idx = if *index < 0 { len + index } else { *index };
                if let Ok(idx) = usize::try_from(idx)
                    && let Some(found) = items.get(idx)
                {
                    out.push(found);
                }
            }
        }
        Step::Wildcard => children(value, out, |_| true),
        Step::Filter(conditions) => {
            children(value, out, |item| conditions.iter().all(|c| c.holds(item)));
        }
        Step::Union(names) => {
            for name in names {
                if let Some(found) = value.get(name.as_str()) {
                    out.push(found);
                }
            }
        }
    }
}

fn children<'a>(value: &'a Value, out: &mut Vec<&'a Value>, keep: impl Fn(&Value) -> bool) {
    match value {
        Value::Array(items) => out.extend(items.iter().filter(|item| keep(*item))),
        Value::Object(map) => out.extend(map.values().filter(|item| keep(*item))),
        _ => {}
    }
}

impl Condition {
    fn holds(&self, item: &Value) -> bool {
        let mut current = item;
        for key in &self.field {
            match current.get(key.as_str()) {
                Some(next) => current = next,
                None => return false,
            }
        }

        match self.op {
            CompareOp::Truthy => is_truthy(current),
            CompareOp::Eq => literal_eq(current, &self.literal),
            CompareOp::Ne => !literal_eq(current, &self.literal),
            CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
                let Some(ordering) = literal_cmp(current, &self.literal) else {
                    return false;
                };
                match self.op {
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn literal_eq(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::String(s), Literal::Str(l)) => s == l,
        (Value::Number(n), Literal::Num(l)) => {
            n.as_f64().is_some_and(|n| (n - l).abs() < f64::EPSILON)
        }
        (Value::Bool(b), Literal::Bool(l)) => b == l,
        (Value::Null, Literal::Null) => true,
        _ => false,
    }
}

fn literal_cmp(value: &Value, literal: &Literal) -> Option<std::cmp::Ordering> {
    match (value, literal) {
        (Value::Number(n), Literal::Num(l)) => n.as_f64()?.partial_cmp(l),
        (Value::String(s), Literal::Str(l)) => Some(s.as_str().cmp(l.as_str())),
        _ => None,
    }
}

fn find_closing_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open..].iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_bracket(inner: &str) -> Result<Step, String> {
    if inner.is_empty() {
        return Err("empty brackets".to_string());
    }
    if inner == "*" {
        return Ok(Step::Wildcard);
    }
    if let Some(filter) = inner.strip_prefix('?') {
        let body = filter
            .trim()
            .strip_prefix('(')
            .and_then(|f| f.strip_suffix(')'))
            .ok_or_else(|| "filter must be written as [?(...)]".to_string())?;
        let conditions = split_unquoted(body, "&&")
            .into_iter()
            .map(parse_condition)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Step::Filter(conditions));
    }
    if let Ok(index) = inner.parse::<i64>() {
        return Ok(Step::Index(index));
    }

    let names: Vec<String> = split_unquoted(inner, ",")
        .into_iter()
        .map(|name| unquote(name.trim()).to_string())
        .filter(|name| !name.is_empty())
        .collect();
    match names.len() {
        0 => Err("empty field union".to_string()),
        1 => Ok(Step::Field(names.into_iter().next().unwrap_or_default())),
        _ => Ok(Step::Union(names)),
    }
}

/// Split on `sep` outside of quoted literals.
fn split_unquoted<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        } else if i >= start && s[i..].starts_with(sep) {
            parts.push(&s[start..i]);
            start = i + sep.len();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_condition(raw: &str) -> Result<Condition, String> {
    let raw = raw.trim();
    let rest = raw
        .strip_prefix("@.")
        .ok_or_else(|| format!("condition '{raw}' must start with '@.'"))?;

    let Some((at, op, width)) = find_operator(rest) else {
        return Ok(Condition {
            field: split_field(rest),
            op: CompareOp::Truthy,
            literal: Literal::Null,
        });
    };

    let field = rest.get(..at).unwrap_or_default().trim();
    let literal = rest.get(at + width..).unwrap_or_default().trim();
    if field.is_empty() {
        return Err(format!("condition '{raw}' has no field"));
    }

    Ok(Condition {
        field: split_field(field),
        op,
        literal: parse_literal(literal)?,
    })
}

fn find_operator(s: &str) -> Option<(usize, CompareOp, usize)> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &c) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        let next = bytes.get(i + 1).copied();
        let found = match (c, next) {
            (b'\'' | b'"', _) => {
                quote = Some(c);
                None
            }
            (b'=', Some(b'=')) => Some((CompareOp::Eq, 2)),
            (b'!', Some(b'=')) => Some((CompareOp::Ne, 2)),
            (b'>', Some(b'=')) => Some((CompareOp::Ge, 2)),
            (b'<', Some(b'=')) => Some((CompareOp::Le, 2)),
            (b'>', _) => Some((CompareOp::Gt, 1)),
            (b'<', _) => Some((CompareOp::Lt, 1)),
            _ => None,
        };
        if let Some((op, width)) = found {
            return Some((i, op, width));
        }
    }
    None
}

fn split_field(field: &str) -> Vec<String> {
    field.split('.').map(|s| s.trim().to_string()).collect()
}

fn parse_literal(raw: &str) -> Result<Literal, String> {
    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        return Ok(Literal::Str(unquote(raw).to_string()));
    }
    match raw {
        "true" | "True" => return Ok(Literal::Bool(true)),
        "false" | "False" => return Ok(Literal::Bool(false)),
        "null" | "None" => return Ok(Literal::Null),
        _ => {}
    }
    raw.parse::<f64>()
        .map(Literal::Num)
        .map_err(|_| format!("unsupported literal '{raw}'"))
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn production_json() -> Value {
        json!({
            "production": [
                {"type": "inverters", "activeCount": 10, "wNow": 1200},
                {"type": "eim", "activeCount": 1, "wNow": 1500, "whToday": 4200,
                 "lines": [{"wNow": 500}, {"wNow": 490}, {"wNow": 510}]}
            ],
            "consumption": [
                {"measurementType": "total-consumption", "activeCount": 1, "wNow": 300},
                {"measurementType": "net-consumption", "activeCount": 1, "wNow": -1200}
            ]
        })
    }

    #[test]
    fn test_field_and_index() {
        let doc = json!({"a": {"b": [10, 20, 30]}});
        assert_eq!(resolve(&doc, "a.b[1]", Value::Null).unwrap(), json!(20));
        assert_eq!(resolve(&doc, "a.b[-1]", Value::Null).unwrap(), json!(30));
        assert_eq!(resolve(&doc, "a.b", Value::Null).unwrap(), json!([10, 20, 30]));
    }

    #[test]
    fn test_missing_segment_returns_default() {
        let doc = production_json();
        assert_eq!(
            resolve(&doc, "storage[0].wNow", json!("fallback")).unwrap(),
            json!("fallback")
        );
        assert_eq!(resolve(&doc, "production[7].wNow", Value::Null).unwrap(), Value::Null);
        assert_eq!(resolve(&json!(42), "a.b", Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_filter_equality() {
        let doc = production_json();
        let value = resolve(&doc, "production[?(@.type=='eim')].wNow", Value::Null).unwrap();
        assert_eq!(value, json!(1500));
    }

    #[test]
    fn test_filter_conjunction_with_spaces() {
        let doc = production_json();
        let expr = "consumption[?(@.measurementType == 'total-consumption' && @.activeCount > 0)].wNow";
        assert_eq!(resolve(&doc, expr, Value::Null).unwrap(), json!(300));

        let expr = "consumption[?(@.measurementType == 'total-consumption' && @.activeCount > 1)].wNow";
        assert_eq!(resolve(&doc, expr, json!(0)).unwrap(), json!(0));
    }

    #[test]
    fn test_dot_before_filter() {
        let doc = json!({"inv": [{"devType": 1, "sn": "a"}, {"devType": 12, "sn": "b"}]});
        let value = resolve(&doc, "inv.[?(@.devType==1)]", Value::Null).unwrap();
        assert_eq!(value, json!({"devType": 1, "sn": "a"}));
    }

    #[test]
    fn test_multiple_matches_return_list() {
        let doc = production_json();
        let value = resolve(&doc, "production[*].type", Value::Null).unwrap();
        assert_eq!(value, json!(["inverters", "eim"]));
        let value = resolve(&doc, "production.*.activeCount", Value::Null).unwrap();
        assert_eq!(value, json!([10, 1]));
    }

    #[test]
    fn test_separators_inside_quotes_are_literal() {
        let doc = json!({
            "meters": [
                {"name": "a&&b", "phases": 3},
                {"name": "a", "phases": 1}
            ],
            "lastReading": {"a,b": 1, "c": 2}
        });
        let value = resolve(&doc, "meters[?(@.name=='a&&b' && @.phases > 1)].phases", Value::Null).unwrap();
        assert_eq!(value, json!(3));

        assert_eq!(resolve(&doc, "lastReading['a,b']", Value::Null).unwrap(), json!(1));
        assert_eq!(
            resolve(&doc, "lastReading['a,b','c']", Value::Null).unwrap(),
            json!([1, 2])
        );
    }

    #[test]
    fn test_resolve_all_keeps_single_match_wrapped() {
        let doc = production_json();
        let all = resolve_all(&doc, "production[?(@.type=='eim')].wNow").unwrap();
        assert_eq!(all, vec![json!(1500)]);
        assert!(resolve_all(&doc, "storage").unwrap().is_empty());
    }

    #[test]
    fn test_trailing_colon_flattens() {
        let doc = json!({"power": {"devices": [{"sn": "1"}, {"sn": "2"}]}});
        let expr = PathExpr::parse("power.devices:").unwrap();
        assert_eq!(expr.matches(&doc).len(), 2);

        let single = json!({"power": {"devices": [{"sn": "1"}]}});
        assert_eq!(expr.resolve(&single, Value::Null), json!({"sn": "1"}));
    }

    #[test]
    fn test_field_union() {
        let doc = json!({"lastReading": {"VrmsL1N": 230_100, "other": 1}});
        let value = resolve(&doc, "lastReading.[voltRmsL1,VrmsL1N]", Value::Null).unwrap();
        assert_eq!(value, json!(230_100));
    }

    #[test]
    fn test_hyphenated_field_and_negation() {
        let doc = json!({"scan": {"polling-period-secs": 900}, "items": [{"k": "x"}, {"k": "y"}]});
        assert_eq!(
            resolve(&doc, "scan.polling-period-secs", Value::Null).unwrap(),
            json!(900)
        );
        assert_eq!(
            resolve(&doc, "items[?(@.k!='x')].k", Value::Null).unwrap(),
            json!("y")
        );
    }

    #[test]
    fn test_resolve_in_store_map() {
        let mut store = Map::new();
        store.insert("production_json".to_string(), production_json());
        let expr = PathExpr::parse("production_json.production[?(@.type=='inverters')].wNow").unwrap();
        assert_eq!(expr.head(), Some("production_json"));
        assert_eq!(expr.resolve_in(&store, Value::Null), json!(1200));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let doc = production_json();
        let expr = PathExpr::parse("production[?(@.type=='eim')].lines[*].wNow").unwrap();
        let first = expr.resolve(&doc, Value::Null);
        let second = expr.resolve(&doc, Value::Null);
        assert_eq!(first, second);
        assert_eq!(first, json!([500, 490, 510]));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(PathExpr::parse("").is_err());
        assert!(PathExpr::parse("a[0").is_err());
        assert!(PathExpr::parse("a..b").is_err());
        assert!(PathExpr::parse("a[?(type=='x')]").is_err());
        assert!(PathExpr::parse("a[?(@.type==x)]").is_err());
    }
}
