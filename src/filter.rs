//! Row filters in the `column=op.value` form used by realtime bindings
//! (`id=eq.5`, `status=in.(open,closed)`).

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

fn filter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\w+)=(eq|neq|lt|lte|gt|gte|in)\.(.+)$").expect("filter regex is valid")
    })
}

impl RowFilter {
    pub fn parse(raw: &str) -> Result<Self, RealtimeError> {
        let caps = filter_regex()
            .captures(raw.trim())
            .ok_or_else(|| RealtimeError::InvalidFilter(raw.to_string()))?;

        let op = match &caps[2] {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            _ => FilterOp::In,
        };

        let rest = &caps[3];
        let values = if op == FilterOp::In {
            let inner = rest
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| RealtimeError::InvalidFilter(raw.to_string()))?;
            inner.split(',').map(|v| v.trim().to_string()).collect()
        } else {
            vec![rest.to_string()]
        };

        Ok(Self { column: caps[1].to_string(), op, values })
    }

    /// Evaluate against a row object. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(cell) = row.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => compare(cell, &self.values[0]) == Some(Ordering::Equal),
            FilterOp::Neq => compare(cell, &self.values[0]) != Some(Ordering::Equal),
            FilterOp::Lt => compare(cell, &self.values[0]) == Some(Ordering::Less),
            FilterOp::Lte => matches!(compare(cell, &self.values[0]), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt => compare(cell, &self.values[0]) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(compare(cell, &self.values[0]), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::In => self.values.iter().any(|v| compare(cell, v) == Some(Ordering::Equal)),
        }
    }
}

fn compare(cell: &Value, literal: &str) -> Option<Ordering> {
    match cell {
        Value::Number(n) => {
            let lhs = n.as_f64()?;
            let rhs = literal.parse::<f64>().ok()?;
            lhs.partial_cmp(&rhs)
        }
        Value::String(s) => Some(s.as_str().cmp(literal)),
        Value::Bool(b) => Some(b.to_string().as_str().cmp(literal)),
        Value::Null => (literal == "null").then_some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_and_matches_equality() {
        let filter = RowFilter::parse("id=eq.5").unwrap();
        assert_eq!(filter.column, "id");
        assert!(filter.matches(&json!({ "id": 5 })));
        assert!(!filter.matches(&json!({ "id": 6 })));
        assert!(!filter.matches(&json!({ "name": "x" })));
    }

    #[test]
    fn in_lists_and_ranges() {
        let status = RowFilter::parse("status=in.(draft, confirmed)").unwrap();
        assert!(status.matches(&json!({ "status": "confirmed" })));
        assert!(!status.matches(&json!({ "status": "cancelled" })));

        let crew = RowFilter::parse("crew_size=gte.4").unwrap();
        assert!(crew.matches(&json!({ "crew_size": 4 })));
        assert!(!crew.matches(&json!({ "crew_size": 3 })));
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(matches!(RowFilter::parse("id=5"), Err(RealtimeError::InvalidFilter(_))));
        assert!(RowFilter::parse("id=like.%x%").is_err());
        assert!(RowFilter::parse("id=in.1,2").is_err());
    }
}
