use serde_json::Value;

use crate::store::Document;

/// Search filter over document attributes. Attribute paths use `/` to reach
/// nested fields (`targetResource/href`). Renders to the API's filter syntax
/// through `Display` and can be evaluated locally with [`Filter::matches`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    Lt(String, String),
    Prefix(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq(attribute.into(), value.into())
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Lt(attribute.into(), value.into())
    }

    pub fn prefix(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Prefix(attribute.into(), value.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut all) => {
                all.push(other);
                Filter::And(all)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut any) => {
                any.push(other);
                Filter::Or(any)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(attr, value) => lookup(doc, attr).is_some_and(|v| &v == value),
            // Timestamps are RFC 3339 in UTC, so string order is time order.
            Filter::Lt(attr, value) => lookup(doc, attr).is_some_and(|v| v.as_str() < value.as_str()),
            Filter::Prefix(attr, value) => {
                lookup(doc, attr).is_some_and(|v| v.starts_with(value.as_str()))
            }
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
        }
    }
}

fn lookup(doc: &Document, path: &str) -> Option<String> {
    let value = path
        .split('/')
        .try_fold(doc, |current, key| current.get(key))?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Eq(attr, value) => write!(f, "{}=\"{}\"", attr, value),
            Filter::Lt(attr, value) => write!(f, "{}<\"{}\"", attr, value),
            Filter::Prefix(attr, value) => write!(f, "{}^=\"{}\"", attr, value),
            Filter::And(all) => write_joined(f, all, " and "),
            Filter::Or(any) => write_joined(f, any, " or "),
        }
    }
}

fn write_joined(f: &mut std::fmt::Formatter<'_>, filters: &[Filter], sep: &str) -> std::fmt::Result {
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        match filter {
            Filter::And(_) | Filter::Or(_) => write!(f, "({})", filter)?,
            _ => write!(f, "{}", filter)?,
        }
    }
    Ok(())
}
