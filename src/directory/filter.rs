//! Minimal LDAP search filter representation.
//!
//! Enough of RFC 4515 to express the checkpoint lookup and simple
//! acceptance filters: conjunction, disjunction, equality, presence.

use std::fmt;

use super::entry::Attrs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Eq { attr: String, value: String },
    Present(String),
}

impl Filter {
    pub fn eq(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present(attr.into())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    pub fn matches(&self, attrs: &Attrs) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(attrs)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attrs)),
            Filter::Eq { attr, value } => attrs
                .get(attr)
                .is_some_and(|values| values.iter().any(|v| v == value)),
            Filter::Present(attr) => attrs.contains_key(attr),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Eq { attr, value } => write!(f, "({attr}={value})"),
            Filter::Present(attr) => write!(f, "({attr}=*)"),
        }
    }
}
