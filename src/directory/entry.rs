//! Directory entries and LDAP modification semantics.

use std::collections::BTreeMap;

/// Attribute map of a directory entry. Attributes are multi-valued.
pub type Attrs = BTreeMap<String, Vec<String>>;

/// A directory entry as returned by a search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attrs: Attrs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

/// A single LDAP modification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Modification {
    pub op: ModOp,
    pub attr: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn add(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op: ModOp::Add,
            attr: attr.into(),
            values,
        }
    }

    pub fn delete(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op: ModOp::Delete,
            attr: attr.into(),
            values,
        }
    }

    pub fn replace(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op: ModOp::Replace,
            attr: attr.into(),
            values,
        }
    }
}

/// Apply standard LDAP modification semantics to a copy of `attrs`.
///
/// Starting from an empty map this synthesizes the entry a modify stream
/// would have produced, which is how replays over missing entries converge.
pub fn apply_modifications(attrs: &Attrs, mods: &[Modification]) -> Attrs {
    let mut out = attrs.clone();
    for m in mods {
        match m.op {
            ModOp::Add => {
                let slot = out.entry(m.attr.clone()).or_default();
                for value in &m.values {
                    if !slot.contains(value) {
                        slot.push(value.clone());
                    }
                }
            }
            ModOp::Delete => {
                if m.values.is_empty() {
                    out.remove(&m.attr);
                } else {
                    let emptied = match out.get_mut(&m.attr) {
                        Some(slot) => {
                            slot.retain(|v| !m.values.contains(v));
                            slot.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        out.remove(&m.attr);
                    }
                }
            }
            ModOp::Replace => {
                if m.values.is_empty() {
                    out.remove(&m.attr);
                } else {
                    out.insert(m.attr.clone(), m.values.clone());
                }
            }
        }
    }
    out
}

/// Rewrite a full attribute set as one replace modification per attribute.
pub fn to_replace_modifications(attrs: &Attrs) -> Vec<Modification> {
    attrs
        .iter()
        .map(|(attr, values)| Modification::replace(attr.clone(), values.clone()))
        .collect()
}
