//! Checkpoint records in the local directory.
//!
//! Each remote owns one record naming the last changenumber applied for it.
//! The record is created on first start and thereafter advanced by the
//! checkpoint-update control riding on every local write, or directly for
//! changes that produce no local write.

use thiserror::Error;
use uuid::Uuid;

use crate::directory::{
    Attrs, DirectoryError, Filter, LocalDirectory, Modification, Scope,
};
use crate::remote::RemoteIdentity;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("multiple checkpoint records for {url} under {base}")]
    Ambiguous { url: String, base: String },
    #[error("checkpoint record {dn} has unparseable changenumber {value:?}")]
    BadChangenumber { dn: String, value: Option<String> },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Location and position of one remote's checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub dn: String,
    pub changenumber: u64,
}

/// The two checkpoint schemas: uuid-keyed (preferred) and the legacy
/// url-hash form.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CheckpointKey {
    Uuid(Uuid),
    LegacyUid(String),
}

impl CheckpointKey {
    fn for_identity(identity: &RemoteIdentity) -> Self {
        match identity.uuid {
            Some(uuid) => CheckpointKey::Uuid(uuid),
            None => {
                CheckpointKey::LegacyUid(format!("{:x}", md5::compute(identity.url.as_bytes())))
            }
        }
    }

    fn rdn(&self) -> String {
        match self {
            CheckpointKey::Uuid(uuid) => format!("uuid={uuid}"),
            CheckpointKey::LegacyUid(uid) => format!("uid={uid}"),
        }
    }
}

/// DN at which `identity`'s checkpoint record lives under `base`.
pub fn dn_for(base: &str, identity: &RemoteIdentity) -> String {
    format!("{}, {}", CheckpointKey::for_identity(identity).rdn(), base)
}

fn lookup_filter(objectclass: &str, identity: &RemoteIdentity) -> Filter {
    // objectclass repeated in each disjunct so the backing store can serve
    // every branch from its objectclass index.
    let mut disjuncts = vec![Filter::and(vec![
        Filter::eq("objectclass", objectclass),
        Filter::eq("url", identity.url.as_str()),
    ])];
    if let Some(uuid) = identity.uuid {
        disjuncts.push(Filter::and(vec![
            Filter::eq("objectclass", objectclass),
            Filter::eq("uuid", uuid.to_string()),
        ]));
    }
    if disjuncts.len() == 1 {
        disjuncts.remove(0)
    } else {
        Filter::or(disjuncts)
    }
}

/// Locate the checkpoint record for `identity`, creating it at
/// `changenumber = 0` when absent. More than one match is fatal.
pub fn init<C: LocalDirectory>(
    client: &mut C,
    base: &str,
    objectclass: &str,
    identity: &RemoteIdentity,
    raw_queries: &[String],
) -> Result<CheckpointRecord, CheckpointError> {
    let filter = lookup_filter(objectclass, identity);
    let matches = match client.search(base, Scope::Sub, &filter) {
        Ok(entries) => entries,
        Err(DirectoryError::NoSuchObject(_)) => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    match matches.as_slice() {
        [] => add(client, base, objectclass, identity, raw_queries),
        [entry] => {
            let value = entry
                .attrs
                .get("changenumber")
                .and_then(|values| values.first())
                .cloned();
            let changenumber = value
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| CheckpointError::BadChangenumber {
                    dn: entry.dn.clone(),
                    value: value.clone(),
                })?;
            tracing::debug!(url = %identity.url, dn = %entry.dn, changenumber, "checkpoint found");
            Ok(CheckpointRecord {
                dn: entry.dn.clone(),
                changenumber,
            })
        }
        _ => Err(CheckpointError::Ambiguous {
            url: identity.url.clone(),
            base: base.to_string(),
        }),
    }
}

fn add<C: LocalDirectory>(
    client: &mut C,
    base: &str,
    objectclass: &str,
    identity: &RemoteIdentity,
    raw_queries: &[String],
) -> Result<CheckpointRecord, CheckpointError> {
    let key = CheckpointKey::for_identity(identity);
    let dn = format!("{}, {}", key.rdn(), base);

    let mut attrs = Attrs::new();
    attrs.insert("objectclass".into(), vec![objectclass.to_string()]);
    attrs.insert("url".into(), vec![identity.url.clone()]);
    attrs.insert("changenumber".into(), vec!["0".into()]);
    if !raw_queries.is_empty() {
        attrs.insert("query".into(), raw_queries.to_vec());
    }
    match &key {
        CheckpointKey::Uuid(uuid) => {
            attrs.insert("uuid".into(), vec![uuid.to_string()]);
        }
        CheckpointKey::LegacyUid(uid) => {
            attrs.insert("uid".into(), vec![uid.clone()]);
        }
    }

    client.add(&dn, &attrs, &[])?;
    tracing::info!(url = %identity.url, %dn, "checkpoint created");
    Ok(CheckpointRecord { dn, changenumber: 0 })
}

/// Advance a checkpoint directly. Used for changes that produce no local
/// write to carry the checkpoint-update control.
pub fn update<C: LocalDirectory>(
    client: &mut C,
    dn: &str,
    changenumber: u64,
) -> Result<(), DirectoryError> {
    client.modify(
        dn,
        &[Modification::replace(
            "changenumber",
            vec![changenumber.to_string()],
        )],
        &[],
    )
}
