//! Per-change application against the local directory.
//!
//! Adds, modifies, and deletes from a remote changelog are translated into
//! whatever local operation converges the local copy, honoring the remote's
//! acceptance filter. Categorized permanent errors are logged and skipped so
//! the stream keeps advancing; everything else propagates for retry.

use crate::directory::{
    Attrs, Control, DirectoryError, Filter, LocalDirectory, Modification, Scope,
    apply_modifications, to_replace_modifications,
};
use crate::remote::{Change, ChangePayload, Matcher, matches_any};

/// How a change was absorbed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A local write carried the checkpoint update.
    Applied,
    /// No local write happened (filtered out or a permanent per-entry
    /// error); the checkpoint must be advanced separately.
    Skipped,
}

pub fn apply_change<C: LocalDirectory>(
    client: &mut C,
    queries: &[Box<dyn Matcher>],
    change: &Change,
    controls: &[Control],
) -> Result<ApplyOutcome, DirectoryError> {
    match &change.payload {
        ChangePayload::Add(attrs) => add(client, &change.targetdn, attrs, controls),
        ChangePayload::Modify(mods) => modify(client, queries, &change.targetdn, mods, controls),
        ChangePayload::Delete => delete(client, queries, &change.targetdn, controls),
    }
}

fn add<C: LocalDirectory>(
    client: &mut C,
    dn: &str,
    attrs: &Attrs,
    controls: &[Control],
) -> Result<ApplyOutcome, DirectoryError> {
    match client.add(dn, attrs, controls) {
        Ok(()) => Ok(ApplyOutcome::Applied),
        Err(DirectoryError::EntryAlreadyExists(_)) => {
            // Replays converge existing state to the remote's latest values.
            let mods = to_replace_modifications(attrs);
            match client.modify(dn, &mods, controls) {
                Ok(()) => Ok(ApplyOutcome::Applied),
                Err(DirectoryError::ConstraintViolation(reason)) => {
                    tracing::error!(%dn, %reason, "constraint violation rewriting add; skipping entry");
                    Ok(ApplyOutcome::Skipped)
                }
                Err(err) => Err(err),
            }
        }
        Err(DirectoryError::ConstraintViolation(reason)) => {
            tracing::error!(%dn, %reason, "constraint violation on add; skipping entry");
            Ok(ApplyOutcome::Skipped)
        }
        Err(err) => Err(err),
    }
}

fn modify<C: LocalDirectory>(
    client: &mut C,
    queries: &[Box<dyn Matcher>],
    dn: &str,
    mods: &[Modification],
    controls: &[Control],
) -> Result<ApplyOutcome, DirectoryError> {
    match fetch(client, dn)? {
        Some(old) => {
            let new = apply_modifications(&old, mods);
            if matches_any(queries, &new) {
                client.modify(dn, mods, controls)?;
                Ok(ApplyOutcome::Applied)
            } else if matches_any(queries, &old) {
                // The change moved the entry outside the acceptance filter.
                client.del(dn, controls)?;
                Ok(ApplyOutcome::Applied)
            } else {
                // A local entry matching no filter should not exist.
                tracing::error!(%dn, "modify target matches no acceptance filter; ignoring");
                Ok(ApplyOutcome::Skipped)
            }
        }
        None => {
            let new = apply_modifications(&Attrs::new(), mods);
            if matches_any(queries, &new) {
                client.add(dn, &new, controls)?;
                Ok(ApplyOutcome::Applied)
            } else {
                Ok(ApplyOutcome::Skipped)
            }
        }
    }
}

fn delete<C: LocalDirectory>(
    client: &mut C,
    queries: &[Box<dyn Matcher>],
    dn: &str,
    controls: &[Control],
) -> Result<ApplyOutcome, DirectoryError> {
    let Some(attrs) = fetch(client, dn)? else {
        return Ok(ApplyOutcome::Skipped);
    };
    if !matches_any(queries, &attrs) {
        return Ok(ApplyOutcome::Skipped);
    }
    match client.del(dn, controls) {
        Ok(()) => Ok(ApplyOutcome::Applied),
        Err(DirectoryError::NotAllowedOnNonLeaf(_)) => {
            // Orphaned children are handled when their own changes arrive.
            tracing::warn!(%dn, "delete target has children; leaving in place");
            Ok(ApplyOutcome::Skipped)
        }
        Err(err) => Err(err),
    }
}

fn fetch<C: LocalDirectory>(
    client: &mut C,
    dn: &str,
) -> Result<Option<Attrs>, DirectoryError> {
    match client.search(dn, Scope::Base, &Filter::present("objectclass")) {
        Ok(entries) => Ok(entries.into_iter().next().map(|entry| entry.attrs)),
        Err(DirectoryError::NoSuchObject(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
