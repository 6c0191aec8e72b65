//! Local directory client seam.

pub mod control;
pub mod entry;
pub mod error;
pub mod filter;

pub use control::Control;
pub use entry::{Attrs, Entry, ModOp, Modification, apply_modifications, to_replace_modifications};
pub use error::DirectoryError;
pub use filter::Filter;

/// LDAP search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Base,
    One,
    Sub,
}

/// Connected, authenticated handle to the downstream directory.
///
/// `connect` embodies the client's own reconnect machinery: it binds with
/// the configured credentials, reads the server version from the root DSE,
/// and retries transient failures forever (each attempt capped by the
/// client's reconnect configuration). It returns an error only for fatal
/// setup problems, such as a server too old to support the
/// checkpoint-update control.
pub trait LocalDirectory {
    fn connect(&mut self) -> Result<(), DirectoryError>;
    fn unbind(&mut self);
    fn destroy(&mut self);
    fn connected(&self) -> bool;
    /// Server version learned from the root DSE during the last successful
    /// connect.
    fn version(&self) -> Option<u32>;
    fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &Filter,
    ) -> Result<Vec<Entry>, DirectoryError>;
    fn add(&mut self, dn: &str, attrs: &Attrs, controls: &[Control])
    -> Result<(), DirectoryError>;
    fn modify(
        &mut self,
        dn: &str,
        mods: &[Modification],
        controls: &[Control],
    ) -> Result<(), DirectoryError>;
    fn del(&mut self, dn: &str, controls: &[Control]) -> Result<(), DirectoryError>;
}
