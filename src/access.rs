//! Access Gate (spec §4.7, C7).

use crate::error::ObsyncError;
use crate::ids::VaultId;
use crate::principal::{Principal, Scope};
use crate::store::metadata::MetadataStore;

#[derive(Clone)]
pub struct Gate {
    store: MetadataStore,
}

impl Gate {
    pub fn new(store: MetadataStore) -> Self {
        Gate { store }
    }

    /// `RequireScope` (spec §4.7): `admin` satisfies any request;
    /// `read`/`write` are siblings with no implication between them.
    pub fn require_scope(&self, principal: &Principal, requested: Scope) -> Result<(), ObsyncError> {
        if principal.has_scope(requested) {
            Ok(())
        } else {
            Err(ObsyncError::forbidden("principal lacks required scope"))
        }
    }

    /// `RequireVaultOwner` (spec §4.7): absence and ownership mismatch
    /// are deliberately indistinguishable to the caller, so a probing
    /// client cannot learn whether a vault id exists.
    pub async fn require_vault_owner(
        &self,
        vault_id: &VaultId,
        principal: &Principal,
    ) -> Result<(), ObsyncError> {
        match self.store.lookup_vault_owner(vault_id.clone()).await? {
            Some(owner) if owner == principal.user_id => Ok(()),
            _ => Err(ObsyncError::vault_not_found()),
        }
    }

    /// Convenience combining both checks, used by every handler.
    pub async fn admit(
        &self,
        vault_id: &VaultId,
        principal: &Principal,
        requested: Scope,
    ) -> Result<(), ObsyncError> {
        self.require_scope(principal, requested)?;
        self.require_vault_owner(vault_id, principal).await
    }
}
