use crate::models::{IsolationMode, ServerId, ServerProfile, TenantId};
use crate::store::PlayerStats;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Implemented by every persisted entity so boundary checks are typed.
pub trait HasTenantScope {
    fn tenant_id(&self) -> TenantId;
    fn server_id(&self) -> &ServerId;
}

impl HasTenantScope for ServerProfile {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn server_id(&self) -> &ServerId {
        &self.server_id
    }
}

impl HasTenantScope for PlayerStats {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn server_id(&self) -> &ServerId {
        &self.server_id
    }
}

/// The (tenant, server) scope and access policy of one operation.
///
/// Passed explicitly through every call chain; never stored ambiently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationContext {
    tenant_id: TenantId,
    server_id: ServerId,
    mode: IsolationMode,
}

impl IsolationContext {
    pub fn new(
        tenant_id: TenantId,
        server_id: impl Into<ServerId>,
        mode: IsolationMode,
    ) -> Result<Self> {
        let server_id = server_id.into();
        validate_scope(tenant_id, &server_id)?;
        Ok(Self {
            tenant_id,
            server_id,
            mode,
        })
    }

    pub fn for_profile(profile: &ServerProfile) -> Result<Self> {
        Self::new(profile.tenant_id, profile.server_id.clone(), profile.mode)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn is_restricted(&self) -> bool {
        self.mode.is_restricted()
    }

    pub fn verify_boundary(&self, tenant_id: TenantId, server_id: &ServerId) -> bool {
        self.tenant_id == tenant_id && &self.server_id == server_id
    }

    pub fn verify_entity(&self, entity: &impl HasTenantScope) -> bool {
        self.verify_boundary(entity.tenant_id(), entity.server_id())
    }

    /// `verify_entity`, failing with `Unauthorized` on mismatch.
    pub fn ensure_entity(&self, entity: &impl HasTenantScope) -> Result<()> {
        if self.verify_entity(entity) {
            return Ok(());
        }
        tracing::warn!(
            tenant_id = %self.tenant_id,
            server_id = %self.server_id,
            entity_tenant_id = %entity.tenant_id(),
            entity_server_id = %entity.server_id(),
            "tenant boundary violation"
        );
        Err(Error::Unauthorized(format!(
            "entity {}/{} is outside scope {}/{}",
            entity.tenant_id(),
            entity.server_id(),
            self.tenant_id,
            self.server_id
        )))
    }
}

pub(crate) fn validate_scope(tenant_id: TenantId, server_id: &ServerId) -> Result<()> {
    if !tenant_id.is_valid() {
        return Err(Error::InvalidScope(format!(
            "tenant id must be > 0, got {tenant_id}"
        )));
    }
    if server_id.is_blank() {
        return Err(Error::InvalidScope("server id is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_scope() {
        assert!(matches!(
            IsolationContext::new(TenantId(-4), "s1", IsolationMode::Standard),
            Err(Error::InvalidScope(_))
        ));
        assert!(matches!(
            IsolationContext::new(TenantId(4), "", IsolationMode::Standard),
            Err(Error::InvalidScope(_))
        ));
    }

    #[test]
    fn boundary_requires_both_ids() {
        let ctx = IsolationContext::new(TenantId(10), "alpha", IsolationMode::Standard).unwrap();
        assert!(ctx.verify_boundary(TenantId(10), &ServerId::from("alpha")));
        assert!(!ctx.verify_boundary(TenantId(11), &ServerId::from("alpha")));
        assert!(!ctx.verify_boundary(TenantId(10), &ServerId::from("beta")));
    }

    #[test]
    fn foreign_entity_is_unauthorized() {
        let ctx = IsolationContext::new(TenantId(10), "alpha", IsolationMode::Standard).unwrap();
        let other =
            ServerProfile::new(TenantId(11), "alpha", "Other", IsolationMode::Standard, None)
                .unwrap();
        assert!(matches!(ctx.ensure_entity(&other), Err(Error::Unauthorized(_))));
    }
}
