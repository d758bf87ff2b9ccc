use std::ops::Deref;
use std::sync::Arc;

use dashmap::DashMap;

use crate::Result;
use crate::isolation::context::{IsolationContext, validate_scope};
use crate::models::{IsolationMode, ServerId, ServerProfile, TenantId};
use crate::store::TenantDirectory;

type ActiveMap = DashMap<(TenantId, ServerId), usize>;

/// Hands out scoped isolation contexts and tracks how many are live per scope.
///
/// Constructed explicitly and shared by `Arc`; there is no process-wide instance.
pub struct IsolationManager {
    directory: Arc<dyn TenantDirectory>,
    active: Arc<ActiveMap>,
}

impl IsolationManager {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self {
            directory,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Open a context for (tenant, server).
    ///
    /// The profile's mode is copied into the context when the lookup succeeds. A failed
    /// lookup is logged and leaves the context in `standard` mode without a profile.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn enter(
        &self,
        tenant_id: TenantId,
        server_id: impl Into<ServerId> + std::fmt::Debug,
    ) -> Result<ScopedContext> {
        let server_id = server_id.into();
        validate_scope(tenant_id, &server_id)?;

        let profile = match self.directory.get_profile(tenant_id, &server_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%tenant_id, %server_id, error = %e, "profile lookup failed");
                None
            }
        };
        let mode = profile
            .as_ref()
            .map(|p| p.mode)
            .unwrap_or(IsolationMode::Standard);
        let context = IsolationContext::new(tenant_id, server_id.clone(), mode)?;

        *self.active.entry((tenant_id, server_id)).or_insert(0) += 1;
        tracing::debug!(%tenant_id, mode = %mode, "isolation context entered");

        Ok(ScopedContext {
            context,
            profile,
            active: self.active.clone(),
            released: false,
        })
    }

    pub fn active_contexts(&self, tenant_id: TenantId, server_id: &ServerId) -> usize {
        self.active
            .get(&(tenant_id, server_id.clone()))
            .map(|n| *n)
            .unwrap_or(0)
    }
}

/// A live isolation context. Released exactly once, by `exit()` or on drop.
pub struct ScopedContext {
    context: IsolationContext,
    profile: Option<ServerProfile>,
    active: Arc<ActiveMap>,
    released: bool,
}

impl ScopedContext {
    pub fn context(&self) -> &IsolationContext {
        &self.context
    }

    /// Profile found when the context was entered.
    pub fn profile(&self) -> Option<&ServerProfile> {
        self.profile.as_ref()
    }

    pub fn exit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let key = (self.context.tenant_id(), self.context.server_id().clone());
        if let Some(mut n) = self.active.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
        self.active.remove_if(&key, |_, n| *n == 0);
        tracing::debug!(
            tenant_id = %self.context.tenant_id(),
            server_id = %self.context.server_id(),
            "isolation context released"
        );
    }
}

impl Deref for ScopedContext {
    type Target = IsolationContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Drop for ScopedContext {
    fn drop(&mut self) {
        self.release();
    }
}
