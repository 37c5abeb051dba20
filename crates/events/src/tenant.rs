use courier_core::TenantId;

use crate::Notification;

/// Helper trait for tenant-scoped messages.
///
/// Consumers that serve a single tenant (for example a per-tenant SSE stream)
/// use this to drop messages that belong to other tenants.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for Notification {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
