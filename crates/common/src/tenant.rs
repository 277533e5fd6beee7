use serde::{Deserialize, Serialize};

/// Authenticated tenant scope attached to every request by the host's auth
/// layer. Every read and write in the core carries both identifiers; an
/// operation without them is refused before it reaches a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: i64,
    pub workspace_id: i64,
}

impl TenantContext {
    pub fn new(tenant_id: i64, workspace_id: i64) -> Self {
        Self {
            tenant_id,
            workspace_id,
        }
    }
}
