use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

/// Extracts the authenticated tenant scope injected by the host's auth
/// layer. The core refuses any request lacking either identifier.
pub async fn tenant_context(mut request: Request, next: Next) -> Response {
    let parse_header = |name: &str| -> Option<i64> {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|id| *id > 0)
    };

    let (Some(tenant_id), Some(workspace_id)) =
        (parse_header("x-tenant-id"), parse_header("x-workspace-id"))
    else {
        return AppError::Unauthorized(
            "Missing or invalid tenant context headers".to_string(),
        )
        .into_response();
    };

    request
        .extensions_mut()
        .insert(TenantContext::new(tenant_id, workspace_id));

    next.run(request).await
}
