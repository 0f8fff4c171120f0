//! Tenant context extraction.
//!
//! The upstream gateway authenticates the caller and injects the tenant id
//! into the request; in development the `X-Tenant-ID` header stands in.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::error::CoreError;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant identity attached to every admin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantId, CoreError> {
    let value = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::Unauthorized("missing tenant context".to_string()))?;
    let id = Uuid::parse_str(value)
        .map_err(|_| CoreError::invalid_request("tenant id must be a UUID"))?;
    Ok(TenantId(id))
}

/// Resolve the tenant for the request: an extension set by upstream
/// middleware wins, the header is the development fallback.
pub async fn require_tenant(mut request: Request, next: Next) -> Result<Response, CoreError> {
    if request.extensions().get::<TenantId>().is_none() {
        let tenant = tenant_from_headers(request.headers())?;
        request.extensions_mut().insert(tenant);
    }
    Ok(next.run(request).await)
}
