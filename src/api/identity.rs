use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

/// Caller identity resolved by the identity middleware. Real authentication
/// lives behind this seam; the default resolver trusts an `x-user-id`
/// header and falls back to an anonymous principal.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

pub const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS: &str = "anonymous";

pub async fn identity_middleware(mut req: Request, next: Next) -> Response {
    let user = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string();
    req.extensions_mut().insert(Identity(user));
    next.run(req).await
}
