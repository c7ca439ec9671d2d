use std::sync::Arc;

use poem::Endpoint;
use poem::Middleware;
use poem::Request;
use poem::Result as PoemResult;
use tracing::warn;

use super::ApiError;

/// Static bearer token authentication middleware
///
/// Without a configured token every request passes.
pub struct ApiTokenMiddleware {
    token: Option<Arc<str>>,
}

impl ApiTokenMiddleware {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

impl<E> Middleware<E> for ApiTokenMiddleware
where E: Endpoint
{
    type Output = ApiTokenEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        ApiTokenEndpoint {
            inner: ep,
            token: self.token.clone(),
        }
    }
}

pub struct ApiTokenEndpoint<E> {
    inner: E,
    token: Option<Arc<str>>,
}

/// Checks the `Authorization` header against `expected`.
fn authorize(header: Option<&str>, expected: &str) -> Result<(), ApiError> {
    let header = header.ok_or(ApiError::MissingAuthHeader)?;
    let presented = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::AuthenticationFailed {
            reason: "invalid authorization header format".to_string(),
        })?;
    if presented.trim() != expected {
        return Err(ApiError::AuthenticationFailed {
            reason: "invalid token".to_string(),
        });
    }
    Ok(())
}

impl<E> Endpoint for ApiTokenEndpoint<E>
where E: Endpoint
{
    type Output = E::Output;

    async fn call(&self, req: Request) -> PoemResult<Self::Output> {
        if let Some(expected) = &self.token {
            let header = req
                .headers()
                .get("authorization")
                .and_then(|h| h.to_str().ok());
            if let Err(err) = authorize(header, expected) {
                warn!(path = %req.uri().path(), "rejected request: {err}");
                return Err(err.into());
            }
        }
        self.inner.call(req).await
    }
}
