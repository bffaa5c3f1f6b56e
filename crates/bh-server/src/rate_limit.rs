//! Fixed-window rate limiting for the unauthenticated bootstrap endpoint.
//!
//! `/v1/init` mints credentials and must not be free to hammer. The counter
//! lives in Redis (`INCR` + `EXPIRE`) so the limit holds across replicas.
//! The limiter fails open: if Redis is unreachable, bootstrap availability
//! wins over strictness and the request proceeds with a warning.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::error::{ApiError, ApiResult};

/// Best-effort client identity for rate limiting: the first hop of
/// `X-Forwarded-For` when a proxy supplied it, otherwise the peer address.
/// Falls back to a shared bucket when neither is available (e.g. the router
/// is embedded without connect info).
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let ip = forwarded.unwrap_or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        });
        Ok(ClientIp(ip))
    }
}

/// Requests allowed per client per window.
const INIT_LIMIT_PER_WINDOW: i64 = 30;

/// Window length in seconds.
const INIT_WINDOW_SECONDS: i64 = 60;

pub async fn enforce_init_rate_limit(
    conn: &mut ConnectionManager,
    client_ip: &str,
) -> ApiResult<()> {
    let key = format!("ratelimit:init:{client_ip}");

    let count: i64 = match redis::pipe()
        .atomic()
        .cmd("INCR")
        .arg(&key)
        .cmd("EXPIRE")
        .arg(&key)
        .arg(INIT_WINDOW_SECONDS)
        .arg("NX")
        .ignore()
        .query_async::<(i64,)>(conn)
        .await
    {
        Ok((count,)) => count,
        Err(err) => {
            warn!(error = %err, "init rate limiter unavailable, allowing request");
            return Ok(());
        }
    };

    if count > INIT_LIMIT_PER_WINDOW {
        return Err(ApiError::TooManyRequests(
            "Too many init requests; retry in a minute".into(),
        ));
    }
    Ok(())
}
