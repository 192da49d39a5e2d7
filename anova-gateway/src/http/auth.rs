//! Request authentication: per-device bearer/query secret, and admin Basic
//! auth bypassed for loopback/private-network callers.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::http::AppState;

/// Constant-time byte comparison, so a wrong secret's matching-prefix length
/// can't be inferred from response latency.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Deserialize)]
pub struct SecretKeyQuery {
    secret_key: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Extracted once a caller has presented a key; route handlers still need to
/// compare it against the specific device's stored secret.
pub struct DeviceSecret(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for DeviceSecret
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(parts) {
            return Ok(DeviceSecret(token));
        }
        let Query(query) = Query::<SecretKeyQuery>::from_request_parts(parts, state)
            .await
            .map_err(|_| GatewayError::Unauthorized)?;
        query.secret_key.map(DeviceSecret).ok_or(GatewayError::Unauthorized)
    }
}

/// Verify `presented` matches `device_id`'s stored secret key.
pub async fn verify_device_secret(
    state: &AppState,
    device_id: &str,
    presented: &DeviceSecret,
) -> Result<(), GatewayError> {
    let device = state
        .manager
        .get_device(device_id)
        .await
        .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;
    if constant_time_eq(presented.0.as_bytes(), device.secret_key.as_bytes()) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized)
    }
}

fn is_private_or_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Marker type proving the admin auth extractor accepted the request.
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ConnectInfo(addr) = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map_err(|_| GatewayError::Unauthorized)?;

        if is_private_or_loopback(addr.ip()) {
            return Ok(AdminAuth);
        }

        if !state.settings.admin_credentials_configured() {
            return Err(GatewayError::Unauthorized);
        }

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthorized)?;
        let encoded = header.strip_prefix("Basic ").ok_or(GatewayError::Unauthorized)?;
        let decoded = BASE64.decode(encoded).map_err(|_| GatewayError::Unauthorized)?;
        let credentials = String::from_utf8(decoded).map_err(|_| GatewayError::Unauthorized)?;
        let (user, pass) = credentials.split_once(':').ok_or(GatewayError::Unauthorized)?;

        let expected_user = state.settings.admin_username.as_deref().unwrap_or("");
        let expected_pass = state.settings.admin_password.as_deref().unwrap_or("");
        if constant_time_eq(user.as_bytes(), expected_user.as_bytes())
            && constant_time_eq(pass.as_bytes(), expected_pass.as_bytes())
        {
            Ok(AdminAuth)
        } else {
            Err(GatewayError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer-string"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_bytes() {
        assert!(constant_time_eq(b"a1b2c3d4e5", b"a1b2c3d4e5"));
    }

    #[test]
    fn loopback_and_private_ranges_bypass_basic_auth() {
        assert!(is_private_or_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_private_or_loopback("10.0.0.5".parse().unwrap()));
        assert!(is_private_or_loopback("192.168.1.1".parse().unwrap()));
        assert!(!is_private_or_loopback("8.8.8.8".parse().unwrap()));
    }
}
