//! HTTP API for faucet service

use super::batcher::Batcher;
use super::error::{FaucetError, FaucetResult};
use super::limiter::WeightedWindowLimiter;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use faucet_common::{Address, Coin};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const SEND_MONEY_PATH: &str = "/api/v1/faucet/send-money";

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub batcher: Arc<Batcher>,
    pub limiter: Arc<WeightedWindowLimiter<IpAddr>>,
    pub transfer_amount: Coin,
    /// How long a caller waits for its batch before giving up.
    pub request_timeout: Duration,
}

/// Send money request
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMoneyRequest {
    pub address: String,
}

/// Send money response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMoneyResponse {
    pub tx_hash: String,
}

/// Build the faucet router with rate limiting and request tracing.
pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(SEND_MONEY_PATH, post(send_money_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Send money handler
pub async fn send_money_handler(
    State(state): State<AppState>,
    Json(request): Json<SendMoneyRequest>,
) -> FaucetResult<Json<SendMoneyResponse>> {
    let destination = parse_destination(&state, &request.address)?;
    info!(address = %destination, amount = %state.transfer_amount, "Send money request");

    let tx_hash = state
        .batcher
        .send_token_until(
            destination,
            state.transfer_amount.clone(),
            tokio::time::sleep(state.request_timeout),
        )
        .await
        .map_err(|e| {
            warn!(address = %destination, "Send money failed: {}", e);
            e
        })?;

    Ok(Json(SendMoneyResponse { tx_hash }))
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Root handler with info
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Testnet faucet batching transfers across funding accounts",
        "endpoints": {
            "POST /api/v1/faucet/send-money": "Request tokens",
            "GET /health": "Health check"
        }
    }))
}

/// Rejects callers that used up their rate limit. Reads pass through, as do
/// callers on private, loopback and link-local addresses.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, FaucetError> {
    if request.method() == Method::GET {
        return Ok(next.run(request).await);
    }

    let connect_info = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let ip = client_ip(request.headers(), connect_info)
        .ok_or_else(|| FaucetError::Internal("unable to determine caller address".to_string()))?;

    if !is_exempt(&ip) && !state.limiter.allow(ip) {
        warn!(ip = %ip, "Rate limit exhausted");
        return Err(FaucetError::LimitExhausted(format!(
            "ip {} has already used its rate limit",
            ip
        )));
    }

    debug!(ip = %ip, "Rate limit passed");
    Ok(next.run(request).await)
}

/// Address the rate limit is keyed on.
///
/// `X-Forwarded-For` is only read when the peer is itself a private or
/// loopback proxy; the right-most hop outside those ranges is the caller.
/// Any other peer is keyed on its own address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let peer = peer?.ip();
    if !is_exempt(&peer) {
        return Some(peer);
    }

    let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) else {
        return Some(peer);
    };
    for hop in forwarded.rsplit(',') {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if is_exempt(&ip) => continue,
            Ok(ip) => return Some(ip),
            // hops left of a malformed entry cannot be attributed
            Err(_) => break,
        }
    }
    Some(peer)
}

fn is_exempt(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_exempt(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            v6.is_loopback() || unique_local || link_local
        }
    }
}

fn parse_destination(state: &AppState, raw: &str) -> FaucetResult<Address> {
    let address: Address = raw.parse()?;

    if address.is_zero() {
        return Err(FaucetError::InvalidAddress("Zero address not allowed".to_string()));
    }
    if state.batcher.funding_identities().contains(&address) {
        return Err(FaucetError::InvalidAddress(
            "Cannot send to a faucet funding address".to_string(),
        ));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_client_ip_ignores_header_from_public_peer() {
        let peer: SocketAddr = "198.51.100.7:4000".parse().unwrap();

        assert_eq!(client_ip(&forwarded("10.0.0.1"), Some(peer)), Some(peer.ip()));
        assert_eq!(
            client_ip(&forwarded("10.0.0.1, 198.51.100.8"), Some(peer)),
            Some(peer.ip())
        );
    }

    #[test]
    fn test_client_ip_uses_rightmost_untrusted_hop_behind_proxy() {
        let proxy: SocketAddr = "10.0.0.9:4000".parse().unwrap();

        assert_eq!(
            client_ip(&forwarded("203.0.113.1, 198.51.100.7, 10.0.0.1"), Some(proxy)),
            Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
        );
        // a spoofed private entry left of the real caller changes nothing
        assert_eq!(
            client_ip(&forwarded("10.0.0.1, 198.51.100.7"), Some(proxy)),
            Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let proxy: SocketAddr = "10.0.0.9:4000".parse().unwrap();

        assert_eq!(client_ip(&HeaderMap::new(), Some(proxy)), Some(proxy.ip()));
        assert_eq!(client_ip(&forwarded("garbage"), Some(proxy)), Some(proxy.ip()));
        assert_eq!(client_ip(&forwarded("10.0.0.1, 10.0.0.2"), Some(proxy)), Some(proxy.ip()));
        assert_eq!(client_ip(&forwarded("198.51.100.7"), None), None);
    }

    #[test]
    fn test_exempt_ranges() {
        assert!(is_exempt(&"10.1.2.3".parse().unwrap()));
        assert!(is_exempt(&"192.168.0.10".parse().unwrap()));
        assert!(is_exempt(&"127.0.0.1".parse().unwrap()));
        assert!(is_exempt(&"169.254.10.1".parse().unwrap()));
        assert!(is_exempt(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_exempt(&"fd00::1".parse().unwrap()));
        assert!(is_exempt(&"fe80::1".parse().unwrap()));
        assert!(is_exempt(&"::ffff:10.0.0.1".parse().unwrap()));

        assert!(!is_exempt(&"8.8.8.8".parse().unwrap()));
        assert!(!is_exempt(&"2001:db8::1".parse().unwrap()));
    }
}
