//! Kraken spot REST implementation of [`ExchangeClient`]
//!
//! Private endpoints are signed with HMAC-SHA512:
//! 1. SHA256(nonce + POST data)
//! 2. HMAC-SHA512(uri_path + sha256_digest, base64_decoded_secret)
//! 3. Base64 encode the result into the `API-Sign` header

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};

use super::balance::normalize_pair_code;
use super::errors::{GridError, GridResult};
use super::executor::{ExchangeClient, RetryPolicy};
use super::types::{OrderRecord, OrderRequest, OrderSide};

type HmacSha512 = Hmac<Sha512>;

pub const KRAKEN_REST_URL: &str = "https://api.kraken.com";
pub const API_KEY_ENV: &str = "KRAKEN_API_KEY";
pub const API_SECRET_ENV: &str = "KRAKEN_API_SECRET";

// ============================================================================
// Nonces
// ============================================================================

/// Source of strictly increasing request nonces
pub trait NonceProvider: Send + Sync {
    fn next_nonce(&self) -> u64;
}

/// Nanosecond-clock nonce that never repeats or goes backwards
///
/// With persistence enabled the last nonce survives restarts, so a clock
/// step backwards cannot produce an already-used nonce.
#[derive(Debug)]
pub struct MonotonicNonce {
    last: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl MonotonicNonce {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
            persist_path: None,
        }
    }

    /// Resume from the nonce stored at `path`, and store every new nonce there
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create nonce directory {:?}: {}", parent, e);
            }
        }
        let last = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if last > 0 {
            debug!("Resuming nonce sequence from {:?}", path);
        }
        Self {
            last: AtomicU64::new(last),
            persist_path: Some(path),
        }
    }

    fn clock_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn persist(&self, nonce: u64) {
        if let Some(path) = &self.persist_path {
            if let Err(e) = std::fs::write(path, nonce.to_string()) {
                warn!("Failed to persist nonce to {:?}: {}", path, e);
            }
        }
    }
}

impl Default for MonotonicNonce {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceProvider for MonotonicNonce {
    fn next_nonce(&self) -> u64 {
        let now = Self::clock_nanos();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.persist(next);
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

// ============================================================================
// Signing
// ============================================================================

/// HMAC-SHA512 request signer
#[derive(Clone)]
pub struct KrakenSigner {
    api_key: String,
    api_secret: Vec<u8>,
}

impl std::fmt::Debug for KrakenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenSigner")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl KrakenSigner {
    /// Create a signer from an API key and its base64-encoded secret
    pub fn new(api_key: impl Into<String>, api_secret_b64: impl AsRef<str>) -> GridResult<Self> {
        let api_secret = BASE64
            .decode(api_secret_b64.as_ref().trim())
            .map_err(|e| GridError::Signing(format!("Invalid base64 API secret: {}", e)))?;

        Ok(Self {
            api_key: api_key.into(),
            api_secret,
        })
    }

    /// Load credentials from `KRAKEN_API_KEY` / `KRAKEN_API_SECRET`
    pub fn from_env() -> GridResult<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GridError::MissingCredentials(format!("{} is not set", API_KEY_ENV)))?;
        let api_secret = std::env::var(API_SECRET_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GridError::MissingCredentials(format!("{} is not set", API_SECRET_ENV))
            })?;
        Self::new(api_key.trim(), api_secret)
    }

    /// Sign a private request, returning the `API-Sign` header value
    pub fn sign(&self, uri_path: &str, post_data: &str, nonce: u64) -> GridResult<String> {
        let mut sha256 = Sha256::new();
        sha256.update(nonce.to_string().as_bytes());
        sha256.update(post_data.as_bytes());
        let digest = sha256.finalize();

        let mut mac = HmacSha512::new_from_slice(&self.api_secret)
            .map_err(|e| GridError::Signing(e.to_string()))?;
        mac.update(uri_path.as_bytes());
        mac.update(&digest);

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResult {
    #[serde(default)]
    open: HashMap<String, OpenOrderEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderEntry {
    descr: OrderDescription,
    vol: String,
    #[serde(default)]
    vol_exec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderDescription {
    pair: String,
    #[serde(rename = "type")]
    side: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    /// Last trade closed: [price, lot volume]
    c: Vec<String>,
}

/// Map a Kraken error string onto the engine's error classes
pub fn map_kraken_error(error: &str) -> GridError {
    if error.contains("Rate limit") || error.contains("Too many requests") || error.contains("Temporary lockout") {
        GridError::RateLimited(error.to_string())
    } else if error.starts_with("EAPI:Invalid nonce")
        || error.starts_with("EService:")
        || error.starts_with("EGeneral:Internal error")
    {
        GridError::Transient(error.to_string())
    } else if error.starts_with("EAPI:Invalid key")
        || error.starts_with("EAPI:Invalid signature")
        || error.starts_with("EGeneral:Permission denied")
    {
        GridError::Authentication(error.to_string())
    } else {
        GridError::Rejected(error.to_string())
    }
}

fn parse_response<T: DeserializeOwned>(status: reqwest::StatusCode, body: &str) -> GridResult<T> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GridError::RateLimited(format!("HTTP 429: {}", body)));
    }
    if status.is_server_error() {
        return Err(GridError::Transient(format!("HTTP {}: {}", status.as_u16(), body)));
    }
    if !status.is_success() {
        return Err(GridError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)));
    }

    let response: KrakenResponse<T> = serde_json::from_str(body)
        .map_err(|e| GridError::JsonParse(format!("{} - {}", e, body)))?;

    if let Some(first) = response.error.first() {
        return Err(map_kraken_error(first));
    }

    response
        .result
        .ok_or_else(|| GridError::JsonParse("No result in response".into()))
}

fn parse_open_orders(result: OpenOrdersResult) -> Vec<OrderRecord> {
    let mut orders: Vec<OrderRecord> = result
        .open
        .into_iter()
        .filter_map(|(id, entry)| {
            let Some(side) = OrderSide::parse(&entry.descr.side) else {
                warn!("Order {} has unknown side '{}'", id, entry.descr.side);
                return None;
            };
            let volume = entry.vol.parse::<f64>().ok()?;
            let executed = entry
                .vol_exec
                .as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            let price = entry.descr.price.parse::<f64>().ok()?;
            Some(OrderRecord {
                id,
                pair: entry.descr.pair,
                side,
                volume: (volume - executed).max(0.0),
                price,
            })
        })
        .collect();
    orders.sort_by(|a, b| a.id.cmp(&b.id));
    orders
}

/// Key ticker prices by the requested ids, tolerating canonical renames
fn map_ticker_prices(requested: &[String], entries: HashMap<String, TickerEntry>) -> HashMap<String, f64> {
    let prices: HashMap<String, f64> = entries
        .into_iter()
        .filter_map(|(pair, entry)| {
            let price = entry.c.first()?.parse::<f64>().ok()?;
            Some((pair, price))
        })
        .collect();

    requested
        .iter()
        .filter_map(|wanted| {
            if let Some(price) = prices.get(wanted) {
                return Some((wanted.clone(), *price));
            }
            let normalized = normalize_pair_code(wanted);
            prices
                .iter()
                .find(|(pair, _)| normalize_pair_code(pair) == normalized)
                .map(|(_, price)| (wanted.clone(), *price))
        })
        .collect()
}

// ============================================================================
// Client
// ============================================================================

/// Kraken spot REST client
pub struct KrakenClient {
    http: reqwest::Client,
    base_url: String,
    signer: KrakenSigner,
    nonces: Arc<dyn NonceProvider>,
    retry: RetryPolicy,
}

impl KrakenClient {
    pub fn new(
        base_url: impl Into<String>,
        signer: KrakenSigner,
        nonces: Arc<dyn NonceProvider>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> GridResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GridError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signer,
            nonces,
            retry,
        })
    }

    /// One signed POST attempt with a fresh nonce
    async fn post_private<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> GridResult<T> {
        let nonce = self.nonces.next_nonce();

        let mut post_data = format!("nonce={}", nonce);
        for (key, value) in params {
            post_data.push('&');
            post_data.push_str(key);
            post_data.push('=');
            post_data.push_str(value);
        }

        let signature = self.signer.sign(path, &post_data, nonce)?;
        debug!("POST (private) {}", path);

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("API-Key", self.signer.api_key())
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")
            .body(post_data)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_response(status, &body)
    }

    /// Signed POST with retry
    async fn private<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> GridResult<T> {
        self.retry.run(path, || self.post_private(path, params)).await
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> GridResult<T> {
        debug!("GET (public) {}", path);

        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_response(status, &body)
    }

    async fn cancel_order(&self, txid: &str) -> GridResult<u32> {
        let result: CountResult = self
            .private("/0/private/CancelOrder", &[("txid", txid.to_string())])
            .await?;
        Ok(result.count.max(0) as u32)
    }
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    async fn place_order(&self, request: &OrderRequest) -> GridResult<String> {
        let params = [
            ("pair", request.pair.clone()),
            ("type", request.side.as_str().to_string()),
            ("ordertype", "limit".to_string()),
            ("price", request.price_str()),
            ("volume", request.volume_str()),
        ];

        let result: AddOrderResult = self.private("/0/private/AddOrder", &params).await?;
        result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| GridError::Rejected("AddOrder returned no transaction id".into()))
    }

    async fn cancel_all(&self, pair: Option<&str>) -> GridResult<u32> {
        let Some(pair) = pair else {
            let result: CountResult = self.private("/0/private/CancelAll", &[]).await?;
            info!("Cancelled {} open orders", result.count);
            return Ok(result.count.max(0) as u32);
        };

        let wanted_exact = pair.to_uppercase();
        let wanted = normalize_pair_code(pair);
        let orders = self.get_open_orders().await?;

        let mut cancelled = 0;
        for order in orders.iter().filter(|o| {
            o.pair.to_uppercase() == wanted_exact || normalize_pair_code(&o.pair) == wanted
        }) {
            match self.cancel_order(&order.id).await {
                Ok(count) => cancelled += count,
                Err(e) => warn!("Failed to cancel order {} on {}: {}", order.id, pair, e),
            }
        }

        info!("Cancelled {} open orders on {}", cancelled, pair);
        Ok(cancelled)
    }

    async fn get_open_orders(&self) -> GridResult<Vec<OrderRecord>> {
        let result: OpenOrdersResult = self.private("/0/private/OpenOrders", &[]).await?;
        Ok(parse_open_orders(result))
    }

    async fn get_balances(&self) -> GridResult<HashMap<String, f64>> {
        let result: HashMap<String, String> = self.private("/0/private/Balance", &[]).await?;
        Ok(result
            .into_iter()
            .filter_map(|(asset, amount)| amount.parse::<f64>().ok().map(|a| (asset, a)))
            .collect())
    }

    async fn get_ticker(&self, pairs: &[String]) -> GridResult<HashMap<String, f64>> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }

        let query = [("pair", pairs.join(","))];
        let entries: HashMap<String, TickerEntry> = self
            .retry
            .run("/0/public/Ticker", || self.get_public("/0/public/Ticker", &query))
            .await?;

        Ok(map_ticker_prices(pairs, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_API_KEY: &str = "test_api_key";
    // Base64 encoded "test_secret_key_12345"
    const TEST_API_SECRET_B64: &str = "dGVzdF9zZWNyZXRfa2V5XzEyMzQ1";

    #[test]
    fn test_signer_creation() {
        let signer = KrakenSigner::new(TEST_API_KEY, TEST_API_SECRET_B64).unwrap();
        assert_eq!(signer.api_key(), TEST_API_KEY);
        assert!(!format!("{:?}", signer).contains("test_secret"));
    }

    #[test]
    fn test_invalid_base64_secret() {
        let result = KrakenSigner::new(TEST_API_KEY, "not-valid-base64!!!");
        assert!(matches!(result, Err(GridError::Signing(_))));
    }

    #[test]
    fn test_documented_signature_vector() {
        let signer = KrakenSigner::new(
            "key",
            "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==",
        )
        .unwrap();
        let post_data =
            "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25";

        let signature = signer
            .sign("/0/private/AddOrder", post_data, 1616492376594)
            .unwrap();
        assert_eq!(
            signature,
            "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ=="
        );
    }

    #[test]
    fn test_signature_depends_on_path_and_data() {
        let signer = KrakenSigner::new(TEST_API_KEY, TEST_API_SECRET_B64).unwrap();
        let base = signer.sign("/0/private/Balance", "nonce=1", 1).unwrap();

        assert_eq!(base, signer.sign("/0/private/Balance", "nonce=1", 1).unwrap());
        assert_ne!(base, signer.sign("/0/private/OpenOrders", "nonce=1", 1).unwrap());
        assert_ne!(base, signer.sign("/0/private/Balance", "nonce=2", 2).unwrap());
        assert_eq!(BASE64.decode(&base).unwrap().len(), 64);
    }

    #[test]
    fn test_nonce_strictly_increasing() {
        let nonces = MonotonicNonce::new();
        let mut last = 0;
        for _ in 0..1000 {
            let next = nonces.next_nonce();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_nonce_resumes_from_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".last_nonce");
        let future = MonotonicNonce::clock_nanos() + 1_000_000_000_000;
        std::fs::write(&path, future.to_string()).unwrap();

        let nonces = MonotonicNonce::with_persistence(&path);
        let next = nonces.next_nonce();
        assert_eq!(next, future + 1);

        let stored: u64 = std::fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(stored, next);
    }

    #[test]
    fn test_nonce_persistence_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh").join("data").join(".last_nonce");

        let nonces = MonotonicNonce::with_persistence(&path);
        assert!(path.parent().unwrap().is_dir());

        let next = nonces.next_nonce();
        let stored: u64 = std::fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(stored, next);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(map_kraken_error("EAPI:Rate limit exceeded"), GridError::RateLimited(_)));
        assert!(matches!(map_kraken_error("EAPI:Invalid nonce"), GridError::Transient(_)));
        assert!(matches!(map_kraken_error("EService:Unavailable"), GridError::Transient(_)));
        assert!(matches!(map_kraken_error("EAPI:Invalid key"), GridError::Authentication(_)));
        assert!(matches!(map_kraken_error("EOrder:Insufficient funds"), GridError::Rejected(_)));
        assert!(matches!(
            map_kraken_error("EGeneral:Invalid arguments:volume minimum not met"),
            GridError::Rejected(_)
        ));
    }

    #[test]
    fn test_parse_response_envelope() {
        let ok: HashMap<String, String> = parse_response(
            reqwest::StatusCode::OK,
            r#"{"error":[],"result":{"XXBT":"0.5000000000","ZUSD":"1000.0000"}}"#,
        )
        .unwrap();
        assert_eq!(ok.get("ZUSD").map(String::as_str), Some("1000.0000"));

        let err = parse_response::<CountResult>(
            reqwest::StatusCode::OK,
            r#"{"error":["EOrder:Insufficient funds"]}"#,
        );
        assert!(matches!(err, Err(GridError::Rejected(_))));

        let err = parse_response::<CountResult>(reqwest::StatusCode::BAD_GATEWAY, "bad gateway");
        assert!(matches!(err, Err(GridError::Transient(_))));
    }

    #[test]
    fn test_parse_open_orders_uses_remaining_volume() {
        let body = r#"{"error":[],"result":{"open":{
            "OB5VMB-B4U2U-DK2WRW":{"status":"open","vol":"0.01000000","vol_exec":"0.00400000",
                "descr":{"pair":"ETHUSD","type":"buy","ordertype":"limit","price":"2450.00"}},
            "OQCLML-BW3P3-BUCMWZ":{"status":"open","vol":"25.00000000","vol_exec":"0.00000000",
                "descr":{"pair":"XRPXBT","type":"sell","ordertype":"limit","price":"0.00002500"}}
        }}}"#;

        let result: OpenOrdersResult = parse_response(reqwest::StatusCode::OK, body).unwrap();
        let orders = parse_open_orders(result);

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id, "OB5VMB-B4U2U-DK2WRW");
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!((orders[0].volume - 0.006).abs() < 1e-12);
        assert_eq!(orders[1].pair, "XRPXBT");
        assert_eq!(orders[1].price, 0.000025);
    }

    #[test]
    fn test_ticker_maps_canonical_names_back() {
        let entries: HashMap<String, TickerEntry> = serde_json::from_str(
            r#"{"XXBTZUSD":{"c":["95000.10000","0.001"]},"XETHZUSD":{"c":["3100.5","0.2"]}}"#,
        )
        .unwrap();
        let requested = vec!["XBTUSD".to_string(), "XETHZUSD".to_string(), "SOLUSD".to_string()];

        let prices = map_ticker_prices(&requested, entries);
        assert_eq!(prices.get("XBTUSD"), Some(&95000.1));
        assert_eq!(prices.get("XETHZUSD"), Some(&3100.5));
        assert!(!prices.contains_key("SOLUSD"));
    }
}
