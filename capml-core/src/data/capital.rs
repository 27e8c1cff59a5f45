//! Capital.com REST client.
//!
//! Blocking HTTP with a cached session (`CST` + `X-SECURITY-TOKEN`),
//! exponential-backoff retries on transient failures, and a shared circuit
//! breaker that enforces the cooldown after a login rate limit.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{Broker, DataError, DealConfirmation, OpenPositionRequest, PageRequest};
use crate::domain::Candle;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LIVE_URL: &str = "https://api-capital.backend-capital.com";
pub const DEMO_URL: &str = "https://demo-api-capital.backend-capital.com";

/// Largest page the prices endpoint serves.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct CapitalCredentials {
    pub api_key: String,
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CapitalSettings {
    pub base_url: String,
    pub session_ttl: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for CapitalSettings {
    fn default() -> Self {
        Self {
            base_url: DEMO_URL.to_string(),
            session_ttl: Duration::from_secs(9 * 60),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    cst: String,
    security_token: String,
    created: Instant,
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    identifier: &'a str,
    password: &'a str,
    #[serde(rename = "encryptedPassword")]
    encrypted_password: bool,
}

#[derive(Debug, Deserialize)]
struct PricesResponse {
    prices: Vec<PriceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceEntry {
    #[serde(rename = "snapshotTimeUTC")]
    snapshot_time_utc: Option<String>,
    snapshot_time: Option<String>,
    open_price: Quote,
    high_price: Quote,
    low_price: Quote,
    close_price: Quote,
    #[serde(default)]
    last_traded_volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    bid: Option<f64>,
    #[serde(alias = "offer")]
    ask: Option<f64>,
}

impl Quote {
    fn mid(&self) -> f64 {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => (b + a) / 2.0,
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => f64::NAN,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketEntry {
    epic: String,
    #[serde(default)]
    instrument_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenBody<'a> {
    epic: &'a str,
    direction: &'a str,
    size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    currency_code: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealResponse {
    deal_reference: Option<String>,
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<PositionEntry>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    market: PositionMarket,
}

#[derive(Debug, Deserialize)]
struct PositionMarket {
    epic: String,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    #[serde(default)]
    preferred: bool,
    balance: AccountBalance,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    balance: f64,
}

/// Parse the broker's timestamp format. UTC is implied when no offset is given.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|n| n.and_utc())
}

fn parse_prices(epic: &str, resp: PricesResponse) -> Result<Vec<Candle>, DataError> {
    let mut candles = Vec::with_capacity(resp.prices.len());
    for p in resp.prices {
        let raw = p
            .snapshot_time_utc
            .as_deref()
            .or(p.snapshot_time.as_deref())
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("{epic}: price without timestamp")))?;
        let time = parse_utc(raw)
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("{epic}: bad timestamp '{raw}'")))?;
        let candle = Candle {
            time,
            open: p.open_price.mid(),
            high: p.high_price.mid(),
            low: p.low_price.mid(),
            close: p.close_price.mid(),
            volume: p.last_traded_volume.unwrap_or(0.0),
        };
        if candle.is_void() {
            continue;
        }
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.time);
    Ok(candles)
}

/// Capital.com broker client.
pub struct CapitalClient {
    client: Client,
    settings: CapitalSettings,
    credentials: CapitalCredentials,
    session: Mutex<Option<Session>>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl CapitalClient {
    pub fn new(
        settings: CapitalSettings,
        credentials: CapitalCredentials,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            credentials,
            session: Mutex::new(None),
            circuit_breaker,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    /// Drop the cached session so the next call logs in again.
    pub fn invalidate_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    fn login(&self) -> Result<Session, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }
        let body = LoginBody {
            identifier: &self.credentials.identifier,
            password: &self.credentials.password,
            encrypted_password: false,
        };
        let resp = self
            .client
            .post(self.url("/api/v1/session"))
            .header("X-CAP-API-KEY", &self.credentials.api_key)
            .json(&body)
            .send()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.trip();
            warn!(
                cooldown_secs = self.circuit_breaker.cooldown().as_secs(),
                "login rate limited; entering cooldown"
            );
            return Err(DataError::RateLimited {
                retry_after_secs: self.circuit_breaker.cooldown().as_secs(),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // bad credentials stay bad; don't hammer the login endpoint
            self.circuit_breaker.trip();
            return Err(DataError::AuthenticationRequired(format!(
                "login rejected with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(DataError::ServerError {
                status: status.as_u16(),
            });
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let (cst, security_token) = match (header("CST"), header("X-SECURITY-TOKEN")) {
            (Some(c), Some(t)) => (c, t),
            _ => {
                return Err(DataError::AuthenticationRequired(
                    "login response missing session tokens".into(),
                ))
            }
        };
        info!(broker = "capital.com", "session established");
        Ok(Session {
            cst,
            security_token,
            created: Instant::now(),
        })
    }

    /// Current session, logging in when absent or older than the TTL.
    fn session(&self) -> Result<Session, DataError> {
        let mut guard = self.session.lock().unwrap();
        if let Some(s) = guard.as_ref() {
            if s.created.elapsed() < self.settings.session_ttl {
                return Ok(s.clone());
            }
            debug!("session expired; refreshing");
        }
        let fresh = self.login()?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Send an authenticated request with retry and circuit breaker logic.
    fn send(&self, label: &str, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let mut last_error = None;
        let mut reauthenticated = false;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.settings.base_delay * 2u32.pow(attempt - 1));
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            let session = self.session()?;
            let result = build(&self.client)
                .header("X-CAP-API-KEY", &self.credentials.api_key)
                .header("CST", &session.cst)
                .header("X-SECURITY-TOKEN", &session.security_token)
                .send();

            let resp = match result {
                Ok(r) => r,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                // Session revoked server-side; log in once more.
                self.invalidate_session();
                reauthenticated = true;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(DataError::AuthenticationRequired(format!("{label}: HTTP {status}")));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                self.circuit_breaker
                    .record_failure(Some(Duration::from_secs(retry_after)));
                last_error = Some(DataError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }
            if status.is_server_error() {
                last_error = Some(DataError::ServerError {
                    status: status.as_u16(),
                });
                continue;
            }
            if status == StatusCode::NOT_FOUND {
                return Err(DataError::SymbolNotFound {
                    symbol: label.to_string(),
                });
            }
            if !status.is_success() {
                let text = resp.text().unwrap_or_default();
                return Err(DataError::Rejected(format!("{label}: HTTP {status}: {text}")));
            }

            self.circuit_breaker.record_success();
            return Ok(resp);
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

impl Broker for CapitalClient {
    fn name(&self) -> &str {
        "capital.com"
    }

    fn fetch_page(&self, req: &PageRequest<'_>) -> Result<Vec<Candle>, DataError> {
        let url = self.url(&format!("/api/v1/prices/{}", req.epic));
        let max = req.page_size.clamp(1, MAX_PAGE_SIZE).to_string();
        let to = req.before.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string());
        let resp = self.send(req.epic, |c| {
            let mut q = vec![
                ("resolution", req.timeframe.broker_resolution().to_string()),
                ("max", max.clone()),
            ];
            if let Some(to) = &to {
                q.push(("to", to.clone()));
            }
            c.get(&url).query(&q)
        })?;
        let body: PricesResponse = resp.json().map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse prices for {}: {e}", req.epic))
        })?;
        parse_prices(req.epic, body)
    }

    fn search_epic(&self, symbol: &str) -> Result<Option<String>, DataError> {
        let url = self.url("/api/v1/markets");
        let resp = self.send(symbol, |c| c.get(&url).query(&[("searchTerm", symbol)]))?;
        let body: MarketsResponse = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("market search for {symbol}: {e}")))?;
        let exact = body
            .markets
            .iter()
            .find(|m| m.epic.eq_ignore_ascii_case(symbol))
            .or_else(|| {
                body.markets.iter().find(|m| {
                    m.instrument_name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(symbol))
                })
            })
            .or_else(|| body.markets.first());
        Ok(exact.map(|m| m.epic.clone()))
    }

    fn open_position(&self, req: &OpenPositionRequest) -> Result<DealConfirmation, DataError> {
        let url = self.url("/api/v1/positions");
        let body = OpenBody {
            epic: &req.epic,
            direction: req.direction.as_str(),
            size: req.size,
            currency_code: req.currency.as_deref(),
        };
        let resp = self.send(&req.epic, |c| c.post(&url).json(&body))?;
        let deal: DealResponse = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("position response: {e}")))?;
        match (deal.deal_reference, deal.error_code) {
            (Some(r), None) => Ok(DealConfirmation { deal_reference: r }),
            (_, Some(code)) => Err(DataError::Rejected(code)),
            (None, None) => Err(DataError::ResponseFormatChanged("no dealReference".into())),
        }
    }

    fn open_epics(&self) -> Result<Vec<String>, DataError> {
        let url = self.url("/api/v1/positions");
        let resp = self.send("positions", |c| c.get(&url))?;
        let body: PositionsResponse = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("positions: {e}")))?;
        Ok(body.positions.into_iter().map(|p| p.market.epic).collect())
    }

    fn account_equity(&self) -> Result<f64, DataError> {
        let url = self.url("/api/v1/accounts");
        let resp = self.send("accounts", |c| c.get(&url))?;
        let body: AccountsResponse = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("accounts: {e}")))?;
        body.accounts
            .iter()
            .find(|a| a.preferred)
            .or_else(|| body.accounts.first())
            .map(|a| a.balance.balance)
            .ok_or_else(|| DataError::ResponseFormatChanged("no accounts".into()))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_naive_and_offset_timestamps() {
        let a = parse_utc("2024-03-01T10:00:00").unwrap();
        let b = parse_utc("2024-03-01T10:00:00Z").unwrap();
        let c = parse_utc("2024-03-01T10:00:00.000").unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert_eq!(c, expected);
        assert!(parse_utc("yesterday").is_none());
    }

    #[test]
    fn prices_use_mid_of_bid_and_offer() {
        let json = r#"{"prices":[
            {"snapshotTimeUTC":"2024-03-01T11:00:00",
             "openPrice":{"bid":1.0,"ask":1.2},
             "highPrice":{"bid":1.4,"offer":1.6},
             "lowPrice":{"bid":0.8,"ask":1.0},
             "closePrice":{"bid":1.1,"ask":1.3},
             "lastTradedVolume":42},
            {"snapshotTimeUTC":"2024-03-01T10:00:00",
             "openPrice":{"bid":1.0,"ask":1.0},
             "highPrice":{"bid":1.0,"ask":1.0},
             "lowPrice":{"bid":1.0,"ask":1.0},
             "closePrice":{"bid":1.0,"ask":1.0}}
        ]}"#;
        let resp: PricesResponse = serde_json::from_str(json).unwrap();
        let candles = parse_prices("EURUSD", resp).unwrap();
        assert_eq!(candles.len(), 2);
        // sorted ascending
        assert!(candles[0].time < candles[1].time);
        assert!((candles[1].open - 1.1).abs() < 1e-12);
        assert!((candles[1].high - 1.5).abs() < 1e-12);
        assert!((candles[1].close - 1.2).abs() < 1e-12);
        assert_eq!(candles[1].volume, 42.0);
        assert_eq!(candles[0].volume, 0.0);
    }

    #[test]
    fn price_without_timestamp_is_format_change() {
        let json = r#"{"prices":[{"openPrice":{"bid":1.0},"highPrice":{"bid":1.0},
            "lowPrice":{"bid":1.0},"closePrice":{"bid":1.0}}]}"#;
        let resp: PricesResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            parse_prices("X", resp),
            Err(DataError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn login_refused_while_cooling_down() {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60)));
        breaker.trip();
        let client = CapitalClient::new(
            CapitalSettings {
                base_url: "http://127.0.0.1:9".into(),
                ..CapitalSettings::default()
            },
            CapitalCredentials {
                api_key: "k".into(),
                identifier: "i".into(),
                password: "p".into(),
            },
            breaker,
        )
        .unwrap();
        assert!(!client.is_available());
        assert!(matches!(
            client.account_equity(),
            Err(DataError::CircuitBreakerTripped)
        ));
    }
}
