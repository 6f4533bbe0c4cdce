//! Binance REST Client
//!
//! `reqwest` implementation of the [`RestTransport`] port for the public
//! market-data endpoints.
//!
//! # Endpoints
//!
//! - `GET /api/v3/ticker/24hr?symbol=BTCUSDT`
//! - `GET /api/v3/klines?symbol=BTCUSDT&interval=1m&limit=500`
//! - `GET /api/v3/depth?symbol=BTCUSDT&limit=20`
//!
//! # Failures
//!
//! Non-2xx responses become `FeedError::Http` carrying the status, the
//! `{"code", "msg"}` error body when present and the `Retry-After` header.
//! A success response that is not JSON is treated as malformed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};

use super::messages::{ApiErrorBody, DepthSnapshot, RestKline, RestTicker};
use crate::application::ports::{RestEndpoint, RestRequest, RestTransport};
use crate::domain::market::{Candle, MarketData, Ticker};
use crate::error::FeedError;

/// Parse a `Retry-After` header value given in seconds.
///
/// HTTP-date values are not used by the exchange and yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// REST client for the public market-data API.
#[derive(Clone)]
pub struct BinanceRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for BinanceRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRestClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BinanceRestClient {
    /// Create a client for `base_url` (e.g. `https://api.binance.com`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: RestEndpoint) -> String {
        format!("{}/api/v3/{}", self.base_url, endpoint.path())
    }

    fn query(request: &RestRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![("symbol", request.symbol.to_string())];
        if let Some(interval) = request.interval {
            query.push(("interval", interval.as_str().to_string()));
        }
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }
        query
    }

    fn decode(request: &RestRequest, body: &str) -> Result<MarketData, FeedError> {
        let malformed = |e: serde_json::Error| FeedError::Malformed(e.to_string());

        match request.endpoint {
            RestEndpoint::Ticker24h => {
                let ticker: RestTicker = serde_json::from_str(body).map_err(malformed)?;
                Ok(MarketData::Ticker(Ticker::try_from(ticker)?))
            }
            RestEndpoint::Klines => {
                let rows: Vec<RestKline> = serde_json::from_str(body).map_err(malformed)?;
                let now = Utc::now();
                let candles = rows
                    .into_iter()
                    .map(|row| row.into_candle(now))
                    .collect::<Result<Vec<Candle>, _>>()?;
                Ok(MarketData::Candles(candles))
            }
            RestEndpoint::Depth => {
                let snapshot: DepthSnapshot = serde_json::from_str(body).map_err(malformed)?;
                Ok(MarketData::OrderBook(snapshot.into()))
            }
        }
    }
}

#[async_trait]
impl RestTransport for BinanceRestClient {
    async fn fetch(&self, request: &RestRequest) -> Result<MarketData, FeedError> {
        let url = self.url(request.endpoint);
        tracing::debug!(url = %url, symbol = %request.symbol, "Fetching market data");

        let response = self
            .http
            .get(&url)
            .query(&Self::query(request))
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers();
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response.text().await?;

        if !status.is_success() {
            let api_error = serde_json::from_str::<ApiErrorBody>(&body).ok();
            let message = api_error.as_ref().map_or_else(
                || status.canonical_reason().unwrap_or("request failed").to_string(),
                |e| e.msg.clone(),
            );
            tracing::warn!(
                status = status.as_u16(),
                code = ?api_error.as_ref().map(|e| e.code),
                message = %message,
                "REST request failed"
            );
            return Err(FeedError::Http {
                status: status.as_u16(),
                code: api_error.map(|e| e.code),
                message,
                retry_after,
            });
        }

        if !content_type.contains("json") {
            return Err(FeedError::Malformed(format!(
                "unexpected content type: {content_type:?}"
            )));
        }

        Self::decode(request, &body)
    }
}
