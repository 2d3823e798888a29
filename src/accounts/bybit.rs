//! Bybit v5 linear perpetuals adapter.

use crate::accounts::error::ExchangeError;
use crate::accounts::traits::AccountProcessor;
use crate::accounts::types::{MarginMode, OrderSide, PositionState, SymbolSpec};
use crate::config::AccountCredentials;
use crate::utils::decimal::{chunk_quantity, quantize_order};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

const MAINNET_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";
const SETTLE_COIN: &str = "USDT";
/// Pause between chunk orders so the venue's matching keeps up.
const CHUNK_PAUSE: Duration = Duration::from_millis(100);

// Application retCodes the adapter special-cases.
const RET_OK: i64 = 0;
const RET_RATE_LIMITED: i64 = 10006;
const RET_INVALID_KEY: i64 = 10003;
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;
const RET_MARGIN_MODE_NOT_MODIFIED: i64 = 110026;
const RET_POSITION_BLOCKS_SWITCH: i64 = 110024;

/// Signed REST client for the Bybit v5 API.
pub struct BybitClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BybitList<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletBalance {
    #[serde(with = "rust_decimal::serde::str")]
    total_equity: Decimal,
}

/// One entry of `/v5/position/list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    symbol: String,
    side: String,
    #[serde(with = "rust_decimal::serde::str")]
    size: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    leverage: Decimal,
    /// 0 = cross, 1 = isolated.
    trade_mode: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(with = "rust_decimal::serde::str")]
    qty_step: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    min_order_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    max_mkt_order_qty: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    #[serde(with = "rust_decimal::serde::str")]
    tick_size: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverageFilter {
    #[serde(with = "rust_decimal::serde::str")]
    max_leverage: Decimal,
}

/// One entry of `/v5/market/instruments-info`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    symbol: String,
    lot_size_filter: LotSizeFilter,
    price_filter: PriceFilter,
    leverage_filter: LeverageFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    #[serde(with = "rust_decimal::serde::str")]
    last_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: String,
}

impl BybitClient {
    pub fn new(credentials: &AccountCredentials) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            base_url: MAINNET_URL.to_string(),
        })
    }

    fn timestamp() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string()
    }

    /// v5 signature: HMAC-SHA256 over `timestamp + api_key + recv_window +
    /// payload`, where payload is the query string (GET) or body (POST).
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn check<T>(response: BybitResponse<T>) -> Result<Option<T>, ExchangeError> {
        match response.ret_code {
            RET_OK => Ok(response.result),
            RET_LEVERAGE_NOT_MODIFIED | RET_MARGIN_MODE_NOT_MODIFIED => Ok(None),
            RET_RATE_LIMITED => Err(ExchangeError::RateLimited),
            RET_INVALID_KEY => Err(ExchangeError::Auth(response.ret_msg)),
            RET_POSITION_BLOCKS_SWITCH => Err(ExchangeError::FlatPositionRequired),
            code => Err(ExchangeError::Venue {
                code,
                message: response.ret_msg,
            }),
        }
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, ExchangeError> {
        let query_string: String = query
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = Self::timestamp();
        let signature = self.sign(&timestamp, &query_string);

        let url = format!("{}{path}?{query_string}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .send()
            .await?
            .json::<BybitResponse<T>>()
            .await?;
        Self::check(response)
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Option<T>, ExchangeError> {
        let payload = body.to_string();
        let timestamp = Self::timestamp();
        let signature = self.sign(&timestamp, &payload);

        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?
            .json::<BybitResponse<T>>()
            .await?;
        Self::check(response)
    }

    #[instrument(skip(self))]
    pub async fn get_total_equity(&self) -> Result<Decimal, ExchangeError> {
        let result: Option<BybitList<WalletBalance>> = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED"), ("coin", SETTLE_COIN)],
            )
            .await?;
        result
            .and_then(|r| r.list.into_iter().next())
            .map(|b| b.total_equity)
            .ok_or_else(|| ExchangeError::Parse("empty wallet balance".to_string()))
    }

    #[instrument(skip(self))]
    pub async fn get_positions(&self) -> Result<Vec<BybitPosition>, ExchangeError> {
        let result: Option<BybitList<BybitPosition>> = self
            .signed_get(
                "/v5/position/list",
                &[("category", "linear"), ("settleCoin", SETTLE_COIN)],
            )
            .await?;
        Ok(result.map(|r| r.list).unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn get_instrument(&self, symbol: &str) -> Result<Instrument, ExchangeError> {
        let result: Option<BybitList<Instrument>> = self
            .signed_get(
                "/v5/market/instruments-info",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;
        result
            .and_then(|r| r.list.into_iter().find(|i| i.symbol == symbol))
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    #[instrument(skip(self))]
    pub async fn get_last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let result: Option<BybitList<Ticker>> = self
            .signed_get(
                "/v5/market/tickers",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;
        result
            .and_then(|r| r.list.into_iter().next())
            .map(|t| t.last_price)
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    #[instrument(skip(self))]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post::<serde_json::Value>("/v5/position/set-leverage", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn switch_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        let trade_mode = match mode {
            MarginMode::Isolated => 1,
            MarginMode::Cross => 0,
        };
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": trade_mode,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post::<serde_json::Value>("/v5/position/switch-isolated", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Market",
            "qty": qty.to_string(),
            "reduceOnly": reduce_only,
            "positionIdx": 0,
        });
        let ack: Option<OrderAck> = self.signed_post("/v5/order/create", &body).await?;
        if let Some(ack) = ack {
            debug!(%symbol, %qty, order_id = %ack.order_id, "Market order accepted");
        }
        Ok(())
    }
}

/// `AccountProcessor` backed by one Bybit unified account.
pub struct BybitAccount {
    client: BybitClient,
    account_id: String,
    enabled: bool,
    leverage_override: Option<u32>,
}

impl BybitAccount {
    pub fn new(credentials: &AccountCredentials) -> Result<Self, ExchangeError> {
        Ok(Self {
            client: BybitClient::new(credentials)?,
            account_id: credentials.account_id(),
            enabled: credentials.enabled,
            leverage_override: credentials.leverage_override,
        })
    }
}

#[async_trait]
impl AccountProcessor for BybitAccount {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn exchange_name(&self) -> &str {
        "bybit"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn leverage_override(&self) -> Option<u32> {
        self.leverage_override
    }

    /// Bybit linear contracts already use the canonical format.
    fn map_symbol(&self, canonical: &str) -> String {
        canonical.to_string()
    }

    async fn get_total_equity(&self) -> Result<Decimal, ExchangeError> {
        self.client.get_total_equity().await
    }

    async fn get_positions(&self) -> Result<HashMap<String, PositionState>, ExchangeError> {
        let positions = self.client.get_positions().await?;
        let mut mapped = HashMap::new();
        for position in positions {
            if position.size == Decimal::ZERO {
                continue;
            }
            let size = if position.side.eq_ignore_ascii_case("sell") {
                -position.size.abs()
            } else {
                position.size.abs()
            };
            mapped.insert(
                position.symbol.clone(),
                PositionState {
                    size,
                    entry_price: position.avg_price.unwrap_or(Decimal::ZERO),
                    leverage: position.leverage.to_u32().unwrap_or(1),
                    margin_mode: if position.trade_mode == 1 {
                        MarginMode::Isolated
                    } else {
                        MarginMode::Cross
                    },
                },
            );
        }
        Ok(mapped)
    }

    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ExchangeError> {
        let native = self.map_symbol(symbol);
        let instrument = self.client.get_instrument(&native).await?;
        Ok(SymbolSpec {
            min_size: instrument.lot_size_filter.min_order_qty,
            size_step: instrument.lot_size_filter.qty_step,
            price_step: instrument.price_filter.tick_size,
            max_single_order_size: instrument.lot_size_filter.max_mkt_order_qty,
            contract_multiplier: Decimal::ONE,
            max_leverage: instrument.leverage_filter.max_leverage.to_u32().unwrap_or(1),
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.client.get_last_price(&self.map_symbol(symbol)).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.client
            .set_leverage(&self.map_symbol(symbol), leverage)
            .await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        // The switch endpoint re-states leverage; 1x is never sent because the
        // engine always sets leverage right after a mode change.
        self.client
            .switch_margin_mode(&self.map_symbol(symbol), mode, 1)
            .await
    }

    async fn place_market(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        reduce_only: bool,
    ) -> Result<Decimal, ExchangeError> {
        let native = self.map_symbol(symbol);
        let spec = self.get_symbol_spec(symbol).await?;
        let qty = quantize_order(signed_qty, spec.size_step, spec.min_size);
        if qty == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let side = OrderSide::from_delta(qty);
        let chunks = chunk_quantity(qty.abs(), spec.max_single_order_size);
        let chunked = chunks.len() > 1;
        if chunked {
            warn!(%symbol, %qty, chunks = chunks.len(), "Order exceeds max single size, chunking");
        }
        for chunk in chunks {
            self.client
                .place_market_order(&native, side, chunk, reduce_only)
                .await?;
            if chunked {
                tokio::time::sleep(CHUNK_PAUSE).await;
            }
        }
        Ok(qty)
    }

    async fn close_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let positions = self.get_positions().await?;
        let Some(position) = positions.get(symbol) else {
            return Ok(Decimal::ZERO);
        };
        if position.size == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let native = self.map_symbol(symbol);
        let side = OrderSide::from_delta(-position.size);
        self.client
            .place_market_order(&native, side, position.size.abs(), true)
            .await?;
        Ok(-position.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_response_parsing() {
        let json = r#"
        {
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [
                    {
                        "symbol": "BTCUSDT",
                        "side": "Sell",
                        "size": "0.075",
                        "avgPrice": "50000.5",
                        "leverage": "3",
                        "tradeMode": 1
                    }
                ]
            }
        }
        "#;
        let response: BybitResponse<BybitList<BybitPosition>> =
            serde_json::from_str(json).unwrap();
        let list = BybitClient::check(response).unwrap().unwrap().list;
        assert_eq!(list[0].size, dec!(0.075));
        assert_eq!(list[0].side, "Sell");
        assert_eq!(list[0].trade_mode, 1);
    }

    #[test]
    fn test_instrument_response_parsing() {
        let json = r#"
        {
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [
                    {
                        "symbol": "BTCUSDT",
                        "lotSizeFilter": {
                            "qtyStep": "0.001",
                            "minOrderQty": "0.001",
                            "maxMktOrderQty": "100"
                        },
                        "priceFilter": {"tickSize": "0.1"},
                        "leverageFilter": {"maxLeverage": "100"}
                    }
                ]
            }
        }
        "#;
        let response: BybitResponse<BybitList<Instrument>> = serde_json::from_str(json).unwrap();
        let instrument = &BybitClient::check(response).unwrap().unwrap().list[0];
        assert_eq!(instrument.lot_size_filter.qty_step, dec!(0.001));
        assert_eq!(instrument.lot_size_filter.max_mkt_order_qty, dec!(100));
    }

    #[test]
    fn test_ret_code_mapping() {
        let not_modified: BybitResponse<serde_json::Value> = serde_json::from_str(
            r#"{"retCode": 110043, "retMsg": "Set leverage not modified", "result": {}}"#,
        )
        .unwrap();
        assert!(BybitClient::check(not_modified).is_ok());

        let rate_limited: BybitResponse<serde_json::Value> = serde_json::from_str(
            r#"{"retCode": 10006, "retMsg": "Too many visits", "result": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            BybitClient::check(rate_limited),
            Err(ExchangeError::RateLimited)
        ));

        let blocked: BybitResponse<serde_json::Value> = serde_json::from_str(
            r#"{"retCode": 110024, "retMsg": "position exists", "result": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            BybitClient::check(blocked),
            Err(ExchangeError::FlatPositionRequired)
        ));
    }
}
