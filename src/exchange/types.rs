//! Wire types for the MEXC contract REST and streaming APIs.

use crate::market::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// MEXC kline interval code for a tracked timeframe.
pub fn interval_code(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::Min1 => "Min1",
        Timeframe::Min15 => "Min15",
        Timeframe::Hour1 => "Min60",
    }
}

/// Inverse of [`interval_code`]; `None` for intervals we do not track.
pub fn timeframe_from_code(code: &str) -> Option<Timeframe> {
    match code {
        "Min1" => Some(Timeframe::Min1),
        "Min15" => Some(Timeframe::Min15),
        "Min60" => Some(Timeframe::Hour1),
        _ => None,
    }
}

// ==================== REST ====================

/// Common REST envelope: `{"success": true, "code": 0, "data": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub code: i64,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Contract listing entry from `/api/v1/contract/detail`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDetail {
    pub symbol: String,
    #[serde(default)]
    pub quote_coin: String,
    /// 0 = enabled; anything else is delisted, paused or pre-market
    #[serde(default)]
    pub state: i32,
}

impl ContractDetail {
    pub fn is_usdt_enabled(&self) -> bool {
        self.state == 0 && self.symbol.ends_with("_USDT")
    }
}

/// Columnar kline series from `/api/v1/contract/kline/{symbol}`.
///
/// `time` is in epoch seconds and marks the bucket start.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KlineSeries {
    #[serde(default)]
    pub time: Vec<i64>,
    #[serde(default)]
    pub open: Vec<Decimal>,
    #[serde(default)]
    pub close: Vec<Decimal>,
    #[serde(default)]
    pub high: Vec<Decimal>,
    #[serde(default)]
    pub low: Vec<Decimal>,
    #[serde(default)]
    pub vol: Vec<Decimal>,
}

impl KlineSeries {
    /// All price columns have the same length as `time`.
    pub fn is_consistent(&self) -> bool {
        let n = self.time.len();
        self.open.len() == n && self.close.len() == n && self.high.len() == n && self.low.len() == n
    }
}

// ==================== Streaming ====================

/// Outbound streaming request.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<WsParam<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsParam<'a> {
    pub symbol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<&'a str>,
}

impl<'a> WsRequest<'a> {
    pub fn ping() -> Self {
        Self {
            method: "ping",
            param: None,
        }
    }

    pub fn sub_ticker(symbol: &'a str) -> Self {
        Self {
            method: "sub.ticker",
            param: Some(WsParam {
                symbol,
                interval: None,
            }),
        }
    }

    pub fn sub_kline(symbol: &'a str, timeframe: Timeframe) -> Self {
        Self {
            method: "sub.kline",
            param: Some(WsParam {
                symbol,
                interval: Some(interval_code(timeframe)),
            }),
        }
    }
}

/// Inbound frame: `{"channel": "push.ticker", "symbol": "...", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    pub channel: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// `push.ticker` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerPush {
    pub symbol: String,
    pub last_price: Decimal,
    /// Cumulative 24h volume
    #[serde(default)]
    pub volume24: Decimal,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// `push.kline` payload describing the currently open bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct KlinePush {
    pub symbol: String,
    pub interval: String,
    /// Bucket start, epoch seconds
    pub t: i64,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    /// Volume in contracts
    #[serde(default)]
    pub q: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_interval_codes_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(timeframe_from_code(interval_code(tf)), Some(tf));
        }
        assert_eq!(timeframe_from_code("Hour4"), None);
    }

    #[test]
    fn test_subscribe_request_shape() {
        let json = serde_json::to_string(&WsRequest::sub_kline("BTC_USDT", Timeframe::Hour1)).unwrap();
        assert_eq!(
            json,
            r#"{"method":"sub.kline","param":{"symbol":"BTC_USDT","interval":"Min60"}}"#
        );
        let json = serde_json::to_string(&WsRequest::sub_ticker("BTC_USDT")).unwrap();
        assert_eq!(json, r#"{"method":"sub.ticker","param":{"symbol":"BTC_USDT"}}"#);
        assert_eq!(
            serde_json::to_string(&WsRequest::ping()).unwrap(),
            r#"{"method":"ping"}"#
        );
    }

    #[test]
    fn test_parse_kline_series() {
        let json = r#"{
            "success": true,
            "code": 0,
            "data": {
                "time": [1700000000, 1700000060],
                "open": [1.5, 1.6],
                "close": [1.6, 1.55],
                "high": [1.7, 1.65],
                "low": [1.45, 1.5],
                "vol": [1000, 1200],
                "amount": [1500.0, 1900.0]
            }
        }"#;
        let response: ApiResponse<KlineSeries> = serde_json::from_str(json).unwrap();
        assert!(response.success);
        let series = response.data.unwrap();
        assert!(series.is_consistent());
        assert_eq!(series.close, vec![dec!(1.6), dec!(1.55)]);
    }

    #[test]
    fn test_parse_contract_detail() {
        let json = r#"{"success":true,"code":0,"data":[
            {"symbol":"BTC_USDT","quoteCoin":"USDT","state":0},
            {"symbol":"OLD_USDT","quoteCoin":"USDT","state":4},
            {"symbol":"BTC_USD","quoteCoin":"USD","state":0}
        ]}"#;
        let response: ApiResponse<Vec<ContractDetail>> = serde_json::from_str(json).unwrap();
        let enabled: Vec<_> = response
            .data
            .unwrap()
            .into_iter()
            .filter(ContractDetail::is_usdt_enabled)
            .map(|c| c.symbol)
            .collect();
        assert_eq!(enabled, vec!["BTC_USDT"]);
    }
}
