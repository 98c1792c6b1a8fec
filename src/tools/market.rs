//! Market utility tools: currency conversion, market hours, earnings

use crate::error::EngineError;
use crate::tools::Tool;
use crate::Result;
use chrono::{Datelike, FixedOffset, Timelike, Utc};
use reqwest::Client;
use serde_json::{Map, Value};

/// Convert between currencies using live exchange rates.
pub struct ConvertCurrencyTool {
    client: Client,
}

impl ConvertCurrencyTool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for ConvertCurrencyTool {
    fn name(&self) -> &'static str {
        "convert_currency"
    }

    fn description(&self) -> &'static str {
        "Convert between different currencies using real-time exchange rates. Essential for international investment comparisons."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "amount": {
                    "type": "number",
                    "description": "The amount of money to convert"
                },
                "from_currency": {
                    "type": "string",
                    "description": "Source currency code (e.g., USD, EUR, JPY, GBP)"
                },
                "to_currency": {
                    "type": "string",
                    "description": "Target currency code (e.g., USD, EUR, JPY, GBP)"
                }
            },
            "required": ["amount", "from_currency", "to_currency"]
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["amount", "from_currency", "to_currency"]
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let amount = args
            .get("amount")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                EngineError::InvalidToolInput("Missing 'amount' parameter".to_string())
            })?;
        let from = args
            .get("from_currency")
            .and_then(|v| v.as_str())
            .map(str::to_uppercase)
            .ok_or_else(|| {
                EngineError::InvalidToolInput("Missing 'from_currency' parameter".to_string())
            })?;
        let to = args
            .get("to_currency")
            .and_then(|v| v.as_str())
            .map(str::to_uppercase)
            .ok_or_else(|| {
                EngineError::InvalidToolInput("Missing 'to_currency' parameter".to_string())
            })?;

        let url = format!("https://open.er-api.com/v6/latest/{}", from);
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ToolError(format!("Error converting currency: {}", e)))?
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("Error converting currency: {}", e)))?;

        let rate = body
            .get("rates")
            .and_then(|r| r.get(&to))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                EngineError::ToolError(format!("No exchange rate for {} -> {}", from, to))
            })?;

        Ok(format!("{} {} = {:.2} {}", amount, from, amount * rate, to))
    }
}

/// One exchange's schedule: fixed UTC offset and a weekday hour window.
struct MarketSchedule {
    name: &'static str,
    utc_offset_hours: i32,
    open_hour: u32,
    close_hour: u32,
}

const MARKETS: &[MarketSchedule] = &[
    MarketSchedule {
        name: "NYSE/NASDAQ",
        utc_offset_hours: -5,
        open_hour: 9,
        close_hour: 16,
    },
    MarketSchedule {
        name: "London LSE",
        utc_offset_hours: 0,
        open_hour: 8,
        close_hour: 16,
    },
    MarketSchedule {
        name: "Tokyo TSE",
        utc_offset_hours: 9,
        open_hour: 9,
        close_hour: 15,
    },
];

/// Report whether major stock exchanges are currently open.
pub struct CheckMarketHoursTool;

#[async_trait::async_trait]
impl Tool for CheckMarketHoursTool {
    fn name(&self) -> &'static str {
        "check_market_hours"
    }

    fn description(&self) -> &'static str {
        "Check if major stock exchanges (NYSE, NASDAQ, London, Tokyo) are currently open or closed. Essential for time-sensitive trading decisions."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<String> {
        let now = Utc::now();
        let mut result = String::from("Market Hours Status:\n");

        for market in MARKETS {
            let offset = FixedOffset::east_opt(market.utc_offset_hours * 3600)
                .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
            let local = now.with_timezone(&offset);

            let weekday_open = local.weekday().num_days_from_monday() < 5;
            let in_hours = local.hour() >= market.open_hour && local.hour() < market.close_hour;
            let status = if weekday_open && in_hours {
                "OPEN"
            } else {
                "CLOSED"
            };

            result.push_str(&format!(
                "{}: {} (Local time: {})\n",
                market.name,
                status,
                local.format("%H:%M")
            ));
        }

        Ok(result)
    }
}

/// Quarterly earnings via the Alpha Vantage EARNINGS endpoint.
pub struct GetEarningsTool {
    client: Client,
    api_key: String,
}

impl GetEarningsTool {
    pub fn new(client: Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait::async_trait]
impl Tool for GetEarningsTool {
    fn name(&self) -> &'static str {
        "get_earnings"
    }

    fn description(&self) -> &'static str {
        "Retrieve the latest quarterly earnings data including reported EPS, estimated EPS, and earnings dates for fundamental analysis."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Stock ticker symbol of the company (e.g., AAPL for Apple, MSFT for Microsoft)"
                }
            },
            "required": ["symbol"]
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["symbol"]
    }

    fn symbol_param(&self) -> Option<&'static str> {
        Some("symbol")
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let symbol = args
            .get("symbol")
            .and_then(|v| v.as_str())
            .map(str::to_uppercase)
            .ok_or_else(|| {
                EngineError::InvalidToolInput("Missing 'symbol' parameter".to_string())
            })?;

        let url = format!(
            "https://www.alphavantage.co/query?function=EARNINGS&symbol={}&apikey={}",
            symbol, self.api_key
        );

        let data: Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ToolError(format!("Error fetching earnings data: {}", e)))?
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("Error fetching earnings data: {}", e)))?;

        let Some(quarters) = data.get("quarterlyEarnings").and_then(Value::as_array) else {
            return Ok(format!("No earnings data found for {}", symbol));
        };

        let mut result = format!("Quarterly Earnings for {}:\n", symbol);
        for quarter in quarters.iter().take(4) {
            let field = |key: &str| {
                quarter
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or("N/A")
                    .to_string()
            };
            result.push_str(&format!(
                "\nFiscal Quarter: {}\nReported EPS: ${}\nEstimated EPS: ${}\n",
                field("fiscalDateEnding"),
                field("reportedEPS"),
                field("estimatedEPS")
            ));
        }

        Ok(result)
    }
}
