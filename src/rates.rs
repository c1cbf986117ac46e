use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres};
use tracing::{error, info};

use crate::config::RatesConfig;

const FREE_API_URL: &str = "https://api.coingecko.com/api";
const PRO_API_URL: &str = "https://pro-api.coingecko.com/api";

pub(crate) type FiatRates = HashMap<String, Decimal>;
pub(crate) type RatesResult = HashMap<String, FiatRates>;

pub(crate) struct RatesService {
    is_pro: bool,
    config: RatesConfig,
    client: reqwest::Client,
}

impl RatesService {
    pub(crate) fn new(config: RatesConfig) -> Self {
        Self {
            is_pro: !config.api_key.is_empty(),
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        if self.is_pro {
            format!("{PRO_API_URL}{path}")
        } else {
            format!("{FREE_API_URL}{path}")
        }
    }

    pub(crate) async fn fetch_rates(&self) -> Result<RatesResult> {
        let remote_ids: Vec<&str> = self.config.cryptos.values().map(String::as_str).collect();

        let mut request = self
            .client
            .get(self.url("/v3/simple/price"))
            .query(&[
                ("ids", remote_ids.join(",")),
                ("vs_currencies", self.config.fiats.join(",")),
            ]);
        if self.is_pro {
            request = request.header("x-cg-pro-api-key", &self.config.api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            bail!("API returned {}", response.status());
        }

        let price_map: HashMap<String, HashMap<String, f64>> = response.json().await?;

        parse_price_map(&self.config.cryptos, price_map)
    }
}

/// Remaps remote currency ids back to the local ones and rejects partial or
/// non-finite responses.
pub(crate) fn parse_price_map(
    cryptos: &HashMap<String, String>,
    price_map: HashMap<String, HashMap<String, f64>>,
) -> Result<RatesResult> {
    let remote_to_local: HashMap<&str, &str> = cryptos
        .iter()
        .map(|(local, remote)| (remote.as_str(), local.as_str()))
        .collect();

    if price_map.len() != remote_to_local.len() {
        bail!("failed to fetch all currencies");
    }

    let mut result = RatesResult::new();
    for (remote_id, fiat_map) in price_map {
        let Some(local_id) = remote_to_local.get(remote_id.as_str()) else {
            bail!("unexpected currency {remote_id} in response");
        };

        let mut rates = FiatRates::new();
        for (fiat_id, rate) in fiat_map {
            if !rate.is_finite() {
                bail!("non-finite rate for {remote_id}/{fiat_id}");
            }
            let rate = Decimal::from_f64(rate)
                .ok_or_else(|| anyhow!("unrepresentable rate for {remote_id}/{fiat_id}"))?;
            rates.insert(fiat_id, rate);
        }

        result.insert((*local_id).to_string(), rates);
    }

    Ok(result)
}

pub(crate) async fn save_rates(db: &Pool<Postgres>, prices: &RatesResult) -> Result<()> {
    for (crypto_id, fiat_map) in prices {
        for (fiat_id, rate) in fiat_map {
            sqlx::query(
                r#"
                INSERT INTO rates (base, target, ratio)
                VALUES ($1, $2, $3)
                ON CONFLICT (base, target) DO UPDATE SET ratio = EXCLUDED.ratio
                "#,
            )
            .bind(crypto_id)
            .bind(fiat_id)
            .bind(rate)
            .execute(db)
            .await?;
        }
    }

    Ok(())
}

pub(crate) fn start_rates_task(db: Pool<Postgres>, service: RatesService, frequency_mins: u64) {
    tokio::spawn(async move {
        let period = Duration::from_secs(frequency_mins.max(1) * 60);
        loop {
            tokio::time::sleep(period).await;
            match service.fetch_rates().await {
                Ok(prices) => {
                    let pairs: usize = prices.values().map(HashMap::len).sum();
                    if let Err(e) = save_rates(&db, &prices).await {
                        error!(error = %e, "failed to save rates");
                    } else {
                        info!(pairs, "refreshed rates");
                    }
                }
                Err(e) => error!(error = %e, "failed to fetch rates"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn cryptos() -> HashMap<String, String> {
        HashMap::from([("eth".to_string(), "ethereum".to_string())])
    }

    #[test]
    fn remaps_remote_ids_to_local_ids() {
        let prices = HashMap::from([(
            "ethereum".to_string(),
            HashMap::from([("usd".to_string(), 1234.56f64)]),
        )]);

        let result = parse_price_map(&cryptos(), prices).unwrap();
        assert_eq!(
            result["eth"]["usd"],
            Decimal::from_str("1234.56").unwrap()
        );
    }

    #[test]
    fn rejects_partial_responses() {
        assert!(parse_price_map(&cryptos(), HashMap::new()).is_err());
    }

    #[test]
    fn rejects_non_finite_rates() {
        let prices = HashMap::from([(
            "ethereum".to_string(),
            HashMap::from([("usd".to_string(), f64::NAN)]),
        )]);
        assert!(parse_price_map(&cryptos(), prices).is_err());

        let prices = HashMap::from([(
            "ethereum".to_string(),
            HashMap::from([("usd".to_string(), f64::INFINITY)]),
        )]);
        assert!(parse_price_map(&cryptos(), prices).is_err());
    }

    #[test]
    fn rejects_unknown_remote_ids() {
        let prices = HashMap::from([(
            "dogecoin".to_string(),
            HashMap::from([("usd".to_string(), 0.1f64)]),
        )]);
        assert!(parse_price_map(&cryptos(), prices).is_err());
    }
}
