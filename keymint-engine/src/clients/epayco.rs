//! The ePayco validation API client, used by reconciliation to fetch the
//! canonical state of a payment by its `ref_payco`.

use async_trait::async_trait;
use keymint_common::amount::Amount;
use keymint_common::config::EpaycoConfig;
use keymint_common::enums::PaymentProvider;
use serde_json::Value;

use crate::adapters::epayco::EpaycoAdapter;
use crate::error::EngineError;
use crate::traits::{CanonicalStatus, ProviderApi};

pub struct EpaycoClient {
    cfg: EpaycoConfig,
    client: reqwest::Client,
}

impl EpaycoClient {
    pub fn new(cfg: EpaycoConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .expect("Failed to build reqwest Client");
        Self { cfg, client }
    }
}

#[async_trait]
impl ProviderApi for EpaycoClient {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Epayco
    }

    /// For ePayco the gateway ref *is* the status id (`ref_payco`).
    async fn find_status_id(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(Some(gateway_ref.to_owned()))
    }

    async fn canonical_status(
        &self,
        status_id: &str,
        _bypass_cache: bool,
    ) -> Result<CanonicalStatus, EngineError> {
        let url = format!(
            "{}/validation/v1/reference/{status_id}",
            self.cfg.base_url,
        );
        let response = self.client.get(&url).send().await.map_err(|err| {
            EngineError::provider(format!("ePayco unreachable: {err}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(format!(
                "ePayco returned {status}: {body}"
            )));
        }
        let body: Value = response.json().await.map_err(|err| {
            EngineError::provider(format!(
                "ePayco response was not JSON: {err}"
            ))
        })?;

        let data = &body["data"];
        let raw_code = data["x_cod_response"]
            .as_i64()
            .map(|code| code.to_string())
            .or_else(|| data["x_cod_response"].as_str().map(str::to_owned))
            .unwrap_or_default();
        let amount = match &data["x_amount"] {
            Value::Number(n) => n
                .as_f64()
                .map(|major| major.to_string())
                .and_then(|s| Amount::from_major_str(&s).ok()),
            Value::String(s) => Amount::from_major_str(s).ok(),
            _ => None,
        }
        .ok_or_else(|| {
            EngineError::provider(
                "ePayco validation carries no amount".to_owned(),
            )
        })?;

        Ok(CanonicalStatus {
            external_id: data["x_ref_payco"]
                .as_i64()
                .map(|id| id.to_string())
                .or_else(|| data["x_ref_payco"].as_str().map(str::to_owned))
                .unwrap_or_default(),
            status: EpaycoAdapter::map_status(&raw_code),
            raw_status: data["x_response"]
                .as_str()
                .unwrap_or(&raw_code)
                .to_owned(),
            amount,
            currency: data["x_currency_code"]
                .as_str()
                .unwrap_or("COP")
                .to_owned(),
        })
    }
}
