//! The mock provider adapter, for tests and local development.
//!
//! Auth is a static shared secret in the `x-mock-signature` header; the
//! payload mirrors the normalized event shape, so tests can drive any
//! status sequence without signing machinery.

use std::str::FromStr;

use keymint_common::enums::{PaymentProvider, TxnStatus, WebhookEventType};
use keymint_common::time::TimestampMs;
use serde_json::Value;

use crate::adapters::{ProviderAdapter, minor_amount, stringy};
use crate::error::EngineError;
use crate::event::{NormalizedEvent, WebhookRequest};

pub const SIGNATURE_HEADER: &str = "x-mock-signature";

pub struct MockAdapter {
    secret: String,
}

impl MockAdapter {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    fn parse_event(
        event: &Value,
        event_index: i32,
    ) -> Result<NormalizedEvent, EngineError> {
        let external_ref = stringy(&event["external_ref"]).ok_or_else(|| {
            EngineError::validation("Mock event is missing external_ref")
        })?;
        let status = stringy(&event["status"])
            .and_then(|s| TxnStatus::from_str(&s).ok())
            .ok_or_else(|| {
                EngineError::validation("Mock event is missing a valid status")
            })?;
        let event_type = stringy(&event["type"])
            .and_then(|s| WebhookEventType::from_str(&s).ok())
            .unwrap_or(WebhookEventType::Payment);
        let occurred_at = event["created_at"]
            .as_i64()
            .and_then(|ms| TimestampMs::from_i64(ms).ok());

        Ok(NormalizedEvent {
            provider: PaymentProvider::Mock,
            event_id: stringy(&event["event_id"])
                .unwrap_or_else(|| format!("mock-{external_ref}")),
            external_ref,
            event_type,
            status,
            amount: minor_amount(&event["amount_cents"]),
            currency: stringy(&event["currency"]),
            payload: event.clone(),
            event_index,
            occurred_at,
        })
    }
}

impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Mock
    }

    fn verify_signature(&self, req: &WebhookRequest) -> bool {
        req.header(SIGNATURE_HEADER) == Some(self.secret.as_str())
    }

    fn parse_webhook(
        &self,
        req: &WebhookRequest,
    ) -> Result<Vec<NormalizedEvent>, EngineError> {
        let body: Value = req.parse_json().map_err(|err| {
            EngineError::validation(format!("Mock payload is not JSON: {err}"))
        })?;
        let events: Vec<&Value> = if let Some(batch) = body["events"].as_array()
        {
            batch.iter().collect()
        } else {
            vec![&body]
        };
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Self::parse_event(event, i as i32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn secret_header_gates_verification() {
        let adapter = MockAdapter::new("s3cret".to_owned());
        let ok = WebhookRequest::new(
            vec![(SIGNATURE_HEADER.to_owned(), "s3cret".to_owned())],
            "{}".to_owned(),
        );
        let bad = WebhookRequest::new(
            vec![(SIGNATURE_HEADER.to_owned(), "nope".to_owned())],
            "{}".to_owned(),
        );
        assert!(adapter.verify_signature(&ok));
        assert!(!adapter.verify_signature(&bad));
        assert!(!adapter.verify_signature(&WebhookRequest::new(
            vec![],
            "{}".to_owned()
        )));
    }

    #[test]
    fn parses_normalized_shape() {
        let adapter = MockAdapter::new("s".to_owned());
        let body = json!({
            "external_ref": "X1",
            "status": "PAID",
            "amount_cents": 100_000,
            "currency": "COP",
        })
        .to_string();
        let req = WebhookRequest::new(vec![], body);
        let events = adapter.parse_webhook(&req).unwrap();
        assert_eq!(events[0].status, TxnStatus::Paid);
        assert_eq!(events[0].external_ref, "X1");
    }
}
