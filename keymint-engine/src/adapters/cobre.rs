//! The Cobre webhook adapter.
//!
//! Cobre signs each delivery with HMAC-SHA256 over `"<timestamp>.<rawBody>"`
//! using the shared webhook secret; the hex signature and the timestamp
//! arrive in the `event-signature` / `event-timestamp` headers. Amounts are
//! already in minor units.

use hmac::{Hmac, Mac};
use keymint_common::enums::{PaymentProvider, TxnStatus, WebhookEventType};
use keymint_common::time::TimestampMs;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use crate::adapters::{ProviderAdapter, minor_amount, stringy, warn_unknown_status};
use crate::error::EngineError;
use crate::event::{NormalizedEvent, WebhookRequest};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "event-signature";
pub const TIMESTAMP_HEADER: &str = "event-timestamp";

pub struct CobreAdapter {
    webhook_secret: String,
}

impl CobreAdapter {
    pub fn new(webhook_secret: String) -> Self {
        Self { webhook_secret }
    }

    /// Map Cobre's status word onto the extracted event status. Shared with
    /// the outbound client, which sees the same words on money movements.
    pub(crate) fn map_status(raw: &str) -> TxnStatus {
        match raw {
            "completed" => TxnStatus::Paid,
            "created" | "initiated" | "processing" | "pending" =>
                TxnStatus::Pending,
            "failed" | "rejected" | "canceled" | "cancelled" | "expired"
            | "returned" => TxnStatus::Failed,
            other => warn_unknown_status(PaymentProvider::Cobre, other),
        }
    }

    /// External-ref resolution priority:
    /// `content.external_id` -> `content.unique_transaction_id` ->
    /// `content.metadata.uniqueTransactionId` -> top-level `external_id` ->
    /// the provider event id (with a warning).
    fn resolve_external_ref(event: &Value, event_id: &str) -> String {
        let content = &event["content"];
        let candidates = [
            &content["external_id"],
            &content["unique_transaction_id"],
            &content["metadata"]["uniqueTransactionId"],
            &event["external_id"],
        ];
        for candidate in candidates {
            if let Some(s) = stringy(candidate).filter(|s| !s.is_empty()) {
                return s;
            }
        }
        warn!(
            event_id,
            "Cobre event carries no correlation id; falling back to event id"
        );
        event_id.to_owned()
    }

    fn parse_event(
        event: &Value,
        event_index: i32,
    ) -> Result<NormalizedEvent, EngineError> {
        let event_id = stringy(&event["id"])
            .or_else(|| stringy(&event["event_id"]))
            .ok_or_else(|| {
                EngineError::validation("Cobre event is missing an event id")
            })?;
        let event_key = stringy(&event["event_key"]).unwrap_or_default();

        let event_type = if event_key.contains("balance") {
            WebhookEventType::BalanceCredit
        } else {
            WebhookEventType::Payment
        };

        // The status word is the last segment of the event key, e.g.
        // `money_movement.status.completed`.
        let raw_status = event_key
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_owned();
        let status = Self::map_status(&raw_status);

        let content = &event["content"];
        let occurred_at = stringy(&event["created_at"])
            .or_else(|| stringy(&content["created_at"]))
            .and_then(|s| {
                chrono::DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| TimestampMs::from_utc(dt.to_utc()))
            });

        Ok(NormalizedEvent {
            provider: PaymentProvider::Cobre,
            external_ref: Self::resolve_external_ref(event, &event_id),
            event_id,
            event_type,
            status,
            // Cobre reports minor units; pass through unchanged.
            amount: minor_amount(&content["amount"]),
            currency: stringy(&content["currency"]),
            payload: event.clone(),
            event_index,
            occurred_at,
        })
    }
}

impl ProviderAdapter for CobreAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Cobre
    }

    fn verify_signature(&self, req: &WebhookRequest) -> bool {
        let (Some(signature), Some(timestamp)) =
            (req.header(SIGNATURE_HEADER), req.header(TIMESTAMP_HEADER))
        else {
            return false;
        };
        let Ok(signature_bytes) = hex::decode(signature.trim()) else {
            return false;
        };

        let mut mac = HmacSha256::new_from_slice(
            self.webhook_secret.as_bytes(),
        )
        .expect("HMAC accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(req.body().as_bytes());
        // verify_slice is constant-time.
        mac.verify_slice(&signature_bytes).is_ok()
    }

    fn parse_webhook(
        &self,
        req: &WebhookRequest,
    ) -> Result<Vec<NormalizedEvent>, EngineError> {
        let body: Value = req.parse_json().map_err(|err| {
            EngineError::validation(format!("Cobre payload is not JSON: {err}"))
        })?;

        // A delivery is usually a single event object, but batched
        // deliveries arrive as `{"events": [...]}` or a bare array.
        let events: Vec<&Value> = if let Some(batch) = body["events"].as_array()
        {
            batch.iter().collect()
        } else if let Some(batch) = body.as_array() {
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

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn request(secret: &str, body: &str) -> WebhookRequest {
        let timestamp = "1714000000";
        WebhookRequest::new(
            vec![
                (TIMESTAMP_HEADER.to_owned(), timestamp.to_owned()),
                (
                    SIGNATURE_HEADER.to_owned(),
                    sign(secret, timestamp, body),
                ),
            ],
            body.to_owned(),
        )
    }

    fn payment_body(external_id: &str, status_word: &str) -> String {
        json!({
            "id": "ev_01",
            "event_key": format!("money_movement.status.{status_word}"),
            "created_at": "2024-04-25T00:26:40Z",
            "content": {
                "external_id": external_id,
                "amount": 100_000,
                "currency": "COP",
            },
        })
        .to_string()
    }

    #[test]
    fn valid_signature_verifies() {
        let adapter = CobreAdapter::new("whsec_1".to_owned());
        let body = payment_body("X1", "completed");
        assert!(adapter.verify_signature(&request("whsec_1", &body)));
    }

    #[test]
    fn wrong_secret_or_tampered_body_fails() {
        let adapter = CobreAdapter::new("whsec_1".to_owned());
        let body = payment_body("X1", "completed");
        assert!(!adapter.verify_signature(&request("whsec_2", &body)));

        // A valid signature over a different timestamp must not verify.
        let signed = request("whsec_1", &body);
        let tampered = WebhookRequest::new(
            vec![
                (TIMESTAMP_HEADER.to_owned(), "1714000001".to_owned()),
                (
                    SIGNATURE_HEADER.to_owned(),
                    signed.header(SIGNATURE_HEADER).unwrap().to_owned(),
                ),
            ],
            body,
        );
        assert!(!adapter.verify_signature(&tampered));
    }

    #[test]
    fn missing_headers_or_bad_hex_fail_closed() {
        let adapter = CobreAdapter::new("whsec_1".to_owned());
        let body = payment_body("X1", "completed");
        let no_headers = WebhookRequest::new(vec![], body.clone());
        assert!(!adapter.verify_signature(&no_headers));

        let bad_hex = WebhookRequest::new(
            vec![
                (TIMESTAMP_HEADER.to_owned(), "1714000000".to_owned()),
                (SIGNATURE_HEADER.to_owned(), "not-hex!".to_owned()),
            ],
            body,
        );
        assert!(!adapter.verify_signature(&bad_hex));
    }

    #[test]
    fn parses_single_payment_event() {
        let adapter = CobreAdapter::new("s".to_owned());
        let req = request("s", &payment_body("X1", "completed"));
        let events = adapter.parse_webhook(&req).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.external_ref, "X1");
        assert_eq!(event.status, TxnStatus::Paid);
        assert_eq!(event.event_type, WebhookEventType::Payment);
        assert_eq!(event.amount.unwrap().cents(), 100_000);
        assert!(event.occurred_at.is_some());
    }

    #[test]
    fn external_ref_resolution_priority() {
        let event = json!({
            "id": "ev_02",
            "event_key": "money_movement.status.completed",
            "external_id": "top",
            "content": {
                "unique_transaction_id": "utid",
                "metadata": { "uniqueTransactionId": "meta" },
            },
        });
        assert_eq!(
            CobreAdapter::resolve_external_ref(&event, "ev_02"),
            "utid"
        );

        let only_meta = json!({
            "id": "ev_03",
            "content": { "metadata": { "uniqueTransactionId": "meta" } },
        });
        assert_eq!(
            CobreAdapter::resolve_external_ref(&only_meta, "ev_03"),
            "meta"
        );

        let nothing = json!({ "id": "ev_04", "content": {} });
        assert_eq!(
            CobreAdapter::resolve_external_ref(&nothing, "ev_04"),
            "ev_04"
        );
    }

    #[test]
    fn unknown_status_defaults_to_failed() {
        let adapter = CobreAdapter::new("s".to_owned());
        let req = request("s", &payment_body("X1", "weird_status"));
        let events = adapter.parse_webhook(&req).unwrap();
        assert_eq!(events[0].status, TxnStatus::Failed);
    }

    #[test]
    fn batched_events_keep_input_order() {
        let adapter = CobreAdapter::new("s".to_owned());
        let body = json!({
            "events": [
                serde_json::from_str::<Value>(&payment_body("A", "pending"))
                    .unwrap(),
                serde_json::from_str::<Value>(&payment_body("B", "completed"))
                    .unwrap(),
            ],
        })
        .to_string();
        let events = adapter.parse_webhook(&request("s", &body)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].external_ref, "A");
        assert_eq!(events[0].event_index, 0);
        assert_eq!(events[1].external_ref, "B");
        assert_eq!(events[1].event_index, 1);
    }

    #[test]
    fn balance_credit_is_classified() {
        let adapter = CobreAdapter::new("s".to_owned());
        let body = json!({
            "id": "ev_05",
            "event_key": "accounts.balance.credit",
            "content": { "amount": 5_000, "currency": "COP" },
        })
        .to_string();
        let events = adapter.parse_webhook(&request("s", &body)).unwrap();
        assert_eq!(events[0].event_type, WebhookEventType::BalanceCredit);
    }
}
