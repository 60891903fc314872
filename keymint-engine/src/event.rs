//! The normalized webhook event model shared by adapters, ingress, and the
//! state machine.

use keymint_common::amount::Amount;
use keymint_common::enums::{PaymentProvider, TxnStatus, WebhookEventType};
use keymint_common::time::TimestampMs;
use serde::Serialize;
use serde_json::Value;

/// An inbound webhook as seen by an adapter: the raw body exactly as
/// received (signatures are computed over it) plus the headers.
#[derive(Clone, Debug)]
pub struct WebhookRequest {
    headers: Vec<(String, String)>,
    body: String,
}

impl WebhookRequest {
    pub fn new(headers: Vec<(String, String)>, body: String) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self { headers, body }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Headers as a JSON object for the audit record.
    pub fn headers_json(&self) -> Value {
        let map = self
            .headers
            .iter()
            .map(|(n, v)| (n.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    pub fn parse_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// A provider webhook normalized into the shape the state machine consumes.
/// One inbound request can carry several of these, in input order.
#[derive(Clone, Debug)]
pub struct NormalizedEvent {
    pub provider: PaymentProvider,
    /// The gateway correlation id; the idempotency key together with
    /// `provider`.
    pub external_ref: String,
    /// Provider-local event id.
    pub event_id: String,
    pub event_type: WebhookEventType,
    /// Extracted status, already mapped through the provider table.
    pub status: TxnStatus,
    pub amount: Option<Amount>,
    pub currency: Option<String>,
    /// The provider payload for this event (sanitized before persistence).
    pub payload: Value,
    /// Position of this event within the inbound request.
    pub event_index: i32,
    /// Provider-reported creation time, used to drop out-of-order replays.
    pub occurred_at: Option<TimestampMs>,
}

/// How a single event fared during ingress.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Processed,
    Duplicate,
    Failed,
}

/// Per-event result echoed to the webhook caller.
#[derive(Clone, Debug, Serialize)]
pub struct EventResult {
    #[serde(rename = "externalRef")]
    pub external_ref: String,
    pub disposition: EventDisposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate summary for one inbound webhook request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSummary {
    pub total_events: usize,
    pub processed_events: usize,
    pub failed_events: usize,
    pub duplicate_events: usize,
    pub processing_time_ms: u64,
    pub results: Vec<EventResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = WebhookRequest::new(
            vec![("Event-Signature".to_owned(), "abc".to_owned())],
            "{}".to_owned(),
        );
        assert_eq!(req.header("event-signature"), Some("abc"));
        assert_eq!(req.header("EVENT-SIGNATURE"), Some("abc"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = WebhookSummary {
            total_events: 1,
            processed_events: 1,
            failed_events: 0,
            duplicate_events: 0,
            processing_time_ms: 12,
            results: vec![EventResult {
                external_ref: "X1".to_owned(),
                disposition: EventDisposition::Processed,
                reason: None,
            }],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["totalEvents"], 1);
        assert_eq!(json["processingTimeMs"], 12);
        assert_eq!(json["results"][0]["disposition"], "processed");
    }
}
