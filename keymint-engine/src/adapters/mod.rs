//! Provider adapters: verify gateway signatures and normalize webhook
//! payloads into [`NormalizedEvent`]s.
//!
//! Adapters are pure (no I/O), which keeps signature vectors and payload
//! parsing unit-testable without a running gateway.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use keymint_common::amount::Amount;
use keymint_common::enums::PaymentProvider;
use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;
use crate::event::{NormalizedEvent, WebhookRequest};

/// Cobre: HMAC-signed JSON webhooks.
pub mod cobre;
/// ePayco: form-style confirmation webhooks.
pub mod epayco;
/// Static-secret mock used by tests and local development.
pub mod mock;

/// The per-provider capability set: verify, then parse.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn provider(&self) -> PaymentProvider;

    /// Check the request's authenticity. Missing headers/fields and any
    /// decoding error are simply `false`; the caller decides how to respond.
    fn verify_signature(&self, req: &WebhookRequest) -> bool;

    /// Normalize the payload into one or more events, in input order.
    fn parse_webhook(
        &self,
        req: &WebhookRequest,
    ) -> Result<Vec<NormalizedEvent>, EngineError>;
}

/// Adapters registered by provider, resolved from the URL path segment.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Resolve by provider name; unknown names are a caller error (4xx).
    pub fn by_name(
        &self,
        name: &str,
    ) -> Result<&Arc<dyn ProviderAdapter>, EngineError> {
        let provider = PaymentProvider::from_str(name).map_err(|_| {
            EngineError::validation(format!("Unknown payment provider '{name}'"))
        })?;
        self.adapters.get(&provider).ok_or_else(|| {
            EngineError::validation(format!(
                "Payment provider '{name}' is not enabled"
            ))
        })
    }
}

/// Read an amount field that may arrive as a JSON number or string, already
/// in minor units.
pub(crate) fn minor_amount(value: &Value) -> Option<Amount> {
    match value {
        Value::Number(n) => {
            let cents = n.as_i64()?;
            Amount::from_cents(cents).ok()
        }
        Value::String(s) => Amount::from_minor_str(s).ok(),
        _ => None,
    }
}

/// Read a string field, tolerating numeric JSON values.
pub(crate) fn stringy(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Log-and-default for unknown provider status codes.
pub(crate) fn warn_unknown_status(
    provider: PaymentProvider,
    raw: &str,
) -> keymint_common::enums::TxnStatus {
    warn!(%provider, raw, "Unknown provider status code; defaulting to FAILED");
    keymint_common::enums::TxnStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_and_unregistered() {
        let registry = AdapterRegistry::new();
        assert!(matches!(
            registry.by_name("stripe"),
            Err(EngineError::Validation(_))
        ));
        // "cobre" parses as a provider but nothing is registered.
        assert!(matches!(
            registry.by_name("cobre"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn minor_amount_accepts_number_and_string() {
        assert_eq!(
            minor_amount(&serde_json::json!(100_000)).unwrap().cents(),
            100_000
        );
        assert_eq!(
            minor_amount(&serde_json::json!("100000")).unwrap().cents(),
            100_000
        );
        assert_eq!(minor_amount(&serde_json::json!(null)), None);
        assert_eq!(minor_amount(&serde_json::json!(-5)), None);
    }
}
