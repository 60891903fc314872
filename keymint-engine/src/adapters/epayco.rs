//! The ePayco confirmation-webhook adapter.
//!
//! ePayco posts `x_*` fields (form-encoded or JSON) and signs them with
//! SHA-256 over the caret-joined tuple
//! `<clientId>^<pKey>^<refPayco>^<transactionId>^<amount>^<currency>`,
//! hex-compared against `x_signature`. Amounts arrive in major units
//! (pesos) and are converted to cents.

use std::collections::BTreeMap;

use keymint_common::amount::Amount;
use keymint_common::enums::{PaymentProvider, TxnStatus, WebhookEventType};
use keymint_common::time::TimestampMs;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::adapters::{ProviderAdapter, stringy, warn_unknown_status};
use crate::error::EngineError;
use crate::event::{NormalizedEvent, WebhookRequest};

pub struct EpaycoAdapter {
    client_id: String,
    p_key: String,
}

impl EpaycoAdapter {
    pub fn new(client_id: String, p_key: String) -> Self {
        Self { client_id, p_key }
    }

    /// ePayco response codes: 1 approved, 2 rejected, 3 pending, 4 failed.
    /// Shared with the outbound client; the validation API reports the same
    /// codes.
    pub(crate) fn map_status(code: &str) -> TxnStatus {
        match code {
            "1" => TxnStatus::Paid,
            "3" => TxnStatus::Pending,
            "2" | "4" => TxnStatus::Failed,
            other => warn_unknown_status(PaymentProvider::Epayco, other),
        }
    }

    /// Extract the `x_*` fields from either a JSON object or a form body.
    fn fields(req: &WebhookRequest) -> Option<BTreeMap<String, String>> {
        if let Ok(Value::Object(map)) = req.parse_json() {
            let fields = map
                .into_iter()
                .filter_map(|(k, v)| stringy(&v).map(|s| (k, s)))
                .collect::<BTreeMap<_, _>>();
            return Some(fields);
        }
        parse_form(req.body())
    }

    fn expected_signature(&self, fields: &BTreeMap<String, String>) -> Option<String> {
        let ref_payco = fields.get("x_ref_payco")?;
        let transaction_id = fields.get("x_transaction_id")?;
        let amount = fields.get("x_amount")?;
        let currency = fields.get("x_currency_code")?;
        let tuple = format!(
            "{}^{}^{ref_payco}^{transaction_id}^{amount}^{currency}",
            self.client_id, self.p_key,
        );
        Some(hex::encode(Sha256::digest(tuple.as_bytes())))
    }
}

/// Minimal `application/x-www-form-urlencoded` parsing; `+` is a space and
/// values are percent-decoded.
fn parse_form(body: &str) -> Option<BTreeMap<String, String>> {
    if body.is_empty() {
        return None;
    }
    let mut fields = BTreeMap::new();
    for pair in body.split('&') {
        let (key, value) = pair.split_once('=')?;
        let decode = |s: &str| {
            percent_decode_str(&s.replace('+', " "))
                .decode_utf8()
                .map(|cow| cow.into_owned())
                .ok()
        };
        fields.insert(decode(key)?, decode(value)?);
    }
    Some(fields)
}

impl ProviderAdapter for EpaycoAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Epayco
    }

    fn verify_signature(&self, req: &WebhookRequest) -> bool {
        let Some(fields) = Self::fields(req) else {
            return false;
        };
        let Some(received) = fields.get("x_signature") else {
            return false;
        };
        match self.expected_signature(&fields) {
            Some(expected) => expected.eq_ignore_ascii_case(received),
            None => false,
        }
    }

    fn parse_webhook(
        &self,
        req: &WebhookRequest,
    ) -> Result<Vec<NormalizedEvent>, EngineError> {
        let fields = Self::fields(req).ok_or_else(|| {
            EngineError::validation(
                "ePayco payload is neither JSON nor form-encoded",
            )
        })?;

        let ref_payco = fields.get("x_ref_payco").cloned();
        let transaction_id = fields.get("x_transaction_id").cloned();
        let external_ref = ref_payco
            .clone()
            .or_else(|| fields.get("x_id_invoice").cloned())
            .or_else(|| transaction_id.clone())
            .ok_or_else(|| {
                EngineError::validation(
                    "ePayco payload carries no correlation id",
                )
            })?;
        let event_id = transaction_id
            .or(ref_payco)
            .unwrap_or_else(|| external_ref.clone());

        let raw_code = fields
            .get("x_cod_response")
            .or_else(|| fields.get("x_cod_transaction_state"))
            .cloned()
            .unwrap_or_default();
        let status = Self::map_status(&raw_code);

        // Major units ("pesos") -> cents.
        let amount = fields
            .get("x_amount")
            .and_then(|raw| Amount::from_major_str(raw).ok());
        let currency = fields.get("x_currency_code").cloned();

        // `x_transaction_date` is Bogota local time without an offset.
        let occurred_at = fields.get("x_transaction_date").and_then(|raw| {
            let naive = chrono::NaiveDateTime::parse_from_str(
                raw,
                "%Y-%m-%d %H:%M:%S",
            )
            .ok()?;
            let bogota = chrono::FixedOffset::west_opt(5 * 3600)?;
            let local = naive.and_local_timezone(bogota).single()?;
            Some(TimestampMs::from_utc(local.to_utc()))
        });

        let payload = Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );

        Ok(vec![NormalizedEvent {
            provider: PaymentProvider::Epayco,
            external_ref,
            event_id,
            event_type: WebhookEventType::Payment,
            status,
            amount,
            currency,
            payload,
            event_index: 0,
            occurred_at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn adapter() -> EpaycoAdapter {
        EpaycoAdapter::new("1234".to_owned(), "pkey".to_owned())
    }

    fn signed_fields(code: &str) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("x_ref_payco".to_owned(), "9001".to_owned());
        fields.insert("x_transaction_id".to_owned(), "tx-55".to_owned());
        fields.insert("x_amount".to_owned(), "550.50".to_owned());
        fields.insert("x_currency_code".to_owned(), "COP".to_owned());
        fields.insert("x_cod_response".to_owned(), code.to_owned());
        fields.insert(
            "x_transaction_date".to_owned(),
            "2024-04-24 19:26:40".to_owned(),
        );
        let signature = adapter().expected_signature(&fields).unwrap();
        fields.insert("x_signature".to_owned(), signature);
        fields
    }

    fn json_request(fields: &BTreeMap<String, String>) -> WebhookRequest {
        WebhookRequest::new(vec![], json!(fields).to_string())
    }

    #[test]
    fn valid_signature_verifies() {
        let fields = signed_fields("1");
        assert!(adapter().verify_signature(&json_request(&fields)));
    }

    #[test]
    fn tampered_amount_fails() {
        let mut fields = signed_fields("1");
        fields.insert("x_amount".to_owned(), "1.00".to_owned());
        assert!(!adapter().verify_signature(&json_request(&fields)));
    }

    #[test]
    fn missing_fields_fail_closed() {
        let mut fields = signed_fields("1");
        fields.remove("x_signature");
        assert!(!adapter().verify_signature(&json_request(&fields)));

        let mut fields = signed_fields("1");
        fields.remove("x_currency_code");
        assert!(!adapter().verify_signature(&json_request(&fields)));
    }

    #[test]
    fn form_bodies_are_parsed_and_verified() {
        let fields = signed_fields("1");
        let body = fields
            .iter()
            .map(|(k, v)| format!("{k}={}", v.replace(' ', "+")))
            .collect::<Vec<_>>()
            .join("&");
        let req = WebhookRequest::new(vec![], body);
        assert!(adapter().verify_signature(&req));

        let events = adapter().parse_webhook(&req).unwrap();
        assert_eq!(events[0].external_ref, "9001");
    }

    #[test]
    fn status_codes_map_per_table() {
        for (code, expected) in [
            ("1", TxnStatus::Paid),
            ("2", TxnStatus::Failed),
            ("3", TxnStatus::Pending),
            ("4", TxnStatus::Failed),
            ("99", TxnStatus::Failed),
        ] {
            let fields = signed_fields(code);
            let events =
                adapter().parse_webhook(&json_request(&fields)).unwrap();
            assert_eq!(events[0].status, expected, "code {code}");
        }
    }

    #[test]
    fn pesos_convert_to_cents() {
        let fields = signed_fields("1");
        let events = adapter().parse_webhook(&json_request(&fields)).unwrap();
        assert_eq!(events[0].amount.unwrap().cents(), 55_050);
    }

    #[test]
    fn transaction_date_is_bogota_local() {
        let fields = signed_fields("1");
        let events = adapter().parse_webhook(&json_request(&fields)).unwrap();
        // 2024-04-24 19:26:40 -05:00 == 2024-04-25T00:26:40Z
        assert_eq!(
            events[0].occurred_at.unwrap().to_utc().to_rfc3339(),
            "2024-04-25T00:26:40+00:00"
        );
    }
}
