//! Plain value records for the persisted entities.
//!
//! These are the rows the storage layer returns: no live connections, no
//! lazily-loaded relations. Cross-entity references are ids only; the engine
//! fetches what it needs explicitly.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::enums::{
    InvoiceStatus, LicenseStatus, OrderStatus, PaymentProvider, TxnStatus,
    WaitlistStatus, WebhookEventType, WebhookStatus,
};
use crate::ids::{
    CustomerId, LicenseId, OrderId, ProductId, TxnId, WaitlistEntryId,
    WebhookEventId,
};
use crate::time::TimestampMs;

/// A storefront customer. Intake finds-or-creates by email.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Identity document type, e.g. "CC" or "NIT". Validated at intake.
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub created_at: TimestampMs,
}

/// A sellable product. `license_type` products deliver a pre-provisioned
/// license key by email; the rest complete immediately on payment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Stable external reference, unique per product.
    pub product_ref: String,
    pub name: String,
    pub price: Amount,
    pub currency: String,
    pub license_type: bool,
    pub created_at: TimestampMs,
}

/// A customer order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub product_ref: String,
    pub qty: i32,
    pub subtotal: Amount,
    pub discount_total: Amount,
    pub tax_total: Amount,
    /// Invariant: `grand_total = subtotal - discount_total + tax_total`.
    pub grand_total: Amount,
    pub currency: String,
    pub status: OrderStatus,
    /// Opaque structured delivery metadata; the engine owns only the
    /// `email` subtree (see [`EmailReceipt`]).
    pub shipping_info: serde_json::Value,
    /// Append-only audit subtrees: `webhook`, `revived`,
    /// `statusVerification`, `licenseChange`.
    pub meta: serde_json::Value,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// A payment attempt against an order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Txn {
    pub id: TxnId,
    pub order_id: OrderId,
    pub gateway: PaymentProvider,
    /// The gateway's correlation id, externally unique per gateway. Also the
    /// webhook idempotency key. `None` until the provider acknowledges the
    /// payment intent.
    pub gateway_ref: Option<String>,
    pub amount: Amount,
    pub currency: String,
    pub status: TxnStatus,
    pub payment_method: Option<String>,
    pub invoice_status: Option<InvoiceStatus>,
    /// Append-only audit subtrees, including `webhook` and `lastWebhookAt`.
    pub meta: serde_json::Value,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Txn {
    /// The `lastWebhookAt` watermark used to drop out-of-order webhooks.
    pub fn last_webhook_at(&self) -> Option<TimestampMs> {
        self.meta
            .get("lastWebhookAt")
            .and_then(serde_json::Value::as_i64)
            .and_then(|ms| TimestampMs::from_i64(ms).ok())
    }
}

/// A pre-provisioned license key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: LicenseId,
    pub product_ref: String,
    pub license_key: String,
    pub status: LicenseStatus,
    /// Weak back-reference, set on sale and cleared on change.
    /// Invariant: `status == Sold` iff `order_id` and `sold_at` are set.
    pub order_id: Option<OrderId>,
    pub reserved_at: Option<TimestampMs>,
    pub sold_at: Option<TimestampMs>,
    pub instructions: Option<String>,
    pub created_at: TimestampMs,
}

/// A paid order awaiting license inventory, FIFO by `priority`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: WaitlistEntryId,
    /// Unique: an order is waitlisted at most once.
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub product_ref: String,
    pub qty: i32,
    pub status: WaitlistStatus,
    /// FIFO ordering key (entry creation time).
    pub priority: TimestampMs,
    pub license_id: Option<LicenseId>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

/// A persisted inbound webhook event: audit trail + idempotency index.
///
/// `(provider, external_ref)` is the idempotency key. A second event with
/// the same key and the same extracted status is a duplicate; a different
/// status updates this record and re-runs the state machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub provider: PaymentProvider,
    pub external_ref: String,
    /// Provider-local event id.
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub extracted_status: TxnStatus,
    pub amount: Option<Amount>,
    pub currency: Option<String>,
    pub payload: serde_json::Value,
    pub raw_headers: serde_json::Value,
    pub raw_body: String,
    pub event_index: i32,
    pub status: WebhookStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

/// The `shipping_info.email` receipt subtree recorded alongside order
/// completion. An order with a license product may only be `Completed` when
/// a receipt with `sent == true` exists.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub recipient: String,
    /// E.g. "license_delivery".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmailReceipt {
    pub fn sent(
        recipient: String,
        kind: &str,
        message_id: Option<String>,
        at: TimestampMs,
    ) -> Self {
        Self {
            sent: true,
            sent_at: Some(at),
            attempted_at: None,
            message_id,
            recipient,
            kind: kind.to_owned(),
            error: None,
        }
    }

    pub fn failed(
        recipient: String,
        kind: &str,
        error: String,
        at: TimestampMs,
    ) -> Self {
        Self {
            sent: false,
            sent_at: None,
            attempted_at: Some(at),
            message_id: None,
            recipient,
            kind: kind.to_owned(),
            error: Some(error),
        }
    }
}

/// Reads the [`EmailReceipt`] out of an order's `shipping_info`, if any.
pub fn email_receipt(shipping_info: &serde_json::Value) -> Option<EmailReceipt> {
    shipping_info
        .get("email")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_receipt_roundtrips_through_shipping_info() {
        let receipt = EmailReceipt::sent(
            "ada@example.com".to_owned(),
            "license_delivery",
            Some("msg-1".to_owned()),
            TimestampMs::now(),
        );
        let shipping_info = serde_json::json!({
            "email": receipt,
            "address": { "city": "Bogotá" },
        });
        assert_eq!(email_receipt(&shipping_info).unwrap(), receipt);
    }

    #[test]
    fn last_webhook_at_reads_meta_watermark() {
        let mut txn_meta = serde_json::json!({ "lastWebhookAt": 1700000000000i64 });
        let txn = Txn {
            id: crate::ids::TxnId(1),
            order_id: crate::ids::OrderId(1),
            gateway: PaymentProvider::Mock,
            gateway_ref: Some("X1".to_owned()),
            amount: Amount::ZERO,
            currency: "COP".to_owned(),
            status: TxnStatus::Pending,
            payment_method: None,
            invoice_status: None,
            meta: txn_meta.take(),
            created_at: TimestampMs::now(),
            updated_at: TimestampMs::now(),
        };
        assert_eq!(
            txn.last_webhook_at().map(TimestampMs::as_i64),
            Some(1_700_000_000_000)
        );
    }
}
