//! Row types returned by sqlx, converted into the plain value records the
//! engine consumes. Status columns are TEXT; conversion goes through the
//! common enums' `FromStr`, so a row that violates the schema CHECKs
//! surfaces as a storage error instead of a panic.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use keymint_common::amount::Amount;
use keymint_common::enums::{
    InvoiceStatus, LicenseStatus, OrderStatus, PaymentProvider, TxnStatus,
    WaitlistStatus, WebhookEventType, WebhookStatus,
};
use keymint_common::ids::{
    CustomerId, LicenseId, OrderId, ProductId, TxnId, WaitlistEntryId,
    WebhookEventId,
};
use keymint_common::records::{
    Customer, License, Order, Product, Txn, WaitlistEntry, WebhookEvent,
};
use keymint_common::time::TimestampMs;
use keymint_engine::error::StoreError;
use sqlx::FromRow;

fn ts(dt: DateTime<Utc>) -> TimestampMs {
    TimestampMs::from_utc(dt)
}

fn cents(value: i64, column: &str) -> Result<Amount, StoreError> {
    Amount::from_cents(value).map_err(|err| {
        StoreError::new(anyhow::anyhow!("Column {column} invalid: {err}"))
    })
}

fn parse<T>(raw: &str, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|err| {
        StoreError::new(anyhow::anyhow!(
            "Column {column} holds unrecognized value '{raw}': {err}"
        ))
    })
}

#[derive(FromRow)]
pub struct CustomerRow {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = StoreError;
    fn try_from(row: CustomerRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: CustomerId(row.id),
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            document_type: row.document_type,
            document_number: row.document_number,
            created_at: ts(row.created_at),
        })
    }
}

#[derive(FromRow)]
pub struct ProductRow {
    pub id: i64,
    pub product_ref: String,
    pub name: String,
    pub price: i64,
    pub currency: String,
    pub license_type: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;
    fn try_from(row: ProductRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: ProductId(row.id),
            product_ref: row.product_ref,
            name: row.name,
            price: cents(row.price, "products.price")?,
            currency: row.currency,
            license_type: row.license_type,
            created_at: ts(row.created_at),
        })
    }
}

#[derive(FromRow)]
pub struct OrderRow {
    pub id: i64,
    pub customer_id: i64,
    pub product_ref: String,
    pub qty: i32,
    pub subtotal: i64,
    pub discount_total: i64,
    pub tax_total: i64,
    pub grand_total: i64,
    pub currency: String,
    pub status: String,
    pub shipping_info: serde_json::Value,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;
    fn try_from(row: OrderRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: OrderId(row.id),
            customer_id: CustomerId(row.customer_id),
            product_ref: row.product_ref,
            qty: row.qty,
            subtotal: cents(row.subtotal, "orders.subtotal")?,
            discount_total: cents(row.discount_total, "orders.discount_total")?,
            tax_total: cents(row.tax_total, "orders.tax_total")?,
            grand_total: cents(row.grand_total, "orders.grand_total")?,
            currency: row.currency,
            status: parse::<OrderStatus>(&row.status, "orders.status")?,
            shipping_info: row.shipping_info,
            meta: row.meta,
            created_at: ts(row.created_at),
            updated_at: ts(row.updated_at),
        })
    }
}

#[derive(FromRow)]
pub struct TxnRow {
    pub id: i64,
    pub order_id: i64,
    pub gateway: String,
    pub gateway_ref: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: Option<String>,
    pub invoice_status: Option<String>,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TxnRow> for Txn {
    type Error = StoreError;
    fn try_from(row: TxnRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: TxnId(row.id),
            order_id: OrderId(row.order_id),
            gateway: parse::<PaymentProvider>(
                &row.gateway,
                "transactions.gateway",
            )?,
            gateway_ref: row.gateway_ref,
            amount: cents(row.amount, "transactions.amount")?,
            currency: row.currency,
            status: parse::<TxnStatus>(&row.status, "transactions.status")?,
            payment_method: row.payment_method,
            invoice_status: row
                .invoice_status
                .as_deref()
                .map(|raw| {
                    parse::<InvoiceStatus>(raw, "transactions.invoice_status")
                })
                .transpose()?,
            meta: row.meta,
            created_at: ts(row.created_at),
            updated_at: ts(row.updated_at),
        })
    }
}

#[derive(FromRow)]
pub struct LicenseRow {
    pub id: i64,
    pub product_ref: String,
    pub license_key: String,
    pub status: String,
    pub order_id: Option<i64>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub sold_at: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LicenseRow> for License {
    type Error = StoreError;
    fn try_from(row: LicenseRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: LicenseId(row.id),
            product_ref: row.product_ref,
            license_key: row.license_key,
            status: parse::<LicenseStatus>(&row.status, "licenses.status")?,
            order_id: row.order_id.map(OrderId),
            reserved_at: row.reserved_at.map(ts),
            sold_at: row.sold_at.map(ts),
            instructions: row.instructions,
            created_at: ts(row.created_at),
        })
    }
}

#[derive(FromRow)]
pub struct WaitlistEntryRow {
    pub id: i64,
    pub order_id: i64,
    pub customer_id: i64,
    pub product_ref: String,
    pub qty: i32,
    pub status: String,
    pub priority: DateTime<Utc>,
    pub license_id: Option<i64>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WaitlistEntryRow> for WaitlistEntry {
    type Error = StoreError;
    fn try_from(row: WaitlistEntryRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: WaitlistEntryId(row.id),
            order_id: OrderId(row.order_id),
            customer_id: CustomerId(row.customer_id),
            product_ref: row.product_ref,
            qty: row.qty,
            status: parse::<WaitlistStatus>(
                &row.status,
                "waitlist_entries.status",
            )?,
            priority: ts(row.priority),
            license_id: row.license_id.map(LicenseId),
            retry_count: row.retry_count,
            error_message: row.error_message,
            processed_at: row.processed_at.map(ts),
            created_at: ts(row.created_at),
        })
    }
}

#[derive(FromRow)]
pub struct WebhookEventRow {
    pub id: i64,
    pub provider: String,
    pub external_ref: String,
    pub event_id: String,
    pub event_type: String,
    pub extracted_status: String,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub payload: serde_json::Value,
    pub raw_headers: serde_json::Value,
    pub raw_body: String,
    pub event_index: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = StoreError;
    fn try_from(row: WebhookEventRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: WebhookEventId(row.id),
            provider: parse::<PaymentProvider>(
                &row.provider,
                "webhook_events.provider",
            )?,
            external_ref: row.external_ref,
            event_id: row.event_id,
            event_type: parse::<WebhookEventType>(
                &row.event_type,
                "webhook_events.event_type",
            )?,
            extracted_status: parse::<TxnStatus>(
                &row.extracted_status,
                "webhook_events.extracted_status",
            )?,
            amount: row
                .amount
                .map(|value| cents(value, "webhook_events.amount"))
                .transpose()?,
            currency: row.currency,
            payload: row.payload,
            raw_headers: row.raw_headers,
            raw_body: row.raw_body,
            event_index: row.event_index,
            status: parse::<WebhookStatus>(
                &row.status,
                "webhook_events.status",
            )?,
            error_message: row.error_message,
            processed_at: row.processed_at.map(ts),
            created_at: ts(row.created_at),
        })
    }
}
