//! Traits at the seams: storage, outbound mail, and provider status APIs.
//!
//! The engine is generic over these so the same state machine runs against
//! Postgres in production and the in-memory store in tests. Implementations
//! must provide the locking discipline the engine assumes: any row returned
//! by a `*_for_update` / `lock_*` method inside a [`StoreTx`] is exclusively
//! locked until commit or rollback.

use async_trait::async_trait;
use keymint_common::amount::Amount;
use keymint_common::enums::{
    InvoiceStatus, OrderStatus, PaymentProvider, TxnStatus, WaitlistStatus,
    WebhookEventType, WebhookStatus,
};
use keymint_common::ids::{
    CustomerId, LicenseId, OrderId, TxnId, WaitlistEntryId, WebhookEventId,
};
use keymint_common::records::{
    Customer, EmailReceipt, License, Order, Product, Txn, WaitlistEntry,
    WebhookEvent,
};
use keymint_common::time::TimestampMs;
use serde_json::Value;

use crate::error::{EngineError, StoreError};

// --- New-record inputs --- //

#[derive(Clone, Debug)]
pub struct NewCustomer {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewOrder {
    pub customer_id: CustomerId,
    pub product_ref: String,
    pub qty: i32,
    pub subtotal: Amount,
    pub discount_total: Amount,
    pub tax_total: Amount,
    pub grand_total: Amount,
    pub currency: String,
    pub shipping_info: Value,
}

#[derive(Clone, Debug)]
pub struct NewTxn {
    pub order_id: OrderId,
    pub gateway: PaymentProvider,
    pub amount: Amount,
    pub currency: String,
}

#[derive(Clone, Debug)]
pub struct NewLicense {
    pub license_key: String,
    pub instructions: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewWaitlistEntry {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub product_ref: String,
    pub qty: i32,
    pub priority: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct NewWebhookEvent {
    pub provider: PaymentProvider,
    pub external_ref: String,
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub extracted_status: TxnStatus,
    pub amount: Option<Amount>,
    pub currency: Option<String>,
    pub payload: Value,
    pub raw_headers: Value,
    pub raw_body: String,
    pub event_index: i32,
}

// --- Storage --- //

/// Handle to the storage backend. Cheap to clone; the non-transactional
/// methods are plain reads with no locks.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a transaction. All mutations go through [`StoreTx`].
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;
    async fn txn(&self, id: TxnId) -> Result<Option<Txn>, StoreError>;
    async fn txns_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<Txn>, StoreError>;
    async fn customer(
        &self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError>;
    async fn product_by_ref(
        &self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError>;
    async fn license(
        &self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError>;
    /// The SOLD license backing an order, if any. Plain read, no lock.
    async fn license_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError>;
    async fn waitlist_entry(
        &self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError>;

    /// Transactions still open (CREATED/PENDING) created before `cutoff`,
    /// oldest first; the reconciliation sweep feed.
    async fn stuck_open_txns(
        &self,
        cutoff: TimestampMs,
        limit: i64,
    ) -> Result<Vec<Txn>, StoreError>;
}

/// An open storage transaction. Dropping without commit rolls back.
#[async_trait]
pub trait StoreTx: Send + Sized {
    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;

    // --- Webhook events (idempotency index) --- //

    async fn webhook_event_by_key(
        &mut self,
        provider: PaymentProvider,
        external_ref: &str,
    ) -> Result<Option<WebhookEvent>, StoreError>;
    async fn insert_webhook_event(
        &mut self,
        new: NewWebhookEvent,
    ) -> Result<WebhookEvent, StoreError>;
    /// Record the processing outcome; sets `processed_at` to now.
    async fn update_webhook_event_outcome(
        &mut self,
        id: WebhookEventId,
        status: WebhookStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
    /// A status-changing replay: refresh the stored event id, extracted
    /// status, and payload before the state machine re-runs.
    async fn update_webhook_event_replay(
        &mut self,
        id: WebhookEventId,
        event_id: &str,
        extracted_status: TxnStatus,
        payload: &Value,
    ) -> Result<(), StoreError>;

    // --- Transactions --- //

    /// Locked lookup by the gateway correlation id.
    async fn txn_by_gateway_ref(
        &mut self,
        gateway: PaymentProvider,
        gateway_ref: &str,
    ) -> Result<Option<Txn>, StoreError>;
    async fn txn_for_update(
        &mut self,
        id: TxnId,
    ) -> Result<Option<Txn>, StoreError>;
    /// The amount-correlation fallback: open transactions on this gateway
    /// with this amount created at or after `cutoff`.
    async fn open_txns_by_amount(
        &mut self,
        gateway: PaymentProvider,
        amount: Amount,
        cutoff: TimestampMs,
    ) -> Result<Vec<Txn>, StoreError>;
    /// Apply a transition: status, optional payment method, optional invoice
    /// status, and the merged `meta` document.
    async fn update_txn_transition(
        &mut self,
        id: TxnId,
        status: TxnStatus,
        payment_method: Option<&str>,
        invoice_status: Option<InvoiceStatus>,
        meta: &Value,
    ) -> Result<(), StoreError>;
    async fn set_txn_gateway_ref(
        &mut self,
        id: TxnId,
        gateway_ref: &str,
        status: TxnStatus,
    ) -> Result<(), StoreError>;
    async fn count_open_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError>;
    async fn count_paid_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError>;

    // --- Orders --- //

    async fn order_for_update(
        &mut self,
        id: OrderId,
    ) -> Result<Option<Order>, StoreError>;
    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StoreError>;
    /// Write the `shipping_info.email` receipt subtree.
    async fn set_order_shipping_email(
        &mut self,
        id: OrderId,
        receipt: &EmailReceipt,
    ) -> Result<(), StoreError>;
    async fn set_order_meta(
        &mut self,
        id: OrderId,
        meta: &Value,
    ) -> Result<(), StoreError>;
    async fn insert_order(
        &mut self,
        new: NewOrder,
    ) -> Result<Order, StoreError>;
    async fn insert_txn(&mut self, new: NewTxn) -> Result<Txn, StoreError>;

    // --- Customers & products --- //

    async fn customer(
        &mut self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError>;
    async fn customer_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<Customer>, StoreError>;
    async fn insert_customer(
        &mut self,
        new: NewCustomer,
    ) -> Result<Customer, StoreError>;
    async fn product_by_ref(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError>;

    // --- Licenses --- //

    /// Lock and return the first AVAILABLE license of the product, if any.
    async fn lock_available_license(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<License>, StoreError>;
    /// Lock up to `limit` AVAILABLE licenses, oldest first.
    async fn lock_available_licenses(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<License>, StoreError>;
    async fn license_for_update(
        &mut self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError>;
    /// Locked lookup of the SOLD license backing an order, if any.
    async fn sold_license_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError>;
    async fn mark_license_sold(
        &mut self,
        id: LicenseId,
        order_id: OrderId,
        at: TimestampMs,
    ) -> Result<(), StoreError>;
    async fn mark_license_reserved(
        &mut self,
        id: LicenseId,
        at: TimestampMs,
    ) -> Result<(), StoreError>;
    /// Reset a license to AVAILABLE, clearing the order back-reference and
    /// both lifecycle timestamps.
    async fn release_license(&mut self, id: LicenseId)
    -> Result<(), StoreError>;
    async fn insert_licenses(
        &mut self,
        product_ref: &str,
        licenses: &[NewLicense],
    ) -> Result<u64, StoreError>;
    async fn count_available_licenses(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError>;

    // --- Waitlist --- //

    async fn insert_waitlist_entry(
        &mut self,
        new: NewWaitlistEntry,
    ) -> Result<WaitlistEntry, StoreError>;
    async fn waitlist_entry_for_update(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError>;
    async fn count_pending_waitlist(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError>;
    /// Lock up to `limit` PENDING entries of the product, FIFO by priority.
    async fn lock_pending_waitlist(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<WaitlistEntry>, StoreError>;
    /// Lock the single oldest READY_FOR_EMAIL entry across all products.
    async fn lock_oldest_ready_entry(
        &mut self,
    ) -> Result<Option<WaitlistEntry>, StoreError>;
    async fn set_waitlist_status(
        &mut self,
        id: WaitlistEntryId,
        status: WaitlistStatus,
    ) -> Result<(), StoreError>;
    /// PENDING -> READY_FOR_EMAIL with the paired license recorded.
    async fn stage_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        license_id: LicenseId,
    ) -> Result<(), StoreError>;
    async fn complete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        at: TimestampMs,
    ) -> Result<(), StoreError>;
    /// Bounded retry: back to READY_FOR_EMAIL with the bumped count.
    async fn retry_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
    ) -> Result<(), StoreError>;
    async fn fail_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
        error_message: &str,
    ) -> Result<(), StoreError>;
    async fn delete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<(), StoreError>;
}

// --- Outbound mail --- //

/// A rendered email ready for the transactional-mail API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutgoingEmail {
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub html_body: String,
    /// Correlation tags, e.g. `license_delivery` or
    /// `waitlist_<entryId>_<nowMillis>`.
    pub tags: Vec<String>,
}

/// The outbound mail seam. Returns the provider message id on success.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(
        &self,
        email: &OutgoingEmail,
    ) -> Result<String, EngineError>;
}

// --- Provider status API (reconciliation) --- //

/// The provider's canonical view of a payment, fetched out-of-band.
#[derive(Clone, Debug)]
pub struct CanonicalStatus {
    /// Must equal the transaction's `gateway_ref`.
    pub external_id: String,
    /// Already mapped through the provider status table.
    pub status: TxnStatus,
    /// The provider's own status word, kept for the audit trail.
    pub raw_status: String,
    pub amount: Amount,
    pub currency: String,
}

/// Outbound status queries against one provider.
#[async_trait]
pub trait ProviderApi: Send + Sync + 'static {
    fn provider(&self) -> PaymentProvider;

    /// Discover the provider-side status id (e.g. the money-movement id) for
    /// a checkout when the caller doesn't already know it.
    async fn find_status_id(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<String>, EngineError>;

    /// Fetch the canonical status. `bypass_cache` forces a live read.
    async fn canonical_status(
        &self,
        status_id: &str,
        bypass_cache: bool,
    ) -> Result<CanonicalStatus, EngineError>;
}
