//! An in-memory [`Store`] with the same atomicity and FIFO semantics as the
//! Postgres implementation: one big async mutex plays the role of row locks
//! (every transaction is serialized), and rollback restores a snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use keymint_common::amount::Amount;
use keymint_common::enums::{
    InvoiceStatus, LicenseStatus, OrderStatus, PaymentProvider, TxnStatus,
    WaitlistStatus, WebhookStatus,
};
use keymint_common::ids::{
    CustomerId, LicenseId, OrderId, ProductId, TxnId, WaitlistEntryId,
    WebhookEventId,
};
use keymint_common::records::{
    Customer, EmailReceipt, License, Order, Product, Txn, WaitlistEntry,
    WebhookEvent,
};
use keymint_common::time::TimestampMs;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StoreError;
use crate::traits::{
    NewCustomer, NewLicense, NewOrder, NewTxn, NewWaitlistEntry,
    NewWebhookEvent, Store, StoreTx,
};

fn conflict(msg: &str) -> StoreError {
    StoreError::new(anyhow::anyhow!("unique constraint violated: {msg}"))
}

/// All tables plus the id sequence.
#[derive(Clone, Debug, Default)]
pub struct MemState {
    next_id: i64,
    pub customers: BTreeMap<i64, Customer>,
    pub products: BTreeMap<i64, Product>,
    pub orders: BTreeMap<i64, Order>,
    pub txns: BTreeMap<i64, Txn>,
    pub licenses: BTreeMap<i64, License>,
    pub waitlist: BTreeMap<i64, WaitlistEntry>,
    pub webhook_events: BTreeMap<i64, WebhookEvent>,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

pub struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    snapshot: MemState,
    committed: bool,
}

impl Drop for MemTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = self.snapshot.clone();
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure against a read-only view of the state; assertion
    /// helper for tests.
    pub async fn with_state<R>(&self, f: impl FnOnce(&MemState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    // --- Fixture seeding --- //

    pub async fn seed_product(
        &self,
        product_ref: &str,
        price: Amount,
        license_type: bool,
    ) -> Product {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let product = Product {
            id: ProductId(id),
            product_ref: product_ref.to_owned(),
            name: format!("Product {product_ref}"),
            price,
            currency: "COP".to_owned(),
            license_type,
            created_at: TimestampMs::now(),
        };
        state.products.insert(id, product.clone());
        product
    }

    pub async fn seed_customer(&self, email: &str) -> Customer {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let customer = Customer {
            id: CustomerId(id),
            email: email.to_owned(),
            first_name: "Ada".to_owned(),
            last_name: "Lovelace".to_owned(),
            document_type: Some("CC".to_owned()),
            document_number: Some("100".to_owned()),
            created_at: TimestampMs::now(),
        };
        state.customers.insert(id, customer.clone());
        customer
    }

    pub async fn seed_licenses(
        &self,
        product_ref: &str,
        keys: &[&str],
    ) -> Vec<License> {
        let mut state = self.state.lock().await;
        let mut licenses = Vec::with_capacity(keys.len());
        for key in keys {
            let id = state.next_id();
            let license = License {
                id: LicenseId(id),
                product_ref: product_ref.to_owned(),
                license_key: (*key).to_owned(),
                status: LicenseStatus::Available,
                order_id: None,
                reserved_at: None,
                sold_at: None,
                instructions: None,
                created_at: TimestampMs::now(),
            };
            state.licenses.insert(id, license.clone());
            licenses.push(license);
        }
        licenses
    }

    /// An order in PENDING with one transaction, gateway ref set, in the
    /// given status.
    pub async fn seed_order_with_txn(
        &self,
        customer: &Customer,
        product_ref: &str,
        amount: Amount,
        gateway: PaymentProvider,
        gateway_ref: Option<&str>,
        txn_status: TxnStatus,
    ) -> (Order, Txn) {
        let mut state = self.state.lock().await;
        let now = TimestampMs::now();
        let order_id = state.next_id();
        let order = Order {
            id: OrderId(order_id),
            customer_id: customer.id,
            product_ref: product_ref.to_owned(),
            qty: 1,
            subtotal: amount,
            discount_total: Amount::ZERO,
            tax_total: Amount::ZERO,
            grand_total: amount,
            currency: "COP".to_owned(),
            status: OrderStatus::Pending,
            shipping_info: json!({}),
            meta: json!({}),
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(order_id, order.clone());
        let txn_id = state.next_id();
        let txn = Txn {
            id: TxnId(txn_id),
            order_id: order.id,
            gateway,
            gateway_ref: gateway_ref.map(str::to_owned),
            amount,
            currency: "COP".to_owned(),
            status: txn_status,
            payment_method: None,
            invoice_status: None,
            meta: json!({}),
            created_at: now,
            updated_at: now,
        };
        state.txns.insert(txn_id, txn.clone());
        (order, txn)
    }
}

#[async_trait]
impl Store for MemStore {
    type Tx = MemTx;

    async fn begin(&self) -> Result<MemTx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(MemTx {
            guard,
            snapshot,
            committed: false,
        })
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id.0).cloned())
    }

    async fn txn(&self, id: TxnId) -> Result<Option<Txn>, StoreError> {
        Ok(self.state.lock().await.txns.get(&id.0).cloned())
    }

    async fn txns_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<Txn>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .txns
            .values()
            .filter(|txn| txn.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn customer(
        &self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(self.state.lock().await.customers.get(&id.0).cloned())
    }

    async fn product_by_ref(
        &self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .products
            .values()
            .find(|product| product.product_ref == product_ref)
            .cloned())
    }

    async fn license(
        &self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError> {
        Ok(self.state.lock().await.licenses.get(&id.0).cloned())
    }

    async fn license_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .licenses
            .values()
            .find(|license| {
                license.order_id == Some(order_id)
                    && license.status == LicenseStatus::Sold
            })
            .cloned())
    }

    async fn waitlist_entry(
        &self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        Ok(self.state.lock().await.waitlist.get(&id.0).cloned())
    }

    async fn stuck_open_txns(
        &self,
        cutoff: TimestampMs,
        limit: i64,
    ) -> Result<Vec<Txn>, StoreError> {
        let state = self.state.lock().await;
        let mut stuck = state
            .txns
            .values()
            .filter(|txn| txn.status.is_open() && txn.created_at <= cutoff)
            .cloned()
            .collect::<Vec<_>>();
        stuck.sort_by_key(|txn| txn.created_at);
        stuck.truncate(limit as usize);
        Ok(stuck)
    }
}

#[async_trait]
impl StoreTx for MemTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        *self.guard = self.snapshot.clone();
        self.committed = true;
        Ok(())
    }

    // --- Webhook events --- //

    async fn webhook_event_by_key(
        &mut self,
        provider: PaymentProvider,
        external_ref: &str,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self
            .guard
            .webhook_events
            .values()
            .find(|event| {
                event.provider == provider
                    && event.external_ref == external_ref
            })
            .cloned())
    }

    async fn insert_webhook_event(
        &mut self,
        new: NewWebhookEvent,
    ) -> Result<WebhookEvent, StoreError> {
        let duplicate = self.guard.webhook_events.values().any(|event| {
            event.provider == new.provider
                && event.external_ref == new.external_ref
        });
        if duplicate {
            return Err(conflict("webhook_events(provider, external_ref)"));
        }
        let id = self.guard.next_id();
        let event = WebhookEvent {
            id: WebhookEventId(id),
            provider: new.provider,
            external_ref: new.external_ref,
            event_id: new.event_id,
            event_type: new.event_type,
            extracted_status: new.extracted_status,
            amount: new.amount,
            currency: new.currency,
            payload: new.payload,
            raw_headers: new.raw_headers,
            raw_body: new.raw_body,
            event_index: new.event_index,
            status: WebhookStatus::Pending,
            error_message: None,
            processed_at: None,
            created_at: TimestampMs::now(),
        };
        self.guard.webhook_events.insert(id, event.clone());
        Ok(event)
    }

    async fn update_webhook_event_outcome(
        &mut self,
        id: WebhookEventId,
        status: WebhookStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let event = self
            .guard
            .webhook_events
            .get_mut(&id.0)
            .ok_or_else(|| conflict("webhook event vanished"))?;
        event.status = status;
        event.error_message = error_message;
        event.processed_at = Some(TimestampMs::now());
        Ok(())
    }

    async fn update_webhook_event_replay(
        &mut self,
        id: WebhookEventId,
        event_id: &str,
        extracted_status: TxnStatus,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let event = self
            .guard
            .webhook_events
            .get_mut(&id.0)
            .ok_or_else(|| conflict("webhook event vanished"))?;
        event.event_id = event_id.to_owned();
        event.extracted_status = extracted_status;
        event.payload = payload.clone();
        event.status = WebhookStatus::Pending;
        Ok(())
    }

    // --- Transactions --- //

    async fn txn_by_gateway_ref(
        &mut self,
        gateway: PaymentProvider,
        gateway_ref: &str,
    ) -> Result<Option<Txn>, StoreError> {
        Ok(self
            .guard
            .txns
            .values()
            .find(|txn| {
                txn.gateway == gateway
                    && txn.gateway_ref.as_deref() == Some(gateway_ref)
            })
            .cloned())
    }

    async fn txn_for_update(
        &mut self,
        id: TxnId,
    ) -> Result<Option<Txn>, StoreError> {
        Ok(self.guard.txns.get(&id.0).cloned())
    }

    async fn open_txns_by_amount(
        &mut self,
        gateway: PaymentProvider,
        amount: Amount,
        cutoff: TimestampMs,
    ) -> Result<Vec<Txn>, StoreError> {
        Ok(self
            .guard
            .txns
            .values()
            .filter(|txn| {
                txn.gateway == gateway
                    && txn.status.is_open()
                    && txn.amount == amount
                    && txn.created_at >= cutoff
            })
            .cloned()
            .collect())
    }

    async fn update_txn_transition(
        &mut self,
        id: TxnId,
        status: TxnStatus,
        payment_method: Option<&str>,
        invoice_status: Option<InvoiceStatus>,
        meta: &Value,
    ) -> Result<(), StoreError> {
        let txn = self
            .guard
            .txns
            .get_mut(&id.0)
            .ok_or_else(|| conflict("transaction vanished"))?;
        txn.status = status;
        if let Some(method) = payment_method {
            txn.payment_method = Some(method.to_owned());
        }
        if let Some(invoice) = invoice_status {
            txn.invoice_status = Some(invoice);
        }
        txn.meta = meta.clone();
        txn.updated_at = TimestampMs::now();
        Ok(())
    }

    async fn set_txn_gateway_ref(
        &mut self,
        id: TxnId,
        gateway_ref: &str,
        status: TxnStatus,
    ) -> Result<(), StoreError> {
        let txn = self
            .guard
            .txns
            .get_mut(&id.0)
            .ok_or_else(|| conflict("transaction vanished"))?;
        txn.gateway_ref = Some(gateway_ref.to_owned());
        txn.status = status;
        txn.updated_at = TimestampMs::now();
        Ok(())
    }

    async fn count_open_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError> {
        Ok(self
            .guard
            .txns
            .values()
            .filter(|txn| {
                txn.order_id == order_id
                    && txn.id != excluded
                    && txn.status.is_open()
            })
            .count() as i64)
    }

    async fn count_paid_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError> {
        Ok(self
            .guard
            .txns
            .values()
            .filter(|txn| {
                txn.order_id == order_id
                    && txn.id != excluded
                    && txn.status == TxnStatus::Paid
            })
            .count() as i64)
    }

    // --- Orders --- //

    async fn order_for_update(
        &mut self,
        id: OrderId,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self.guard.orders.get(&id.0).cloned())
    }

    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        let order = self
            .guard
            .orders
            .get_mut(&id.0)
            .ok_or_else(|| conflict("order vanished"))?;
        order.status = status;
        order.updated_at = TimestampMs::now();
        Ok(())
    }

    async fn set_order_shipping_email(
        &mut self,
        id: OrderId,
        receipt: &EmailReceipt,
    ) -> Result<(), StoreError> {
        let order = self
            .guard
            .orders
            .get_mut(&id.0)
            .ok_or_else(|| conflict("order vanished"))?;
        if !order.shipping_info.is_object() {
            order.shipping_info = json!({});
        }
        order.shipping_info["email"] =
            serde_json::to_value(receipt).expect("Receipt serializes");
        order.updated_at = TimestampMs::now();
        Ok(())
    }

    async fn set_order_meta(
        &mut self,
        id: OrderId,
        meta: &Value,
    ) -> Result<(), StoreError> {
        let order = self
            .guard
            .orders
            .get_mut(&id.0)
            .ok_or_else(|| conflict("order vanished"))?;
        order.meta = meta.clone();
        order.updated_at = TimestampMs::now();
        Ok(())
    }

    async fn insert_order(
        &mut self,
        new: NewOrder,
    ) -> Result<Order, StoreError> {
        let id = self.guard.next_id();
        let now = TimestampMs::now();
        let order = Order {
            id: OrderId(id),
            customer_id: new.customer_id,
            product_ref: new.product_ref,
            qty: new.qty,
            subtotal: new.subtotal,
            discount_total: new.discount_total,
            tax_total: new.tax_total,
            grand_total: new.grand_total,
            currency: new.currency,
            status: OrderStatus::Pending,
            shipping_info: new.shipping_info,
            meta: json!({}),
            created_at: now,
            updated_at: now,
        };
        self.guard.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn insert_txn(&mut self, new: NewTxn) -> Result<Txn, StoreError> {
        let id = self.guard.next_id();
        let now = TimestampMs::now();
        let txn = Txn {
            id: TxnId(id),
            order_id: new.order_id,
            gateway: new.gateway,
            gateway_ref: None,
            amount: new.amount,
            currency: new.currency,
            status: TxnStatus::Created,
            payment_method: None,
            invoice_status: None,
            meta: json!({}),
            created_at: now,
            updated_at: now,
        };
        self.guard.txns.insert(id, txn.clone());
        Ok(txn)
    }

    // --- Customers & products --- //

    async fn customer(
        &mut self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(self.guard.customers.get(&id.0).cloned())
    }

    async fn customer_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(self
            .guard
            .customers
            .values()
            .find(|customer| customer.email == email)
            .cloned())
    }

    async fn insert_customer(
        &mut self,
        new: NewCustomer,
    ) -> Result<Customer, StoreError> {
        if self
            .guard
            .customers
            .values()
            .any(|customer| customer.email == new.email)
        {
            return Err(conflict("customers(email)"));
        }
        let id = self.guard.next_id();
        let customer = Customer {
            id: CustomerId(id),
            email: new.email,
            first_name: new.first_name,
            last_name: new.last_name,
            document_type: new.document_type,
            document_number: new.document_number,
            created_at: TimestampMs::now(),
        };
        self.guard.customers.insert(id, customer.clone());
        Ok(customer)
    }

    async fn product_by_ref(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError> {
        Ok(self
            .guard
            .products
            .values()
            .find(|product| product.product_ref == product_ref)
            .cloned())
    }

    // --- Licenses --- //

    async fn lock_available_license(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<License>, StoreError> {
        Ok(self
            .guard
            .licenses
            .values()
            .filter(|license| {
                license.product_ref == product_ref
                    && license.status == LicenseStatus::Available
            })
            .min_by_key(|license| license.id.0)
            .cloned())
    }

    async fn lock_available_licenses(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<License>, StoreError> {
        let mut available = self
            .guard
            .licenses
            .values()
            .filter(|license| {
                license.product_ref == product_ref
                    && license.status == LicenseStatus::Available
            })
            .cloned()
            .collect::<Vec<_>>();
        available.sort_by_key(|license| license.id.0);
        available.truncate(limit as usize);
        Ok(available)
    }

    async fn license_for_update(
        &mut self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError> {
        Ok(self.guard.licenses.get(&id.0).cloned())
    }

    async fn sold_license_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError> {
        Ok(self
            .guard
            .licenses
            .values()
            .find(|license| {
                license.order_id == Some(order_id)
                    && license.status == LicenseStatus::Sold
            })
            .cloned())
    }

    async fn mark_license_sold(
        &mut self,
        id: LicenseId,
        order_id: OrderId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        let license = self
            .guard
            .licenses
            .get_mut(&id.0)
            .ok_or_else(|| conflict("license vanished"))?;
        license.status = LicenseStatus::Sold;
        license.order_id = Some(order_id);
        license.sold_at = Some(at);
        Ok(())
    }

    async fn mark_license_reserved(
        &mut self,
        id: LicenseId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        let license = self
            .guard
            .licenses
            .get_mut(&id.0)
            .ok_or_else(|| conflict("license vanished"))?;
        license.status = LicenseStatus::Reserved;
        license.reserved_at = Some(at);
        Ok(())
    }

    async fn release_license(
        &mut self,
        id: LicenseId,
    ) -> Result<(), StoreError> {
        let license = self
            .guard
            .licenses
            .get_mut(&id.0)
            .ok_or_else(|| conflict("license vanished"))?;
        license.status = LicenseStatus::Available;
        license.order_id = None;
        license.reserved_at = None;
        license.sold_at = None;
        Ok(())
    }

    async fn insert_licenses(
        &mut self,
        product_ref: &str,
        licenses: &[NewLicense],
    ) -> Result<u64, StoreError> {
        for new in licenses {
            let duplicate = self
                .guard
                .licenses
                .values()
                .any(|license| license.license_key == new.license_key);
            if duplicate {
                return Err(conflict("licenses(license_key)"));
            }
            let id = self.guard.next_id();
            self.guard.licenses.insert(id, License {
                id: LicenseId(id),
                product_ref: product_ref.to_owned(),
                license_key: new.license_key.clone(),
                status: LicenseStatus::Available,
                order_id: None,
                reserved_at: None,
                sold_at: None,
                instructions: new.instructions.clone(),
                created_at: TimestampMs::now(),
            });
        }
        Ok(licenses.len() as u64)
    }

    async fn count_available_licenses(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError> {
        Ok(self
            .guard
            .licenses
            .values()
            .filter(|license| {
                license.product_ref == product_ref
                    && license.status == LicenseStatus::Available
            })
            .count() as i64)
    }

    // --- Waitlist --- //

    async fn insert_waitlist_entry(
        &mut self,
        new: NewWaitlistEntry,
    ) -> Result<WaitlistEntry, StoreError> {
        if self
            .guard
            .waitlist
            .values()
            .any(|entry| entry.order_id == new.order_id)
        {
            return Err(conflict("waitlist_entries(order_id)"));
        }
        let id = self.guard.next_id();
        let entry = WaitlistEntry {
            id: WaitlistEntryId(id),
            order_id: new.order_id,
            customer_id: new.customer_id,
            product_ref: new.product_ref,
            qty: new.qty,
            status: WaitlistStatus::Pending,
            priority: new.priority,
            license_id: None,
            retry_count: 0,
            error_message: None,
            processed_at: None,
            created_at: TimestampMs::now(),
        };
        self.guard.waitlist.insert(id, entry.clone());
        Ok(entry)
    }

    async fn waitlist_entry_for_update(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        Ok(self.guard.waitlist.get(&id.0).cloned())
    }

    async fn count_pending_waitlist(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError> {
        Ok(self
            .guard
            .waitlist
            .values()
            .filter(|entry| {
                entry.product_ref == product_ref
                    && entry.status == WaitlistStatus::Pending
            })
            .count() as i64)
    }

    async fn lock_pending_waitlist(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<WaitlistEntry>, StoreError> {
        let mut pending = self
            .guard
            .waitlist
            .values()
            .filter(|entry| {
                entry.product_ref == product_ref
                    && entry.status == WaitlistStatus::Pending
            })
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by_key(|entry| (entry.priority, entry.id.0));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn lock_oldest_ready_entry(
        &mut self,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        Ok(self
            .guard
            .waitlist
            .values()
            .filter(|entry| entry.status == WaitlistStatus::ReadyForEmail)
            .min_by_key(|entry| (entry.priority, entry.id.0))
            .cloned())
    }

    async fn set_waitlist_status(
        &mut self,
        id: WaitlistEntryId,
        status: WaitlistStatus,
    ) -> Result<(), StoreError> {
        let entry = self
            .guard
            .waitlist
            .get_mut(&id.0)
            .ok_or_else(|| conflict("waitlist entry vanished"))?;
        entry.status = status;
        Ok(())
    }

    async fn stage_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        license_id: LicenseId,
    ) -> Result<(), StoreError> {
        let entry = self
            .guard
            .waitlist
            .get_mut(&id.0)
            .ok_or_else(|| conflict("waitlist entry vanished"))?;
        entry.status = WaitlistStatus::ReadyForEmail;
        entry.license_id = Some(license_id);
        Ok(())
    }

    async fn complete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        let entry = self
            .guard
            .waitlist
            .get_mut(&id.0)
            .ok_or_else(|| conflict("waitlist entry vanished"))?;
        entry.status = WaitlistStatus::Completed;
        entry.processed_at = Some(at);
        Ok(())
    }

    async fn retry_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
    ) -> Result<(), StoreError> {
        let entry = self
            .guard
            .waitlist
            .get_mut(&id.0)
            .ok_or_else(|| conflict("waitlist entry vanished"))?;
        entry.status = WaitlistStatus::ReadyForEmail;
        entry.retry_count = retry_count;
        Ok(())
    }

    async fn fail_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let entry = self
            .guard
            .waitlist
            .get_mut(&id.0)
            .ok_or_else(|| conflict("waitlist entry vanished"))?;
        entry.status = WaitlistStatus::Failed;
        entry.retry_count = retry_count;
        entry.error_message = Some(error_message.to_owned());
        Ok(())
    }

    async fn delete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<(), StoreError> {
        self.guard.waitlist.remove(&id.0);
        Ok(())
    }
}
