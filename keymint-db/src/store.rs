//! The Postgres implementation of the engine's storage seam.
//!
//! Locking discipline: every `*_for_update` / `lock_*` method issues
//! `SELECT ... FOR UPDATE`, so rows the engine intends to mutate are held
//! exclusively until the transaction commits or rolls back. The waitlist
//! locks use plain FOR UPDATE (not SKIP LOCKED): the single-threaded
//! schedulers are the only writers that contend on ordering, and FIFO must
//! hold even when an admin races a tick.

use async_trait::async_trait;
use keymint_common::amount::Amount;
use keymint_common::enums::{
    InvoiceStatus, OrderStatus, PaymentProvider, TxnStatus, WaitlistStatus,
    WebhookStatus,
};
use keymint_common::ids::{
    CustomerId, LicenseId, OrderId, TxnId, WaitlistEntryId, WebhookEventId,
};
use keymint_common::records::{
    Customer, EmailReceipt, License, Order, Product, Txn, WaitlistEntry,
    WebhookEvent,
};
use keymint_common::time::TimestampMs;
use keymint_engine::error::StoreError;
use keymint_engine::traits::{
    NewCustomer, NewLicense, NewOrder, NewTxn, NewWaitlistEntry,
    NewWebhookEvent, Store, StoreTx,
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{
    CustomerRow, LicenseRow, OrderRow, ProductRow, TxnRow, WaitlistEntryRow,
    WebhookEventRow,
};

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::new(err)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(PgTx { tx })
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Order::try_from)
            .transpose()
    }

    async fn txn(&self, id: TxnId) -> Result<Option<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Txn::try_from)
        .transpose()
    }

    async fn txns_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(Txn::try_from)
        .collect()
    }

    async fn customer(
        &self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        sqlx::query_as::<_, CustomerRow>(
            "SELECT * FROM customers WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Customer::try_from)
        .transpose()
    }

    async fn product_by_ref(
        &self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError> {
        sqlx::query_as::<_, ProductRow>(
            "SELECT * FROM products WHERE product_ref = $1",
        )
        .bind(product_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Product::try_from)
        .transpose()
    }

    async fn license(
        &self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(License::try_from)
        .transpose()
    }

    async fn license_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses \
             WHERE order_id = $1 AND status = 'SOLD' \
             ORDER BY id LIMIT 1",
        )
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(License::try_from)
        .transpose()
    }

    async fn waitlist_entry(
        &self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        sqlx::query_as::<_, WaitlistEntryRow>(
            "SELECT * FROM waitlist_entries WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(WaitlistEntry::try_from)
        .transpose()
    }

    async fn stuck_open_txns(
        &self,
        cutoff: TimestampMs,
        limit: i64,
    ) -> Result<Vec<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions \
             WHERE status IN ('CREATED', 'PENDING') AND created_at <= $1 \
             ORDER BY created_at \
             LIMIT $2",
        )
        .bind(cutoff.to_utc())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(Txn::try_from)
        .collect()
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(db_err)
    }

    // --- Webhook events --- //

    async fn webhook_event_by_key(
        &mut self,
        provider: PaymentProvider,
        external_ref: &str,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        // FOR UPDATE serializes concurrent deliveries of the same key.
        sqlx::query_as::<_, WebhookEventRow>(
            "SELECT * FROM webhook_events \
             WHERE provider = $1 AND external_ref = $2 \
             FOR UPDATE",
        )
        .bind(provider.as_str())
        .bind(external_ref)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(WebhookEvent::try_from)
        .transpose()
    }

    async fn insert_webhook_event(
        &mut self,
        new: NewWebhookEvent,
    ) -> Result<WebhookEvent, StoreError> {
        let row = sqlx::query_as::<_, WebhookEventRow>(
            "INSERT INTO webhook_events \
             (provider, external_ref, event_id, event_type, \
              extracted_status, amount, currency, payload, raw_headers, \
              raw_body, event_index) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING *",
        )
        .bind(new.provider.as_str())
        .bind(&new.external_ref)
        .bind(&new.event_id)
        .bind(new.event_type.as_str())
        .bind(new.extracted_status.as_str())
        .bind(new.amount.map(Amount::cents))
        .bind(&new.currency)
        .bind(&new.payload)
        .bind(&new.raw_headers)
        .bind(&new.raw_body)
        .bind(new.event_index)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        WebhookEvent::try_from(row)
    }

    async fn update_webhook_event_outcome(
        &mut self,
        id: WebhookEventId,
        status: WebhookStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = $2, error_message = $3, processed_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .bind(error_message)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_webhook_event_replay(
        &mut self,
        id: WebhookEventId,
        event_id: &str,
        extracted_status: TxnStatus,
        payload: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET event_id = $2, extracted_status = $3, payload = $4, \
                 status = 'PENDING' \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(event_id)
        .bind(extracted_status.as_str())
        .bind(payload)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // --- Transactions --- //

    async fn txn_by_gateway_ref(
        &mut self,
        gateway: PaymentProvider,
        gateway_ref: &str,
    ) -> Result<Option<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions \
             WHERE gateway = $1 AND gateway_ref = $2 \
             FOR UPDATE",
        )
        .bind(gateway.as_str())
        .bind(gateway_ref)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Txn::try_from)
        .transpose()
    }

    async fn txn_for_update(
        &mut self,
        id: TxnId,
    ) -> Result<Option<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Txn::try_from)
        .transpose()
    }

    async fn open_txns_by_amount(
        &mut self,
        gateway: PaymentProvider,
        amount: Amount,
        cutoff: TimestampMs,
    ) -> Result<Vec<Txn>, StoreError> {
        sqlx::query_as::<_, TxnRow>(
            "SELECT * FROM transactions \
             WHERE gateway = $1 AND status IN ('CREATED', 'PENDING') \
               AND amount = $2 AND created_at >= $3 \
             FOR UPDATE",
        )
        .bind(gateway.as_str())
        .bind(amount.cents())
        .bind(cutoff.to_utc())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(Txn::try_from)
        .collect()
    }

    async fn update_txn_transition(
        &mut self,
        id: TxnId,
        status: TxnStatus,
        payment_method: Option<&str>,
        invoice_status: Option<InvoiceStatus>,
        meta: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transactions \
             SET status = $2, \
                 payment_method = COALESCE($3, payment_method), \
                 invoice_status = COALESCE($4, invoice_status), \
                 meta = $5, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .bind(payment_method)
        .bind(invoice_status.map(|s| s.as_str()))
        .bind(meta)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_txn_gateway_ref(
        &mut self,
        id: TxnId,
        gateway_ref: &str,
        status: TxnStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transactions \
             SET gateway_ref = $2, status = $3, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(gateway_ref)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn count_open_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transactions \
             WHERE order_id = $1 AND id <> $2 \
               AND status IN ('CREATED', 'PENDING')",
        )
        .bind(order_id.as_i64())
        .bind(excluded.as_i64())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    async fn count_paid_txns_excluding(
        &mut self,
        order_id: OrderId,
        excluded: TxnId,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transactions \
             WHERE order_id = $1 AND id <> $2 AND status = 'PAID'",
        )
        .bind(order_id.as_i64())
        .bind(excluded.as_i64())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    // --- Orders --- //

    async fn order_for_update(
        &mut self,
        id: OrderId,
    ) -> Result<Option<Order>, StoreError> {
        sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Order::try_from)
        .transpose()
    }

    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orders SET status = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_order_shipping_email(
        &mut self,
        id: OrderId,
        receipt: &EmailReceipt,
    ) -> Result<(), StoreError> {
        let receipt =
            serde_json::to_value(receipt).map_err(StoreError::new)?;
        sqlx::query(
            "UPDATE orders \
             SET shipping_info = jsonb_set( \
                     COALESCE(shipping_info, '{}'::jsonb), \
                     '{email}', $2::jsonb, true), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(receipt)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_order_meta(
        &mut self,
        id: OrderId,
        meta: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orders SET meta = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(meta)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_order(
        &mut self,
        new: NewOrder,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "INSERT INTO orders \
             (customer_id, product_ref, qty, subtotal, discount_total, \
              tax_total, grand_total, currency, shipping_info) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING *",
        )
        .bind(new.customer_id.as_i64())
        .bind(&new.product_ref)
        .bind(new.qty)
        .bind(new.subtotal.cents())
        .bind(new.discount_total.cents())
        .bind(new.tax_total.cents())
        .bind(new.grand_total.cents())
        .bind(&new.currency)
        .bind(&new.shipping_info)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Order::try_from(row)
    }

    async fn insert_txn(&mut self, new: NewTxn) -> Result<Txn, StoreError> {
        let row = sqlx::query_as::<_, TxnRow>(
            "INSERT INTO transactions (order_id, gateway, amount, currency) \
             VALUES ($1, $2, $3, $4) \
             RETURNING *",
        )
        .bind(new.order_id.as_i64())
        .bind(new.gateway.as_str())
        .bind(new.amount.cents())
        .bind(&new.currency)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Txn::try_from(row)
    }

    // --- Customers & products --- //

    async fn customer(
        &mut self,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        sqlx::query_as::<_, CustomerRow>(
            "SELECT * FROM customers WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Customer::try_from)
        .transpose()
    }

    async fn customer_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<Customer>, StoreError> {
        sqlx::query_as::<_, CustomerRow>(
            "SELECT * FROM customers WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Customer::try_from)
        .transpose()
    }

    async fn insert_customer(
        &mut self,
        new: NewCustomer,
    ) -> Result<Customer, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "INSERT INTO customers \
             (email, first_name, last_name, document_type, document_number) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING *",
        )
        .bind(&new.email)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.document_type)
        .bind(&new.document_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Customer::try_from(row)
    }

    async fn product_by_ref(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<Product>, StoreError> {
        sqlx::query_as::<_, ProductRow>(
            "SELECT * FROM products WHERE product_ref = $1",
        )
        .bind(product_ref)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(Product::try_from)
        .transpose()
    }

    // --- Licenses --- //

    async fn lock_available_license(
        &mut self,
        product_ref: &str,
    ) -> Result<Option<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses \
             WHERE product_ref = $1 AND status = 'AVAILABLE' \
             ORDER BY id \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(product_ref)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(License::try_from)
        .transpose()
    }

    async fn lock_available_licenses(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses \
             WHERE product_ref = $1 AND status = 'AVAILABLE' \
             ORDER BY id \
             LIMIT $2 \
             FOR UPDATE",
        )
        .bind(product_ref)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(License::try_from)
        .collect()
    }

    async fn license_for_update(
        &mut self,
        id: LicenseId,
    ) -> Result<Option<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(License::try_from)
        .transpose()
    }

    async fn sold_license_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Option<License>, StoreError> {
        sqlx::query_as::<_, LicenseRow>(
            "SELECT * FROM licenses \
             WHERE order_id = $1 AND status = 'SOLD' \
             ORDER BY id \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(order_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(License::try_from)
        .transpose()
    }

    async fn mark_license_sold(
        &mut self,
        id: LicenseId,
        order_id: OrderId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE licenses \
             SET status = 'SOLD', order_id = $2, sold_at = $3 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(order_id.as_i64())
        .bind(at.to_utc())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_license_reserved(
        &mut self,
        id: LicenseId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE licenses \
             SET status = 'RESERVED', reserved_at = $2 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(at.to_utc())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn release_license(
        &mut self,
        id: LicenseId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE licenses \
             SET status = 'AVAILABLE', order_id = NULL, \
                 reserved_at = NULL, sold_at = NULL \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_licenses(
        &mut self,
        product_ref: &str,
        licenses: &[NewLicense],
    ) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for new in licenses {
            let result = sqlx::query(
                "INSERT INTO licenses (product_ref, license_key, \
                 instructions) \
                 VALUES ($1, $2, $3)",
            )
            .bind(product_ref)
            .bind(&new.license_key)
            .bind(&new.instructions)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn count_available_licenses(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM licenses \
             WHERE product_ref = $1 AND status = 'AVAILABLE'",
        )
        .bind(product_ref)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    // --- Waitlist --- //

    async fn insert_waitlist_entry(
        &mut self,
        new: NewWaitlistEntry,
    ) -> Result<WaitlistEntry, StoreError> {
        let row = sqlx::query_as::<_, WaitlistEntryRow>(
            "INSERT INTO waitlist_entries \
             (order_id, customer_id, product_ref, qty, priority) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING *",
        )
        .bind(new.order_id.as_i64())
        .bind(new.customer_id.as_i64())
        .bind(&new.product_ref)
        .bind(new.qty)
        .bind(new.priority.to_utc())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        WaitlistEntry::try_from(row)
    }

    async fn waitlist_entry_for_update(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        sqlx::query_as::<_, WaitlistEntryRow>(
            "SELECT * FROM waitlist_entries WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(WaitlistEntry::try_from)
        .transpose()
    }

    async fn count_pending_waitlist(
        &mut self,
        product_ref: &str,
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM waitlist_entries \
             WHERE product_ref = $1 AND status = 'PENDING'",
        )
        .bind(product_ref)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    async fn lock_pending_waitlist(
        &mut self,
        product_ref: &str,
        limit: i64,
    ) -> Result<Vec<WaitlistEntry>, StoreError> {
        sqlx::query_as::<_, WaitlistEntryRow>(
            "SELECT * FROM waitlist_entries \
             WHERE product_ref = $1 AND status = 'PENDING' \
             ORDER BY priority, id \
             LIMIT $2 \
             FOR UPDATE",
        )
        .bind(product_ref)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(WaitlistEntry::try_from)
        .collect()
    }

    async fn lock_oldest_ready_entry(
        &mut self,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        sqlx::query_as::<_, WaitlistEntryRow>(
            "SELECT * FROM waitlist_entries \
             WHERE status = 'READY_FOR_EMAIL' \
             ORDER BY priority, id \
             LIMIT 1 \
             FOR UPDATE",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(WaitlistEntry::try_from)
        .transpose()
    }

    async fn set_waitlist_status(
        &mut self,
        id: WaitlistEntryId,
        status: WaitlistStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE waitlist_entries SET status = $2 WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stage_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        license_id: LicenseId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE waitlist_entries \
             SET status = 'READY_FOR_EMAIL', license_id = $2 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(license_id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE waitlist_entries \
             SET status = 'COMPLETED', processed_at = $2 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(at.to_utc())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn retry_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE waitlist_entries \
             SET status = 'READY_FOR_EMAIL', retry_count = $2 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(retry_count)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
        retry_count: i32,
        error_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE waitlist_entries \
             SET status = 'FAILED', retry_count = $2, error_message = $3 \
             WHERE id = $1",
        )
        .bind(id.as_i64())
        .bind(retry_count)
        .bind(error_message)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_waitlist_entry(
        &mut self,
        id: WaitlistEntryId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM waitlist_entries WHERE id = $1")
            .bind(id.as_i64())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
