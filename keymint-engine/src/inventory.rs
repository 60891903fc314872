//! License inventory and the FIFO waitlist.
//!
//! All mutations acquire row locks through the storage transaction, so a
//! license is never double-sold under parallel webhook delivery, and
//! waitlisted orders drain strictly oldest-first.

use keymint_common::config::WaitlistConfig;
use keymint_common::enums::{OrderStatus, WaitlistStatus};
use keymint_common::ids::WaitlistEntryId;
use keymint_common::records::{EmailReceipt, WaitlistEntry};
use keymint_common::shutdown::ShutdownSignal;
use keymint_common::time::TimestampMs;
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::mailer::EmailSender;
use crate::mailer::templates::LicenseDeliveryEmail;
use crate::traits::{MailTransport, NewLicense, Store, StoreTx};

pub struct Inventory<S: Store, M: MailTransport> {
    store: S,
    sender: EmailSender<S, M>,
    cfg: WaitlistConfig,
}

impl<S: Store, M: MailTransport> Clone for Inventory<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sender: self.sender.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

impl<S: Store, M: MailTransport> Inventory<S, M> {
    pub fn new(store: S, sender: EmailSender<S, M>, cfg: WaitlistConfig) -> Self {
        Self { store, sender, cfg }
    }

    /// Bulk-load AVAILABLE licenses for a product, then stage any waiting
    /// orders against the fresh stock.
    pub async fn load_licenses(
        &self,
        product_ref: &str,
        licenses: Vec<NewLicense>,
    ) -> Result<u64, EngineError> {
        if licenses.is_empty() {
            return Err(EngineError::validation("No license keys provided"));
        }
        let product = self
            .store
            .product_by_ref(product_ref)
            .await?
            .ok_or_else(|| EngineError::not_found("Product", product_ref))?;
        if !product.license_type {
            return Err(EngineError::conflict(format!(
                "Product '{product_ref}' does not deliver licenses"
            )));
        }

        let mut tx = self.store.begin().await?;
        let inserted = tx.insert_licenses(product_ref, &licenses).await?;
        tx.commit().await?;
        info!(product_ref, inserted, "License inventory loaded");

        let staged = self.stage_waitlist_reservations(product_ref).await?;
        if staged > 0 {
            info!(product_ref, staged, "Waitlist reservations staged");
        }
        Ok(inserted)
    }

    /// Pair `k = min(pending, available)` licenses with the oldest PENDING
    /// entries under a single transaction holding locks on both sets.
    /// Returns the number of pairs staged.
    #[instrument(skip(self))]
    pub async fn stage_waitlist_reservations(
        &self,
        product_ref: &str,
    ) -> Result<usize, EngineError> {
        let mut tx = self.store.begin().await?;
        let pending = tx.count_pending_waitlist(product_ref).await?;
        let available = tx.count_available_licenses(product_ref).await?;
        let k = pending.min(available);
        if k == 0 {
            tx.rollback().await?;
            return Ok(0);
        }

        let licenses = tx.lock_available_licenses(product_ref, k).await?;
        let entries = tx.lock_pending_waitlist(product_ref, k).await?;
        let now = TimestampMs::now();
        let mut staged = 0;
        for (license, entry) in licenses.iter().zip(entries.iter()) {
            tx.mark_license_reserved(license.id, now).await?;
            tx.stage_waitlist_entry(entry.id, license.id).await?;
            staged += 1;
        }
        tx.commit().await?;
        Ok(staged)
    }

    /// Deliver the single oldest READY_FOR_EMAIL entry. One entry per
    /// scheduler tick; FIFO by priority.
    pub async fn process_next_waitlist_entry(
        &self,
    ) -> Result<Option<WaitlistEntryId>, EngineError> {
        // Claim the entry and resolve everything the email needs, then
        // release the locks before the outbound call.
        let claimed = self.claim_next_entry().await?;
        let Some((entry, input)) = claimed else {
            return Ok(None);
        };

        match self.sender.send_license_delivery(&input).await {
            Ok(message_id) => {
                self.finalize_delivery(&entry, &input, message_id).await?;
                info!(entry_id = %entry.id, "Waitlist entry delivered");
            }
            Err(err) => {
                self.record_delivery_failure(&entry, &err).await?;
            }
        }
        Ok(Some(entry.id))
    }

    async fn claim_next_entry(
        &self,
    ) -> Result<Option<(WaitlistEntry, LicenseDeliveryEmail)>, EngineError>
    {
        let mut tx = self.store.begin().await?;
        let Some(entry) = tx.lock_oldest_ready_entry().await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let license_id = entry.license_id.ok_or_else(|| {
            EngineError::conflict(format!(
                "Waitlist entry {} is READY_FOR_EMAIL without a license",
                entry.id
            ))
        })?;
        let license =
            tx.license_for_update(license_id).await?.ok_or_else(|| {
                EngineError::not_found("License", license_id)
            })?;
        let order = tx
            .order_for_update(entry.order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", entry.order_id))?;
        let customer = tx.customer(order.customer_id).await?.ok_or_else(
            || EngineError::not_found("Customer", order.customer_id),
        )?;
        let product = tx
            .product_by_ref(&entry.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &entry.product_ref)
            })?;

        tx.set_waitlist_status(entry.id, WaitlistStatus::Processing).await?;
        tx.commit().await?;

        let input = LicenseDeliveryEmail {
            to_email: customer.email,
            to_name: customer.first_name,
            order_id: order.id,
            product_name: product.name,
            license_key: license.license_key,
            instructions: license.instructions,
        };
        Ok(Some((entry, input)))
    }

    /// Email confirmed: license SOLD, order COMPLETED, entry COMPLETED,
    /// atomically.
    async fn finalize_delivery(
        &self,
        entry: &WaitlistEntry,
        input: &LicenseDeliveryEmail,
        message_id: String,
    ) -> Result<(), EngineError> {
        let now = TimestampMs::now();
        let license_id =
            entry.license_id.expect("Checked when the entry was claimed");
        let receipt = EmailReceipt::sent(
            input.to_email.clone(),
            "license_delivery",
            Some(message_id),
            now,
        );

        let mut tx = self.store.begin().await?;
        tx.mark_license_sold(license_id, entry.order_id, now).await?;
        tx.set_order_shipping_email(entry.order_id, &receipt).await?;
        tx.set_order_status(entry.order_id, OrderStatus::Completed).await?;
        tx.complete_waitlist_entry(entry.id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Email failed: bounded retry back to READY_FOR_EMAIL, else FAILED.
    /// The reserved license stays RESERVED; releasing it is the admin
    /// removal's compensating action.
    async fn record_delivery_failure(
        &self,
        entry: &WaitlistEntry,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        let retry_count = entry.retry_count + 1;
        let mut tx = self.store.begin().await?;
        if retry_count <= self.cfg.max_retries as i32 {
            warn!(
                entry_id = %entry.id, retry_count,
                "Waitlist delivery failed; will retry: {err}"
            );
            tx.retry_waitlist_entry(entry.id, retry_count).await?;
        } else {
            error!(
                entry_id = %entry.id,
                "Waitlist delivery failed permanently: {err}"
            );
            tx.fail_waitlist_entry(entry.id, retry_count, &err.to_string())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The waitlist scheduler: one delivery attempt per tick. Errors are
    /// logged and the loop continues.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("Waitlist processor started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                () = tokio::time::sleep(self.cfg.tick_interval) => {}
            }
            match self.process_next_waitlist_entry().await {
                Ok(_) => {}
                Err(err) => error!("Waitlist tick errored: {err}"),
            }
        }
        info!("Waitlist processor stopped");
    }
}
