//! Admin operations: change-license, revive-order, resend-license-email,
//! and waitlist-entry removal. Each is a locked multi-entity transition that
//! leaves an audit entry in the order's `meta`.

use keymint_common::enums::OrderStatus;
use keymint_common::ids::{LicenseId, OrderId, WaitlistEntryId};
use keymint_common::records::EmailReceipt;
use keymint_common::time::TimestampMs;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::inventory::Inventory;
use crate::mailer::templates::LicenseDeliveryEmail;
use crate::mailer::{EmailQueue, EmailSender, EmailTaskSpec};
use crate::meta;
use crate::traits::{MailTransport, Store, StoreTx};

#[derive(Clone, Debug)]
pub struct LicenseChange {
    pub order_id: OrderId,
    pub old_license_id: LicenseId,
    pub new_license_id: LicenseId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReviveOutcome {
    /// License assigned and delivered; order COMPLETED.
    Completed,
    /// License assigned but delivery failed; order IN_PROCESS, resend
    /// required.
    AwaitingEmail,
}

pub struct Admin<S: Store, M: MailTransport> {
    store: S,
    sender: EmailSender<S, M>,
    email_queue: EmailQueue,
    inventory: Inventory<S, M>,
}

impl<S: Store, M: MailTransport> Admin<S, M> {
    pub fn new(
        store: S,
        sender: EmailSender<S, M>,
        email_queue: EmailQueue,
        inventory: Inventory<S, M>,
    ) -> Self {
        Self {
            store,
            sender,
            email_queue,
            inventory,
        }
    }

    /// Swap an order's SOLD license for a fresh AVAILABLE one of the same
    /// product (and hence equal price), atomically: the old key returns to
    /// inventory, the new one is assigned, and delivery of the new key is
    /// queued.
    #[instrument(skip(self))]
    pub async fn change_license(
        &self,
        order_id: OrderId,
    ) -> Result<LicenseChange, EngineError> {
        let now = TimestampMs::now();
        let mut tx = self.store.begin().await?;
        let order = tx
            .order_for_update(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))?;
        let old = tx.sold_license_for_order(order_id).await?.ok_or_else(
            || {
                EngineError::conflict(format!(
                    "Order {order_id} has no sold license to change"
                ))
            },
        )?;
        let new = tx
            .lock_available_license(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::conflict(format!(
                    "No available license for product '{}'",
                    order.product_ref
                ))
            })?;

        tx.release_license(old.id).await?;
        tx.mark_license_sold(new.id, order_id, now).await?;

        let mut order_meta = order.meta.clone();
        meta::append_entry(&mut order_meta, "licenseChange", json!({
            "from": old.id,
            "to": new.id,
            "at": now.as_i64(),
        }));
        tx.set_order_meta(order_id, &order_meta).await?;
        tx.commit().await?;

        // Deliver the replacement key; the queue retries transient failures.
        if let Err(err) = self
            .email_queue
            .submit(EmailTaskSpec::license_email(order_id))
        {
            warn!(%order_id, "Could not queue replacement-key email: {err}");
        }
        info!(%order_id, old = %old.id, new = %new.id, "License changed");
        Ok(LicenseChange {
            order_id,
            old_license_id: old.id,
            new_license_id: new.id,
        })
    }

    /// Bounded revive of a CANCELED license order: assign an AVAILABLE
    /// license and drive the same delivery-then-complete path as a payment
    /// success. An order can be revived at most once.
    #[instrument(skip(self))]
    pub async fn revive_order(
        &self,
        order_id: OrderId,
    ) -> Result<ReviveOutcome, EngineError> {
        let now = TimestampMs::now();
        let mut tx = self.store.begin().await?;
        let order = tx
            .order_for_update(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))?;
        if order.status != OrderStatus::Canceled {
            return Err(EngineError::conflict(format!(
                "Order {order_id} is {}; only CANCELED orders can be revived",
                order.status
            )));
        }
        if order.meta.get("revived").is_some() {
            return Err(EngineError::conflict(format!(
                "Order {order_id} was already revived once"
            )));
        }
        let product = tx
            .product_by_ref(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &order.product_ref)
            })?;
        if !product.license_type {
            return Err(EngineError::conflict(
                "Only license orders can be revived".to_owned(),
            ));
        }
        let license = tx
            .lock_available_license(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::conflict(format!(
                    "No available license for product '{}'",
                    order.product_ref
                ))
            })?;
        let customer = tx.customer(order.customer_id).await?.ok_or_else(
            || EngineError::not_found("Customer", order.customer_id),
        )?;

        tx.mark_license_sold(license.id, order_id, now).await?;
        let mut order_meta = order.meta.clone();
        meta::append_entry(&mut order_meta, "revived", json!({
            "licenseId": license.id,
            "at": now.as_i64(),
        }));
        tx.set_order_meta(order_id, &order_meta).await?;

        let input = LicenseDeliveryEmail {
            to_email: customer.email.clone(),
            to_name: customer.first_name.clone(),
            order_id,
            product_name: product.name,
            license_key: license.license_key.clone(),
            instructions: license.instructions.clone(),
        };
        let outcome = match self.sender.send_license_delivery(&input).await {
            Ok(message_id) => {
                let receipt = EmailReceipt::sent(
                    customer.email,
                    "license_delivery",
                    Some(message_id),
                    now,
                );
                tx.set_order_shipping_email(order_id, &receipt).await?;
                tx.set_order_status(order_id, OrderStatus::Completed).await?;
                ReviveOutcome::Completed
            }
            Err(err) => {
                warn!(%order_id, "Revive delivery failed: {err}");
                let receipt = EmailReceipt::failed(
                    customer.email,
                    "license_delivery",
                    err.to_string(),
                    now,
                );
                tx.set_order_shipping_email(order_id, &receipt).await?;
                tx.set_order_status(order_id, OrderStatus::InProcess).await?;
                ReviveOutcome::AwaitingEmail
            }
        };
        tx.commit().await?;
        info!(%order_id, ?outcome, "Order revived");
        Ok(outcome)
    }

    /// Re-drive license delivery for an order whose synchronous email
    /// failed. Completes the order on success.
    #[instrument(skip(self))]
    pub async fn resend_license_email(
        &self,
        order_id: OrderId,
    ) -> Result<(), EngineError> {
        let now = TimestampMs::now();
        let mut tx = self.store.begin().await?;
        let order = tx
            .order_for_update(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))?;
        let license = tx.sold_license_for_order(order_id).await?.ok_or_else(
            || {
                EngineError::conflict(format!(
                    "Order {order_id} has no sold license to deliver"
                ))
            },
        )?;
        let customer = tx.customer(order.customer_id).await?.ok_or_else(
            || EngineError::not_found("Customer", order.customer_id),
        )?;
        let product = tx
            .product_by_ref(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &order.product_ref)
            })?;

        let input = LicenseDeliveryEmail {
            to_email: customer.email.clone(),
            to_name: customer.first_name.clone(),
            order_id,
            product_name: product.name,
            license_key: license.license_key,
            instructions: license.instructions,
        };
        match self.sender.send_license_delivery(&input).await {
            Ok(message_id) => {
                let receipt = EmailReceipt::sent(
                    customer.email,
                    "license_delivery",
                    Some(message_id),
                    now,
                );
                tx.set_order_shipping_email(order_id, &receipt).await?;
                if order.status == OrderStatus::InProcess {
                    tx.set_order_status(order_id, OrderStatus::Completed)
                        .await?;
                }
                tx.commit().await?;
                info!(%order_id, "License email resent");
                Ok(())
            }
            Err(err) => {
                let receipt = EmailReceipt::failed(
                    customer.email,
                    "license_delivery",
                    err.to_string(),
                    now,
                );
                tx.set_order_shipping_email(order_id, &receipt).await?;
                tx.commit().await?;
                Err(err)
            }
        }
    }

    /// Remove a waitlist entry. The compensating action for a FAILED entry:
    /// its reserved license returns to AVAILABLE and is immediately offered
    /// to the next waiting order.
    #[instrument(skip(self))]
    pub async fn remove_waitlist_entry(
        &self,
        entry_id: WaitlistEntryId,
    ) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let entry = tx
            .waitlist_entry_for_update(entry_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("WaitlistEntry", entry_id)
            })?;
        if entry.status == keymint_common::enums::WaitlistStatus::Completed {
            return Err(EngineError::conflict(format!(
                "Waitlist entry {entry_id} already completed; its license \
                 is sold"
            )));
        }
        if let Some(license_id) = entry.license_id {
            tx.release_license(license_id).await?;
        }
        let product_ref = entry.product_ref.clone();
        tx.delete_waitlist_entry(entry_id).await?;
        tx.commit().await?;
        info!(%entry_id, "Waitlist entry removed");

        // The freed license may serve the next PENDING entry.
        let staged =
            self.inventory.stage_waitlist_reservations(&product_ref).await?;
        if staged > 0 {
            info!(product_ref, staged, "Released license re-staged");
        }
        Ok(())
    }
}
