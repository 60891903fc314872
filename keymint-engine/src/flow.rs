//! The transaction state machine.
//!
//! Entry point is [`Fulfillment::handle_event`]. Each state update runs as a
//! single storage transaction: locate the payment attempt, guard against
//! replays and stale deliveries, apply the transition, and drive the order's
//! side effects (license assignment, the synchronous license email, waitlist
//! overflow, cancellation). Deferred email tasks are collected during the
//! transaction and submitted to the queue only after commit.

use std::time::Duration;

use keymint_common::enums::{
    InvoiceStatus, OrderStatus, TxnStatus, WebhookEventType,
};
use keymint_common::records::{EmailReceipt, Txn};
use keymint_common::time::TimestampMs;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::event::NormalizedEvent;
use crate::mailer::templates::LicenseDeliveryEmail;
use crate::mailer::{EmailQueue, EmailSender, EmailTaskSpec};
use crate::meta;
use crate::traits::{
    MailTransport, NewWaitlistEntry, Store, StoreTx,
};

/// Failure webhooks lacking a correlation id are matched by amount against
/// open transactions no older than this.
pub const AMOUNT_FALLBACK_WINDOW: Duration = Duration::from_secs(3600);

/// The outcome of handling one normalized event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandleOutcome {
    /// A state transition was applied.
    Processed,
    /// The transaction was already PAID and the event reports PAID.
    AlreadyProcessed,
    /// The event is older than the transaction's webhook watermark.
    Stale,
    /// An informational `balance_credit`; acknowledged, never applied.
    BalanceCreditAcknowledged,
    /// No transaction matches; the caller still acks the provider.
    TransactionNotFound,
    /// The amount fallback matched more than one open transaction; nothing
    /// was mutated.
    AmbiguousAmountMatch,
}

impl HandleOutcome {
    /// Whether the event failed to land (recorded as FAILED on the audit
    /// record, still acked 200 to the provider).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TransactionNotFound | Self::AmbiguousAmountMatch
        )
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Processed => None,
            Self::AlreadyProcessed => Some("already_processed"),
            Self::Stale => Some("stale_webhook"),
            Self::BalanceCreditAcknowledged => Some("balance_credit"),
            Self::TransactionNotFound => Some("transaction_not_found"),
            Self::AmbiguousAmountMatch => Some("ambiguous_amount_match"),
        }
    }
}

/// Where a transition came from, for the audit subtree it appends.
pub(crate) enum TransitionCtx<'a> {
    Webhook(&'a NormalizedEvent),
    Verification { raw_status: &'a str },
}

enum Located {
    Found(Txn),
    NotFound,
    Ambiguous,
}

/// The fulfillment state machine, generic over storage and mail transport.
pub struct Fulfillment<S: Store, M: MailTransport> {
    store: S,
    sender: EmailSender<S, M>,
    email_queue: EmailQueue,
}

impl<S: Store, M: MailTransport> Clone for Fulfillment<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sender: self.sender.clone(),
            email_queue: self.email_queue.clone(),
        }
    }
}

impl<S: Store, M: MailTransport> Fulfillment<S, M> {
    pub fn new(
        store: S,
        sender: EmailSender<S, M>,
        email_queue: EmailQueue,
    ) -> Self {
        Self {
            store,
            sender,
            email_queue,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn email_queue(&self) -> &EmailQueue {
        &self.email_queue
    }

    /// Handle one normalized webhook event.
    #[instrument(skip_all, fields(
        provider = %event.provider,
        external_ref = %event.external_ref,
        status = %event.status,
    ))]
    pub async fn handle_event(
        &self,
        event: &NormalizedEvent,
    ) -> Result<HandleOutcome, EngineError> {
        // Account-level credit notifications are informational; they are
        // recorded by ingress but never drive order state, even when a
        // transaction happens to correlate.
        if event.event_type == WebhookEventType::BalanceCredit {
            info!("Acknowledging balance credit");
            return Ok(HandleOutcome::BalanceCreditAcknowledged);
        }

        let mut tx = self.store.begin().await?;

        let txn = match self.locate_txn(&mut tx, event).await? {
            Located::Found(txn) => txn,
            Located::Ambiguous => {
                tx.rollback().await?;
                warn!("Amount fallback matched several open transactions");
                return Ok(HandleOutcome::AmbiguousAmountMatch);
            }
            Located::NotFound => {
                tx.rollback().await?;
                return Ok(HandleOutcome::TransactionNotFound);
            }
        };

        // Handler-level idempotency: PAID is terminal and never regresses,
        // so any webhook for an already-PAID transaction is a no-op.
        if txn.status == TxnStatus::Paid {
            tx.rollback().await?;
            return Ok(HandleOutcome::AlreadyProcessed);
        }

        // Out-of-order delivery: older than the recorded watermark.
        if let (Some(occurred_at), Some(last)) =
            (event.occurred_at, txn.last_webhook_at())
        {
            if occurred_at < last {
                tx.rollback().await?;
                warn!("Dropping webhook older than the watermark");
                return Ok(HandleOutcome::Stale);
            }
        }

        let deferred = self
            .transition(&mut tx, txn, event.status, TransitionCtx::Webhook(event))
            .await?;
        tx.commit().await?;
        self.submit_deferred(deferred);
        Ok(HandleOutcome::Processed)
    }

    /// Transaction lookup: by gateway ref, then (for failure events only) by
    /// amount correlation within [`AMOUNT_FALLBACK_WINDOW`].
    async fn locate_txn(
        &self,
        tx: &mut S::Tx,
        event: &NormalizedEvent,
    ) -> Result<Located, EngineError> {
        if let Some(txn) = tx
            .txn_by_gateway_ref(event.provider, &event.external_ref)
            .await?
        {
            return Ok(Located::Found(txn));
        }

        // Some providers omit the correlation id on failure webhooks; match
        // a unique open transaction by amount instead.
        if event.status == TxnStatus::Failed {
            if let Some(amount) = event.amount {
                let cutoff =
                    TimestampMs::now().saturating_sub(AMOUNT_FALLBACK_WINDOW);
                let mut candidates = tx
                    .open_txns_by_amount(event.provider, amount, cutoff)
                    .await?;
                return Ok(match candidates.len() {
                    0 => Located::NotFound,
                    1 => Located::Found(candidates.remove(0)),
                    _ => Located::Ambiguous,
                });
            }
        }

        Ok(Located::NotFound)
    }

    /// Apply a status transition inside an open storage transaction.
    /// Returns email tasks the caller must submit after commit.
    pub(crate) async fn transition(
        &self,
        tx: &mut S::Tx,
        txn: Txn,
        new_status: TxnStatus,
        ctx: TransitionCtx<'_>,
    ) -> Result<Vec<EmailTaskSpec>, EngineError> {
        let old_status = txn.status;
        let now = TimestampMs::now();

        let mut txn_meta = txn.meta.clone();
        let payment_method = match &ctx {
            TransitionCtx::Webhook(event) => {
                meta::append_entry(&mut txn_meta, "webhook", json!({
                    "eventId": event.event_id,
                    "eventType": event.event_type,
                    "status": new_status,
                    "at": now.as_i64(),
                }));
                meta::set_last_webhook_at(&mut txn_meta, now);
                extract_payment_method(event)
            }
            TransitionCtx::Verification { raw_status } => {
                meta::append_entry(&mut txn_meta, "statusVerification", json!({
                    "providerStatus": raw_status,
                    "status": new_status,
                    "at": now.as_i64(),
                }));
                None
            }
        };

        let invoice_status =
            (new_status == TxnStatus::Paid).then_some(InvoiceStatus::Pending);
        tx.update_txn_transition(
            txn.id,
            new_status,
            payment_method.as_deref(),
            invoice_status,
            &txn_meta,
        )
        .await?;

        let mut deferred = Vec::new();
        if old_status != TxnStatus::Paid && new_status == TxnStatus::Paid {
            self.handle_payment_success(tx, &txn, now, &mut deferred).await?;
        } else if new_status == TxnStatus::Failed {
            self.handle_payment_failure(tx, &txn).await?;
        }
        Ok(deferred)
    }

    /// The success path: order to IN_PROCESS, then license assignment and
    /// delivery, or waitlist overflow, or immediate completion for
    /// non-license products.
    async fn handle_payment_success(
        &self,
        tx: &mut S::Tx,
        txn: &Txn,
        now: TimestampMs,
        deferred: &mut Vec<EmailTaskSpec>,
    ) -> Result<(), EngineError> {
        // At most one transaction per order may be PAID.
        let other_paid =
            tx.count_paid_txns_excluding(txn.order_id, txn.id).await?;
        if other_paid > 0 {
            warn!(
                order_id = %txn.order_id,
                "Order already has a PAID transaction; skipping side effects"
            );
            return Ok(());
        }

        let order = tx
            .order_for_update(txn.order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", txn.order_id))?;
        if order.status == OrderStatus::Completed {
            warn!(order_id = %order.id, "Order is already COMPLETED");
            return Ok(());
        }
        if order.status == OrderStatus::Canceled {
            // A payment landing after cancellation; the money is real, so
            // the order is revived into the normal flow.
            warn!(order_id = %order.id, "Payment arrived for a CANCELED order");
        }
        tx.set_order_status(order.id, OrderStatus::InProcess).await?;

        let product = tx
            .product_by_ref(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &order.product_ref)
            })?;

        if !product.license_type {
            tx.set_order_status(order.id, OrderStatus::Completed).await?;
            deferred.push(EmailTaskSpec::order_confirmation(order.id));
            info!(order_id = %order.id, "Non-license order completed");
            return Ok(());
        }

        match tx.lock_available_license(&order.product_ref).await? {
            Some(license) => {
                tx.mark_license_sold(license.id, order.id, now).await?;
                let customer = tx
                    .customer(order.customer_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::not_found("Customer", order.customer_id)
                    })?;

                // The one sanctioned outbound call inside a storage
                // transaction: delivery must be confirmed before the order
                // may reach COMPLETED.
                let input = LicenseDeliveryEmail {
                    to_email: customer.email.clone(),
                    to_name: customer.first_name.clone(),
                    order_id: order.id,
                    product_name: product.name.clone(),
                    license_key: license.license_key.clone(),
                    instructions: license.instructions.clone(),
                };
                match self.sender.send_license_delivery(&input).await {
                    Ok(message_id) => {
                        let receipt = EmailReceipt::sent(
                            customer.email,
                            "license_delivery",
                            Some(message_id),
                            now,
                        );
                        tx.set_order_shipping_email(order.id, &receipt)
                            .await?;
                        tx.set_order_status(order.id, OrderStatus::Completed)
                            .await?;
                        info!(
                            order_id = %order.id,
                            license_id = %license.id,
                            "License delivered; order completed"
                        );
                    }
                    Err(err) => {
                        // Never COMPLETED without email confirmation. The
                        // license stays SOLD; the resend path re-drives it.
                        warn!(
                            order_id = %order.id,
                            "License email failed; order stays IN_PROCESS: \
                             {err}"
                        );
                        let receipt = EmailReceipt::failed(
                            customer.email,
                            "license_delivery",
                            err.to_string(),
                            now,
                        );
                        tx.set_order_shipping_email(order.id, &receipt)
                            .await?;
                    }
                }
            }
            None => {
                let entry = tx
                    .insert_waitlist_entry(NewWaitlistEntry {
                        order_id: order.id,
                        customer_id: order.customer_id,
                        product_ref: order.product_ref.clone(),
                        qty: order.qty,
                        priority: now,
                    })
                    .await?;
                deferred.push(EmailTaskSpec::waitlist_notification(
                    order.id, entry.id,
                ));
                info!(
                    order_id = %order.id,
                    entry_id = %entry.id,
                    "Inventory exhausted; order waitlisted"
                );
            }
        }
        Ok(())
    }

    /// The failure path: cancel the order once no other payment attempt is
    /// still open.
    async fn handle_payment_failure(
        &self,
        tx: &mut S::Tx,
        txn: &Txn,
    ) -> Result<(), EngineError> {
        let open =
            tx.count_open_txns_excluding(txn.order_id, txn.id).await?;
        if open > 0 {
            return Ok(());
        }
        let paid =
            tx.count_paid_txns_excluding(txn.order_id, txn.id).await?;
        if paid > 0 {
            return Ok(());
        }
        if let Some(order) = tx.order_for_update(txn.order_id).await? {
            if matches!(
                order.status,
                OrderStatus::Pending | OrderStatus::InProcess
            ) {
                tx.set_order_status(order.id, OrderStatus::Canceled).await?;
                info!(order_id = %order.id, "All payment attempts failed; \
                       order canceled");
            }
        }
        Ok(())
    }

    /// Submit deferred email tasks after the storage transaction committed.
    /// Best-effort: a full queue is logged, never propagated.
    pub(crate) fn submit_deferred(&self, specs: Vec<EmailTaskSpec>) {
        for spec in specs {
            let kind = spec.kind;
            if let Err(err) = self.email_queue.submit(spec) {
                warn!(%kind, "Dropping deferred email task: {err}");
            }
        }
    }
}

fn extract_payment_method(event: &NormalizedEvent) -> Option<String> {
    let payload = &event.payload;
    [
        &payload["content"]["payment_method"],
        &payload["payment_method"],
        &payload["content"]["checkout_rail"],
        &payload["x_franchise"],
    ]
    .into_iter()
    .find_map(|v| v.as_str().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reasons_match_wire_strings() {
        assert_eq!(HandleOutcome::Processed.reason(), None);
        assert_eq!(
            HandleOutcome::TransactionNotFound.reason(),
            Some("transaction_not_found")
        );
        assert!(HandleOutcome::AmbiguousAmountMatch.is_failure());
        assert!(!HandleOutcome::AlreadyProcessed.is_failure());
    }

    #[test]
    fn payment_method_extraction_priority() {
        let event = NormalizedEvent {
            provider: keymint_common::enums::PaymentProvider::Cobre,
            external_ref: "X".into(),
            event_id: "e".into(),
            event_type: WebhookEventType::Payment,
            status: TxnStatus::Paid,
            amount: None,
            currency: None,
            payload: json!({
                "content": { "payment_method": "transfiya" },
                "x_franchise": "visa",
            }),
            event_index: 0,
            occurred_at: None,
        };
        assert_eq!(extract_payment_method(&event).as_deref(), Some("transfiya"));
    }
}
