//! The email delivery subsystem: a bounded, rate-paced in-process queue plus
//! the sender that resolves entities, renders templates, and talks to the
//! outbound mail transport.
//!
//! The queue is intentionally decoupled from the DB transaction that produced
//! a task: submission happens after commit. The synchronous license-email
//! path bypasses the queue entirely (see the state machine).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keymint_common::config::EmailQueueConfig;
use keymint_common::enums::{EmailTaskKind, OrderStatus};
use keymint_common::ids::{OrderId, WaitlistEntryId};
use keymint_common::records::EmailReceipt;
use keymint_common::shutdown::ShutdownSignal;
use keymint_common::time::TimestampMs;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::mailer::templates::{
    LicenseDeliveryEmail, OrderConfirmationEmail, WaitlistNotificationEmail,
};
use crate::traits::{MailTransport, Store, StoreTx};

/// Outbound transport for the Brevo-style transactional mail API.
pub mod brevo;
/// Typed template rendering.
pub mod templates;

// --- Queue --- //

/// What a caller submits: the task kind plus the entity refs the sender
/// resolves at delivery time.
#[derive(Clone, Debug)]
pub struct EmailTaskSpec {
    pub kind: EmailTaskKind,
    pub order_id: Option<OrderId>,
    pub entry_id: Option<WaitlistEntryId>,
}

impl EmailTaskSpec {
    pub fn license_email(order_id: OrderId) -> Self {
        Self {
            kind: EmailTaskKind::LicenseEmail,
            order_id: Some(order_id),
            entry_id: None,
        }
    }

    pub fn waitlist_notification(
        order_id: OrderId,
        entry_id: WaitlistEntryId,
    ) -> Self {
        Self {
            kind: EmailTaskKind::WaitlistNotification,
            order_id: Some(order_id),
            entry_id: Some(entry_id),
        }
    }

    pub fn order_confirmation(order_id: OrderId) -> Self {
        Self {
            kind: EmailTaskKind::OrderConfirmation,
            order_id: Some(order_id),
            entry_id: None,
        }
    }
}

/// A queued delivery task.
#[derive(Clone, Debug)]
pub struct EmailTask {
    pub id: u64,
    pub kind: EmailTaskKind,
    pub order_id: Option<OrderId>,
    pub entry_id: Option<WaitlistEntryId>,
    pub retry_count: u32,
    pub created_at: TimestampMs,
}

struct QueueInner {
    cfg: EmailQueueConfig,
    queue: Mutex<VecDeque<EmailTask>>,
    /// Wakes the processor loop out of its idle wait on submission.
    notify: tokio::sync::Notify,
    next_id: AtomicU64,
}

/// The bounded FIFO delivery queue. Cheap to clone.
///
/// The processor loop pops one task per `interval` tick; it idles (without
/// timers) while the queue is empty and wakes on the next submission.
#[derive(Clone)]
pub struct EmailQueue {
    inner: Arc<QueueInner>,
}

impl EmailQueue {
    pub fn new(cfg: EmailQueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                cfg,
                queue: Mutex::new(VecDeque::new()),
                notify: tokio::sync::Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueue a task. Fails with [`EngineError::QueueFull`] at capacity.
    pub fn submit(&self, spec: EmailTaskSpec) -> Result<u64, EngineError> {
        let mut queue = self.inner.queue.lock().expect("Queue lock poisoned");
        if queue.len() >= self.inner.cfg.max_queue_size {
            return Err(EngineError::QueueFull);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        queue.push_back(EmailTask {
            id,
            kind: spec.kind,
            order_id: spec.order_id,
            entry_id: spec.entry_id,
            retry_count: 0,
            created_at: TimestampMs::now(),
        });
        drop(queue);
        self.inner.notify.notify_one();
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("Queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<EmailTask> {
        self.inner
            .queue
            .lock()
            .expect("Queue lock poisoned")
            .pop_front()
    }

    /// Re-enqueue a retrying task at the tail. Capacity is not re-checked;
    /// the slot was freed by the pop that produced the task.
    fn requeue(&self, task: EmailTask) {
        self.inner
            .queue
            .lock()
            .expect("Queue lock poisoned")
            .push_back(task);
    }

    /// The processor loop. One task per interval tick; transient failures
    /// re-enqueue at the tail up to `max_retries`; permanent failures are
    /// logged and dropped. Errors never escape the loop.
    pub async fn run<S: Store, M: MailTransport>(
        self,
        sender: EmailSender<S, M>,
        shutdown: ShutdownSignal,
    ) {
        info!("Email queue processor started");
        loop {
            if self.is_empty() {
                tokio::select! {
                    biased;
                    () = shutdown.recv() => break,
                    () = self.inner.notify.notified() => continue,
                }
            }

            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                () = tokio::time::sleep(self.inner.cfg.interval) => {}
            }

            let Some(mut task) = self.pop() else {
                continue;
            };
            let task_id = task.id;
            let kind = task.kind;
            match sender.send_task(&task).await {
                Ok(()) => debug!(task_id, %kind, "Email task delivered"),
                Err(err) if err.is_transient()
                    && task.retry_count < self.inner.cfg.max_retries =>
                {
                    task.retry_count += 1;
                    warn!(
                        task_id, %kind, retry_count = task.retry_count,
                        "Email task failed; re-enqueued: {err}"
                    );
                    self.requeue(task);
                }
                Err(err) => {
                    error!(task_id, %kind, "Email task permanently failed: {err}");
                }
            }
        }
        info!("Email queue processor stopped");
    }
}

// --- Sender --- //

/// Resolves a task's entities, renders the template, and invokes the
/// transport. Also used directly (without the queue) by the synchronous
/// license-email path and the waitlist processor.
pub struct EmailSender<S, M> {
    store: S,
    transport: Arc<M>,
}

impl<S: Clone, M> Clone for EmailSender<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<S: Store, M: MailTransport> EmailSender<S, M> {
    pub fn new(store: S, transport: Arc<M>) -> Self {
        Self { store, transport }
    }

    /// Render and send a license delivery email. Pure transport: no store
    /// access, so the state machine can call it mid-transaction.
    pub async fn send_license_delivery(
        &self,
        input: &LicenseDeliveryEmail,
    ) -> Result<String, EngineError> {
        self.transport.send(&templates::license_delivery(input)).await
    }

    /// Process a queued task end to end.
    pub async fn send_task(&self, task: &EmailTask) -> Result<(), EngineError> {
        match task.kind {
            EmailTaskKind::LicenseEmail => self.send_license_task(task).await,
            EmailTaskKind::WaitlistNotification =>
                self.send_waitlist_task(task).await,
            EmailTaskKind::OrderConfirmation =>
                self.send_confirmation_task(task).await,
        }
    }

    async fn send_license_task(
        &self,
        task: &EmailTask,
    ) -> Result<(), EngineError> {
        let order_id = task
            .order_id
            .ok_or_else(|| EngineError::validation("Task has no order id"))?;
        let (order, customer, product) = self.resolve_order(order_id).await?;
        let license = self
            .store
            .license_for_order(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("License", order_id))?;

        let message_id = self
            .send_license_delivery(&LicenseDeliveryEmail {
                to_email: customer.email.clone(),
                to_name: customer.first_name.clone(),
                order_id,
                product_name: product.name,
                license_key: license.license_key,
                instructions: license.instructions,
            })
            .await?;

        // Record the delivery; a queue-driven license email also closes an
        // order that was stuck IN_PROCESS behind a failed send.
        let now = TimestampMs::now();
        let receipt = EmailReceipt::sent(
            customer.email,
            "license_delivery",
            Some(message_id),
            now,
        );
        let mut tx = self.store.begin().await?;
        tx.set_order_shipping_email(order_id, &receipt).await?;
        if order.status == OrderStatus::InProcess {
            tx.set_order_status(order_id, OrderStatus::Completed).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn send_waitlist_task(
        &self,
        task: &EmailTask,
    ) -> Result<(), EngineError> {
        let entry_id = task
            .entry_id
            .ok_or_else(|| EngineError::validation("Task has no entry id"))?;
        let entry = self
            .store
            .waitlist_entry(entry_id)
            .await?
            .ok_or_else(|| EngineError::not_found("WaitlistEntry", entry_id))?;
        let (_order, customer, product) =
            self.resolve_order(entry.order_id).await?;

        self.transport
            .send(&templates::waitlist_notification(
                &WaitlistNotificationEmail {
                    to_email: customer.email,
                    to_name: customer.first_name,
                    order_id: entry.order_id,
                    entry_id,
                    product_name: product.name,
                },
                TimestampMs::now(),
            ))
            .await?;
        Ok(())
    }

    async fn send_confirmation_task(
        &self,
        task: &EmailTask,
    ) -> Result<(), EngineError> {
        let order_id = task
            .order_id
            .ok_or_else(|| EngineError::validation("Task has no order id"))?;
        let (order, customer, product) = self.resolve_order(order_id).await?;

        self.transport
            .send(&templates::order_confirmation(&OrderConfirmationEmail {
                to_email: customer.email,
                to_name: customer.first_name,
                order_id,
                product_name: product.name,
                grand_total: order.grand_total,
                currency: order.currency,
            }))
            .await?;
        Ok(())
    }

    async fn resolve_order(
        &self,
        order_id: OrderId,
    ) -> Result<
        (
            keymint_common::records::Order,
            keymint_common::records::Customer,
            keymint_common::records::Product,
        ),
        EngineError,
    > {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))?;
        let customer = self
            .store
            .customer(order.customer_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Customer", order.customer_id)
            })?;
        let product = self
            .store
            .product_by_ref(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &order.product_ref)
            })?;
        Ok((order, customer, product))
    }
}
