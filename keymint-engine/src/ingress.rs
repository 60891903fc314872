//! Webhook ingress: adapter resolution, signature gate, idempotency, audit
//! persistence, dispatch, and the per-request summary.
//!
//! Gateways deliver at-least-once; order completion is exactly-once. The
//! bridge is the `(provider, external_ref)` idempotency row: a replay with
//! the same extracted status is skipped, a status-changing replay re-runs
//! the state machine so a PENDING -> PAID transition is never lost.

use std::time::Instant;

use keymint_common::enums::{TxnStatus, WebhookStatus};
use keymint_common::ids::WebhookEventId;
use keymint_common::time::TimestampMs;
use tracing::{error, info, instrument, warn};

use crate::adapters::AdapterRegistry;
use crate::error::EngineError;
use crate::event::{
    EventDisposition, EventResult, NormalizedEvent, WebhookRequest,
    WebhookSummary,
};
use crate::flow::{Fulfillment, HandleOutcome};
use crate::sanitize;
use crate::traits::{MailTransport, NewWebhookEvent, Store, StoreTx};

pub struct WebhookIngress<S: Store, M: MailTransport> {
    adapters: AdapterRegistry,
    flow: Fulfillment<S, M>,
}

impl<S: Store, M: MailTransport> WebhookIngress<S, M> {
    pub fn new(adapters: AdapterRegistry, flow: Fulfillment<S, M>) -> Self {
        Self { adapters, flow }
    }

    /// Process one inbound webhook request.
    ///
    /// Returns `Err` only for caller-fixable problems (unknown provider, bad
    /// signature, unparseable payload); per-event processing failures are
    /// reported in the summary and acked to the provider.
    #[instrument(skip_all, fields(provider = provider_name))]
    pub async fn process(
        &self,
        provider_name: &str,
        request: &WebhookRequest,
    ) -> Result<WebhookSummary, EngineError> {
        let started = Instant::now();
        let adapter = self.adapters.by_name(provider_name)?;

        if !adapter.verify_signature(request) {
            self.record_rejected(adapter.provider(), request).await;
            return Err(EngineError::Unauthorized(format!(
                "Signature verification failed for provider '{provider_name}'"
            )));
        }

        let events = adapter.parse_webhook(request)?;
        let mut results = Vec::with_capacity(events.len());
        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut duplicates = 0usize;

        for event in &events {
            let (disposition, reason) =
                self.process_event(request, event).await;
            match disposition {
                EventDisposition::Processed => processed += 1,
                EventDisposition::Duplicate => duplicates += 1,
                EventDisposition::Failed => failed += 1,
            }
            results.push(EventResult {
                external_ref: event.external_ref.clone(),
                disposition,
                reason,
            });
        }

        let summary = WebhookSummary {
            total_events: events.len(),
            processed_events: processed,
            failed_events: failed,
            duplicate_events: duplicates,
            processing_time_ms: started.elapsed().as_millis() as u64,
            results,
        };
        info!(
            total = summary.total_events,
            processed = summary.processed_events,
            duplicates = summary.duplicate_events,
            failed = summary.failed_events,
            "Webhook request processed"
        );
        Ok(summary)
    }

    /// Never errors: internal failures become a `Failed` disposition so one
    /// bad event doesn't poison the rest of the batch.
    async fn process_event(
        &self,
        request: &WebhookRequest,
        event: &NormalizedEvent,
    ) -> (EventDisposition, Option<String>) {
        match self.try_process_event(request, event).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    external_ref = %event.external_ref,
                    "Webhook event processing errored: {err}"
                );
                (EventDisposition::Failed, Some(err.to_string()))
            }
        }
    }

    async fn try_process_event(
        &self,
        request: &WebhookRequest,
        event: &NormalizedEvent,
    ) -> Result<(EventDisposition, Option<String>), EngineError> {
        // Consult and update the idempotency index in its own short
        // transaction, committed before dispatch so a crash mid-handling
        // leaves the audit row behind.
        let record_id = {
            let mut tx = self.flow.store().begin().await?;
            let existing = tx
                .webhook_event_by_key(event.provider, &event.external_ref)
                .await?;
            match existing {
                Some(existing)
                    if existing.extracted_status == event.status =>
                {
                    tx.rollback().await?;
                    info!(
                        external_ref = %event.external_ref,
                        "Duplicate webhook (same extracted status); skipping"
                    );
                    return Ok((EventDisposition::Duplicate, None));
                }
                Some(existing) => {
                    // Status-changing replay: refresh the record and re-run
                    // the state machine below.
                    tx.update_webhook_event_replay(
                        existing.id,
                        &event.event_id,
                        event.status,
                        &sanitize::sanitize_json(&event.payload),
                    )
                    .await?;
                    tx.commit().await?;
                    existing.id
                }
                None => {
                    let record = tx
                        .insert_webhook_event(new_webhook_record(
                            request, event,
                        ))
                        .await?;
                    tx.commit().await?;
                    record.id
                }
            }
        };

        let outcome = self.flow.handle_event(event).await;
        self.record_outcome(record_id, &outcome).await?;

        let (disposition, reason) = match outcome {
            Ok(HandleOutcome::AlreadyProcessed) => (
                EventDisposition::Duplicate,
                Some("already_processed".to_owned()),
            ),
            Ok(outcome) if outcome.is_failure() => (
                EventDisposition::Failed,
                outcome.reason().map(str::to_owned),
            ),
            Ok(outcome) =>
                (EventDisposition::Processed, outcome.reason().map(str::to_owned)),
            Err(err) => (EventDisposition::Failed, Some(err.to_string())),
        };
        Ok((disposition, reason))
    }

    /// Update the audit record with the processing outcome, exactly once.
    async fn record_outcome(
        &self,
        record_id: WebhookEventId,
        outcome: &Result<HandleOutcome, EngineError>,
    ) -> Result<(), EngineError> {
        let (status, error_message) = match outcome {
            Ok(outcome) if outcome.is_failure() => (
                WebhookStatus::Failed,
                outcome.reason().map(str::to_owned),
            ),
            Ok(_) => (WebhookStatus::Processed, None),
            Err(err) => (WebhookStatus::Failed, Some(err.to_string())),
        };
        let mut tx = self.flow.store().begin().await?;
        tx.update_webhook_event_outcome(record_id, status, error_message)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a signature rejection. Best-effort: audit only.
    async fn record_rejected(
        &self,
        provider: keymint_common::enums::PaymentProvider,
        request: &WebhookRequest,
    ) {
        let result: Result<(), EngineError> = async {
            let mut tx = self.flow.store().begin().await?;
            let record = tx
                .insert_webhook_event(NewWebhookEvent {
                    provider,
                    // The payload is untrusted; a synthetic unique ref keeps
                    // the rejection out of the idempotency index.
                    external_ref: format!(
                        "rejected_{}",
                        TimestampMs::now().as_i64()
                    ),
                    event_id: String::new(),
                    event_type:
                        keymint_common::enums::WebhookEventType::Payment,
                    extracted_status: TxnStatus::Failed,
                    amount: None,
                    currency: None,
                    payload: serde_json::Value::Null,
                    raw_headers: sanitize::sanitize_json(
                        &request.headers_json(),
                    ),
                    raw_body: sanitize::cap_raw_body(request.body()),
                    event_index: 0,
                })
                .await?;
            tx.update_webhook_event_outcome(
                record.id,
                WebhookStatus::Failed,
                Some("signature_verification_failed".to_owned()),
            )
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!("Could not record rejected webhook: {err}");
        }
    }
}

fn new_webhook_record(
    request: &WebhookRequest,
    event: &NormalizedEvent,
) -> NewWebhookEvent {
    NewWebhookEvent {
        provider: event.provider,
        external_ref: event.external_ref.clone(),
        event_id: event.event_id.clone(),
        event_type: event.event_type,
        extracted_status: event.status,
        amount: event.amount,
        currency: event.currency.clone(),
        payload: sanitize::sanitize_json(&event.payload),
        raw_headers: sanitize::sanitize_json(&request.headers_json()),
        raw_body: sanitize::cap_raw_body(request.body()),
        event_index: event.event_index,
    }
}
