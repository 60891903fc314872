//! Out-of-band reconciliation: when webhooks go missing, poll the provider
//! for the canonical status and replay the same state-machine transition the
//! webhook would have driven.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use keymint_common::config::ReconcilerConfig;
use keymint_common::enums::{PaymentProvider, TxnStatus};
use keymint_common::ids::TxnId;
use keymint_common::shutdown::ShutdownSignal;
use keymint_common::time::TimestampMs;
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::flow::{Fulfillment, TransitionCtx};
use crate::traits::{MailTransport, ProviderApi, Store, StoreTx};

/// In-memory guard preventing concurrent verification of one transaction.
/// Acquire returns a token; release happens on drop.
#[derive(Clone, Default)]
struct ProcessingGuard {
    inner: Arc<Mutex<HashSet<TxnId>>>,
}

struct GuardToken {
    id: TxnId,
    inner: Arc<Mutex<HashSet<TxnId>>>,
}

impl ProcessingGuard {
    fn acquire(&self, id: TxnId) -> Result<GuardToken, EngineError> {
        let mut set = self.inner.lock().expect("Guard lock poisoned");
        if !set.insert(id) {
            return Err(EngineError::AlreadyProcessing(id));
        }
        Ok(GuardToken {
            id,
            inner: self.inner.clone(),
        })
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.inner
            .lock()
            .expect("Guard lock poisoned")
            .remove(&self.id);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    /// Canonical status equals the local one; no writes performed.
    NoChange,
    /// The local transaction was advanced to the canonical status.
    Updated { from: TxnStatus, to: TxnStatus },
}

pub struct Reconciler<S: Store, M: MailTransport> {
    flow: Fulfillment<S, M>,
    apis: HashMap<PaymentProvider, Arc<dyn ProviderApi>>,
    guard: ProcessingGuard,
    cfg: ReconcilerConfig,
}

impl<S: Store, M: MailTransport> Clone for Reconciler<S, M> {
    fn clone(&self) -> Self {
        Self {
            flow: self.flow.clone(),
            apis: self.apis.clone(),
            guard: self.guard.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

impl<S: Store, M: MailTransport> Reconciler<S, M> {
    pub fn new(
        flow: Fulfillment<S, M>,
        apis: Vec<Arc<dyn ProviderApi>>,
        cfg: ReconcilerConfig,
    ) -> Self {
        let apis = apis
            .into_iter()
            .map(|api| (api.provider(), api))
            .collect();
        Self {
            flow,
            apis,
            guard: ProcessingGuard::default(),
            cfg,
        }
    }

    /// Verify one transaction against the provider's canonical record.
    ///
    /// Integrity rule: external id, amount, and currency must all match the
    /// local transaction; any mismatch aborts without mutating state.
    #[instrument(skip(self))]
    pub async fn verify_transaction_status(
        &self,
        txn_id: TxnId,
        provider_status_id: Option<String>,
    ) -> Result<VerifyOutcome, EngineError> {
        let _token = self.guard.acquire(txn_id)?;

        let txn = self
            .flow
            .store()
            .txn(txn_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Transaction", txn_id))?;
        let api = self.apis.get(&txn.gateway).ok_or_else(|| {
            EngineError::validation(format!(
                "No status API registered for gateway '{}'",
                txn.gateway
            ))
        })?;
        let gateway_ref = txn.gateway_ref.clone().ok_or_else(|| {
            EngineError::conflict(format!(
                "Transaction {txn_id} has no gateway ref to verify against"
            ))
        })?;

        // Discover the provider-side status id from the checkout record if
        // the caller didn't supply one.
        let status_id = match provider_status_id {
            Some(id) => id,
            None => api
                .find_status_id(&gateway_ref)
                .await?
                .ok_or_else(|| {
                    EngineError::not_found("ProviderStatus", &gateway_ref)
                })?,
        };

        // Verification always reads live provider state.
        let canonical = api.canonical_status(&status_id, true).await?;

        if canonical.external_id != gateway_ref {
            return Err(EngineError::integrity(format!(
                "External id mismatch: provider '{}' vs local '{gateway_ref}'",
                canonical.external_id
            )));
        }
        if canonical.amount != txn.amount {
            return Err(EngineError::integrity(format!(
                "Amount mismatch: provider {} vs local {}",
                canonical.amount, txn.amount
            )));
        }
        if !canonical.currency.eq_ignore_ascii_case(&txn.currency) {
            return Err(EngineError::integrity(format!(
                "Currency mismatch: provider '{}' vs local '{}'",
                canonical.currency, txn.currency
            )));
        }

        if canonical.status == txn.status {
            return Ok(VerifyOutcome::NoChange);
        }
        // A PAID transaction never regresses; the provider reporting
        // anything else is suspicious but not actionable here.
        if txn.status == TxnStatus::Paid {
            warn!(
                %txn_id,
                canonical = %canonical.status,
                "Provider reports non-PAID for a locally PAID transaction"
            );
            return Ok(VerifyOutcome::NoChange);
        }

        // Re-run the same transition path a webhook would have taken.
        let mut tx = self.flow.store().begin().await?;
        let locked = tx
            .txn_for_update(txn_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Transaction", txn_id))?;
        if locked.status == canonical.status {
            tx.rollback().await?;
            return Ok(VerifyOutcome::NoChange);
        }
        let from = locked.status;
        let deferred = self
            .flow
            .transition(
                &mut tx,
                locked,
                canonical.status,
                TransitionCtx::Verification {
                    raw_status: &canonical.raw_status,
                },
            )
            .await?;
        tx.commit().await?;
        self.flow.submit_deferred(deferred);

        info!(
            %txn_id,
            %from,
            to = %canonical.status,
            "Reconciliation advanced transaction"
        );
        Ok(VerifyOutcome::Updated {
            from,
            to: canonical.status,
        })
    }

    /// Verify a batch of transactions, `batch_size` at a time with a pause
    /// between batches so the provider API is not hammered.
    pub async fn verify_multiple(
        &self,
        ids: &[TxnId],
    ) -> Vec<(TxnId, Result<VerifyOutcome, EngineError>)> {
        let mut results = Vec::with_capacity(ids.len());
        for (i, chunk) in ids.chunks(self.cfg.batch_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.batch_pause).await;
            }
            for &id in chunk {
                let result =
                    self.verify_transaction_status(id, None).await;
                results.push((id, result));
            }
        }
        results
    }

    /// One sweep: find transactions stuck in CREATED/PENDING beyond the
    /// threshold and verify them.
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let cutoff =
            TimestampMs::now().saturating_sub(self.cfg.stuck_threshold);
        let stuck = self
            .flow
            .store()
            .stuck_open_txns(cutoff, 100)
            .await?;
        if stuck.is_empty() {
            return Ok(0);
        }
        info!(count = stuck.len(), "Reconciliation sweep starting");
        let ids = stuck.iter().map(|txn| txn.id).collect::<Vec<_>>();
        let results = self.verify_multiple(&ids).await;
        let mut advanced = 0;
        for (id, result) in results {
            match result {
                Ok(VerifyOutcome::Updated { .. }) => advanced += 1,
                Ok(VerifyOutcome::NoChange) => {}
                // Transient and per-txn failures wait for the next tick.
                Err(err) => warn!(txn_id = %id, "Verification failed: {err}"),
            }
        }
        Ok(advanced)
    }

    /// The reconciliation scheduler. Sweeps once at startup (recovering any
    /// paid-but-not-completed orders from a previous run), then on the
    /// configured interval. Errors are logged and the loop continues.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("Reconciliation sweeper started");
        loop {
            match self.sweep_once().await {
                Ok(advanced) if advanced > 0 =>
                    info!(advanced, "Reconciliation sweep finished"),
                Ok(_) => {}
                Err(err) => error!("Reconciliation sweep errored: {err}"),
            }
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                () = tokio::time::sleep(self.cfg.sweep_interval) => {}
            }
        }
        info!("Reconciliation sweeper stopped");
    }
}
