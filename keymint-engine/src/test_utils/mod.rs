//! Test doubles: the in-memory store, a recording mock mailer, and a
//! scriptable provider status API.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use keymint_common::enums::PaymentProvider;

use crate::error::EngineError;
use crate::traits::{
    CanonicalStatus, MailTransport, OutgoingEmail, ProviderApi,
};

mod store;

pub use store::{MemState, MemStore, MemTx};

/// A [`MailTransport`] that records every send and can be scripted to fail
/// the next N attempts (as a transient provider error).
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    fail_remaining: AtomicUsize,
    counter: AtomicUsize,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail with a transient provider error.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().expect("Mailer lock poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("Mailer lock poisoned").len()
    }

    /// Count of sent emails carrying a tag with the given prefix.
    pub fn count_tagged(&self, prefix: &str) -> usize {
        self.sent
            .lock()
            .expect("Mailer lock poisoned")
            .iter()
            .filter(|email| {
                email.tags.iter().any(|tag| tag.starts_with(prefix))
            })
            .count()
    }
}

#[async_trait]
impl MailTransport for MockMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, EngineError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::provider(
                "Mail API returned 500".to_owned(),
            ));
        }
        self.sent
            .lock()
            .expect("Mailer lock poisoned")
            .push(email.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("msg-{n}"))
    }
}

/// A scriptable [`ProviderApi`]: tests register status ids and canonical
/// records; lookups of anything unregistered fail like a provider 404.
pub struct MockProviderApi {
    provider: PaymentProvider,
    status_ids: Mutex<HashMap<String, String>>,
    statuses: Mutex<HashMap<String, CanonicalStatus>>,
}

impl MockProviderApi {
    pub fn new(provider: PaymentProvider) -> Self {
        Self {
            provider,
            status_ids: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Register the status id discovered from a checkout record.
    pub fn set_status_id(&self, gateway_ref: &str, status_id: &str) {
        self.status_ids
            .lock()
            .expect("Lock poisoned")
            .insert(gateway_ref.to_owned(), status_id.to_owned());
    }

    /// Register the canonical record returned for a status id.
    pub fn set_status(&self, status_id: &str, canonical: CanonicalStatus) {
        self.statuses
            .lock()
            .expect("Lock poisoned")
            .insert(status_id.to_owned(), canonical);
    }
}

#[async_trait]
impl ProviderApi for MockProviderApi {
    fn provider(&self) -> PaymentProvider {
        self.provider
    }

    async fn find_status_id(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .status_ids
            .lock()
            .expect("Lock poisoned")
            .get(gateway_ref)
            .cloned())
    }

    async fn canonical_status(
        &self,
        status_id: &str,
        _bypass_cache: bool,
    ) -> Result<CanonicalStatus, EngineError> {
        self.statuses
            .lock()
            .expect("Lock poisoned")
            .get(status_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::provider(format!(
                    "No provider record for status id '{status_id}'"
                ))
            })
    }
}
