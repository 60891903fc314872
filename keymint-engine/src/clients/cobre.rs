//! The Cobre API client: auth-token caching, lazy account initialization,
//! checkout creation, and rate-limited cached status queries.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use keymint_common::amount::Amount;
use keymint_common::config::CobreConfig;
use keymint_common::enums::PaymentProvider;
use keymint_common::time::TimestampMs;
use lru::LruCache;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::cobre::CobreAdapter;
use crate::error::EngineError;
use crate::sanitize;
use crate::traits::{CanonicalStatus, ProviderApi};

/// Rails offered on every checkout.
const CHECKOUT_RAILS: &[&str] = &["pse", "transfiya"];
/// Checkout field length limits imposed by the provider.
const HEADER_MAX: usize = 30;
const ITEM_MAX: usize = 40;
const DESCRIPTION_MAX: usize = 40;
/// Entries kept in the status cache.
const STATUS_CACHE_ENTRIES: usize = 256;

/// What intake provides to create a checkout.
#[derive(Clone, Debug)]
pub struct CheckoutSpec {
    pub amount: Amount,
    pub external_id: String,
    pub checkout_header: String,
    pub checkout_item: String,
    pub description_to_payee: String,
    pub valid_until: TimestampMs,
    pub metadata: Value,
}

/// The provider-side checkout session.
#[derive(Clone, Debug, Deserialize)]
pub struct CobreCheckout {
    pub id: String,
    #[serde(default)]
    pub checkout_url: Option<String>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct CobreClient {
    cfg: CobreConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
    /// The account resource id, resolved lazily by alias.
    account_id: Mutex<Option<String>>,
    status_cache: StdMutex<LruCache<String, (Instant, CanonicalStatus)>>,
    rate_limiter: DefaultKeyedRateLimiter<String>,
}

impl CobreClient {
    pub fn new(cfg: CobreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .expect("Failed to build reqwest Client");
        // `rate_limit_max` requests per rolling `rate_limit_window` per key.
        let max = NonZeroU32::new(cfg.rate_limit_max.max(1))
            .expect("max(1) is non-zero");
        let period = cfg.rate_limit_window / cfg.rate_limit_max.max(1);
        let quota = Quota::with_period(period)
            .expect("Non-zero period")
            .allow_burst(max);
        Self {
            cfg,
            client,
            token: Mutex::new(None),
            account_id: Mutex::new(None),
            status_cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(STATUS_CACHE_ENTRIES)
                    .expect("Non-zero cache size"),
            )),
            rate_limiter: RateLimiter::keyed(quota),
        }
    }

    /// Fetch (or reuse) the bearer token, refreshing shortly before expiry.
    async fn token(&self) -> Result<String, EngineError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct AuthResponse {
            access_token: String,
            /// Token lifetime in seconds.
            expiration_time: u64,
        }

        let url = format!("{}/v1/auth", self.cfg.base_url);
        let response: AuthResponse = self
            .request_json(self.client.post(&url).json(&json!({
                "user_id": self.cfg.user_id,
                "secret": self.cfg.secret,
            })))
            .await?;

        let lifetime =
            std::time::Duration::from_secs(response.expiration_time);
        let expires_at = Instant::now()
            + lifetime.saturating_sub(self.cfg.token_expiry_margin);
        debug!("Refreshed Cobre auth token");
        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    /// The account resource, looked up by alias and created on absence.
    /// Cached in-process after the first resolution.
    async fn account_id(&self) -> Result<String, EngineError> {
        let mut cached = self.account_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let token = self.token().await?;
        let lookup_url = format!(
            "{}/v1/accounts?alias={}",
            self.cfg.base_url, self.cfg.account_alias,
        );
        let listing: Value = self
            .request_json(self.client.get(&lookup_url).bearer_auth(&token))
            .await?;
        let existing = listing["contents"]
            .as_array()
            .and_then(|accounts| accounts.first())
            .and_then(|account| account["id"].as_str())
            .map(str::to_owned);

        let id = match existing {
            Some(id) => id,
            None => {
                info!(
                    alias = %self.cfg.account_alias,
                    "Cobre account absent; creating"
                );
                let create_url = format!("{}/v1/accounts", self.cfg.base_url);
                let created: Value = self
                    .request_json(
                        self.client
                            .post(&create_url)
                            .bearer_auth(&token)
                            .json(&json!({
                                "alias": self.cfg.account_alias,
                            })),
                    )
                    .await?;
                created["id"]
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        EngineError::provider(
                            "Account creation returned no id".to_owned(),
                        )
                    })?
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Create a checkout session for a payment intent.
    pub async fn create_checkout(
        &self,
        spec: &CheckoutSpec,
    ) -> Result<CobreCheckout, EngineError> {
        let token = self.token().await?;
        let _account = self.account_id().await?;
        let url = format!("{}/v1/checkouts", self.cfg.base_url);
        let valid_until =
            spec.valid_until.to_utc().to_rfc3339_opts(
                chrono::SecondsFormat::Secs,
                true,
            );
        let body = json!({
            "alias": self.cfg.account_alias,
            "amount": spec.amount.cents(),
            "external_id": spec.external_id,
            "destination_id": self.cfg.destination_id,
            "checkout_rails": CHECKOUT_RAILS,
            "checkout_header":
                sanitize::checkout_text(&spec.checkout_header, HEADER_MAX),
            "checkout_item":
                sanitize::checkout_text(&spec.checkout_item, ITEM_MAX),
            "description_to_payee": sanitize::checkout_text(
                &spec.description_to_payee,
                DESCRIPTION_MAX,
            ),
            "valid_until": valid_until,
            "money_movement_intent_limit": 1,
            "redirect_url": self.cfg.redirect_url,
            "metadata": spec.metadata,
        });

        let checkout: CobreCheckout = self
            .request_json(self.client.post(&url).bearer_auth(&token).json(&body))
            .await?;
        info!(
            checkout_id = %checkout.id,
            external_id = %spec.external_id,
            "Cobre checkout created"
        );
        Ok(checkout)
    }

    /// Fetch a checkout by its external id.
    async fn checkout_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Value>, EngineError> {
        let token = self.token().await?;
        let url = format!(
            "{}/v1/checkouts?external_id={external_id}",
            self.cfg.base_url,
        );
        let listing: Value = self
            .request_json(self.client.get(&url).bearer_auth(&token))
            .await?;
        let checkout = listing["contents"]
            .as_array()
            .and_then(|contents| contents.first())
            .cloned()
            .or_else(|| {
                listing.as_array().and_then(|list| list.first()).cloned()
            });
        Ok(checkout)
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, EngineError> {
        let response = builder.send().await.map_err(|err| {
            EngineError::provider(format!("Cobre unreachable: {err}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(format!(
                "Cobre returned {status}: {body}"
            )));
        }
        response.json().await.map_err(|err| {
            EngineError::provider(format!(
                "Cobre response was not the expected JSON: {err}"
            ))
        })
    }
}

#[async_trait]
impl ProviderApi for CobreClient {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Cobre
    }

    /// The money-movement id is discovered from the checkout record keyed by
    /// the standardized external id.
    async fn find_status_id(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<String>, EngineError> {
        let Some(checkout) =
            self.checkout_by_external_id(gateway_ref).await?
        else {
            return Ok(None);
        };
        let id = checkout["money_movements"]
            .as_array()
            .and_then(|movements| movements.first())
            .and_then(|movement| movement["id"].as_str())
            .or_else(|| checkout["money_movement_id"].as_str())
            .map(str::to_owned);
        Ok(id)
    }

    async fn canonical_status(
        &self,
        status_id: &str,
        bypass_cache: bool,
    ) -> Result<CanonicalStatus, EngineError> {
        if !bypass_cache {
            let mut cache =
                self.status_cache.lock().expect("Cache lock poisoned");
            if let Some((fetched_at, status)) = cache.get(status_id) {
                if fetched_at.elapsed() < self.cfg.status_cache_ttl {
                    return Ok(status.clone());
                }
            }
        }

        if self.rate_limiter.check_key(&status_id.to_owned()).is_err() {
            warn!(status_id, "Cobre status query rate limit hit");
            return Err(EngineError::RateLimited(format!(
                "Status queries for '{status_id}'"
            )));
        }

        let token = self.token().await?;
        let url =
            format!("{}/v1/money_movements/{status_id}", self.cfg.base_url);
        let movement: Value = self
            .request_json(self.client.get(&url).bearer_auth(&token))
            .await?;

        let raw_status = movement["status"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let amount = movement["amount"]
            .as_i64()
            .and_then(|cents| Amount::from_cents(cents).ok())
            .ok_or_else(|| {
                EngineError::provider(
                    "Money movement carries no amount".to_owned(),
                )
            })?;
        let external_id = movement["external_id"]
            .as_str()
            .or_else(|| movement["metadata"]["external_id"].as_str())
            .unwrap_or_default()
            .to_owned();
        let canonical = CanonicalStatus {
            external_id,
            status: CobreAdapter::map_status(&raw_status),
            raw_status,
            amount,
            currency: movement["currency"]
                .as_str()
                .unwrap_or("COP")
                .to_owned(),
        };

        self.status_cache
            .lock()
            .expect("Cache lock poisoned")
            .put(status_id.to_owned(), (Instant::now(), canonical.clone()));
        Ok(canonical)
    }
}

impl CobreClient {
    /// How long a created checkout stays payable.
    pub fn checkout_valid_for(&self) -> std::time::Duration {
        self.cfg.checkout_valid_for
    }
}
