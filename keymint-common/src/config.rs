//! Typed configuration, validated from the environment at startup.
//!
//! Every tunable is an explicit field with a default; required values with no
//! default are collected so a misconfigured deployment gets one fatal report
//! naming everything that is wrong, not just the first missing variable.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Required env vars were missing or unparseable. The process should print
/// this report and exit non-zero.
#[derive(Debug, thiserror::Error)]
#[error("Invalid configuration:\n{report}")]
pub struct FatalConfigError {
    pub report: String,
}

/// Top-level configuration for the keymint node.
#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub cobre: CobreConfig,
    pub epayco: EpaycoConfig,
    pub mock_provider: MockProviderConfig,
    pub mailer: MailerConfig,
    pub email_queue: EmailQueueConfig,
    pub waitlist: WaitlistConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Cobre gateway credentials and client tunables.
#[derive(Clone, Debug)]
pub struct CobreConfig {
    pub base_url: String,
    pub user_id: String,
    pub secret: String,
    pub webhook_secret: String,
    /// Account resource alias; looked up lazily, created on absence.
    pub account_alias: String,
    pub destination_id: String,
    pub redirect_url: String,
    /// How long a created checkout stays payable.
    pub checkout_valid_for: Duration,
    /// Outbound per-checkout rate limit: at most `rate_limit_max` requests
    /// per rolling `rate_limit_window` per key.
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// TTL of the provider status cache. Callers may bypass.
    pub status_cache_ttl: Duration,
    /// Refresh the auth token this long before its reported expiry.
    pub token_expiry_margin: Duration,
    pub request_timeout: Duration,
}

/// ePayco confirmation-webhook credentials.
#[derive(Clone, Debug)]
pub struct EpaycoConfig {
    /// `p_cust_id_cliente`.
    pub client_id: String,
    /// `p_key`.
    pub p_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

/// The mock provider used by tests and local development.
#[derive(Clone, Debug)]
pub struct MockProviderConfig {
    pub enabled: bool,
    pub secret: String,
}

/// Outbound transactional-mail API credentials.
#[derive(Clone, Debug)]
pub struct MailerConfig {
    pub base_url: String,
    pub api_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub reply_to_email: String,
    pub request_timeout: Duration,
}

/// Email delivery queue tunables (spec defaults: 30 s / 3 / 1000).
#[derive(Clone, Debug)]
pub struct EmailQueueConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub max_queue_size: usize,
}

impl Default for EmailQueueConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 3,
            max_queue_size: 1000,
        }
    }
}

/// Waitlist scheduler tunables: one entry per tick.
#[derive(Clone, Debug)]
pub struct WaitlistConfig {
    pub tick_interval: Duration,
    pub max_retries: u32,
}

impl Default for WaitlistConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Reconciliation sweep tunables.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub sweep_interval: Duration,
    /// A transaction stuck in CREATED/PENDING longer than this is verified
    /// against the provider.
    pub stuck_threshold: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(3600),
            batch_size: 5,
            batch_pause: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Read and validate the full configuration from the environment.
    pub fn from_env() -> Result<Self, FatalConfigError> {
        let mut reader = EnvReader::default();

        let server = ServerConfig {
            bind_addr: reader.var_or("KEYMINT_BIND_ADDR", "0.0.0.0"),
            port: reader.parse_or("KEYMINT_PORT", 8080u16),
        };
        let db = DbConfig {
            url: reader.required("DATABASE_URL"),
            max_connections: reader.parse_or("DATABASE_MAX_CONNECTIONS", 10u32),
        };
        let cobre = CobreConfig {
            base_url: reader.var_or("COBRE_BASE_URL", "https://api.cobre.co"),
            user_id: reader.required("COBRE_USER_ID"),
            secret: reader.required("COBRE_SECRET"),
            webhook_secret: reader.required("COBRE_WEBHOOK_SECRET"),
            account_alias: reader.var_or("COBRE_ACCOUNT_ALIAS", "keymint"),
            destination_id: reader.required("COBRE_DESTINATION_ID"),
            redirect_url: reader.required("COBRE_REDIRECT_URL"),
            checkout_valid_for: reader.secs_or("COBRE_CHECKOUT_VALID_SECS", 3600),
            rate_limit_max: reader.parse_or("COBRE_RATE_LIMIT_MAX", 10u32),
            rate_limit_window: reader.secs_or("COBRE_RATE_LIMIT_WINDOW_SECS", 60),
            status_cache_ttl: reader.secs_or("COBRE_STATUS_CACHE_TTL_SECS", 60),
            token_expiry_margin: reader.secs_or("COBRE_TOKEN_MARGIN_SECS", 30),
            request_timeout: reader.secs_or("COBRE_REQUEST_TIMEOUT_SECS", 30),
        };
        let epayco = EpaycoConfig {
            client_id: reader.required("EPAYCO_CLIENT_ID"),
            p_key: reader.required("EPAYCO_P_KEY"),
            base_url: reader
                .var_or("EPAYCO_BASE_URL", "https://secure.epayco.co"),
            request_timeout: reader.secs_or("EPAYCO_REQUEST_TIMEOUT_SECS", 30),
        };
        let mock_provider = MockProviderConfig {
            enabled: reader.parse_or("MOCK_PROVIDER_ENABLED", false),
            secret: reader.var_or("MOCK_PROVIDER_SECRET", "mock-secret"),
        };
        let mailer = MailerConfig {
            base_url: reader.var_or("MAILER_BASE_URL", "https://api.brevo.com"),
            api_key: reader.required("MAILER_API_KEY"),
            sender_name: reader.var_or("MAILER_SENDER_NAME", "Keymint Store"),
            sender_email: reader.required("MAILER_SENDER_EMAIL"),
            reply_to_email: reader.var_or("MAILER_REPLY_TO", "support@keymint.store"),
            request_timeout: reader.secs_or("MAILER_REQUEST_TIMEOUT_SECS", 30),
        };
        let email_queue = EmailQueueConfig {
            interval: reader.secs_or("EMAIL_QUEUE_INTERVAL_SECS", 30),
            max_retries: reader.parse_or("EMAIL_QUEUE_MAX_RETRIES", 3u32),
            max_queue_size: reader.parse_or("EMAIL_QUEUE_MAX_SIZE", 1000usize),
        };
        let waitlist = WaitlistConfig {
            tick_interval: reader.secs_or("WAITLIST_TICK_INTERVAL_SECS", 30),
            max_retries: reader.parse_or("WAITLIST_MAX_RETRIES", 3u32),
        };
        let reconciler = ReconcilerConfig {
            sweep_interval: reader.secs_or("RECONCILER_SWEEP_INTERVAL_SECS", 300),
            stuck_threshold: reader.secs_or("RECONCILER_STUCK_THRESHOLD_SECS", 3600),
            batch_size: reader.parse_or("RECONCILER_BATCH_SIZE", 5usize),
            batch_pause: reader.secs_or("RECONCILER_BATCH_PAUSE_SECS", 1),
        };

        reader.finish()?;
        Ok(Self {
            server,
            db,
            cobre,
            epayco,
            mock_provider,
            mailer,
            email_queue,
            waitlist,
            reconciler,
        })
    }
}

/// Collects every env problem so the report names all of them at once.
#[derive(Default)]
struct EnvReader {
    problems: Vec<String>,
}

impl EnvReader {
    fn required(&mut self, key: &str) -> String {
        match env::var(key) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                self.problems.push(format!("{key} is required but not set"));
                String::new()
            }
        }
    }

    fn var_or(&mut self, key: &str, default: &str) -> String {
        env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| {
            default.to_owned()
        })
    }

    fn parse_or<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match env::var(key) {
            Ok(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(err) => {
                    self.problems
                        .push(format!("{key}={raw} is invalid: {err}"));
                    default
                }
            },
            Err(_) => default,
        }
    }

    fn secs_or(&mut self, key: &str, default_secs: u64) -> Duration {
        Duration::from_secs(self.parse_or(key, default_secs))
    }

    fn finish(self) -> Result<(), FatalConfigError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            let mut report = String::new();
            for problem in &self.problems {
                report.push_str("  - ");
                report.push_str(problem);
                report.push('\n');
            }
            Err(FatalConfigError { report })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_when_unset() {
        let mut reader = EnvReader::default();
        let queue = EmailQueueConfig {
            interval: reader.secs_or("KEYMINT_TEST_UNSET_INTERVAL", 30),
            max_retries: reader.parse_or("KEYMINT_TEST_UNSET_RETRIES", 3u32),
            max_queue_size: reader.parse_or("KEYMINT_TEST_UNSET_SIZE", 1000usize),
        };
        assert!(reader.finish().is_ok());
        assert_eq!(queue.interval, Duration::from_secs(30));
        assert_eq!(queue.max_retries, 3);
        assert_eq!(queue.max_queue_size, 1000);
    }

    #[test]
    fn missing_required_vars_are_all_reported() {
        let mut reader = EnvReader::default();
        let _ = reader.required("KEYMINT_TEST_MISSING_ONE");
        let _ = reader.required("KEYMINT_TEST_MISSING_TWO");
        let err = reader.finish().unwrap_err();
        assert!(err.report.contains("KEYMINT_TEST_MISSING_ONE"));
        assert!(err.report.contains("KEYMINT_TEST_MISSING_TWO"));
    }
}
