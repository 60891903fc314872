//! Status enums and the payment provider enum.
//!
//! Every enum here has a stable `as_str` wire/database form; `FromStr`
//! accepts exactly those forms. Serde goes through the string form so JSON
//! payloads, `meta` audit subtrees, and TEXT columns all agree.

use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::anyhow;
use serde::Serialize;
use serde_with::DeserializeFromStr;

macro_rules! string_enum_impls {
    ($name:ident, $($variant:ident => $str:literal),+ $(,)?) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(anyhow!(concat!(
                        "Unrecognized ", stringify!($name), " '{}'"), s)),
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                self.as_str().serialize(serializer)
            }
        }
    };
}

/// The payment gateways keymint can ingest webhooks from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[derive(strum::VariantArray)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum PaymentProvider {
    /// Cobre: signed webhooks, checkout + money-movement API.
    Cobre,
    /// ePayco: form-style confirmation webhooks.
    Epayco,
    /// In-process mock used by tests and local development.
    Mock,
}

string_enum_impls!(PaymentProvider,
    Cobre => "cobre",
    Epayco => "epayco",
    Mock => "mock",
);

/// Order lifecycle status.
///
/// `Completed` is reachable only after license-email confirmation (or
/// immediately for non-license products). `Canceled` is terminal except for
/// the bounded admin revive operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum OrderStatus {
    Pending,
    InProcess,
    Completed,
    Canceled,
}

string_enum_impls!(OrderStatus,
    Pending => "PENDING",
    InProcess => "IN_PROCESS",
    Completed => "COMPLETED",
    Canceled => "CANCELED",
);

/// Payment attempt status. `Paid` and `Failed` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum TxnStatus {
    Created,
    Pending,
    Paid,
    Failed,
}

string_enum_impls!(TxnStatus,
    Created => "CREATED",
    Pending => "PENDING",
    Paid => "PAID",
    Failed => "FAILED",
);

impl TxnStatus {
    /// Whether this status ends the payment attempt.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }

    /// Whether a payment attempt in this status is still awaiting a gateway
    /// outcome.
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Pending)
    }
}

/// Tax-invoice lifecycle marker on a transaction. Issuance itself is out of
/// scope; the marker is set to `Pending` when a transaction reaches `Paid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum InvoiceStatus {
    Pending,
    Issued,
}

string_enum_impls!(InvoiceStatus,
    Pending => "PENDING",
    Issued => "ISSUED",
);

/// Pre-provisioned license inventory status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum LicenseStatus {
    Available,
    Reserved,
    Sold,
}

string_enum_impls!(LicenseStatus,
    Available => "AVAILABLE",
    Reserved => "RESERVED",
    Sold => "SOLD",
);

/// FIFO waitlist entry status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum WaitlistStatus {
    Pending,
    ReadyForEmail,
    Processing,
    Completed,
    Failed,
}

string_enum_impls!(WaitlistStatus,
    Pending => "PENDING",
    ReadyForEmail => "READY_FOR_EMAIL",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
);

/// Processing status of a persisted webhook event record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

string_enum_impls!(WebhookStatus,
    Pending => "PENDING",
    Processed => "PROCESSED",
    Failed => "FAILED",
);

/// The kinds of email the delivery queue knows how to render and send.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum EmailTaskKind {
    LicenseEmail,
    WaitlistNotification,
    OrderConfirmation,
}

string_enum_impls!(EmailTaskKind,
    LicenseEmail => "LICENSE_EMAIL",
    WaitlistNotification => "WAITLIST_NOTIFICATION",
    OrderConfirmation => "ORDER_CONFIRMATION",
);

/// The two normalized event shapes adapters produce.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum WebhookEventType {
    /// A payment attempt changed state.
    Payment,
    /// An account-level credit notification, informational only.
    BalanceCredit,
}

string_enum_impls!(WebhookEventType,
    Payment => "payment",
    BalanceCredit => "balance_credit",
);

#[cfg(test)]
mod tests {
    use proptest::{prop_assert_eq, proptest};
    use strum::VariantArray;

    use super::*;

    #[test]
    fn provider_fromstr_display_roundtrip() {
        for provider in PaymentProvider::VARIANTS {
            let parsed =
                PaymentProvider::from_str(provider.as_str()).unwrap();
            assert_eq!(parsed, *provider);
        }
        assert!(PaymentProvider::from_str("stripe").is_err());
    }

    #[test]
    fn statuses_roundtrip_through_strings() {
        proptest!(|(
            order in proptest::arbitrary::any::<OrderStatus>(),
            txn in proptest::arbitrary::any::<TxnStatus>(),
            license in proptest::arbitrary::any::<LicenseStatus>(),
            waitlist in proptest::arbitrary::any::<WaitlistStatus>(),
        )| {
            prop_assert_eq!(OrderStatus::from_str(order.as_str()).unwrap(), order);
            prop_assert_eq!(TxnStatus::from_str(txn.as_str()).unwrap(), txn);
            prop_assert_eq!(
                LicenseStatus::from_str(license.as_str()).unwrap(),
                license
            );
            prop_assert_eq!(
                WaitlistStatus::from_str(waitlist.as_str()).unwrap(),
                waitlist
            );
        })
    }

    #[test]
    fn txn_status_classification() {
        assert!(TxnStatus::Created.is_open());
        assert!(TxnStatus::Pending.is_open());
        assert!(TxnStatus::Paid.is_terminal());
        assert!(TxnStatus::Failed.is_terminal());
        assert!(!TxnStatus::Paid.is_open());
    }
}
