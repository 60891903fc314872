//! Entity id newtypes.
//!
//! Every persisted entity is keyed by a database-assigned `BIGSERIAL`; the
//! newtypes exist so an order id cannot be passed where a license id is
//! expected. Relations are stored as ids only; hydration of a bounded object
//! graph happens in the storage layer on demand.

use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        #[cfg_attr(
            any(test, feature = "test-utils"),
            derive(proptest_derive::Arbitrary)
        )]
        pub struct $name(pub i64);

        impl $name {
            #[inline]
            pub fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                i64::from_str(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Key of an [`Order`](crate::records::Order).
    OrderId
);
define_id!(
    /// Key of a [`Txn`](crate::records::Txn), a payment attempt.
    TxnId
);
define_id!(
    /// Key of a [`License`](crate::records::License).
    LicenseId
);
define_id!(
    /// Key of a [`WaitlistEntry`](crate::records::WaitlistEntry).
    WaitlistEntryId
);
define_id!(
    /// Key of a persisted [`WebhookEvent`](crate::records::WebhookEvent).
    WebhookEventId
);
define_id!(
    /// Key of a [`Customer`](crate::records::Customer).
    CustomerId
);
define_id!(
    /// Key of a [`Product`](crate::records::Product).
    ProductId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_fromstr_roundtrip() {
        let id = OrderId(42);
        assert_eq!(OrderId::from_str(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn serde_is_transparent() {
        assert_eq!(serde_json::to_string(&LicenseId(7)).unwrap(), "7");
        assert_eq!(serde_json::from_str::<LicenseId>("7").unwrap(), LicenseId(7));
    }
}
