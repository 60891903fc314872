//! Email template rendering.
//!
//! Templates are typed inputs rendered to inline HTML; there is no template
//! engine because the three bodies are short and fully determined by their
//! inputs.

use keymint_common::amount::Amount;
use keymint_common::ids::{OrderId, WaitlistEntryId};
use keymint_common::time::TimestampMs;

use crate::traits::OutgoingEmail;

/// Escape the handful of HTML-significant characters in user-derived text.
fn escape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '&' => "&amp;".to_owned(),
            '<' => "&lt;".to_owned(),
            '>' => "&gt;".to_owned(),
            '"' => "&quot;".to_owned(),
            c => c.to_string(),
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct LicenseDeliveryEmail {
    pub to_email: String,
    pub to_name: String,
    pub order_id: OrderId,
    pub product_name: String,
    pub license_key: String,
    pub instructions: Option<String>,
}

pub fn license_delivery(input: &LicenseDeliveryEmail) -> OutgoingEmail {
    let product = escape(&input.product_name);
    let key = escape(&input.license_key);
    let instructions = input
        .instructions
        .as_deref()
        .map(|text| format!("<p>{}</p>", escape(text)))
        .unwrap_or_default();
    let html_body = format!(
        "<h2>Your {product} license</h2>\
         <p>Order #{order}</p>\
         <p>License key: <code>{key}</code></p>\
         {instructions}\
         <p>Keep this email; the key is shown only here.</p>",
        order = input.order_id,
    );
    OutgoingEmail {
        to_email: input.to_email.clone(),
        to_name: input.to_name.clone(),
        subject: format!("Your {} license key", input.product_name),
        html_body,
        tags: vec![
            "license_delivery".to_owned(),
            format!("order_{}", input.order_id),
        ],
    }
}

#[derive(Clone, Debug)]
pub struct WaitlistNotificationEmail {
    pub to_email: String,
    pub to_name: String,
    pub order_id: OrderId,
    pub entry_id: WaitlistEntryId,
    pub product_name: String,
}

pub fn waitlist_notification(
    input: &WaitlistNotificationEmail,
    now: TimestampMs,
) -> OutgoingEmail {
    let product = escape(&input.product_name);
    let html_body = format!(
        "<h2>Payment received</h2>\
         <p>Order #{order}: your payment for {product} is confirmed.</p>\
         <p>All keys are currently assigned; yours will be delivered \
         automatically as soon as stock is replenished, in order of \
         purchase.</p>",
        order = input.order_id,
    );
    OutgoingEmail {
        to_email: input.to_email.clone(),
        to_name: input.to_name.clone(),
        subject: format!("{} - you're on the waitlist", input.product_name),
        html_body,
        // Synthetic correlation id for waitlist notifications.
        tags: vec![format!(
            "waitlist_{}_{}",
            input.entry_id,
            now.as_i64()
        )],
    }
}

#[derive(Clone, Debug)]
pub struct OrderConfirmationEmail {
    pub to_email: String,
    pub to_name: String,
    pub order_id: OrderId,
    pub product_name: String,
    pub grand_total: Amount,
    pub currency: String,
}

pub fn order_confirmation(input: &OrderConfirmationEmail) -> OutgoingEmail {
    let product = escape(&input.product_name);
    let currency = escape(&input.currency);
    let html_body = format!(
        "<h2>Order confirmed</h2>\
         <p>Order #{order}: {product}.</p>\
         <p>Total charged: {total} {currency} (minor units).</p>",
        order = input.order_id,
        total = input.grand_total,
    );
    OutgoingEmail {
        to_email: input.to_email.clone(),
        to_name: input.to_name.clone(),
        subject: format!("Order #{} confirmed", input.order_id),
        html_body,
        tags: vec![
            "order_confirmation".to_owned(),
            format!("order_{}", input.order_id),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn license_delivery_contains_key_and_escapes() {
        let email = license_delivery(&LicenseDeliveryEmail {
            to_email: "ada@example.com".to_owned(),
            to_name: "Ada".to_owned(),
            order_id: OrderId(7),
            product_name: "Editor <Pro>".to_owned(),
            license_key: "AAAA-BBBB".to_owned(),
            instructions: None,
        });
        assert!(email.html_body.contains("AAAA-BBBB"));
        assert!(email.html_body.contains("Editor &lt;Pro&gt;"));
        assert!(email.tags.contains(&"license_delivery".to_owned()));
    }

    #[test]
    fn waitlist_tag_uses_synthetic_id() {
        let now = TimestampMs::from_i64(1_700_000_000_000).unwrap();
        let email = waitlist_notification(
            &WaitlistNotificationEmail {
                to_email: "ada@example.com".to_owned(),
                to_name: "Ada".to_owned(),
                order_id: OrderId(7),
                entry_id: WaitlistEntryId(3),
                product_name: "Editor".to_owned(),
            },
            now,
        );
        assert_eq!(email.tags, vec!["waitlist_3_1700000000000".to_owned()]);
    }
}
