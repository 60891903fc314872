//! Order intake and payment initiation.
//!
//! Thin by design: the storefront's HTTP layer calls these; the state
//! machine consumes only the resulting Order/Transaction rows.

use std::sync::Arc;

use keymint_common::amount::Amount;
use keymint_common::enums::{PaymentProvider, TxnStatus};
use keymint_common::ids::OrderId;
use keymint_common::records::{Order, Txn};
use keymint_common::time::{TimestampMs, bogota_checkout_stamp};
use serde_json::json;
use tracing::{info, instrument};

use crate::clients::cobre::{CheckoutSpec, CobreClient};
use crate::error::EngineError;
use crate::traits::{NewCustomer, NewOrder, NewTxn, Store, StoreTx};

/// Identity document types accepted at intake.
const DOCUMENT_TYPES: &[&str] = &["CC", "CE", "NIT", "TI", "PP"];

/// Standardized checkout external id:
/// `<productRef>-<provider>-<orderId>-<YYYY-MM-DD-HHMM>` (Bogota local
/// time). Stored as the transaction's gateway ref, matched by webhooks.
pub fn standardized_external_id(
    product_ref: &str,
    provider: PaymentProvider,
    order_id: OrderId,
    at: TimestampMs,
) -> String {
    format!(
        "{product_ref}-{provider}-{order_id}-{stamp}",
        stamp = bogota_checkout_stamp(at),
    )
}

#[derive(Clone, Debug)]
pub struct CustomerInput {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CreateOrderRequest {
    pub customer: CustomerInput,
    pub product_ref: String,
    pub qty: i32,
    pub gateway: PaymentProvider,
    pub discount_total: Amount,
    pub tax_total: Amount,
    pub shipping_info: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct CreateOrderResult {
    pub order: Order,
    pub txn: Txn,
}

#[derive(Clone, Debug)]
pub struct PaymentInit {
    pub txn_id: keymint_common::ids::TxnId,
    pub external_id: String,
    pub checkout_id: Option<String>,
    pub checkout_url: Option<String>,
}

pub struct Intake<S: Store> {
    store: S,
    cobre: Option<Arc<CobreClient>>,
}

impl<S: Store> Clone for Intake<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cobre: self.cobre.clone(),
        }
    }
}

impl<S: Store> Intake<S> {
    pub fn new(store: S, cobre: Option<Arc<CobreClient>>) -> Self {
        Self { store, cobre }
    }

    /// Create Customer (find-or-create by email), Order (PENDING), and
    /// Transaction (CREATED) in one storage transaction.
    #[instrument(skip_all, fields(product_ref = %req.product_ref))]
    pub async fn create_order(
        &self,
        req: CreateOrderRequest,
    ) -> Result<CreateOrderResult, EngineError> {
        validate_customer(&req.customer)?;
        if req.qty < 1 {
            return Err(EngineError::validation("qty must be at least 1"));
        }

        let product = self
            .store
            .product_by_ref(&req.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &req.product_ref)
            })?;

        let subtotal = Amount::from_cents(
            product
                .price
                .cents()
                .checked_mul(i64::from(req.qty))
                .ok_or_else(|| {
                    EngineError::validation("Order subtotal overflows")
                })?,
        )
        .expect("Product of non-negatives is non-negative");
        let grand_total = subtotal
            .checked_sub(req.discount_total)
            .and_then(|net| net.checked_add(req.tax_total))
            .map_err(|_| {
                EngineError::validation(
                    "discount exceeds subtotal or totals overflow",
                )
            })?;

        let mut tx = self.store.begin().await?;
        let customer =
            match tx.customer_by_email(&req.customer.email).await? {
                Some(existing) => existing,
                None => {
                    tx.insert_customer(NewCustomer {
                        email: req.customer.email.clone(),
                        first_name: req.customer.first_name.clone(),
                        last_name: req.customer.last_name.clone(),
                        document_type: req.customer.document_type.clone(),
                        document_number: req
                            .customer
                            .document_number
                            .clone(),
                    })
                    .await?
                }
            };
        let order = tx
            .insert_order(NewOrder {
                customer_id: customer.id,
                product_ref: req.product_ref.clone(),
                qty: req.qty,
                subtotal,
                discount_total: req.discount_total,
                tax_total: req.tax_total,
                grand_total,
                currency: product.currency.clone(),
                shipping_info: req.shipping_info,
            })
            .await?;
        let txn = tx
            .insert_txn(NewTxn {
                order_id: order.id,
                gateway: req.gateway,
                amount: grand_total,
                currency: product.currency,
            })
            .await?;
        tx.commit().await?;
        info!(order_id = %order.id, txn_id = %txn.id, "Order created");
        Ok(CreateOrderResult { order, txn })
    }

    /// Initiate payment for an order's CREATED transaction: create the
    /// provider checkout, persist the gateway ref, and move the transaction
    /// to PENDING on provider acknowledgement.
    #[instrument(skip(self))]
    pub async fn init_payment(
        &self,
        order_id: OrderId,
    ) -> Result<PaymentInit, EngineError> {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_id))?;
        let txn = self
            .store
            .txns_for_order(order_id)
            .await?
            .into_iter()
            .find(|txn| txn.status == TxnStatus::Created)
            .ok_or_else(|| {
                EngineError::conflict(format!(
                    "Order {order_id} has no CREATED transaction to \
                     initiate"
                ))
            })?;
        let product = self
            .store
            .product_by_ref(&order.product_ref)
            .await?
            .ok_or_else(|| {
                EngineError::not_found("Product", &order.product_ref)
            })?;

        let now = TimestampMs::now();
        let external_id = standardized_external_id(
            &order.product_ref,
            txn.gateway,
            order_id,
            now,
        );

        let (checkout_id, checkout_url) = match txn.gateway {
            PaymentProvider::Cobre => {
                let client = self.cobre.as_ref().ok_or_else(|| {
                    EngineError::validation(
                        "Cobre is not configured on this deployment",
                    )
                })?;
                let valid_for_ms =
                    client.checkout_valid_for().as_millis() as i64;
                let valid_until = TimestampMs::from_i64(
                    now.as_i64().saturating_add(valid_for_ms),
                )
                .unwrap_or(now);
                let checkout = client
                    .create_checkout(&CheckoutSpec {
                        amount: txn.amount,
                        external_id: external_id.clone(),
                        checkout_header: product.name.clone(),
                        checkout_item: product.name.clone(),
                        description_to_payee: format!("Order {order_id}"),
                        valid_until,
                        metadata: json!({
                            "orderId": order_id,
                            "productRef": order.product_ref,
                        }),
                    })
                    .await?;
                (Some(checkout.id), checkout.checkout_url)
            }
            // ePayco and mock checkouts open client-side; the external id
            // travels with the form and returns on the webhook.
            PaymentProvider::Epayco | PaymentProvider::Mock => (None, None),
        };

        let mut tx = self.store.begin().await?;
        tx.set_txn_gateway_ref(txn.id, &external_id, TxnStatus::Pending)
            .await?;
        tx.commit().await?;
        info!(
            txn_id = %txn.id,
            external_id,
            "Payment initiated; transaction PENDING"
        );
        Ok(PaymentInit {
            txn_id: txn.id,
            external_id,
            checkout_id,
            checkout_url,
        })
    }
}

fn validate_customer(customer: &CustomerInput) -> Result<(), EngineError> {
    if !customer.email.contains('@') {
        return Err(EngineError::validation("customer email is invalid"));
    }
    if customer.first_name.trim().is_empty() {
        return Err(EngineError::validation("customer first name is required"));
    }
    if let Some(document_type) = &customer.document_type {
        if !DOCUMENT_TYPES.contains(&document_type.as_str()) {
            return Err(EngineError::validation(format!(
                "unknown document type '{document_type}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_embeds_provider_and_bogota_stamp() {
        // 2024-03-07T03:30:00Z == 2024-03-06 22:30 in Bogota.
        let at = TimestampMs::from_i64(1_709_782_200_000).unwrap();
        assert_eq!(
            standardized_external_id(
                "editor-pro",
                PaymentProvider::Cobre,
                OrderId(42),
                at,
            ),
            "editor-pro-cobre-42-2024-03-06-2230"
        );
    }

    #[test]
    fn document_type_validation() {
        let mut customer = CustomerInput {
            email: "ada@example.com".to_owned(),
            first_name: "Ada".to_owned(),
            last_name: "Lovelace".to_owned(),
            document_type: Some("CC".to_owned()),
            document_number: Some("1".to_owned()),
        };
        assert!(validate_customer(&customer).is_ok());
        customer.document_type = Some("XX".to_owned());
        assert!(matches!(
            validate_customer(&customer),
            Err(EngineError::Validation(_))
        ));
        customer.document_type = None;
        customer.email = "nope".to_owned();
        assert!(validate_customer(&customer).is_err());
    }
}
