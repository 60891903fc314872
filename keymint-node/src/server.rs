//! The HTTP surface: webhook ingress, order intake, and the admin
//! operations. Webhook bodies are taken raw (signatures are computed over
//! the exact bytes); admin responses use the `{success, message, data}`
//! envelope.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use keymint_common::amount::Amount;
use keymint_common::enums::PaymentProvider;
use keymint_common::ids::{OrderId, TxnId, WaitlistEntryId};
use keymint_db::PgStore;
use keymint_engine::admin::Admin;
use keymint_engine::error::EngineError;
use keymint_engine::event::WebhookRequest;
use keymint_engine::ingress::WebhookIngress;
use keymint_engine::intake::{
    CreateOrderRequest, CustomerInput, Intake,
};
use keymint_engine::inventory::Inventory;
use keymint_engine::mailer::brevo::BrevoMailer;
use keymint_engine::reconcile::Reconciler;
use keymint_engine::traits::NewLicense;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

pub struct AppCtx {
    pub ingress: WebhookIngress<PgStore, BrevoMailer>,
    pub intake: Intake<PgStore>,
    pub admin: Admin<PgStore, BrevoMailer>,
    pub reconciler: Reconciler<PgStore, BrevoMailer>,
    pub inventory: Inventory<PgStore, BrevoMailer>,
}

type Ctx = Arc<AppCtx>;

pub fn router(ctx: Ctx) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(handle_webhook))
        .route("/v1/orders", post(create_order))
        .route("/v1/orders/{id}/payment", post(init_payment))
        .route(
            "/v1/admin/orders/{id}/change-license",
            post(change_license),
        )
        .route("/v1/admin/orders/{id}/revive", post(revive_order))
        .route(
            "/v1/admin/orders/{id}/resend-license-email",
            post(resend_license_email),
        )
        .route(
            "/v1/admin/transactions/{id}/verify",
            post(verify_transaction),
        )
        .route("/v1/admin/transactions/verify", post(verify_multiple))
        .route("/v1/admin/waitlist/{id}", delete(remove_waitlist_entry))
        .route(
            "/v1/admin/products/{product_ref}/licenses",
            post(load_licenses),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// [`EngineError`] as an HTTP response with the admin error envelope.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn envelope(message: &str, data: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": message,
        "data": data,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- Webhooks --- //

async fn handle_webhook(
    State(ctx): State<Ctx>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = String::from_utf8(body.to_vec()).map_err(|_| {
        EngineError::validation("Webhook body is not valid UTF-8")
    })?;
    let header_pairs = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect::<Vec<_>>();
    let request = WebhookRequest::new(header_pairs, body);

    let summary = ctx.ingress.process(&provider, &request).await?;
    Ok((StatusCode::OK, Json(summary)).into_response())
}

// --- Intake --- //

#[derive(Deserialize)]
struct CreateOrderBody {
    customer: CustomerBody,
    product_ref: String,
    qty: i32,
    gateway: PaymentProvider,
    #[serde(default)]
    discount_total: Option<i64>,
    #[serde(default)]
    tax_total: Option<i64>,
    #[serde(default)]
    shipping_info: Option<Value>,
}

#[derive(Deserialize)]
struct CustomerBody {
    email: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    document_number: Option<String>,
}

async fn create_order(
    State(ctx): State<Ctx>,
    Json(body): Json<CreateOrderBody>,
) -> Result<Json<Value>, ApiError> {
    let cents = |value: Option<i64>, field: &str| {
        Amount::from_cents(value.unwrap_or(0)).map_err(|_| {
            EngineError::validation(format!("{field} must be non-negative"))
        })
    };
    let request = CreateOrderRequest {
        customer: CustomerInput {
            email: body.customer.email,
            first_name: body.customer.first_name,
            last_name: body.customer.last_name,
            document_type: body.customer.document_type,
            document_number: body.customer.document_number,
        },
        product_ref: body.product_ref,
        qty: body.qty,
        gateway: body.gateway,
        discount_total: cents(body.discount_total, "discount_total")?,
        tax_total: cents(body.tax_total, "tax_total")?,
        shipping_info: body.shipping_info.unwrap_or_else(|| json!({})),
    };
    let result = ctx.intake.create_order(request).await?;
    Ok(envelope("Order created", json!({
        "order": result.order,
        "transaction": result.txn,
    })))
}

async fn init_payment(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let init = ctx.intake.init_payment(OrderId(id)).await?;
    Ok(envelope("Payment initiated", json!({
        "transactionId": init.txn_id,
        "externalId": init.external_id,
        "checkoutId": init.checkout_id,
        "checkoutUrl": init.checkout_url,
    })))
}

// --- Admin --- //

async fn change_license(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let change = ctx.admin.change_license(OrderId(id)).await?;
    Ok(envelope("License changed", json!({
        "orderId": change.order_id,
        "oldLicenseId": change.old_license_id,
        "newLicenseId": change.new_license_id,
    })))
}

async fn revive_order(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let outcome = ctx.admin.revive_order(OrderId(id)).await?;
    Ok(envelope("Order revived", json!({
        "outcome": format!("{outcome:?}"),
    })))
}

async fn resend_license_email(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    ctx.admin.resend_license_email(OrderId(id)).await?;
    Ok(envelope("License email sent", Value::Null))
}

#[derive(Deserialize, Default)]
struct VerifyBody {
    #[serde(default)]
    provider_status_id: Option<String>,
}

async fn verify_transaction(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = ctx
        .reconciler
        .verify_transaction_status(TxnId(id), body.provider_status_id)
        .await?;
    Ok(envelope("Verification finished", json!({
        "outcome": format!("{outcome:?}"),
    })))
}

#[derive(Deserialize)]
struct VerifyMultipleBody {
    transaction_ids: Vec<i64>,
}

async fn verify_multiple(
    State(ctx): State<Ctx>,
    Json(body): Json<VerifyMultipleBody>,
) -> Result<Json<Value>, ApiError> {
    let ids = body
        .transaction_ids
        .into_iter()
        .map(TxnId)
        .collect::<Vec<_>>();
    let results = ctx.reconciler.verify_multiple(&ids).await;
    let report = results
        .into_iter()
        .map(|(id, result)| match result {
            Ok(outcome) => json!({
                "transactionId": id,
                "outcome": format!("{outcome:?}"),
            }),
            Err(err) => json!({
                "transactionId": id,
                "error": err.to_string(),
            }),
        })
        .collect::<Vec<_>>();
    Ok(envelope("Verification batch finished", json!(report)))
}

async fn remove_waitlist_entry(
    State(ctx): State<Ctx>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    ctx.admin.remove_waitlist_entry(WaitlistEntryId(id)).await?;
    Ok(envelope("Waitlist entry removed", Value::Null))
}

#[derive(Deserialize)]
struct LoadLicensesBody {
    licenses: Vec<LicenseBody>,
}

#[derive(Deserialize)]
struct LicenseBody {
    license_key: String,
    #[serde(default)]
    instructions: Option<String>,
}

async fn load_licenses(
    State(ctx): State<Ctx>,
    Path(product_ref): Path<String>,
    Json(body): Json<LoadLicensesBody>,
) -> Result<Json<Value>, ApiError> {
    let licenses = body
        .licenses
        .into_iter()
        .map(|license| NewLicense {
            license_key: license.license_key,
            instructions: license.instructions,
        })
        .collect::<Vec<_>>();
    let inserted =
        ctx.inventory.load_licenses(&product_ref, licenses).await?;
    Ok(envelope("Licenses loaded", json!({ "inserted": inserted })))
}
