//! Dependency wiring and the static task set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use keymint_common::config::Config;
use keymint_common::shutdown::ShutdownSignal;
use keymint_common::task::{NamedTask, join_all_with_shutdown};
use keymint_engine::adapters::AdapterRegistry;
use keymint_engine::adapters::cobre::CobreAdapter;
use keymint_engine::adapters::epayco::EpaycoAdapter;
use keymint_engine::adapters::mock::MockAdapter;
use keymint_engine::admin::Admin;
use keymint_engine::clients::cobre::CobreClient;
use keymint_engine::clients::epayco::EpaycoClient;
use keymint_engine::flow::Fulfillment;
use keymint_engine::ingress::WebhookIngress;
use keymint_engine::intake::Intake;
use keymint_engine::inventory::Inventory;
use keymint_engine::mailer::brevo::BrevoMailer;
use keymint_engine::mailer::{EmailQueue, EmailSender};
use keymint_engine::reconcile::Reconciler;
use keymint_engine::traits::ProviderApi;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::{self, AppCtx};

/// How long tasks have to wind down after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = keymint_db::connect(&config.db)
        .await
        .context("Database connection failed")?;

    let mailer = Arc::new(BrevoMailer::new(config.mailer.clone()));
    let sender = EmailSender::new(store.clone(), mailer);
    let email_queue = EmailQueue::new(config.email_queue.clone());
    let flow =
        Fulfillment::new(store.clone(), sender.clone(), email_queue.clone());

    let mut adapters = AdapterRegistry::new()
        .register(Arc::new(CobreAdapter::new(
            config.cobre.webhook_secret.clone(),
        )))
        .register(Arc::new(EpaycoAdapter::new(
            config.epayco.client_id.clone(),
            config.epayco.p_key.clone(),
        )));
    if config.mock_provider.enabled {
        info!("Mock payment provider enabled");
        adapters = adapters.register(Arc::new(MockAdapter::new(
            config.mock_provider.secret.clone(),
        )));
    }

    let cobre_client = Arc::new(CobreClient::new(config.cobre.clone()));
    let epayco_client = Arc::new(EpaycoClient::new(config.epayco.clone()));

    let ingress = WebhookIngress::new(adapters, flow.clone());
    let inventory =
        Inventory::new(store.clone(), sender.clone(), config.waitlist.clone());
    let reconciler = Reconciler::new(
        flow.clone(),
        vec![
            cobre_client.clone() as Arc<dyn ProviderApi>,
            epayco_client as Arc<dyn ProviderApi>,
        ],
        config.reconciler.clone(),
    );
    let intake = Intake::new(store.clone(), Some(cobre_client));
    let admin = Admin::new(
        store.clone(),
        sender.clone(),
        email_queue.clone(),
        inventory.clone(),
    );

    let ctx = Arc::new(AppCtx {
        ingress,
        intake,
        admin,
        reconciler: reconciler.clone(),
        inventory: inventory.clone(),
    });

    let shutdown = ShutdownSignal::new();
    spawn_signal_handler(shutdown.clone());

    let bind_addr =
        format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Could not bind {bind_addr}"))?;
    info!(%bind_addr, "keymint node listening");

    let tasks = vec![
        NamedTask::spawn(
            "http-server",
            serve(listener, ctx, shutdown.clone()),
        ),
        NamedTask::spawn(
            "email-queue",
            email_queue.run(sender, shutdown.clone()),
        ),
        NamedTask::spawn("waitlist-tick", inventory.run(shutdown.clone())),
        NamedTask::spawn(
            "reconciliation-sweep",
            reconciler.run(shutdown.clone()),
        ),
    ];

    join_all_with_shutdown(tasks, shutdown, SHUTDOWN_TIMEOUT).await;
    info!("keymint node stopped");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    ctx: Arc<AppCtx>,
    shutdown: ShutdownSignal,
) {
    let app = server::router(ctx);
    let graceful = async move { shutdown.recv().await };
    if let Err(err) =
        axum::serve(listener, app).with_graceful_shutdown(graceful).await
    {
        tracing::error!("HTTP server errored: {err}");
    }
}

fn spawn_signal_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
        }
        shutdown.trigger();
    });
}
