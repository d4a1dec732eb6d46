use std::sync::Arc;

use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vault_storage::{SupabaseStore, VaultStore};

use heartbeat_worker::cleanup::CleanupSweeper;
use heartbeat_worker::config::Config;
use heartbeat_worker::crypto::ServerCrypto;
use heartbeat_worker::cycle::{CycleReport, HeartbeatCycle};
use heartbeat_worker::downgrade::DowngradeReverter;
use heartbeat_worker::email::{Mailer, ResendMailer};
use heartbeat_worker::executor::EntryExecutor;
use heartbeat_worker::lifecycle::LifecycleController;
use heartbeat_worker::notify::NotificationDispatcher;
use heartbeat_worker::push::{FcmClient, PushGateway};
use heartbeat_worker::retry::RetryClient;
use heartbeat_worker::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "refusing to start");
            std::process::exit(1);
        }
    };

    match run(config).await {
        Ok(report) => {
            info!(?report, "heartbeat run complete");
        }
        Err(e) => {
            error!(error = %e, "heartbeat run failed");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> anyhow::Result<CycleReport> {
    let store: Arc<dyn VaultStore> = Arc::new(SupabaseStore::new(
        &config.supabase_url,
        &config.supabase_service_role_key,
    )?);
    let retry = Arc::new(RetryClient::new());
    let mailer: Arc<dyn Mailer> = Arc::new(ResendMailer::new(
        retry.clone(),
        config.resend_api_key.clone(),
    ));
    let push: Option<Arc<dyn PushGateway>> = match config.firebase_service_account_json.as_deref() {
        Some(credential) => match FcmClient::from_service_account_json(retry.clone(), credential) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "push disabled: unusable service-account credential");
                None
            }
        },
        None => {
            info!("push disabled: no service-account credential");
            None
        }
    };
    let crypto = Arc::new(ServerCrypto::new(&config.server_secret));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        mailer.clone(),
        push,
        config.resend_from_email.clone(),
    ));
    let executor = EntryExecutor::new(
        store.clone(),
        mailer.clone(),
        dispatcher.clone(),
        crypto.clone(),
        config.resend_from_email.clone(),
        config.viewer_base_url.clone(),
    );
    let lifecycle = LifecycleController::new(store.clone());
    let downgrade = DowngradeReverter::new(
        store.clone(),
        mailer.clone(),
        config.resend_from_email.clone(),
    );
    let cleanup = CleanupSweeper::new(store.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; stopping between profiles");
                cancel.cancel();
            }
        });
    }

    let cycle = HeartbeatCycle::new(
        store,
        executor,
        lifecycle,
        dispatcher,
        downgrade,
        cleanup,
        crypto,
        cancel.clone(),
    );
    let report = Supervisor::new(cycle, cancel).run().await?;
    Ok(report)
}
