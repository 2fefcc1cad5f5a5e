use std::sync::Arc;

use ingestion::{
    transport::{AttendanceRuntime, AuthPolicy, ServiceConfig},
    transport_axum::{PromotionSchedule, serve_http_with_axum},
};
use store::{DedupStore, FileWal, InMemoryStore, WalWritePolicy};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let config = ServiceConfig::from_env();
    init_tracing(config.log_json);

    let store: Arc<dyn DedupStore> = match config.wal_path.as_deref() {
        Some(wal_path) => {
            let wal = match FileWal::open_with_policy(
                wal_path,
                WalWritePolicy {
                    sync_every_records: config.wal_sync_every_records,
                },
            ) {
                Ok(wal) => wal,
                Err(err) => {
                    error!(wal_path = %wal_path.display(), error = %err, "failed opening WAL");
                    std::process::exit(1);
                }
            };
            let (store, load_stats) =
                match InMemoryStore::persistent(wal, config.checkpoint_policy.clone()) {
                    Ok(result) => result,
                    Err(err) => {
                        error!(
                            wal_path = %wal_path.display(),
                            error = %err,
                            "failed replaying WAL"
                        );
                        std::process::exit(1);
                    }
                };
            info!(
                branches_loaded = load_stats.branches_loaded,
                events_loaded = load_stats.events_loaded,
                queued_loaded = load_stats.queued_loaded,
                snapshot_records = load_stats.replay.snapshot_records,
                wal_delta_records = load_stats.replay.wal_records,
                sync_every_records = config.wal_sync_every_records,
                "startup replay complete"
            );
            Arc::new(store)
        }
        None => {
            warn!("PUNCHHUB_WAL_PATH not set; state is kept in memory only");
            Arc::new(InMemoryStore::new())
        }
    };

    let auth = AuthPolicy::from_csv(config.api_keys.as_deref());
    if auth.is_open() {
        warn!("PUNCHHUB_API_KEYS not set; trusted endpoints accept any caller");
    }
    let runtime = Arc::new(AttendanceRuntime::new(store).with_auth_policy(auth));
    let promotion = config.promotion_interval.map(|interval| PromotionSchedule {
        interval,
        max_rows: config.promotion_max_rows,
    });

    info!(
        bind_addr = %config.bind_addr,
        http_workers = config.http_workers,
        promotion_worker = promotion.is_some(),
        "starting punchhub ingestion"
    );
    if let Err(err) = serve_http_with_axum(
        runtime.clone(),
        &config.bind_addr,
        config.http_workers,
        promotion,
    ) {
        error!(error = %err, "ingestion transport failed");
        std::process::exit(1);
    }
    info!("ingestion transport stopped");
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
