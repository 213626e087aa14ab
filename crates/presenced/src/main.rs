use anyhow::{Context, Result};
use presence_core::{Clock, CooldownGate, EuclideanMatcher, SystemClock};
use presence_store::{AttendanceLedger, EnrollmentStore, SqliteEnrollmentStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod ingress;
mod photos;
mod pipeline;
mod roster;

use config::{BusKind, Config};
use pipeline::{Pipeline, PipelineSettings, WorkdayWindow};
use roster::Roster;

const PHOTO_PRUNE_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "presenced starting");

    let config = Config::load();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let offset = config.office_offset();

    let ledger = Arc::new(
        AttendanceLedger::open(&config.ledger_db_path, Arc::clone(&clock), offset)
            .with_context(|| format!("opening ledger at {}", config.ledger_db_path.display()))?,
    );

    // Models load here, before anything is exposed on the bus.
    let extractors = engine::load_extractors(
        config.extractor,
        &config.model_dir,
        config.embedding_dimension,
        config.engine_workers,
    )
    .with_context(|| format!("loading extractor from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(extractors).context("starting extraction engine")?;

    let store: Arc<dyn EnrollmentStore> = Arc::new(SqliteEnrollmentStore::new(&config.enrollment_db_path));
    let initial = match roster::load_roster(Arc::clone(&store), engine.model_version(), clock.as_ref()).await {
        Ok(roster) => {
            tracing::info!(
                embeddings = roster.entries.len(),
                identities = roster.identity_count(),
                "roster loaded"
            );
            roster
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config.enrollment_db_path.display(),
                "roster unavailable; starting empty"
            );
            Roster::empty(clock.now())
        }
    };
    let (roster_tx, roster_rx) = watch::channel(Arc::new(initial));
    let refresher = roster::spawn_refresher(
        store,
        engine.model_version().to_string(),
        Arc::clone(&clock),
        Duration::from_secs(config.roster_refresh_secs),
        roster_tx,
    );

    let settings = PipelineSettings {
        extract_timeout: Duration::from_secs(config.extract_timeout_secs),
        cooldown: CooldownGate::new(config.cooldown_secs),
        max_snapshot_bytes: config.max_snapshot_bytes,
        workday: config.enforce_workday.then_some(WorkdayWindow {
            start_hour: config.workday_start_hour,
            end_hour: config.workday_end_hour,
        }),
    };
    let mut pipeline = Pipeline::new(
        engine,
        Box::new(EuclideanMatcher),
        roster_rx,
        Arc::clone(&ledger),
        Arc::clone(&clock),
        settings,
    );

    let mut pruner = None;
    if let Some(dir) = &config.photo_dir {
        let archive = photos::PhotoArchive::new(dir, offset, config.photo_ttl_days);
        tracing::info!(dir = %archive.root().display(), ttl_days = config.photo_ttl_days, "debug photos enabled");
        pipeline = pipeline.with_photos(archive.clone());
        pruner = Some(spawn_photo_pruner(archive, Arc::clone(&clock)));
    }

    let service = dbus_interface::AttendanceService::new(Arc::new(pipeline), clock.now());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        name = dbus_interface::BUS_NAME,
        cooldown_secs = config.cooldown_secs,
        "presenced ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    refresher.abort();
    if let Some(pruner) = pruner {
        pruner.abort();
    }
    Ok(())
}

fn spawn_photo_pruner(archive: photos::PhotoArchive, clock: Arc<dyn Clock>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PHOTO_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let archive = archive.clone();
            let now = clock.now();
            match tokio::task::spawn_blocking(move || archive.prune(now)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => tracing::info!(removed, "expired debug photos pruned"),
                Ok(Err(e)) => tracing::warn!(error = %e, "debug photo prune failed"),
                Err(e) => tracing::warn!(error = %e, "debug photo prune task failed"),
            }
        }
    })
}
