//! Walks one agreement through create → update → alerts → delete, with both read
//! models attached and one background delivery worker per read model
//! following the log.
//!
//! Uses the in-memory backends unless built with `--features postgres` and
//! `DATABASE_URL` is set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{Days, Utc};
use serde_json::json;
use tracing::info;

use covenant_agreements::commands::{self, CREATE, DELETE, UPDATE_ATTRS};
use covenant_core::StreamId;
use covenant_events::{Command, EventBus, InMemoryProcessedEvents, ProcessedEvents};
use covenant_infra::delivery::{CursorStore, DeliveryWorker, EventFeed, InMemoryCursorStore, WorkerHandle};
use covenant_infra::event_store::{EventStore, InMemoryEventStore};
use covenant_infra::projections::{self, AgreementAlerts, AgreementSearchIndex};
use covenant_infra::{AggregateRepository, CommandDispatcher, RuntimeConfig, register_agreement_handlers};

fn main() -> anyhow::Result<()> {
    covenant_observability::init();
    let config = RuntimeConfig::from_env().context("invalid runtime configuration")?;

    #[cfg(feature = "postgres")]
    if let Some(url) = config.database_url.clone() {
        use covenant_infra::db::PgBackend;
        use covenant_infra::delivery::PostgresCursorStore;
        use covenant_infra::event_store::PostgresEventStore;
        use covenant_infra::idempotency::PostgresProcessedEvents;

        let db = PgBackend::connect(&url).context("connecting to postgres")?;
        db.ensure_schema().context("creating schema")?;
        return run(
            &config,
            PostgresEventStore::new(db.clone()),
            Arc::new(PostgresProcessedEvents::new(db.clone())),
            Arc::new(PostgresCursorStore::new(db)),
        );
    }

    if config.database_url.is_some() {
        info!("DATABASE_URL ignored: built without the postgres feature");
    }
    run(
        &config,
        InMemoryEventStore::new(),
        Arc::new(InMemoryProcessedEvents::new()),
        Arc::new(InMemoryCursorStore::new()),
    )
}

fn run<S>(
    config: &RuntimeConfig,
    store: S,
    processed: Arc<dyn ProcessedEvents>,
    cursors: Arc<dyn CursorStore>,
) -> anyhow::Result<()>
where
    S: EventStore + 'static,
{
    let store = Arc::new(store);
    let search = Arc::new(AgreementSearchIndex::new());
    let alerts = Arc::new(AgreementAlerts::new());
    let bus = Arc::new(
        projections::register_read_models(EventBus::builder(processed), search.clone(), alerts.clone())?.build(),
    );

    let repo = Arc::new(AggregateRepository::with_bus(store.clone(), bus.clone()));
    let mut dispatcher = CommandDispatcher::with_config(config.dispatcher());
    register_agreement_handlers(&mut dispatcher, repo)?;
    let dispatcher = Arc::new(dispatcher);

    let feeds = EventFeed::per_subscriber(store, bus, cursors, config.feed());
    let workers = DeliveryWorker::spawn_all(feeds, config.poll_interval)?;

    let today = Utc::now().date_naive();
    let execution_date = today
        .checked_sub_days(Days::new(300))
        .context("execution date out of range")?;
    let id = StreamId::generate();
    let attrs = json!({
        "name": "Master Services",
        "counterparty": "Acme Corp",
        "kind": "consulting",
        "execution_date": execution_date,
        "term": { "amount": 1, "unit": "year" },
        "outcome_notice": { "amount": 65, "unit": "day" },
        "expiration_alert_enabled": true,
        "outcome_notice_alert_enabled": true,
    });

    let mut create = attrs.clone();
    create["user_id"] = json!("demo-user");
    let send = |command: Command| match config.send_timeout {
        Some(timeout) => dispatcher.send_with_timeout(command, timeout),
        None => dispatcher.send(&command),
    };

    let created = send(Command::to(CREATE, id.clone(), create))?;
    info!(agreement = %created.aggregate_id, version = created.version, "agreement created");

    let mut renamed = attrs;
    renamed["name"] = json!("Master Services (2nd amendment)");
    let updated = send(Command::to(UPDATE_ATTRS, id.clone(), renamed))?;
    info!(version = updated.version, "agreement updated");

    let hits = search.search("acme");
    info!(hits = hits.len(), "search index query");
    if let Some(schedule) = alerts.schedule(&id) {
        info!(
            expiration = ?schedule.expiration_alert_date,
            outcome_notice = ?schedule.outcome_notice_alert_date,
            "alert schedule"
        );
    }

    for alert in alerts.due_by(today) {
        info!(kind = %alert.kind, date = %alert.date, name = %alert.name, "alert due");
        let command = Command::to(
            commands::mark_alert_sent(alert.kind),
            alert.agreement_id,
            json!({ "alert_date": alert.date }),
        );
        let marked = send(command)?;
        info!(version = marked.version, "alert marked sent");
    }
    if !alerts.due_by(today).is_empty() {
        bail!("alerts still due after marking them sent");
    }

    let deleted = send(Command::to(DELETE, id.clone(), json!({ "deleted_by": "demo-user" })))?;
    info!(version = deleted.version, "agreement deleted");
    if search.get(&id).is_some() {
        bail!("deleted agreement still searchable");
    }

    // One more tick so every worker has seen the whole log.
    std::thread::sleep(config.poll_interval + Duration::from_millis(50));
    workers.into_iter().for_each(WorkerHandle::shutdown);
    info!("demo finished");
    Ok(())
}
