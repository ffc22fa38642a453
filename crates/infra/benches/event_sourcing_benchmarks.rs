use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{Value, json};

use covenant_agreements::commands::{CREATE, UPDATE_ATTRS};
use covenant_agreements::{Agreement, AgreementAttrs, AgreementKind, Term};
use covenant_core::{Aggregate, ExpectedVersion, StreamId};
use covenant_events::{Command, EventBus, InMemoryProcessedEvents};
use covenant_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use covenant_infra::projections::{self, AgreementAlerts, AgreementSearchIndex};
use covenant_infra::{AggregateRepository, CommandDispatcher, register_agreement_handlers};

fn attrs(name: &str) -> AgreementAttrs {
    AgreementAttrs {
        name: name.to_string(),
        counterparty: "Acme".to_string(),
        description: None,
        kind: AgreementKind::Licensing,
        execution_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        term: Term::years(3),
        auto_renew: true,
        outcome_notice: Some(Term::months(2)),
        expiration_alert_enabled: true,
        outcome_notice_alert_enabled: true,
    }
}

fn payload(name: &str) -> Value {
    let mut value = serde_json::to_value(attrs(name)).unwrap();
    value["user_id"] = json!("bench");
    value
}

/// Dispatcher wired the way a service would run it: both read models attached.
fn setup_dispatcher() -> CommandDispatcher {
    let store = Arc::new(InMemoryEventStore::new());
    let builder = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()));
    let bus = projections::register_read_models(
        builder,
        Arc::new(AgreementSearchIndex::new()),
        Arc::new(AgreementAlerts::new()),
    )
    .unwrap()
    .build();
    let repo = Arc::new(AggregateRepository::with_bus(store, Arc::new(bus)));
    let mut dispatcher = CommandDispatcher::new();
    register_agreement_handlers(&mut dispatcher, repo).unwrap();
    dispatcher
}

/// One created agreement followed by `updates` attribute changes.
fn history(updates: usize) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
    let mut agreement = Agreement::create(StreamId::new("A1").unwrap(), "bench", attrs("Rev 0"), now).unwrap();
    for n in 1..=updates {
        agreement.update_attrs(attrs(&format!("Rev {n}"))).unwrap();
    }
    let pending = agreement.uncommitted_events().iter().map(UncommittedEvent::from).collect();
    store
        .append(agreement.id(), "Agreement", ExpectedVersion::Exact(0), pending)
        .unwrap();
    store
}

fn bench_command_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_latency");
    group.sample_size(500);

    group.bench_function("create_fresh", |b| {
        let dispatcher = setup_dispatcher();
        b.iter(|| {
            let outcome = dispatcher.send(&Command::create(CREATE, payload("Bench"))).unwrap();
            black_box(outcome);
        });
    });

    for prior in [10usize, 100] {
        group.bench_with_input(BenchmarkId::new("update_with_history", prior), &prior, |b, &prior| {
            let dispatcher = setup_dispatcher();
            let id = StreamId::new("A1").unwrap();
            dispatcher.send(&Command::to(CREATE, id.clone(), payload("Rev 0"))).unwrap();
            for n in 1..=prior {
                dispatcher
                    .send(&Command::to(UPDATE_ATTRS, id.clone(), payload(&format!("Rev {n}"))))
                    .unwrap();
            }
            // Alternate names so every iteration raises an event.
            let mut flip = false;
            b.iter(|| {
                flip = !flip;
                let name = if flip { "Even" } else { "Odd" };
                let outcome = dispatcher.send(&Command::to(UPDATE_ATTRS, id.clone(), payload(name))).unwrap();
                black_box(outcome);
            });
        });
    }

    group.finish();
}

fn bench_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_throughput");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let store = InMemoryEventStore::new();
            let mut stream = 0u64;
            b.iter(|| {
                stream += 1;
                let id = StreamId::new(format!("S{stream}")).unwrap();
                let batch = (0..batch_size)
                    .map(|n| UncommittedEvent::new("bench.appended.v1", json!({ "n": n })))
                    .collect();
                black_box(store.append(&id, "Bench", ExpectedVersion::Exact(0), batch).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_replay");

    for events in [10usize, 100, 1_000] {
        let store = history(events - 1);
        let id = StreamId::new("A1").unwrap();
        group.throughput(Throughput::Elements(events as u64));
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, _| {
            b.iter(|| {
                let stream = store.read(&id).unwrap();
                let agreement = Agreement::rehydrate(id.clone(), &stream).unwrap();
                black_box(agreement.version());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_command_latency, bench_append_throughput, bench_replay);
criterion_main!(benches);
