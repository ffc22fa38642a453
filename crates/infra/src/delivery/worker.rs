use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::DeliveryError;
use super::feed::EventFeed;
use crate::event_store::EventStore;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A pump already in progress finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "delivery worker panicked");
            }
        }
    }
}

/// Runs an [`EventFeed`] on a named background thread.
///
/// - Pumps once on start, then every `poll_interval`
/// - A subscriber failure stalls that subscriber's feed at the failing event;
///   the next tick retries it
/// - Several workers may follow the same store for one subscriber; idempotency
///   records keep the combined effect exactly-once per (event, subscriber)
#[derive(Debug)]
pub struct DeliveryWorker;

impl DeliveryWorker {
    pub fn spawn<S>(feed: EventFeed<S>, poll_interval: Duration) -> Result<WorkerHandle, DeliveryError>
    where
        S: EventStore + 'static,
    {
        let name = format!("delivery:{}", feed.subscriber());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(feed, shutdown_rx, poll_interval))
            .map_err(DeliveryError::Spawn)?;

        info!(worker = %name, ?poll_interval, "delivery worker started");
        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Spawn one worker per feed, typically from [`EventFeed::per_subscriber`].
    ///
    /// Workers already started are shut down if a later spawn fails.
    pub fn spawn_all<S>(feeds: Vec<EventFeed<S>>, poll_interval: Duration) -> Result<Vec<WorkerHandle>, DeliveryError>
    where
        S: EventStore + 'static,
    {
        let mut handles = Vec::with_capacity(feeds.len());
        for feed in feeds {
            match Self::spawn(feed, poll_interval) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    handles.into_iter().for_each(WorkerHandle::shutdown);
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }
}

fn worker_loop<S: EventStore>(feed: EventFeed<S>, shutdown_rx: mpsc::Receiver<()>, tick: Duration) {
    loop {
        match feed.pump() {
            Ok(report) if report.stalled => {
                warn!(subscriber = %feed.subscriber(), cursor = %report.cursor, "delivery stalled; retrying next tick");
            }
            Ok(_) => {}
            Err(err) => warn!(subscriber = %feed.subscriber(), error = %err, "delivery pump failed"),
        }

        match shutdown_rx.recv_timeout(tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }
}
