use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use skein_core::events::RunEvent;
use skein_core::ids::{ChannelId, RunId, SessionId};
use skein_store::connections::ConnectionRepo;
use skein_store::events::{EventRepo, EventRow};
use skein_store::Database;

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Global cap on live observer channels across all runs.
    pub max_channels: usize,
    /// Events returned per replay request.
    pub replay_batch: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_channels: 1024,
            replay_batch: 1000,
        }
    }
}

struct Observer {
    id: ChannelId,
    tx: mpsc::Sender<String>,
}

/// Fan-out point between the durable event log and live observers.
///
/// Delivery is durable-first: `publish` appends to the per-run log before
/// any push is attempted, so an observer that misses a push (full queue,
/// closed socket) recovers the exact same events through `replay`. Pushes
/// are never retried.
pub struct ChannelManager {
    events: EventRepo,
    connections: ConnectionRepo,
    observers: DashMap<String, Vec<Observer>>,
    live_count: AtomicUsize,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(db: Database, config: ChannelConfig) -> Self {
        Self {
            events: EventRepo::new(db.clone()),
            connections: ConnectionRepo::new(db),
            observers: DashMap::new(),
            live_count: AtomicUsize::new(0),
            config,
        }
    }

    /// Attach an observer channel to a run. Persists a connection row so the
    /// registration survives inspection and sweeping; the sender itself is
    /// process-local.
    #[instrument(skip(self, tx), fields(run_id = %run_id))]
    pub fn register(
        &self,
        run_id: &RunId,
        tx: mpsc::Sender<String>,
    ) -> Result<ChannelId, EngineError> {
        // Reserve the slot atomically so concurrent registers cannot both
        // slip under the cap.
        let reserved = self.live_count.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| (n < self.config.max_channels).then_some(n + 1),
        );
        if reserved.is_err() {
            return Err(EngineError::CapacityExceeded {
                limit: self.config.max_channels,
            });
        }

        let row = match self.connections.register(run_id) {
            Ok(row) => row,
            Err(e) => {
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.observers
            .entry(run_id.as_str().to_string())
            .or_default()
            .push(Observer {
                id: row.id.clone(),
                tx,
            });
        Ok(row.id)
    }

    #[instrument(skip(self), fields(run_id = %run_id, channel_id = %channel_id))]
    pub fn unregister(&self, run_id: &RunId, channel_id: &ChannelId) -> Result<(), EngineError> {
        if let Some(mut entry) = self.observers.get_mut(run_id.as_str()) {
            let before = entry.len();
            entry.retain(|o| o.id != *channel_id);
            let removed = before - entry.len();
            self.live_count.fetch_sub(removed, Ordering::SeqCst);
        }
        self.prune_entry(run_id.as_str());
        self.connections.remove(channel_id)?;
        Ok(())
    }

    /// Record the last sequence an observer has processed.
    pub fn ack(&self, channel_id: &ChannelId, sequence: i64) -> Result<(), EngineError> {
        self.connections.ack(channel_id, sequence)?;
        Ok(())
    }

    /// Append an event to the durable log, then push it best-effort to every
    /// live observer of the run.
    #[instrument(skip(self, event), fields(run_id = %run_id, event_type = event.event_type()))]
    pub fn publish(
        &self,
        run_id: &RunId,
        session_id: &SessionId,
        event: &RunEvent,
    ) -> Result<EventRow, EngineError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EngineError::Internal(format!("event serialization: {e}")))?;
        let row = self
            .events
            .append(run_id, session_id, event.event_type(), payload)?;

        self.forward(&row);
        Ok(row)
    }

    /// Push an already-appended event row to live observers. Used after
    /// transactional state-plus-events saves, where the append happened
    /// inside the store.
    pub fn forward(&self, row: &EventRow) {
        let message = match serde_json::to_string(&serde_json::json!({
            "method": "run.event",
            "params": row,
        })) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "failed to encode event for push");
                return;
            }
        };

        if let Some(mut entry) = self.observers.get_mut(row.run_id.as_str()) {
            let before = entry.len();
            entry.retain(|observer| match observer.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow observer: drop the push, keep the channel. It
                    // catches up via replay.
                    debug!(channel_id = %observer.id, sequence = row.sequence, "observer queue full, push dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            self.live_count.fetch_sub(before - entry.len(), Ordering::SeqCst);
        }
        self.prune_entry(row.run_id.as_str());
    }

    /// All events with `sequence > from_sequence`, in order, straight from
    /// the durable log. Reads the log in batches; the result is always the
    /// complete suffix, however long.
    #[instrument(skip(self), fields(run_id = %run_id, from_sequence))]
    pub fn replay(&self, run_id: &RunId, from_sequence: i64) -> Result<Vec<EventRow>, EngineError> {
        let mut out = Vec::new();
        let mut cursor = from_sequence;
        loop {
            let batch = self
                .events
                .list_after_sequence(run_id, cursor, self.config.replay_batch)?;
            let short = (batch.len() as u32) < self.config.replay_batch;
            if let Some(last) = batch.last() {
                cursor = last.sequence;
            }
            out.extend(batch);
            if short {
                return Ok(out);
            }
        }
    }

    /// Release process-local bookkeeping for a closed run: the append lock
    /// and, if no observers remain, the fan-out entry. Observers still
    /// attached keep working (replay of a finished run is normal).
    pub fn release_run(&self, run_id: &RunId) {
        self.events.forget_run(run_id);
        self.prune_entry(run_id.as_str());
    }

    fn prune_entry(&self, run_id: &str) {
        self.observers.remove_if(run_id, |_, observers| observers.is_empty());
    }

    /// Drop observers whose connection rows went stale. Returns the dropped
    /// channel ids.
    #[instrument(skip(self))]
    pub fn sweep_stale(&self, ttl_secs: i64) -> Result<Vec<ChannelId>, EngineError> {
        let stale = self.connections.remove_stale(ttl_secs)?;
        if stale.is_empty() {
            return Ok(stale);
        }

        for mut entry in self.observers.iter_mut() {
            let before = entry.len();
            entry.retain(|o| !stale.contains(&o.id));
            self.live_count.fetch_sub(before - entry.len(), Ordering::SeqCst);
        }
        self.observers.retain(|_, observers| !observers.is_empty());
        Ok(stale)
    }

    pub fn live_channels(&self) -> usize {
        self.live_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_store::runs::RunRepo;
    use skein_store::sessions::SessionRepo;

    fn setup() -> (Database, SessionId, RunId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("review", "test", None).unwrap();
        let run = RunRepo::new(db.clone()).create(&session.id, "review", None).unwrap();
        (db, session.id, run.id)
    }

    fn started(session_id: &SessionId, run_id: &RunId) -> RunEvent {
        RunEvent::RunStarted {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            mode: "review".into(),
        }
    }

    #[tokio::test]
    async fn publish_is_durable_without_observers() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let row = manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        assert_eq!(row.sequence, 0);

        let replayed = manager.replay(&run_id, -1).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_type, "run_started");
    }

    #[tokio::test]
    async fn registered_observer_receives_push() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        manager.register(&run_id, tx).unwrap();

        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();

        let message = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["method"], "run.event");
        assert_eq!(parsed["params"]["sequence"], 0);
        assert_eq!(parsed["params"]["event_type"], "run_started");
    }

    #[tokio::test]
    async fn full_observer_queue_does_not_fail_publish() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let (tx, mut rx) = mpsc::channel(1);
        manager.register(&run_id, tx).unwrap();

        // Second publish overflows the single-slot queue; publish still
        // succeeds and the event is in the log.
        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();

        assert_eq!(manager.replay(&run_id, -1).unwrap().len(), 2);

        // Observer drains its one push, then recovers the rest by replay.
        let first = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        let seen = parsed["params"]["sequence"].as_i64().unwrap();
        let missed = manager.replay(&run_id, seen).unwrap();
        assert_eq!(missed.len(), 1);
    }

    #[tokio::test]
    async fn closed_observer_is_dropped_on_publish() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let (tx, rx) = mpsc::channel(1);
        manager.register(&run_id, tx).unwrap();
        drop(rx);

        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        assert_eq!(manager.live_channels(), 0);
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let (db, _, run_id) = setup();
        let manager = ChannelManager::new(
            db,
            ChannelConfig {
                max_channels: 1,
                ..Default::default()
            },
        );

        let (tx_a, _rx_a) = mpsc::channel(1);
        manager.register(&run_id, tx_a).unwrap();

        let (tx_b, _rx_b) = mpsc::channel(1);
        let result = manager.register(&run_id, tx_b);
        assert!(matches!(result, Err(EngineError::CapacityExceeded { limit: 1 })));
    }

    #[tokio::test]
    async fn unregister_frees_capacity_and_stops_delivery() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        let channel_id = manager.register(&run_id, tx).unwrap();
        manager.unregister(&run_id, &channel_id).unwrap();
        assert_eq!(manager.live_channels(), 0);

        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_is_strict_suffix_of_log() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        for _ in 0..5 {
            manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        }

        let suffix = manager.replay(&run_id, 2).unwrap();
        assert_eq!(suffix.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn replay_spans_multiple_batches() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(
            db,
            ChannelConfig {
                replay_batch: 8,
                ..Default::default()
            },
        );

        for _ in 0..20 {
            manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        }

        // The full log comes back even though it is longer than one batch.
        let full = manager.replay(&run_id, -1).unwrap();
        assert_eq!(full.len(), 20);
        assert_eq!(
            full.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            (0..20).collect::<Vec<i64>>()
        );

        let suffix = manager.replay(&run_id, 4).unwrap();
        assert_eq!(suffix.len(), 15);
        assert_eq!(suffix[0].sequence, 5);
    }

    #[tokio::test]
    async fn empty_observer_entries_are_pruned() {
        let (db, sess_id, run_id) = setup();
        let manager = ChannelManager::new(db, ChannelConfig::default());

        let (tx, _rx) = mpsc::channel(16);
        let channel_id = manager.register(&run_id, tx).unwrap();
        assert_eq!(manager.observers.len(), 1);

        manager.unregister(&run_id, &channel_id).unwrap();
        assert!(manager.observers.is_empty());

        // A closed observer is dropped on publish and its entry goes with it.
        let (tx, rx) = mpsc::channel(1);
        manager.register(&run_id, tx).unwrap();
        drop(rx);
        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        assert!(manager.observers.is_empty());
    }

    #[tokio::test]
    async fn release_run_drops_bookkeeping_but_keeps_live_observers() {
        let (db, sess_id, run_id) = setup();
        let manager = Arc::new(ChannelManager::new(db, ChannelConfig::default()));

        let (tx, mut rx) = mpsc::channel(16);
        manager.register(&run_id, tx).unwrap();
        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();

        manager.release_run(&run_id);
        assert_eq!(manager.live_channels(), 1);

        // The attached observer keeps receiving.
        manager.publish(&run_id, &sess_id, &started(&sess_id, &run_id)).unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_registers_respect_cap() {
        let (db, _, run_id) = setup();
        let manager = Arc::new(ChannelManager::new(
            db,
            ChannelConfig {
                max_channels: 4,
                ..Default::default()
            },
        ));

        let mut handles = vec![];
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let run_id = run_id.clone();
            handles.push(std::thread::spawn(move || {
                // Keep the receiver alive so the channel stays open.
                let (tx, rx) = mpsc::channel(1);
                let ok = manager.register(&run_id, tx).is_ok();
                std::mem::forget(rx);
                ok
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 4);
        assert_eq!(manager.live_channels(), 4);
    }

    #[tokio::test]
    async fn ack_is_recorded() {
        let (db, _, run_id) = setup();
        let manager = ChannelManager::new(db.clone(), ChannelConfig::default());

        let (tx, _rx) = mpsc::channel(1);
        let channel_id = manager.register(&run_id, tx).unwrap();
        manager.ack(&channel_id, 7).unwrap();

        let row = ConnectionRepo::new(db).get(&channel_id).unwrap();
        assert_eq!(row.last_ack_sequence, 7);
    }
}
