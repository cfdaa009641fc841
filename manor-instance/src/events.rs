//! Append-only event log and state store
//!
//! Every state mutation in an instance arrives as a typed event. The log is
//! append-only and deduplicated by client id; handlers maintain derived
//! tables inside the same transaction that records the event, so the
//! visible `current_event_id` only ever advances over fully applied state.
//! Long-poll waiters ride a watch channel that broadcasts the id after each
//! commit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use manor_wire::PublishStatus;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};

use crate::dbproxy::DbProxy;
use crate::error::{Error, Result};

/// A handler applied to events of one type, inside the publish transaction.
///
/// Returns `true` when it changed derived state. Any error aborts the whole
/// transaction; the event is not recorded.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn apply(&self, db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool>;
}

/// Handlers installed at boot, keyed by event type. Multiple handlers per
/// type run in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// The per-instance event store.
pub struct EventStore {
    db: Arc<DbProxy>,
    registry: HandlerRegistry,
    current: watch::Sender<i64>,
    publish_lock: Mutex<()>,
    poll_timeout: Duration,
}

impl EventStore {
    /// Run migrations, load the committed event id, and wire the broadcast
    /// channel.
    pub async fn open(
        db: Arc<DbProxy>,
        registry: HandlerRegistry,
        poll_timeout: Duration,
    ) -> Result<Self> {
        migrate(db.connection()).await?;
        let current_id = load_current_event_id(db.connection()).await?;
        let (current, _) = watch::channel(current_id);
        Ok(Self {
            db,
            registry,
            current,
            publish_lock: Mutex::new(()),
            poll_timeout,
        })
    }

    /// The highest event id whose handlers have committed.
    pub fn status(&self) -> i64 {
        *self.current.borrow()
    }

    /// Record an event and apply its handlers transactionally.
    ///
    /// A `client_id` seen before answers with the original event id and a
    /// duplicate marker; nothing is re-applied.
    pub async fn publish(
        &self,
        client_id: &str,
        payload: JsonValue,
    ) -> Result<(PublishStatus, i64)> {
        if client_id.is_empty() {
            return Err(Error::InvalidRequest("client id is required".into()));
        }
        let event_type = manor_wire::api::event_type(&payload)
            .ok_or_else(|| Error::InvalidRequest("event type is required".into()))?
            .to_string();
        let payload_text = serde_json::to_string(&payload)
            .map_err(|e| Error::InvalidRequest(format!("unencodable payload: {}", e)))?;

        let _guard = self.publish_lock.lock().await;
        let tx_id = self.db.begin_host_tx().await?;

        let outcome = self
            .publish_in_tx(tx_id, client_id, &event_type, &payload_text, &payload)
            .await;

        match outcome {
            Ok((PublishStatus::Duplicate, id)) => {
                self.db.finish_host_tx(tx_id, false).await?;
                Ok((PublishStatus::Duplicate, id))
            }
            Ok((PublishStatus::Success, id)) => {
                self.db.finish_host_tx(tx_id, true).await?;
                // Waiters missed between commit and send recover on the next
                // event or their poll timeout.
                let _ = self.current.send(id);
                Ok((PublishStatus::Success, id))
            }
            Err(e) => {
                if let Err(rollback_err) = self.db.finish_host_tx(tx_id, false).await {
                    tracing::warn!("rollback after failed publish: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn publish_in_tx(
        &self,
        tx_id: u64,
        client_id: &str,
        event_type: &str,
        payload_text: &str,
        payload: &JsonValue,
    ) -> Result<(PublishStatus, i64)> {
        let existing = self
            .db
            .tx_query(
                tx_id,
                "SELECT id FROM event_v1 WHERE client_id = ?1",
                vec![libsql::Value::Text(client_id.to_string())],
            )
            .await?;
        if let Some(row) = existing.first() {
            if let Some(libsql::Value::Integer(id)) = row.first() {
                return Ok((PublishStatus::Duplicate, *id));
            }
        }

        let (id, _) = self
            .db
            .tx_execute(
                tx_id,
                "INSERT INTO event_v1 (client_id, event_type, event_data, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                vec![
                    libsql::Value::Text(client_id.to_string()),
                    libsql::Value::Text(event_type.to_string()),
                    libsql::Value::Text(payload_text.to_string()),
                    libsql::Value::Text(chrono::Utc::now().to_rfc3339()),
                ],
            )
            .await?;

        for handler in self.registry.handlers_for(event_type) {
            handler
                .apply(&self.db, tx_id, payload)
                .await
                .map_err(|e| Error::Internal(format!("event handler failed: {}", e)))?;
        }

        self.db
            .tx_execute(
                tx_id,
                "UPDATE event_state SET current_event_id = ?1 WHERE id = 0",
                vec![libsql::Value::Integer(id)],
            )
            .await?;

        Ok((PublishStatus::Success, id))
    }

    /// Wait until the committed event id reaches `requested`, or until the
    /// configured timeout. `None` means not modified.
    pub async fn poll(&self, requested: i64) -> Option<i64> {
        self.poll_with_timeout(requested, self.poll_timeout).await
    }

    /// Same as [`poll`](Self::poll) with an explicit deadline.
    pub async fn poll_with_timeout(&self, requested: i64, timeout: Duration) -> Option<i64> {
        let mut rx = self.current.subscribe();
        let awaited = tokio::time::timeout(timeout, rx.wait_for(|id| *id >= requested))
            .await
            .map(|r| r.map(|id| *id));
        match awaited {
            Ok(Ok(id)) => Some(id),
            Ok(Err(_)) => None,
            Err(_) => {
                let id = *rx.borrow();
                (id >= requested).then_some(id)
            }
        }
    }

    /// Fetch a stored event by id: `(event_type, payload_text)`.
    pub async fn get(&self, id: i64) -> Result<(String, String)> {
        let mut rows = self
            .db
            .connection()
            .query(
                "SELECT event_type, event_data FROM event_v1 WHERE id = ?1",
                vec![libsql::Value::Integer(id)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok((row.get::<String>(0)?, row.get::<String>(1)?)),
            None => Err(Error::NotFound(format!("no event with id {}", id))),
        }
    }
}

/// Create the event tables if absent.
pub async fn migrate(conn: &libsql::Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS event_v1 (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id TEXT NOT NULL UNIQUE,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        (),
    )
    .await?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS event_state (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            current_event_id INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await?;

    conn.execute(
        "INSERT OR IGNORE INTO event_state (id, current_event_id) VALUES (0, 0)",
        (),
    )
    .await?;

    Ok(())
}

async fn load_current_event_id(conn: &libsql::Connection) -> Result<i64> {
    let mut rows = conn
        .query(
            "SELECT current_event_id FROM event_state WHERE id = 0",
            (),
        )
        .await?;
    let committed = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };

    // Older databases may predate event_state; trust the log itself.
    let mut rows = conn
        .query("SELECT COALESCE(MAX(id), 0) FROM event_v1", ())
        .await?;
    let max_event = match rows.next().await? {
        Some(row) => row.get::<i64>(0)?,
        None => 0,
    };

    Ok(committed.max(max_event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_database, open_memory_database};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        tag: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn apply(&self, db: &DbProxy, tx_id: u64, payload: &JsonValue) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.tag);
            let name = payload
                .get("username")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            db.tx_execute(
                tx_id,
                "INSERT INTO names_v1 (name) VALUES (?1)",
                vec![libsql::Value::Text(name.to_string())],
            )
            .await?;
            Ok(true)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn apply(&self, _db: &DbProxy, _tx_id: u64, _payload: &JsonValue) -> Result<bool> {
            Err(Error::Internal("boom".into()))
        }
    }

    async fn store_with(
        db: Arc<DbProxy>,
        registry: HandlerRegistry,
    ) -> EventStore {
        db.connection()
            .execute(
                "CREATE TABLE IF NOT EXISTS names_v1 (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
                (),
            )
            .await
            .unwrap();
        EventStore::open(db, registry, Duration::from_secs(50))
            .await
            .unwrap()
    }

    async fn memory_store(registry: HandlerRegistry) -> (Arc<DbProxy>, EventStore) {
        let db = Arc::new(DbProxy::new(open_memory_database().await.unwrap()).unwrap());
        let store = store_with(db.clone(), registry).await;
        (db, store)
    }

    fn add_user(name: &str) -> JsonValue {
        serde_json::json!({"type": "ADD_USER", "username": name})
    }

    #[tokio::test]
    async fn publish_assigns_increasing_ids_and_advances_status() {
        let (_db, store) = memory_store(HandlerRegistry::new()).await;
        let (s1, id1) = store.publish("c1", add_user("alice")).await.unwrap();
        let (s2, id2) = store.publish("c2", add_user("bob")).await.unwrap();
        assert_eq!(s1, PublishStatus::Success);
        assert_eq!(s2, PublishStatus::Success);
        assert!(id1 < id2);
        assert_eq!(store.status(), id2);
    }

    #[tokio::test]
    async fn duplicate_client_id_returns_original_id_once_applied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "ADD_USER",
            Arc::new(RecordingHandler {
                tag: "a",
                order: order.clone(),
                calls: calls.clone(),
            }),
        );
        let (db, store) = memory_store(registry).await;

        let (_, id) = store.publish("c1", add_user("alice")).await.unwrap();
        let (status, dup_id) = store.publish("c1", add_user("alice")).await.unwrap();
        assert_eq!(status, PublishStatus::Duplicate);
        assert_eq!(dup_id, id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut rows = db
            .connection()
            .query("SELECT count(*) FROM names_v1", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "ADD_USER",
            Arc::new(RecordingHandler {
                tag: "a",
                order: order.clone(),
                calls: calls.clone(),
            }),
        );
        registry.register("ADD_USER", Arc::new(FailingHandler));
        let (db, store) = memory_store(registry).await;

        let err = store.publish("c1", add_user("alice")).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(store.status(), 0);

        let mut rows = db
            .connection()
            .query("SELECT count(*) FROM event_v1", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);

        let mut rows = db
            .connection()
            .query("SELECT count(*) FROM names_v1", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);

        // The store remains usable and the client id is free again.
        let (status, _) = store.publish("c1", add_user("alice")).await.unwrap();
        assert_eq!(status, PublishStatus::Success);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        for tag in ["first", "second", "third"] {
            registry.register(
                "ADD_USER",
                Arc::new(RecordingHandler {
                    tag,
                    order: order.clone(),
                    calls: calls.clone(),
                }),
            );
        }
        let (_db, store) = memory_store(registry).await;
        store.publish("c1", add_user("alice")).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn poll_wakes_on_publish_and_times_out_quietly() {
        let (_db, store) = memory_store(HandlerRegistry::new()).await;
        let store = Arc::new(store);

        assert_eq!(
            store
                .poll_with_timeout(1, Duration::from_millis(50))
                .await,
            None
        );

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.poll_with_timeout(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, id) = store.publish("c1", add_user("alice")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn get_round_trips_the_payload() {
        let (_db, store) = memory_store(HandlerRegistry::new()).await;
        let payload = add_user("alice");
        let (_, id) = store.publish("c1", payload.clone()).await.unwrap();
        let (event_type, text) = store.get(id).await.unwrap();
        assert_eq!(event_type, "ADD_USER");
        let stored: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(stored, payload);
    }

    #[tokio::test]
    async fn status_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        let last_id = {
            let db = Arc::new(
                DbProxy::new(open_database(&path, 1, 1).await.unwrap()).unwrap(),
            );
            let store = store_with(db, HandlerRegistry::new()).await;
            let mut last = 0;
            for i in 0..20 {
                let (_, id) = store
                    .publish(&format!("c{}", i), add_user(&format!("u{}", i)))
                    .await
                    .unwrap();
                last = id;
            }
            last
        };

        let db = Arc::new(DbProxy::new(open_database(&path, 1, 1).await.unwrap()).unwrap());
        let store = store_with(db, HandlerRegistry::new()).await;
        assert_eq!(store.status(), last_id);
    }

    #[tokio::test]
    async fn publish_rejects_missing_fields() {
        let (_db, store) = memory_store(HandlerRegistry::new()).await;
        let err = store.publish("", add_user("x")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = store
            .publish("c1", serde_json::json!({"username": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
