//! Polled Mailbox Transport
//!
//! Fallback transport backed by a SQLite file every context on the device
//! can open. Senders append rows; each subscriber polls for rows newer
//! than its cursor. Rows older than the retention window are pruned.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{MessageHandler, Transport, Unsubscribe};
use crate::error::{Error, Result};

struct MailboxSubscriber {
    id: u64,
    topic: String,
    cursor: i64,
    handler: MessageHandler,
}

/// SQLite-backed mailbox shared by all contexts on a device
pub struct PolledTransport {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file
    path: PathBuf,
    /// Identifies rows written through this handle
    origin: String,
    /// Local subscribers and their read cursors
    subscribers: Arc<StdMutex<Vec<MailboxSubscriber>>>,
    /// Highest sequence number seen, used as the cursor for new subscribers
    high_water: AtomicI64,
    next_id: AtomicU64,
    retention: Duration,
    online: AtomicBool,
    name: String,
}

impl PolledTransport {
    /// Create or open the mailbox database
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(2))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS coord_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                origin TEXT NOT NULL,
                payload BLOB NOT NULL,
                sent_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_coord_messages_topic
                ON coord_messages(topic, seq);

            CREATE TABLE IF NOT EXISTS coord_counters (
                key TEXT PRIMARY KEY,
                value_int INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        let high_water: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM coord_messages",
            [],
            |row| row.get(0),
        )?;

        let origin = uuid::Uuid::new_v4().to_string();
        let name = format!("mailbox:{}", path.display());
        tracing::debug!("Opened {} at sequence {}", name, high_water);

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            origin,
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            high_water: AtomicI64::new(high_water),
            next_id: AtomicU64::new(1),
            retention,
            online: AtomicBool::new(true),
            name,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Simulate the mailbox becoming unusable
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(format!("{} is offline", self.name)))
        }
    }

    /// Deliver rows written since each subscriber's cursor.
    /// Returns the number of frames handed to handlers.
    pub async fn poll_once(&self) -> Result<usize> {
        self.ensure_online()?;

        let (topics, floor) = {
            let subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            if subs.is_empty() {
                return Ok(0);
            }
            let mut topics: Vec<String> = subs.iter().map(|s| s.topic.clone()).collect();
            topics.sort();
            topics.dedup();
            let floor = subs.iter().map(|s| s.cursor).min().unwrap_or(0);
            (topics, floor)
        };

        let mut rows: Vec<(i64, String, String, Vec<u8>)> = Vec::new();
        {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT seq, topic, origin, payload FROM coord_messages WHERE seq > ?1 ORDER BY seq",
            )?;
            let found = stmt.query_map(params![floor], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            for row in found {
                let row = row?;
                if topics.contains(&row.1) {
                    rows.push(row);
                }
            }
        }

        let mut deliveries: Vec<(MessageHandler, Vec<u8>)> = Vec::new();
        {
            let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            for sub in subs.iter_mut() {
                for (seq, topic, origin, payload) in &rows {
                    if *seq <= sub.cursor || *topic != sub.topic {
                        continue;
                    }
                    sub.cursor = *seq;
                    if *origin != self.origin {
                        deliveries.push((Arc::clone(&sub.handler), payload.clone()));
                    }
                }
            }
        }

        if let Some((seq, ..)) = rows.last() {
            self.high_water.fetch_max(*seq, Ordering::SeqCst);
        }

        let delivered = deliveries.len();
        for (handler, frame) in deliveries {
            handler(frame);
        }
        Ok(delivered)
    }

    /// Delete rows older than the retention window
    pub async fn prune(&self) -> Result<u64> {
        self.ensure_online()?;
        let cutoff = chrono::Utc::now().timestamp_millis() - self.retention.as_millis() as i64;
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM coord_messages WHERE sent_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    }

    /// Number of rows currently stored
    pub async fn message_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM coord_messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Read-modify-write the probe counter, proving the file is writable
    async fn bump_probe_counter(&self) -> Result<i64> {
        self.ensure_online()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO coord_counters (key, value_int) VALUES ('probe', 1)
            ON CONFLICT(key) DO UPDATE SET value_int = value_int + 1, updated_at = CURRENT_TIMESTAMP
            "#,
            [],
        )?;
        let value: i64 = conn.query_row(
            "SELECT value_int FROM coord_counters WHERE key = 'probe'",
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Spawn the background poller; prunes about once per retention window
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mailbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let prune_every = (mailbox.retention.as_millis() / interval.as_millis().max(1)).max(1) as u64;
            let mut polls: u64 = 0;

            loop {
                ticker.tick().await;
                if let Err(e) = mailbox.poll_once().await {
                    tracing::debug!("Mailbox poll failed: {}", e);
                    continue;
                }
                polls += 1;
                if polls % prune_every == 0 {
                    match mailbox.prune().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("Pruned {} mailbox rows", n),
                        Err(e) => tracing::warn!("Mailbox prune failed: {}", e),
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl Transport for PolledTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, topic: &str, frame: Vec<u8>) -> Result<()> {
        self.ensure_online()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO coord_messages (topic, origin, payload, sent_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![topic, self.origin, frame, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Unsubscribe> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cursor = self.high_water.load(Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MailboxSubscriber {
                id,
                topic: topic.to_string(),
                cursor,
                handler,
            });

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Unsubscribe::new(move || {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| s.id != id);
        }))
    }

    async fn probe(&self) -> bool {
        match self.bump_probe_counter().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("{} probe failed: {}", self.name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collector() -> (MessageHandler, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |frame| sink.lock().unwrap().push(frame));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_mailbox_delivery_between_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailbox.db");
        let a = PolledTransport::open(&path, Duration::from_secs(60)).unwrap();
        let b = PolledTransport::open(&path, Duration::from_secs(60)).unwrap();

        let (ha, seen_a) = collector();
        let (hb, seen_b) = collector();
        a.subscribe("ns", ha).unwrap();
        b.subscribe("ns", hb).unwrap();

        a.send("ns", b"one".to_vec()).await.unwrap();
        a.send("other", b"ignored".to_vec()).await.unwrap();
        b.send("ns", b"two".to_vec()).await.unwrap();

        assert_eq!(a.poll_once().await.unwrap(), 1);
        assert_eq!(b.poll_once().await.unwrap(), 1);
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[b"two".to_vec()]);
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"one".to_vec()]);

        // Cursors advanced, nothing is delivered twice
        assert_eq!(a.poll_once().await.unwrap(), 0);
        assert_eq!(b.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_subscriber_skips_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailbox.db");
        let a = PolledTransport::open(&path, Duration::from_secs(60)).unwrap();
        a.send("ns", b"old".to_vec()).await.unwrap();

        let b = PolledTransport::open(&path, Duration::from_secs(60)).unwrap();
        let (hb, seen_b) = collector();
        b.subscribe("ns", hb).unwrap();
        assert_eq!(b.poll_once().await.unwrap(), 0);

        a.send("ns", b"new".to_vec()).await.unwrap();
        b.poll_once().await.unwrap();
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"new".to_vec()]);
    }

    #[tokio::test]
    async fn test_probe_and_offline() {
        let dir = tempdir().unwrap();
        let mailbox = PolledTransport::open(dir.path().join("m.db"), Duration::from_secs(60)).unwrap();
        assert!(mailbox.probe().await);
        assert_eq!(mailbox.bump_probe_counter().await.unwrap(), 2);

        mailbox.set_online(false);
        assert!(!mailbox.probe().await);
        assert!(mailbox.send("ns", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_and_unsubscribe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.db");
        let a = PolledTransport::open(&path, Duration::from_millis(0)).unwrap();
        let b = PolledTransport::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(a.path(), path.as_path());
        let (hb, seen_b) = collector();
        let unsubscribe = b.subscribe("ns", hb).unwrap();

        a.send("ns", vec![1]).await.unwrap();
        unsubscribe.unsubscribe();
        assert_eq!(b.poll_once().await.unwrap(), 0);
        assert!(seen_b.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(a.prune().await.unwrap(), 1);
        assert_eq!(a.message_count().await.unwrap(), 0);
    }
}
