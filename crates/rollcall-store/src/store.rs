use crate::entry::{LogQuery, RecognitionLogEntry};
use crate::error::StoreError;
use crate::maintenance::{self, MaintenanceReport, RetentionPolicy};
use crate::schema::{self, LogStats};
use chrono::Utc;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Upper bound on appends written in one transaction.
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Depth of the append queue; appends beyond it are dropped with a warning.
    pub channel_capacity: usize,
    pub retention: RetentionPolicy,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            retention: RetentionPolicy::default(),
        }
    }
}

enum Command {
    Append(Box<RecognitionLogEntry>),
    Flush(oneshot::Sender<()>),
    Maintain(oneshot::Sender<Result<MaintenanceReport, StoreError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Clone-safe handle to the audit log.
///
/// Writes go through a background task that owns the ordering of appends,
/// flush barriers and maintenance. Reads go straight to the connection.
#[derive(Clone)]
pub struct RecognitionLogStore {
    tx: mpsc::Sender<Command>,
    conn: tokio_rusqlite::Connection,
}

impl RecognitionLogStore {
    /// Open (or create) the log database at `path` and start the writer task.
    pub async fn open(path: impl AsRef<Path>, config: LogStoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "recognition log opened");
        Self::start(conn, config).await
    }

    /// Volatile store backed by an in-memory database.
    pub async fn open_in_memory(config: LogStoreConfig) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::start(conn, config).await
    }

    async fn start(
        conn: tokio_rusqlite::Connection,
        config: LogStoreConfig,
    ) -> Result<Self, StoreError> {
        conn.call(|c| Ok(schema::init(c)?)).await?;

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        tokio::spawn(writer_loop(conn.clone(), rx, config.retention));
        Ok(Self { tx, conn })
    }

    /// Queue `entry` for writing. Never blocks; a full or closed queue drops
    /// the entry and logs a warning.
    pub fn append(&self, entry: RecognitionLogEntry) {
        let kind = entry.kind;
        match self.tx.try_send(Command::Append(Box::new(entry))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%kind, "recognition log queue full; dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(%kind, "recognition log writer stopped; dropping entry");
            }
        }
    }

    /// Entries matching `query`, newest first.
    pub async fn query(&self, query: LogQuery) -> Result<Vec<RecognitionLogEntry>, StoreError> {
        let rows = self.conn.call(move |c| Ok(schema::query(c, &query)?)).await?;
        Ok(rows)
    }

    pub async fn stats(&self) -> Result<LogStats, StoreError> {
        Ok(self.conn.call(|c| Ok(schema::stats(c)?)).await?)
    }

    /// Wait until every append queued before this call has been written.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        done.await.map_err(|_| StoreError::WriterClosed)
    }

    /// Run a maintenance pass now, after all queued appends.
    pub async fn maintain_now(&self) -> Result<MaintenanceReport, StoreError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Maintain(reply))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        done.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Drain queued appends and stop the writer. Later appends are dropped.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        done.await.map_err(|_| StoreError::WriterClosed)
    }
}

async fn writer_loop(
    conn: tokio_rusqlite::Connection,
    mut rx: mpsc::Receiver<Command>,
    retention: RetentionPolicy,
) {
    let mut ticker = (!retention.interval.is_zero()).then(|| {
        let first = Instant::now() + retention.interval;
        let mut t = tokio::time::interval_at(first, retention.interval);
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });
    tracing::debug!(interval = ?retention.interval, "recognition log writer started");

    let mut batch: Vec<RecognitionLogEntry> = Vec::new();
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Append(entry) => {
                        batch.push(*entry);
                        // Pull whatever else is already queued so bursts share a transaction.
                        while batch.len() < MAX_BATCH {
                            match rx.try_recv() {
                                Ok(Command::Append(next)) => batch.push(*next),
                                Ok(other) => {
                                    write_batch(&conn, &mut batch).await;
                                    if !handle_control(&conn, other, &retention).await {
                                        return;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        write_batch(&conn, &mut batch).await;
                    }
                    other => {
                        if !handle_control(&conn, other, &retention).await {
                            return;
                        }
                    }
                }
            }
            _ = next_tick(&mut ticker) => {
                if let Err(err) = maintain(&conn, &retention).await {
                    tracing::warn!(error = %err, "scheduled log maintenance failed");
                }
            }
        }
    }
    tracing::debug!("recognition log writer exiting");
}

/// Handle a non-append command. Returns false when the writer should stop.
async fn handle_control(
    conn: &tokio_rusqlite::Connection,
    cmd: Command,
    retention: &RetentionPolicy,
) -> bool {
    match cmd {
        Command::Append(entry) => {
            let mut batch = vec![*entry];
            write_batch(conn, &mut batch).await;
        }
        Command::Flush(reply) => {
            let _ = reply.send(());
        }
        Command::Maintain(reply) => {
            let _ = reply.send(maintain(conn, retention).await);
        }
        Command::Shutdown(reply) => {
            tracing::info!("recognition log writer shutting down");
            let _ = reply.send(());
            return false;
        }
    }
    true
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_batch(conn: &tokio_rusqlite::Connection, batch: &mut Vec<RecognitionLogEntry>) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    let count = entries.len();
    let result = conn
        .call(move |c| {
            let tx = c.transaction()?;
            for entry in &entries {
                schema::insert(&tx, entry)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, count, "failed to write recognition log entries");
    }
}

async fn maintain(
    conn: &tokio_rusqlite::Connection,
    retention: &RetentionPolicy,
) -> Result<MaintenanceReport, StoreError> {
    let policy = retention.clone();
    let report = conn
        .call(move |c| Ok(maintenance::run(c, &policy, Utc::now())?))
        .await?;
    if report.evicted() > 0 {
        tracing::info!(
            by_age = report.evicted_by_age,
            by_count = report.evicted_by_count,
            by_size = report.evicted_by_size,
            remaining = report.remaining_entries,
            bytes = report.remaining_bytes,
            "recognition log maintenance evicted entries"
        );
    }
    Ok(report)
}
