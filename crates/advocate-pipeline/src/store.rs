//! Session persistence.
//!
//! The pipeline only ever writes sessions; nothing reads them back during a
//! run. Writes go through [`SessionWriter`], a background task that retries
//! failed writes and logs what it cannot save, so a broken store never delays
//! or fails the caller's result.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use advocate_types::{AdvocateError, Result, Session};

use crate::events::{EventEmitter, PipelineEvent};
use crate::retry::BackoffPolicy;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append a snapshot of `session`. Later snapshots supersede earlier ones.
    async fn persist(&self, session: &Session) -> Result<()>;
}

/// One JSON session snapshot per line, appended.
pub struct JsonlSessionStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every snapshot in the log, oldest first. For audit tooling and tests.
    pub async fn read_all(path: &Path) -> Result<Vec<Session>> {
        let data = tokio::fs::read_to_string(path).await?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(AdvocateError::from))
            .collect()
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn persist(&self, session: &Session) -> Result<()> {
        let mut line = serde_json::to_string(session)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps every persisted snapshot in memory.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Vec<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn persist(&self, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .map_err(|_| AdvocateError::PersistenceFailure("memory store poisoned".into()))?
            .push(session.clone());
        Ok(())
    }
}

enum WriteCommand {
    Persist(Box<Session>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background persistence task.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl SessionWriter {
    /// Start the writer. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        retries: usize,
        backoff: BackoffPolicy,
        events: EventEmitter,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriteCommand::Persist(session) => {
                        write_with_retry(store.as_ref(), &session, retries, &backoff, &events).await
                    }
                    WriteCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a snapshot and return immediately.
    pub fn enqueue(&self, session: Session) {
        let session_id = session.id;
        if self.tx.send(WriteCommand::Persist(Box::new(session))).is_err() {
            tracing::error!(%session_id, "Session writer stopped; snapshot dropped");
        }
    }

    /// Wait until every snapshot queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn write_with_retry(
    store: &dyn SessionStore,
    session: &Session,
    retries: usize,
    backoff: &BackoffPolicy,
    events: &EventEmitter,
) {
    let mut attempt = 0;
    loop {
        match store.persist(session).await {
            Ok(()) => {
                tracing::debug!(session_id = %session.id, turns = session.turns.len(), "Session persisted");
                events.emit(PipelineEvent::SessionPersisted {
                    session_id: session.id,
                    turns: session.turns.len(),
                });
                return;
            }
            Err(e) if attempt < retries => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!(session_id = %session.id, attempt, error = %e, "Session write failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                let err = AdvocateError::PersistenceFailure(e.to_string());
                tracing::error!(session_id = %session.id, error = %err, "Giving up on session write");
                events.emit(PipelineEvent::PersistenceFailed {
                    session_id: session.id,
                    error: err.to_string(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyStore {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        inner: MemorySessionStore,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn persist(&self, session: &Session) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AdvocateError::Other("disk hiccup".into()));
            }
            self.inner.persist(session).await
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            inner: MemorySessionStore::new(),
        })
    }

    #[tokio::test]
    async fn jsonl_appends_one_line_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("sessions.jsonl");
        let store = JsonlSessionStore::new(&path);

        let session = Session::new("Meat is natural", None);
        store.persist(&session).await.unwrap();
        store.persist(&session).await.unwrap();

        let read = JsonlSessionStore::read_all(&path).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], session);
    }

    #[tokio::test]
    async fn writer_retries_transient_failures() {
        let store = flaky(2);
        let writer = SessionWriter::spawn(store.clone(), 3, BackoffPolicy::None, EventEmitter::default());
        writer.enqueue(Session::new("x", None));
        writer.flush().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn writer_gives_up_and_reports() {
        let store = flaky(10);
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let writer = SessionWriter::spawn(store.clone(), 1, BackoffPolicy::None, events);

        writer.enqueue(Session::new("x", None));
        writer.flush().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(store.inner.snapshot().is_empty());
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::PersistenceFailed { .. }
        ));
    }
}
