use anyhow::{Context, Result};
use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::protocol::{Segment, SegmentStatus, Session};

/// Durable record store for segments and sessions.
///
/// The orchestrator is the only writer of segment records after hand-off;
/// deletion is deliberately absent — that belongs to the owning application.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Persist (insert or update) a segment record.
    async fn put_segment(&self, segment: &Segment) -> Result<()>;

    /// Fetch a segment by id.
    async fn get_segment(&self, id: Uuid) -> Result<Option<Segment>>;

    /// All segments currently in the given status.
    async fn segments_with_status(&self, status: SegmentStatus) -> Result<Vec<Segment>>;

    /// All segments in `Pending`, ordered by `(created_at, index)`.
    async fn pending_segments(&self) -> Result<Vec<Segment>> {
        let mut segments = self.segments_with_status(SegmentStatus::Pending).await?;
        segments.sort_by(|a, b| (a.created_at, a.index).cmp(&(b.created_at, b.index)));
        Ok(segments)
    }

    /// Persist (insert or update) a session record.
    async fn put_session(&self, session: &Session) -> Result<()>;

    /// Fetch a session by id.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;
}

/// Sled-backed store: one tree per record type, MessagePack values, UUID
/// bytes as keys.
#[derive(Clone)]
pub struct SledSegmentStore {
    db: Db,
    segments: Tree,
    sessions: Tree,
}

impl SledSegmentStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(&path).with_context(|| {
            format!("Failed to open Sled database at {}", path.as_ref().display())
        })?;

        let segments = db.open_tree("segments").context("Failed to open segments tree")?;
        let sessions = db.open_tree("sessions").context("Failed to open sessions tree")?;

        info!("Initialized SledSegmentStore at {}", path.as_ref().display());

        Ok(Self {
            db,
            segments,
            sessions,
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn new_temp() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to create temporary Sled database")?;

        let segments = db.open_tree("segments").context("Failed to open segments tree")?;
        let sessions = db.open_tree("sessions").context("Failed to open sessions tree")?;

        Ok(Self {
            db,
            segments,
            sessions,
        })
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .context("Failed to flush database")?;
        Ok(())
    }

    /// Number of segment records.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[async_trait]
impl SegmentStore for SledSegmentStore {
    async fn put_segment(&self, segment: &Segment) -> Result<()> {
        let data = segment.to_bytes().context("Failed to serialize segment")?;
        self.segments
            .insert(segment.id.as_bytes(), data)
            .with_context(|| format!("Failed to persist segment {}", segment.id))?;
        Ok(())
    }

    async fn get_segment(&self, id: Uuid) -> Result<Option<Segment>> {
        match self.segments.get(id.as_bytes())? {
            Some(data) => {
                let segment =
                    Segment::from_bytes(&data).context("Failed to deserialize segment")?;
                Ok(Some(segment))
            }
            None => Ok(None),
        }
    }

    async fn segments_with_status(&self, status: SegmentStatus) -> Result<Vec<Segment>> {
        // Linear scan: the working set is one recorder's worth of segments,
        // and status is too volatile to be worth a secondary index.
        let mut result = Vec::new();
        for entry in self.segments.iter() {
            let (_, data) = entry?;
            let segment = Segment::from_bytes(&data).context("Failed to deserialize segment")?;
            if segment.status == status {
                result.push(segment);
            }
        }
        Ok(result)
    }

    async fn put_session(&self, session: &Session) -> Result<()> {
        let data = session.to_bytes().context("Failed to serialize session")?;
        self.sessions
            .insert(session.id.as_bytes(), data)
            .with_context(|| format!("Failed to persist session {}", session.id))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        match self.sessions.get(id.as_bytes())? {
            Some(data) => {
                let session =
                    Session::from_bytes(&data).context("Failed to deserialize session")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn segment_for(session_id: Uuid, index: u32) -> Segment {
        Segment::new(
            session_id,
            index,
            Duration::from_secs(30 * index as u64),
            Duration::from_secs(30),
            PathBuf::from(format!("/tmp/audio/{:03}.wav", index)),
        )
    }

    #[tokio::test]
    async fn test_put_and_get_segment() {
        let store = SledSegmentStore::new_temp().unwrap();
        let segment = segment_for(Uuid::new_v4(), 0);

        store.put_segment(&segment).await.unwrap();
        let loaded = store.get_segment(segment.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, segment.id);
        assert_eq!(loaded.index, segment.index);
        assert_eq!(loaded.status, SegmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_overwrites() {
        let store = SledSegmentStore::new_temp().unwrap();
        let mut segment = segment_for(Uuid::new_v4(), 1);
        store.put_segment(&segment).await.unwrap();

        segment.status = SegmentStatus::Transcribed;
        segment.transcript = Some("hello world".to_string());
        store.put_segment(&segment).await.unwrap();

        let loaded = store.get_segment(segment.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SegmentStatus::Transcribed);
        assert_eq!(loaded.transcript.as_deref(), Some("hello world"));
        assert_eq!(store.segment_count(), 1);
    }

    #[tokio::test]
    async fn test_status_scan() {
        let store = SledSegmentStore::new_temp().unwrap();
        let session_id = Uuid::new_v4();

        for i in 0..4 {
            let mut segment = segment_for(session_id, i);
            if i % 2 == 0 {
                segment.status = SegmentStatus::Transcribed;
            }
            store.put_segment(&segment).await.unwrap();
        }

        let pending = store
            .segments_with_status(SegmentStatus::Pending)
            .await
            .unwrap();
        let done = store
            .segments_with_status(SegmentStatus::Transcribed)
            .await
            .unwrap();

        assert_eq!(pending.len(), 2);
        assert_eq!(done.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_order() {
        let store = SledSegmentStore::new_temp().unwrap();
        let session_id = Uuid::new_v4();

        // Insert out of order; pending_segments must come back sorted.
        for i in [2u32, 0, 3, 1] {
            store.put_segment(&segment_for(session_id, i)).await.unwrap();
        }

        let pending = store.pending_segments().await.unwrap();
        assert_eq!(pending.len(), 4);
        // Totally ordered by (created_at, index); index breaks ties when
        // segments were created within the same instant.
        for pair in pending.windows(2) {
            assert!((pair[0].created_at, pair[0].index) <= (pair[1].created_at, pair[1].index));
        }
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store_path = temp_dir.path().join("segments-db");

        let segment = segment_for(Uuid::new_v4(), 7);

        {
            let store = SledSegmentStore::new(&store_path).unwrap();
            store.put_segment(&segment).await.unwrap();
            store.flush().await.unwrap();
        }

        {
            let store = SledSegmentStore::new(&store_path).unwrap();
            let loaded = store.get_segment(segment.id).await.unwrap().unwrap();
            assert_eq!(loaded.index, 7);
        }
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = SledSegmentStore::new_temp().unwrap();
        let session = Session::new("Weekly sync");

        store.put_session(&session).await.unwrap();
        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Weekly sync");

        assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }
}
