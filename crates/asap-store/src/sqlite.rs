//! SQLite implementation of the store traits.
//!
//! This is the durable storage backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use asap_core::{ChannelMeta, EngineState, Era, Format, Hop, PeerId};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{ChunkInfo, ChunkKey, ChunkStore, Origin, StateStore};

/// SQLite-based chunk and engine-state store.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteChunkStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChunkStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Column values identifying one chunk.
struct KeyColumns {
    origin: String,
    uri: String,
    era: i64,
}

impl KeyColumns {
    fn of(key: &ChunkKey) -> Self {
        Self {
            origin: origin_column(&key.origin),
            uri: key.uri.clone(),
            era: key.era.value() as i64,
        }
    }
}

fn origin_column(origin: &Origin) -> String {
    match origin {
        Origin::Local => String::new(),
        Origin::Received(peer) => peer.as_str().to_string(),
    }
}

fn origin_from_column(value: &str) -> Result<Origin> {
    if value.is_empty() {
        Ok(Origin::Local)
    } else {
        PeerId::new(value)
            .map(Origin::Received)
            .map_err(|e| StoreError::InvalidData(e.to_string()))
    }
}

fn era_from_column(value: i64) -> Result<Era> {
    u32::try_from(value)
        .map(Era)
        .map_err(|_| StoreError::InvalidData(format!("era out of range: {}", value)))
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Create the chunk row with default metadata if it is missing.
fn ensure_chunk(conn: &Connection, cols: &KeyColumns) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO chunks (origin, uri, era, meta, hops) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cols.origin,
            cols.uri,
            cols.era,
            to_cbor(&ChannelMeta::default())?,
            to_cbor(&Vec::<Hop>::new())?,
        ],
    )?;
    Ok(())
}

fn load_chunk(conn: &Connection, key: &ChunkKey) -> Result<Option<ChunkInfo>> {
    let cols = KeyColumns::of(key);
    let row: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT meta, hops FROM chunks WHERE origin = ?1 AND uri = ?2 AND era = ?3",
            params![cols.origin, cols.uri, cols.era],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((meta, hops)) = row else {
        return Ok(None);
    };

    let message_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE origin = ?1 AND uri = ?2 AND era = ?3",
        params![cols.origin, cols.uri, cols.era],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT peer FROM deliveries WHERE origin = ?1 AND uri = ?2 AND era = ?3",
    )?;
    let peers = stmt
        .query_map(params![cols.origin, cols.uri, cols.era], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut delivered_to = BTreeSet::new();
    for peer in peers {
        delivered_to.insert(PeerId::new(peer).map_err(|e| StoreError::InvalidData(e.to_string()))?);
    }

    Ok(Some(ChunkInfo {
        key: key.clone(),
        meta: from_cbor(&meta)?,
        message_count: message_count as usize,
        delivered_to,
        hops: from_cbor(&hops)?,
    }))
}

/// Delete chunk rows matching `filter` (a SQL condition over origin/uri/era
/// with positional parameters) from every chunk table.
fn delete_where(conn: &mut Connection, filter: &str, values: &[&dyn rusqlite::ToSql]) -> Result<()> {
    let tx = conn.transaction()?;
    for table in ["messages", "deliveries", "chunks"] {
        tx.execute(&format!("DELETE FROM {} WHERE {}", table, filter), values)?;
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn get_or_create(&self, key: &ChunkKey) -> Result<ChunkInfo> {
        let key = key.clone();
        self.blocking(move |conn| {
            ensure_chunk(conn, &KeyColumns::of(&key))?;
            load_chunk(conn, &key)?
                .ok_or_else(|| StoreError::InvalidData("chunk vanished after insert".into()))
        })
        .await
    }

    async fn get(&self, key: &ChunkKey) -> Result<Option<ChunkInfo>> {
        let key = key.clone();
        self.blocking(move |conn| load_chunk(conn, &key)).await
    }

    async fn exists(&self, key: &ChunkKey) -> Result<bool> {
        let cols = KeyColumns::of(key);
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chunks WHERE origin = ?1 AND uri = ?2 AND era = ?3",
                    params![cols.origin, cols.uri, cols.era],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn list(&self, origin: &Origin, era: Era) -> Result<Vec<ChunkInfo>> {
        let origin = origin.clone();
        self.blocking(move |conn| {
            let uris = {
                let mut stmt = conn.prepare(
                    "SELECT uri FROM chunks WHERE origin = ?1 AND era = ?2 ORDER BY uri",
                )?;
                let rows = stmt
                    .query_map(params![origin_column(&origin), era.value() as i64], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut chunks = Vec::with_capacity(uris.len());
            for uri in uris {
                let key = ChunkKey::new(origin.clone(), uri, era);
                if let Some(chunk) = load_chunk(conn, &key)? {
                    chunks.push(chunk);
                }
            }
            Ok(chunks)
        })
        .await
    }

    async fn eras(&self, origin: &Origin) -> Result<Vec<Era>> {
        let origin = origin_column(origin);
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT era FROM chunks WHERE origin = ?1 ORDER BY era")?;
            let values = stmt
                .query_map(params![origin], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            values.into_iter().map(era_from_column).collect()
        })
        .await
    }

    async fn origins(&self) -> Result<Vec<PeerId>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT origin FROM chunks WHERE origin != '' ORDER BY origin",
            )?;
            let values = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut peers = Vec::with_capacity(values.len());
            for value in values {
                if let Origin::Received(peer) = origin_from_column(&value)? {
                    peers.push(peer);
                }
            }
            Ok(peers)
        })
        .await
    }

    async fn channel_known(&self, uri: &str) -> Result<bool> {
        let uri = uri.to_string();
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chunks WHERE uri = ?1 LIMIT 1",
                    params![uri],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn drop_era(&self, origin: &Origin, era: Era) -> Result<()> {
        let origin = origin_column(origin);
        let era = era.value() as i64;
        self.blocking(move |conn| {
            delete_where(conn, "origin = ?1 AND era = ?2", params![origin, era])
        })
        .await
    }

    async fn remove_channel(&self, origin: &Origin, uri: &str) -> Result<()> {
        let origin = origin_column(origin);
        let uri = uri.to_string();
        self.blocking(move |conn| {
            delete_where(conn, "origin = ?1 AND uri = ?2", params![origin, uri])
        })
        .await
    }

    async fn remove_chunk(&self, key: &ChunkKey) -> Result<()> {
        let cols = KeyColumns::of(key);
        self.blocking(move |conn| {
            delete_where(
                conn,
                "origin = ?1 AND uri = ?2 AND era = ?3",
                params![cols.origin, cols.uri, cols.era],
            )
        })
        .await
    }

    async fn append_message(&self, key: &ChunkKey, message: &[u8]) -> Result<()> {
        let cols = KeyColumns::of(key);
        let body = message.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            ensure_chunk(&tx, &cols)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq) + 1, 0) FROM messages
                 WHERE origin = ?1 AND uri = ?2 AND era = ?3",
                params![cols.origin, cols.uri, cols.era],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (origin, uri, era, seq, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![cols.origin, cols.uri, cols.era, seq, body],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn messages(&self, key: &ChunkKey) -> Result<Vec<Bytes>> {
        let cols = KeyColumns::of(key);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM messages WHERE origin = ?1 AND uri = ?2 AND era = ?3
                 ORDER BY seq",
            )?;
            let bodies = stmt
                .query_map(params![cols.origin, cols.uri, cols.era], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(bodies.into_iter().map(Bytes::from).collect())
        })
        .await
    }

    async fn set_meta(&self, key: &ChunkKey, meta: &ChannelMeta) -> Result<()> {
        let cols = KeyColumns::of(key);
        let meta = to_cbor(meta)?;
        self.blocking(move |conn| {
            ensure_chunk(conn, &cols)?;
            conn.execute(
                "UPDATE chunks SET meta = ?4 WHERE origin = ?1 AND uri = ?2 AND era = ?3",
                params![cols.origin, cols.uri, cols.era, meta],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_hops(&self, key: &ChunkKey, hops: &[Hop]) -> Result<()> {
        let cols = KeyColumns::of(key);
        let hops = to_cbor(&hops.to_vec())?;
        self.blocking(move |conn| {
            ensure_chunk(conn, &cols)?;
            conn.execute(
                "UPDATE chunks SET hops = ?4 WHERE origin = ?1 AND uri = ?2 AND era = ?3",
                params![cols.origin, cols.uri, cols.era, hops],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_delivered(&self, key: &ChunkKey, peer: &PeerId) -> Result<()> {
        let cols = KeyColumns::of(key);
        let peer = peer.as_str().to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO deliveries (origin, uri, era, peer)
                 SELECT origin, uri, era, ?4 FROM chunks
                 WHERE origin = ?1 AND uri = ?2 AND era = ?3",
                params![cols.origin, cols.uri, cols.era, peer],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StateStore for SqliteChunkStore {
    async fn load(&self, format: &Format) -> Result<Option<EngineState>> {
        let format = format.as_str().to_string();
        self.blocking(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT state FROM engine_state WHERE format = ?1",
                    params![format],
                    |row| row.get(0),
                )
                .optional()?;
            blob.map(|bytes| from_cbor(&bytes)).transpose()
        })
        .await
    }

    async fn save(&self, state: &EngineState) -> Result<()> {
        let format = state.format.as_str().to_string();
        let blob = to_cbor(state)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO engine_state (format, state, updated_at) VALUES (?1, ?2, ?3)",
                params![format, blob, now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::Medium;
    use tempfile::TempDir;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn local(era: u32) -> ChunkKey {
        ChunkKey::new(Origin::Local, "sn://chan", Era(era))
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = SqliteChunkStore::open_memory().unwrap();
        store.append_message(&local(3), b"first").await.unwrap();
        store.append_message(&local(3), b"second").await.unwrap();

        let chunk = store.get(&local(3)).await.unwrap().unwrap();
        assert_eq!(chunk.message_count, 2);
        assert_eq!(
            store.messages(&local(3)).await.unwrap(),
            vec![Bytes::from("first"), Bytes::from("second")]
        );
    }

    #[tokio::test]
    async fn test_meta_hops_and_deliveries_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.db");
        let key = ChunkKey::new(Origin::Received(peer("alice")), "sn://chan", Era(u32::MAX));

        {
            let store = SqliteChunkStore::open(&path).unwrap();
            store
                .set_meta(&key, &ChannelMeta::closed([peer("carol")]).with_extra("k", "v"))
                .await
                .unwrap();
            store
                .set_hops(&key, &[Hop::new(peer("alice"), Medium::AdHoc, true, false)])
                .await
                .unwrap();
            store.append_message(&key, b"m").await.unwrap();
            store.mark_delivered(&key, &peer("carol")).await.unwrap();
        }

        let store = SqliteChunkStore::open(&path).unwrap();
        let chunk = store.get(&key).await.unwrap().unwrap();
        assert_eq!(chunk.meta.extra.get("k").map(String::as_str), Some("v"));
        assert_eq!(chunk.hops.len(), 1);
        assert!(chunk.fully_delivered());
        assert_eq!(store.eras(&key.origin).await.unwrap(), vec![Era::MAX]);
        assert_eq!(store.origins().await.unwrap(), vec![peer("alice")]);
    }

    #[tokio::test]
    async fn test_drop_era_removes_messages() {
        let store = SqliteChunkStore::open_memory().unwrap();
        store.append_message(&local(1), b"old").await.unwrap();
        store.append_message(&local(2), b"new").await.unwrap();

        store.drop_era(&Origin::Local, Era(1)).await.unwrap();

        assert!(!store.exists(&local(1)).await.unwrap());
        assert!(store.messages(&local(1)).await.unwrap().is_empty());
        assert_eq!(store.list(&Origin::Local, Era(2)).await.unwrap().len(), 1);
        assert!(store.channel_known("sn://chan").await.unwrap());
    }

    #[tokio::test]
    async fn test_engine_state_roundtrip() {
        let store = SqliteChunkStore::open_memory().unwrap();
        let format = Format::new("chat").unwrap();
        let mut state = EngineState::new(peer("alice"), format.clone());
        state.era = Era(9);
        state.last_seen.insert(peer("bob"), Era(8));

        store.save(&state).await.unwrap();
        assert_eq!(store.load(&format).await.unwrap(), Some(state));
    }
}
