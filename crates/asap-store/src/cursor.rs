//! Lazy message sequences spanning several eras.

use bytes::Bytes;
use std::collections::VecDeque;

use asap_core::Era;

use crate::error::Result;
use crate::traits::{ChunkKey, ChunkStore, Origin};

/// Messages of one channel across an era range, loaded one chunk at a time.
///
/// Eras are visited in successor order starting at `from`, so a wrapped range
/// (`from > to`) yields the eras `>= from` before the eras `<= to`.
pub struct MessageCursor<'a, S: ChunkStore + ?Sized> {
    store: &'a S,
    origin: Origin,
    uri: String,
    from: Era,
    to: Era,
    /// Eras still to visit; `None` until the first call to `next`.
    pending: Option<VecDeque<Era>>,
    buffered: VecDeque<Bytes>,
}

impl<'a, S: ChunkStore + ?Sized> MessageCursor<'a, S> {
    pub(crate) fn new(store: &'a S, origin: Origin, uri: String, from: Era, to: Era) -> Self {
        Self {
            store,
            origin,
            uri,
            from,
            to,
            pending: None,
            buffered: VecDeque::new(),
        }
    }

    /// Next message, or `None` once the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some(message));
            }

            if self.pending.is_none() {
                let mut eras: Vec<Era> = self
                    .store
                    .eras(&self.origin)
                    .await?
                    .into_iter()
                    .filter(|era| era.is_within(self.from, self.to))
                    .collect();
                Era::sort_from(self.from, &mut eras);
                self.pending = Some(eras.into());
            }

            let Some(era) = self.pending.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };

            let key = ChunkKey::new(self.origin.clone(), self.uri.clone(), era);
            self.buffered = self.store.messages(&key).await?.into();
        }
    }

    /// Drain the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<Bytes>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await? {
            messages.push(message);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChunkStore;
    use crate::traits::ChunkStoreExt;

    async fn append(store: &MemoryChunkStore, era: u32, body: &str) {
        let key = ChunkKey::new(Origin::Local, "sn://chan", Era(era));
        store.append_message(&key, body.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_merges_contiguous_range() {
        let store = MemoryChunkStore::new();
        append(&store, 1, "a").await;
        append(&store, 2, "b").await;
        append(&store, 2, "c").await;
        append(&store, 5, "d").await;

        let messages = store
            .messages_for(&Origin::Local, "sn://chan", Era(1), Era(3))
            .collect()
            .await
            .unwrap();
        assert_eq!(messages, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_cursor_wrapped_range_in_successor_order() {
        let store = MemoryChunkStore::new();
        append(&store, 1, "after-wrap").await;
        append(&store, u32::MAX, "before-wrap").await;
        append(&store, 3, "outside").await;

        let messages = store
            .messages_for(&Origin::Local, "sn://chan", Era(u32::MAX - 1), Era(2))
            .collect()
            .await
            .unwrap();
        assert_eq!(
            messages,
            vec![Bytes::from("before-wrap"), Bytes::from("after-wrap")]
        );
    }

    #[tokio::test]
    async fn test_cursor_empty_range_is_not_an_error() {
        let store = MemoryChunkStore::new();
        let mut cursor = store.messages_for(&Origin::Local, "sn://nothing", Era(7), Era(9));
        assert!(cursor.next().await.unwrap().is_none());
    }
}
