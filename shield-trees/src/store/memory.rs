//! In-memory ordered store.

use std::collections::BTreeMap;
use std::convert::Infallible;

use futures::{Stream, StreamExt};
use tokio::sync::RwLock;

use super::{Database, KeyPath, WriteOp};

/// Ordered store holding every entry in memory, keyed by the encoded key bytes.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn decode_key(key: &[u8]) -> KeyPath {
    KeyPath::decode(key).expect("stored keys are encoded key paths")
}

impl Database for MemoryDatabase {
    type Error = Infallible;

    async fn get(&self, path: &KeyPath) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.entries.read().await.get(&path.encode()).cloned())
    }

    async fn put(&self, path: KeyPath, value: Vec<u8>) -> Result<(), Self::Error> {
        self.entries.write().await.insert(path.encode(), value);

        Ok(())
    }

    async fn del(&self, path: &KeyPath) -> Result<(), Self::Error> {
        self.entries.write().await.remove(&path.encode());

        Ok(())
    }

    async fn batch(&self, ops: Vec<WriteOp>) -> Result<(), Self::Error> {
        // a single write guard makes the batch atomic to every other reader
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                WriteOp::Put(path, value) => {
                    entries.insert(path.encode(), value);
                }
                WriteOp::Del(path) => {
                    entries.remove(&path.encode());
                }
            }
        }

        Ok(())
    }

    fn stream_range(
        &self,
        start: KeyPath,
        end: KeyPath,
    ) -> impl Stream<Item = Result<(KeyPath, Vec<u8>), Self::Error>> + Send {
        let start = start.encode();
        let end = end.encode();
        futures::stream::once(async move {
            if start >= end {
                return Vec::new();
            }
            self.entries
                .read()
                .await
                .range(start..end)
                .map(|(key, value)| Ok((decode_key(key), value.clone())))
                .collect::<Vec<_>>()
        })
        .flat_map(futures::stream::iter)
    }

    async fn count_namespace(&self, prefix: &KeyPath) -> Result<usize, Self::Error> {
        let prefix = prefix.encode();
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .count())
    }

    async fn clear_namespace(&self, prefix: &KeyPath) -> Result<(), Self::Error> {
        let prefix = prefix.encode();
        let mut entries = self.entries.write().await;
        let keys: Vec<Vec<u8>> = entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            entries.remove(&key);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn key(segments: &[u64]) -> KeyPath {
        segments
            .iter()
            .fold(KeyPath::new(Vec::new()), |path, segment| {
                path.join_number(*segment)
            })
    }

    #[tokio::test]
    async fn range_streams_in_numeric_order() {
        let db = MemoryDatabase::new();
        for index in [300u64, 2, 40, 1] {
            db.put(key(&[7, index]), vec![index as u8]).await.unwrap();
        }
        db.put(key(&[8, 0]), vec![0]).await.unwrap();

        let entries: Vec<_> = db
            .stream_range(key(&[7, 2]), key(&[7, 300]))
            .try_collect()
            .await
            .unwrap();
        let indices: Vec<u64> = entries
            .iter()
            .map(|(path, _)| path.last_number().unwrap())
            .collect();
        assert_eq!(indices, vec![2, 40]);

        let namespace: Vec<_> = db.stream_namespace(&key(&[7])).try_collect().await.unwrap();
        assert_eq!(namespace.len(), 4);
    }

    #[tokio::test]
    async fn namespaces_are_counted_and_cleared() {
        let db = MemoryDatabase::new();
        db.batch(vec![
            WriteOp::Put(key(&[1, 1]), vec![1]),
            WriteOp::Put(key(&[1, 2]), vec![2]),
            WriteOp::Put(key(&[2, 1]), vec![3]),
            WriteOp::Del(key(&[1, 2])),
        ])
        .await
        .unwrap();
        assert_eq!(db.count_namespace(&key(&[1])).await.unwrap(), 1);

        db.clear_namespace(&key(&[1])).await.unwrap();
        assert_eq!(db.count_namespace(&key(&[1])).await.unwrap(), 0);
        assert_eq!(db.get(&key(&[2, 1])).await.unwrap(), Some(vec![3]));
        assert_eq!(db.len().await, 1);
    }
}
