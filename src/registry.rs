use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{StoreError, StreamError};
use crate::store::KvStore;
use crate::stream::EventStream;
use crate::types::{StreamId, StreamSpec};

fn stream_key(id: &StreamId) -> String {
    format!("streams/{}", id.0)
}

fn checkpoint_key(id: &StreamId) -> String {
    format!("checkpoints/{}", id.0)
}

/// Upstream progress pointer for one stream, advanced by the feeder as
/// completion hooks fire and persisted so a restart resumes from the last
/// delivered position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub stream_id: StreamId,
    pub block_number: u64,
    pub updated_at_secs: u64,
}

impl Checkpoint {
    pub fn new(stream_id: StreamId, block_number: u64) -> Self {
        Self {
            stream_id,
            block_number,
            updated_at_secs: now_secs(),
        }
    }
}

/// Create/lookup/delete façade over the running streams, persisting their
/// definitions through the KV collaborator.
///
/// Persistence is best-effort: a crash between accepting a stream and
/// persisting it may lose the definition, which the creating client covers
/// by retrying.
pub struct StreamRegistry {
    config: GatewayConfig,
    store: Arc<dyn KvStore>,
    streams: Mutex<HashMap<StreamId, Arc<EventStream>>>,
}

impl StreamRegistry {
    pub fn new(config: GatewayConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            store,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Validate, start, and persist a new stream. Assigns an id when the
    /// spec carries none. Returns the normalized spec.
    pub async fn add_stream(&self, mut spec: StreamSpec) -> Result<StreamSpec, StreamError> {
        if spec.id.0.is_empty() {
            spec.id = StreamId(Uuid::new_v4().to_string());
        }
        let stream = Arc::new(EventStream::new(spec, &self.config)?);
        let spec = stream.spec().clone();

        let encoded = serde_json::to_vec(&spec).map_err(StoreError::from)?;
        self.store.put(&stream_key(&spec.id), encoded).await?;
        self.streams.lock().await.insert(spec.id.clone(), stream);

        info!(stream = %spec.id.0, "stream registered");
        Ok(spec)
    }

    /// Look up a running stream.
    pub async fn stream(&self, id: &StreamId) -> Option<Arc<EventStream>> {
        self.streams.lock().await.get(id).cloned()
    }

    /// Specs of every running stream.
    pub async fn streams(&self) -> Vec<StreamSpec> {
        let mut specs: Vec<StreamSpec> = self
            .streams
            .lock()
            .await
            .values()
            .map(|stream| stream.spec().clone())
            .collect();
        specs.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        specs
    }

    /// Stop a stream and remove its definition and checkpoint.
    pub async fn delete_stream(&self, id: &StreamId) -> Result<(), StreamError> {
        let stream = self
            .streams
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| StreamError::StreamNotFound(id.clone()))?;
        stream.stop().await;
        self.store.delete(&stream_key(id)).await?;
        self.store.delete(&checkpoint_key(id)).await?;
        info!(stream = %id.0, "stream deleted");
        Ok(())
    }

    /// Restart every persisted stream definition. Unreadable or invalid
    /// entries are logged and skipped rather than failing recovery.
    pub async fn recover(&self) -> Result<usize, StreamError> {
        let entries = self.store.iter_prefix("streams/").await?;
        let mut restored = 0usize;
        for (key, value) in entries {
            let spec: StreamSpec = match serde_json::from_slice(&value) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable stream definition");
                    continue;
                }
            };
            let mut streams = self.streams.lock().await;
            if streams.contains_key(&spec.id) {
                continue;
            }
            match EventStream::new(spec, &self.config) {
                Ok(stream) => {
                    let id = stream.spec().id.clone();
                    streams.insert(id, Arc::new(stream));
                    restored += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping invalid stream definition");
                }
            }
        }
        if restored > 0 {
            info!(count = restored, "recovered persisted streams");
        }
        Ok(restored)
    }

    /// Persist the feeder's watermark for a stream.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StreamError> {
        let encoded = serde_json::to_vec(checkpoint).map_err(StoreError::from)?;
        self.store
            .put(&checkpoint_key(&checkpoint.stream_id), encoded)
            .await?;
        Ok(())
    }

    /// Load the persisted watermark, if any.
    pub async fn load_checkpoint(&self, id: &StreamId) -> Result<Option<Checkpoint>, StreamError> {
        match self.store.get(&checkpoint_key(id)).await? {
            Some(bytes) => {
                let checkpoint = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Stop every stream. Definitions stay persisted for later recovery.
    pub async fn close(&self) {
        let streams: Vec<Arc<EventStream>> = self.streams.lock().await.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.stop().await;
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn registry() -> StreamRegistry {
        let config = GatewayConfig {
            allow_private_ips: true,
            ..GatewayConfig::default()
        };
        StreamRegistry::new(config, Arc::new(MemoryKvStore::new()))
    }

    fn spec() -> StreamSpec {
        StreamSpec::webhook("http://127.0.0.1:1/hook").with_batch_size(5)
    }

    #[tokio::test]
    async fn add_assigns_id_and_persists() {
        let registry = registry();
        let spec = registry.add_stream(spec()).await.unwrap();
        assert!(!spec.id.0.is_empty());
        assert_eq!(spec.batch_size, 5);

        let stored = registry
            .store
            .get(&stream_key(&spec.id))
            .await
            .unwrap()
            .unwrap();
        let decoded: StreamSpec = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded.id, spec.id);

        assert!(registry.stream(&spec.id).await.is_some());
        assert_eq!(registry.streams().await.len(), 1);
        registry.close().await;
    }

    #[tokio::test]
    async fn add_rejects_invalid_spec() {
        let registry = registry();
        let err = registry.add_stream(StreamSpec::default()).await.unwrap_err();
        assert_eq!(err, StreamError::NoActionSpecified);
        assert!(registry.streams().await.is_empty());
    }

    #[tokio::test]
    async fn delete_stops_and_removes() {
        let registry = registry();
        let spec = registry.add_stream(spec()).await.unwrap();
        let stream = registry.stream(&spec.id).await.unwrap();

        registry.delete_stream(&spec.id).await.unwrap();
        assert!(stream.processor_done());
        assert!(stream.dispatcher_done());
        assert!(registry.stream(&spec.id).await.is_none());
        assert_eq!(registry.store.get(&stream_key(&spec.id)).await.unwrap(), None);

        let missing = StreamId("nope".to_string());
        let err = registry.delete_stream(&missing).await.unwrap_err();
        assert_eq!(err, StreamError::StreamNotFound(missing));
    }

    #[tokio::test]
    async fn recover_restores_persisted_streams() {
        let store = Arc::new(MemoryKvStore::new());
        let config = GatewayConfig {
            allow_private_ips: true,
            ..GatewayConfig::default()
        };

        {
            let registry = StreamRegistry::new(config.clone(), store.clone());
            registry.add_stream(spec()).await.unwrap();
            registry.add_stream(spec()).await.unwrap();
            registry.close().await;
        }
        store
            .put("streams/broken", b"not json".to_vec())
            .await
            .unwrap();

        let registry = StreamRegistry::new(config, store);
        let restored = registry.recover().await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(registry.streams().await.len(), 2);

        // Idempotent: already-running streams are left alone.
        assert_eq!(registry.recover().await.unwrap(), 0);
        registry.close().await;
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let registry = registry();
        let spec = registry.add_stream(spec()).await.unwrap();

        assert_eq!(registry.load_checkpoint(&spec.id).await.unwrap(), None);

        let checkpoint = Checkpoint::new(spec.id.clone(), 150_721);
        registry.save_checkpoint(&checkpoint).await.unwrap();
        let loaded = registry.load_checkpoint(&spec.id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        registry.delete_stream(&spec.id).await.unwrap();
        assert_eq!(registry.load_checkpoint(&spec.id).await.unwrap(), None);
    }
}
