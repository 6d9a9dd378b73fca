//! In-memory transport with failure injection, for tests and dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BlobTransport, RemoteFile};
use crate::error::{AuthErrorKind, NetworkErrorKind, StorageErrorKind};
use crate::{Error, Result};

/// Transport operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Upload,
    Download,
    List,
    Delete,
    Update,
}

/// Failure returned instead of performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Network(NetworkErrorKind),
    Authentication(AuthErrorKind),
    Storage(StorageErrorKind),
}

impl InjectedFailure {
    fn to_error(self, op: TransportOp) -> Error {
        let message = format!("injected failure during {op:?}");
        match self {
            Self::Network(kind) => Error::network(kind, message),
            Self::Authentication(kind) => Error::authentication(kind, message),
            Self::Storage(kind) => Error::storage(kind, message),
        }
    }
}

#[derive(Debug, Clone)]
struct Blob {
    name: String,
    bytes: Vec<u8>,
    created_time: DateTime<Utc>,
    modified_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    blobs: BTreeMap<String, Blob>,
    failures: HashMap<TransportOp, VecDeque<InjectedFailure>>,
    calls: HashMap<TransportOp, usize>,
}

impl State {
    /// Count the call and pop a pending failure for it, if any.
    fn enter(&mut self, op: TransportOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.to_error(op)),
            None => Ok(()),
        }
    }

    fn blob_mut(&mut self, id: &str) -> Result<&mut Blob> {
        self.blobs
            .get_mut(id)
            .ok_or_else(|| Error::storage(StorageErrorKind::NotFound, format!("blob {id}")))
    }
}

/// Blobs held in memory; ids are UUIDs distinct from names.
#[derive(Debug, Default)]
pub struct MemoryBlobTransport {
    state: Mutex<State>,
}

impl MemoryBlobTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `failure`.
    pub async fn fail_next(&self, op: TransportOp, failure: InjectedFailure, times: usize) {
        let mut state = self.state.lock().await;
        state
            .failures
            .entry(op)
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// How many times `op` was attempted.
    pub async fn calls(&self, op: TransportOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Overwrite stored bytes without touching metadata.
    pub async fn tamper(&self, id: &str, edit: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        let mut state = self.state.lock().await;
        edit(&mut state.blob_mut(id)?.bytes);
        Ok(())
    }

    /// Store a blob with an explicit creation time.
    pub async fn insert_at(&self, name: &str, bytes: &[u8], created: DateTime<Utc>) -> String {
        let id = Uuid::now_v7().to_string();
        self.state.lock().await.blobs.insert(
            id.clone(),
            Blob {
                name: name.to_string(),
                bytes: bytes.to_vec(),
                created_time: created,
                modified_time: created,
            },
        );
        id
    }
}

impl BlobTransport for MemoryBlobTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String> {
        self.state.lock().await.enter(TransportOp::Upload)?;
        Ok(self.insert_at(name, bytes, Utc::now()).await)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.enter(TransportOp::Download)?;
        Ok(state.blob_mut(id)?.bytes.clone())
    }

    async fn list(&self) -> Result<Vec<RemoteFile>> {
        let mut state = self.state.lock().await;
        state.enter(TransportOp::List)?;
        Ok(state
            .blobs
            .iter()
            .map(|(id, blob)| RemoteFile {
                id: id.clone(),
                name: blob.name.clone(),
                size: blob.bytes.len() as u64,
                created_time: blob.created_time,
                modified_time: blob.modified_time,
            })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter(TransportOp::Delete)?;
        state
            .blobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::storage(StorageErrorKind::NotFound, format!("blob {id}")))
    }

    async fn update(&self, id: &str, name: &str, bytes: &[u8]) -> Result<String> {
        let mut state = self.state.lock().await;
        state.enter(TransportOp::Update)?;
        let blob = state.blob_mut(id)?;
        name.clone_into(&mut blob.name);
        blob.bytes = bytes.to_vec();
        blob.modified_time = Utc::now();
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn roundtrip_and_update() {
        let transport = MemoryBlobTransport::new();
        let id = transport.upload("a.enc", b"one").await.unwrap();
        assert_ne!(id, "a.enc");

        assert_eq!(transport.update(&id, "a.enc", b"two").await.unwrap(), id);
        assert_eq!(transport.download(&id).await.unwrap(), b"two");

        let found = transport.find_by_name("a.enc").await.unwrap().unwrap();
        assert_eq!(found.size, 3);

        transport.delete(&id).await.unwrap();
        assert!(transport.delete(&id).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_are_consumed_in_order() {
        let transport = MemoryBlobTransport::new();
        transport
            .fail_next(
                TransportOp::List,
                InjectedFailure::Network(NetworkErrorKind::Timeout),
                2,
            )
            .await;

        assert!(transport.list().await.unwrap_err().is_retryable());
        assert!(transport.list().await.is_err());
        assert!(transport.list().await.is_ok());
        assert_eq!(transport.calls(TransportOp::List).await, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tamper_changes_bytes_only() {
        let transport = MemoryBlobTransport::new();
        let id = transport.upload("a.enc", b"abc").await.unwrap();
        transport.tamper(&id, |bytes| bytes[0] = b'X').await.unwrap();
        assert_eq!(transport.download(&id).await.unwrap(), b"Xbc");
    }
}
