//! Per-application client over a shared [`TransferManager`].

use std::path::PathBuf;
use std::sync::Arc;

use blobxfer_transfer::{DownloadOptions, TransferError, Transport, UploadOptions};

use crate::config::ClientOptions;
use crate::manager::TransferManager;
use crate::transfer::Transfer;
use crate::types::ClientRegistration;

/// Creates transfers owned by one restoration id.
///
/// The client registers itself with the manager on construction and
/// unregisters on drop. Transfers it created keep running after the drop
/// but cannot be resumed until a client with the same id registers again.
pub struct BlobClient {
    manager: Arc<TransferManager>,
    options: ClientOptions,
}

impl BlobClient {
    pub fn new(
        manager: Arc<TransferManager>,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, TransferError> {
        manager.register_owner(ClientRegistration::new(options.clone(), transport))?;
        Ok(Self { manager, options })
    }

    pub fn restoration_id(&self) -> &str {
        &self.options.restoration_id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    /// Downloads `source_url` into `destination`.
    pub async fn download(
        &self,
        source_url: impl Into<String>,
        destination: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Result<Transfer, TransferError> {
        self.manager
            .download(self.restoration_id(), source_url, destination, options)
            .await
    }

    /// Uploads `source` as a block blob at `destination_url`.
    pub async fn upload(
        &self,
        source: impl Into<PathBuf>,
        destination_url: impl Into<String>,
        options: UploadOptions,
    ) -> Result<Transfer, TransferError> {
        self.manager
            .upload(self.restoration_id(), source, destination_url, options)
            .await
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.manager.transfers_for_owner(self.restoration_id())
    }

    pub fn downloads(&self) -> Vec<Transfer> {
        self.scoped(self.manager.downloads())
    }

    pub fn uploads(&self) -> Vec<Transfer> {
        self.scoped(self.manager.uploads())
    }

    fn scoped(&self, transfers: Vec<Transfer>) -> Vec<Transfer> {
        let id = self.restoration_id();
        transfers
            .into_iter()
            .filter(|t| t.record().is_some_and(|r| r.owner_tag == id))
            .collect()
    }

    pub fn pause_all(&self) -> usize {
        self.manager.pause_all(Some(self.restoration_id()))
    }

    pub fn resume_all(&self) -> usize {
        self.manager.resume_all(Some(self.restoration_id()))
    }

    pub fn cancel_all(&self) -> usize {
        self.manager.cancel_all(Some(self.restoration_id()))
    }

    pub fn remove_all(&self) -> usize {
        self.manager.remove_all(Some(self.restoration_id()))
    }
}

impl Drop for BlobClient {
    fn drop(&mut self) {
        self.manager.unregister_owner(&self.options.restoration_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::store::MemoryStore;
    use blobxfer_transfer::testing::MemoryBlobService;

    fn manager() -> Arc<TransferManager> {
        Arc::new(TransferManager::new(
            ManagerConfig::default(),
            Arc::new(MemoryStore::new()),
        ))
    }

    #[test]
    fn registration_follows_client_lifetime() {
        let manager = manager();
        let service = Arc::new(MemoryBlobService::new());
        let client =
            BlobClient::new(manager.clone(), service.clone(), ClientOptions::new("app")).unwrap();
        assert!(manager.is_owner_registered("app"));
        assert!(matches!(
            BlobClient::new(manager.clone(), service, ClientOptions::new("app")),
            Err(TransferError::DuplicateOwner(_))
        ));
        drop(client);
        assert!(!manager.is_owner_registered("app"));
    }

    #[tokio::test]
    async fn queries_are_scoped_to_the_client() {
        let manager = manager();
        let service = Arc::new(MemoryBlobService::new());
        let url = "https://acct.blob.core.windows.net/c/data.bin";
        service.put_blob(url, vec![7; 64]);
        let a = BlobClient::new(manager.clone(), service.clone(), ClientOptions::new("a")).unwrap();
        let b = BlobClient::new(manager.clone(), service.clone(), ClientOptions::new("b")).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mine = a
            .download(url, dir.path().join("a"), DownloadOptions::default())
            .await
            .unwrap();
        b.download(url, dir.path().join("b"), DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(a.transfers(), vec![mine.clone()]);
        assert_eq!(a.downloads(), vec![mine]);
        assert!(a.uploads().is_empty());
        assert_eq!(a.cancel_all(), 1);
        assert_eq!(b.transfers().len(), 1);
        assert_eq!(b.remove_all(), 1);
        assert!(b.transfers().is_empty());
    }
}
