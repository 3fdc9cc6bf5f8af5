use crate::http::build_client;
use reqwest::Client;
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

/// Object store client. With `STORAGE_URL` + `STORAGE_SERVICE_KEY` set,
/// objects go to a Supabase-style storage REST API; otherwise a process-local
/// map backs the same interface so the whole pipeline runs offline and in
/// tests. Paths follow `generated/{order_id}/{filename}` and
/// `uploads/pets/{filename}`; the store is append-mostly and nothing here
/// deletes objects of archived images.
#[derive(Clone)]
pub struct StorageClient {
    remote: Option<RemoteStorage>,
    memory: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    http: Client,
}

#[derive(Clone)]
struct RemoteStorage {
    base_url: String,
    service_key: String,
    bucket: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl StorageClient {
    pub fn from_env() -> Self {
        let remote = match (
            std::env::var("STORAGE_URL").ok(),
            std::env::var("STORAGE_SERVICE_KEY").ok(),
        ) {
            (Some(base_url), Some(service_key)) => Some(RemoteStorage {
                base_url: base_url.trim_end_matches('/').to_string(),
                service_key,
                bucket: std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "portraits".into()),
            }),
            _ => None,
        };
        Self {
            remote,
            memory: Arc::new(Mutex::new(HashMap::new())),
            http: build_client(),
        }
    }

    /// Offline client for tests and demo runs.
    pub fn in_memory() -> Self {
        Self {
            remote: None,
            memory: Arc::new(Mutex::new(HashMap::new())),
            http: build_client(),
        }
    }

    /// Store bytes at `path` and return the servable reference.
    pub async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        if let Some(remote) = &self.remote {
            let url = format!(
                "{}/storage/v1/object/{}/{}",
                remote.base_url, remote.bucket, path
            );
            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", remote.service_key))
                .header("x-upsert", "true")
                .body(bytes)
                .send()
                .await
                .map_err(|err| StorageError::Upload(err.to_string()))?;
            if !response.status().is_success() {
                return Err(StorageError::Upload(format!("HTTP {}", response.status())));
            }
            return Ok(format!(
                "{}/storage/v1/object/public/{}/{}",
                remote.base_url, remote.bucket, path
            ));
        }
        self.memory.lock().await.insert(path.to_string(), bytes);
        Ok(path.to_string())
    }

    /// Resolve a reference to bytes. Remote URLs are fetched over HTTP;
    /// everything else is tried against the demo map and then the local
    /// filesystem, since legacy and current records mix storage schemes.
    pub async fn fetch(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        if is_remote(reference) {
            let response = self
                .http
                .get(reference)
                .send()
                .await
                .map_err(|err| StorageError::Fetch(err.to_string()))?;
            if !response.status().is_success() {
                return Err(StorageError::Fetch(format!("HTTP {}", response.status())));
            }
            return response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|err| StorageError::Fetch(err.to_string()));
        }

        if let Some(bytes) = self.memory.lock().await.get(reference) {
            return Ok(bytes.clone());
        }

        if Path::new(reference).is_file() {
            return tokio::fs::read(reference)
                .await
                .map_err(|err| StorageError::Fetch(err.to_string()));
        }

        Err(StorageError::NotFound(reference.to_string()))
    }
}

pub fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn memory_upload_then_fetch() {
        let storage = StorageClient::in_memory();
        let reference = storage
            .upload("generated/x/slot-0.png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(reference, "generated/x/slot-0.png");
        assert_eq!(storage.fetch(&reference).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetch_falls_back_to_local_files() {
        let storage = StorageClient::in_memory();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"template-bytes").unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert_eq!(storage.fetch(&path).await.unwrap(), b"template-bytes");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let storage = StorageClient::in_memory();
        assert!(matches!(
            storage.fetch("generated/none/missing.png").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
