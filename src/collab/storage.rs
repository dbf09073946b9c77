use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::RwLock;

use super::StoreError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn store(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys currently stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{key}")))
    }

    async fn store(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects
            .write()
            .await
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{bucket}/{key}")))
    }
}

/// Client for the blob service's generic object routes.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    /// Every request, body included, must finish within `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn objects_url(&self) -> String {
        format!("{}/api/blob-service/objects", self.base_url)
    }
}

async fn check(response: reqwest::Response, what: String) -> Result<reqwest::Response, StoreError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(what)),
        status => Err(StoreError::Service {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get(self.objects_url())
            .query(&[("bucket", bucket), ("key", key)])
            .send()
            .await?;
        let response = check(response, format!("{bucket}/{key}")).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn store(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.objects_url())
            .query(&[("bucket", bucket), ("key", key)])
            .body(bytes)
            .send()
            .await?;
        check(response, format!("{bucket}/{key}")).await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.objects_url())
            .query(&[("bucket", bucket), ("key", key)])
            .send()
            .await?;
        check(response, format!("{bucket}/{key}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip_and_delete() {
        let store = MemoryObjectStore::new();
        store.store("b", "k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.retrieve("b", "k").await.unwrap(), vec![1, 2, 3]);
        assert!(store.contains("b", "k").await);

        store.delete("b", "k").await.unwrap();
        assert!(matches!(
            store.retrieve("b", "k").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete("b", "k").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_keys_are_per_bucket() {
        let store = MemoryObjectStore::new();
        store.store("a", "2", vec![]).await.unwrap();
        store.store("a", "1", vec![]).await.unwrap();
        store.store("b", "3", vec![]).await.unwrap();
        assert_eq!(store.keys("a").await, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn http_store_gives_up_on_silent_service() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store =
            HttpObjectStore::new(format!("http://{addr}"), Duration::from_millis(100)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            store.retrieve("uploads", "tmp/frame.png"),
        )
        .await
        .expect("request outlived its timeout");

        assert!(matches!(result, Err(StoreError::Http(_))));
    }

    #[test]
    fn http_store_trims_trailing_slash() {
        let store = HttpObjectStore::new("http://blob:13000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.objects_url(),
            "http://blob:13000/api/blob-service/objects"
        );
    }
}
