use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::StorageError;

/// Result of an object fetch. Absence is a valid outcome distinct from a
/// transport error, so callers must handle the branch explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Bytes),
    NotFound,
}

/// Object store collaborator: retrieve raw file bytes by object name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<FetchOutcome, StorageError>;
}

/// GCS-compatible REST adapter downloading objects with `alt=media`.
pub struct GcsObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl GcsObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        access_token: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !access_token.is_empty() {
            if let Ok(value) = format!("Bearer {}", access_token).parse() {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("atm-ingester")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            bucket: bucket.to_owned(),
        })
    }

    fn object_url(&self, name: &str) -> String {
        // Object names routinely contain `/`, which must not be taken as
        // a path separator here.
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            self.bucket,
            urlencoding::encode(name)
        )
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn fetch(&self, name: &str) -> Result<FetchOutcome, StorageError> {
        let response = self.client.get(self.object_url(name)).send().await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(FetchOutcome::NotFound),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                debug!(name, size = bytes.len(), "downloaded object");
                Ok(FetchOutcome::Found(bytes))
            }
            status => Err(StorageError::UnexpectedStatus(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn object_url_percent_encodes_the_name() {
        let store = GcsObjectStore::new(
            "https://storage.example.com/",
            "bucket",
            "",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            store.object_url("incoming/f1.json"),
            "https://storage.example.com/storage/v1/b/bucket/o/incoming%2Ff1.json?alt=media"
        );
    }

    #[tokio::test]
    async fn fetch_returns_object_bytes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/storage/v1/b/bucket/o/")
                .query_param("alt", "media");
            then.status(200).body(r#"{"payload": {}}"#);
        });

        let store = GcsObjectStore::new(
            &server.base_url(),
            "bucket",
            "",
            Duration::from_secs(5),
        )
        .unwrap();
        let outcome = store.fetch("incoming/f1.json").await.unwrap();

        mock.assert();
        assert_eq!(
            outcome,
            FetchOutcome::Found(Bytes::from_static(br#"{"payload": {}}"#))
        );
    }

    #[tokio::test]
    async fn missing_object_is_not_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_contains("/o/");
            then.status(404);
        });

        let store = GcsObjectStore::new(
            &server.base_url(),
            "bucket",
            "",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            store.fetch("gone.json").await.unwrap(),
            FetchOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_contains("/o/");
            then.status(500);
        });

        let store = GcsObjectStore::new(
            &server.base_url(),
            "bucket",
            "",
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(matches!(
            store.fetch("f1.json").await,
            Err(StorageError::UnexpectedStatus(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR
            ))
        ));
    }
}
