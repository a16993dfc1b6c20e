//! Durable store backed by the document HTTP API.
//!
//! `GET {base}/documents/{id}` returns the persisted snapshot (404 if none);
//! `PUT {base}/documents/{id}` replaces it with a JSON `{"text": ...}` body.

use async_trait::async_trait;
use collab_core::persistence::{DocumentStore, Snapshot, StoreError};
use collab_core::Credential;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

pub struct HttpStore {
    client: Client,
    base: Url,
    credential: Option<Credential>,
}

impl HttpStore {
    pub fn new(base: &str, credential: Option<Credential>) -> Result<Self, StoreError> {
        let base = Url::parse(base)
            .map_err(|e| StoreError::Request(format!("Invalid store URL {}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Request(format!("Invalid store URL {}", base)));
        }
        Ok(Self {
            client: Client::new(),
            base,
            credential,
        })
    }

    /// URL of one document; the id is percent-encoded as a single path segment.
    pub fn document_url(&self, document_id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["documents", document_id]);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(credential) => request.bearer_auth(credential.token()),
            None => request,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn load(&self, document_id: &str) -> Result<Option<String>, StoreError> {
        let url = self.document_url(document_id);
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .text()
                .await
                .map(Some)
                .map_err(|e| StoreError::Request(e.to_string())),
            status => Err(StoreError::Rejected {
                document_id: document_id.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn save(&self, document_id: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        let url = self.document_url(document_id);
        debug!("PUT {}", url);

        let response = self
            .authorize(self.client.put(url))
            .json(snapshot)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                document_id: document_id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_url_encodes_id() {
        let store = HttpStore::new("http://localhost:9000/api/", None).unwrap();
        assert_eq!(
            store.document_url("notes/one two").as_str(),
            "http://localhost:9000/api/documents/notes%2Fone%20two"
        );
    }

    #[test]
    fn test_document_url_without_trailing_slash() {
        let store = HttpStore::new("http://localhost:9000", None).unwrap();
        assert_eq!(
            store.document_url("doc-1").as_str(),
            "http://localhost:9000/documents/doc-1"
        );
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(HttpStore::new("mailto:someone@example.com", None).is_err());
        assert!(HttpStore::new("not a url", None).is_err());
    }
}
