//! `RemoteStore` over the document service's REST API.

use async_trait::async_trait;
use mindmap_sync_core::remote::Result;
use mindmap_sync_core::{AuthProvider, Document, DocumentSummary, OperationPayload, RemoteError, RemoteStore};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Header carrying the writing client's id.
pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateNodeBody<'a> {
    parent_id: &'a str,
    node: &'a mindmap_sync_core::Node,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MoveNodeBody<'a> {
    new_parent_id: &'a str,
}

fn network_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, auth)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            auth,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match self.auth.get_auth_header() {
            Some(header) => builder.header(AUTHORIZATION, header),
            None => builder,
        }
    }

    /// Send and turn non-2xx responses into `RemoteError`s.
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        debug!("Remote answered {}: {}", status, body);
        Err(RemoteError::from_response(status.as_u16(), &body, retry_after))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    /// Deleting something already gone is a success.
    async fn send_delete(&self, builder: RequestBuilder) -> Result<()> {
        match self.send(builder).await {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.json(self.request(Method::GET, "/documents")).await
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        self.json(self.request(Method::GET, &format!("/documents/{}", id)))
            .await
    }

    async fn apply(&self, origin: &str, document_id: &str, payload: &OperationPayload) -> Result<()> {
        let doc_path = format!("/documents/{}", document_id);
        let builder = match payload {
            OperationPayload::CreateDoc { document } => self.request(Method::POST, "/documents").json(document),
            OperationPayload::UpdateDoc { document } => self.request(Method::PUT, &doc_path).json(document),
            OperationPayload::DeleteDoc => self.request(Method::DELETE, &doc_path),
            OperationPayload::CreateNode { parent_id, node } => self
                .request(Method::POST, &format!("{}/nodes", doc_path))
                .json(&CreateNodeBody { parent_id, node }),
            OperationPayload::UpdateNode { node_id, patch } => self
                .request(Method::PUT, &format!("{}/nodes/{}", doc_path, node_id))
                .json(patch),
            OperationPayload::DeleteNode { node_id } => {
                self.request(Method::DELETE, &format!("{}/nodes/{}", doc_path, node_id))
            }
            OperationPayload::MoveNode {
                node_id,
                new_parent_id,
            } => self
                .request(Method::PUT, &format!("{}/nodes/{}/move", doc_path, node_id))
                .json(&MoveNodeBody { new_parent_id }),
        };
        let builder = builder.header(CLIENT_ID_HEADER, origin);

        if matches!(payload, OperationPayload::DeleteDoc | OperationPayload::DeleteNode { .. }) {
            return self.send_delete(builder).await;
        }
        self.send(builder).await?;
        Ok(())
    }
}
