//! HTTP transport for the document backend endpoints.

use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    error::BackendError,
    protocol::{AskRequest, AskResponse, DocumentSummary, ErrorBody, LoadDocumentRequest, UploadResponse},
};

use crate::{DocumentBackend, DocumentUpload};

pub struct HttpBackend {
    http: Client,
    server_url: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    /// Non-2xx responses carry `{"error": "..."}` when the backend produced
    /// a message; anything else degrades to a transport failure.
    async fn read_error(response: Response) -> BackendError {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => BackendError::api(body.error),
            Err(_) => BackendError::transport(format!("server returned {status}")),
        }
    }

    async fn expect_success(
        response: Result<Response, reqwest::Error>,
    ) -> Result<Response, BackendError> {
        let response = response.map_err(|err| BackendError::transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::read_error(response).await)
        }
    }
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    async fn upload_document(&self, upload: DocumentUpload) -> Result<String, BackendError> {
        let response = self
            .http
            .post(format!("{}/upload", self.server_url))
            .query(&[
                ("fileName", upload.file_name.as_str()),
                ("mediaType", upload.media_type.as_str()),
            ])
            .body(upload.bytes)
            .send()
            .await;
        let body: UploadResponse = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|err| BackendError::transport(err.to_string()))?;
        Ok(body.text)
    }

    async fn ask(&self, request: AskRequest) -> Result<String, BackendError> {
        let response = self
            .http
            .post(format!("{}/ask", self.server_url))
            .json(&request)
            .send()
            .await;
        let body: AskResponse = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|err| BackendError::transport(err.to_string()))?;
        Ok(body.answer)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, BackendError> {
        let response = self
            .http
            .get(format!("{}/documents", self.server_url))
            .send()
            .await;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|err| BackendError::transport(err.to_string()))
    }

    async fn load_document(&self, file_name: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(format!("{}/documents/load", self.server_url))
            .json(&LoadDocumentRequest {
                file_name: file_name.to_string(),
            })
            .send()
            .await;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn delete_document(&self, file_name: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(format!("{}/documents/{file_name}", self.server_url))
            .send()
            .await;
        Self::expect_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
