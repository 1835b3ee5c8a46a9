//! HTTP client for the vault-store nodes.
//!
//! Writes fan out to every configured node (each node stores its share of
//! the encrypted fields); a write succeeds only when all nodes accept it.
//! Failures are classified by HTTP status so the uploader can decide
//! between re-delegating, retrying with backoff, or dropping the document.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use crate::delegation::DelegationToken;
use crate::error::{MigrationError, Result, VaultErrorKind};
use crate::vault::{CollectionDescriptor, CreateDataRequest, DocumentOutcome, VaultStore};

#[derive(Debug, Default, Deserialize)]
struct CreateDataResponse {
    #[serde(default)]
    created: Vec<String>,
    #[serde(default)]
    errors: Vec<CreateDataError>,
}

#[derive(Debug, Deserialize)]
struct CreateDataError {
    #[serde(default)]
    document: Option<String>,
    error: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Vault-store client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVaultClient {
    client: reqwest::Client,
    nodes: Vec<String>,
    /// Operator root token, used for builder-scoped endpoints
    /// (collection management).
    root_token: String,
}

impl HttpVaultClient {
    pub fn new(nodes: Vec<String>, root_token: String) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MigrationError::config("vault.nodes", "no nodes configured"));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("puffvault/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(60))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            nodes: nodes
                .into_iter()
                .map(|n| n.trim_end_matches('/').to_string())
                .collect(),
            root_token,
        })
    }

    fn classify_status(status: StatusCode, body: &str) -> MigrationError {
        let kind = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VaultErrorKind::Authorization,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
                VaultErrorKind::Validation
            }
            _ => VaultErrorKind::Transient,
        };
        MigrationError::vault(kind, format!("{status}: {body}"))
    }

    async fn post_all_nodes<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        bearer: &str,
        body: &B,
    ) -> Result<Vec<serde_json::Value>> {
        let requests = self.nodes.iter().map(|node| async move {
            let response = self
                .client
                .post(format!("{node}{path}"))
                .bearer_auth(bearer)
                .json(body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            let value = response.json::<serde_json::Value>().await?;
            Ok(value)
        });

        join_all(requests).await.into_iter().collect()
    }
}

#[async_trait]
impl VaultStore for HttpVaultClient {
    async fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()> {
        self.post_all_nodes("/v1/collections", &self.root_token, collection)
            .await?;
        tracing::info!(collection = %collection.id, name = %collection.name, "created collection");
        Ok(())
    }

    async fn has_collection(&self, id: Uuid) -> Result<bool> {
        // Any node answering for the id is enough; absence on the first
        // reachable node means the id is not usable.
        let node = &self.nodes[0];
        let response = self
            .client
            .get(format!("{node}/v1/collections/{id}"))
            .bearer_auth(&self.root_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Self::classify_status(status, &body))
            }
        }
    }

    async fn create_data(
        &self,
        token: &DelegationToken,
        request: &CreateDataRequest,
    ) -> Result<Vec<DocumentOutcome>> {
        let responses = self
            .post_all_nodes("/v1/data/create", token.as_str(), request)
            .await?;

        // Nodes hold shares of the same documents; the first response
        // carries the authoritative created/rejected split.
        let parsed: CreateDataResponse = responses
            .into_iter()
            .next()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        let mut outcomes: Vec<DocumentOutcome> = parsed
            .created
            .into_iter()
            .map(|id| DocumentOutcome::Created { id })
            .collect();
        outcomes.extend(parsed.errors.into_iter().map(|e| DocumentOutcome::Rejected {
            reason: match e.document {
                Some(doc) => format!("{doc}: {}", e.error),
                None => e.error,
            },
        }));
        Ok(outcomes)
    }

    async fn count_data(&self, collection: Uuid) -> Result<u64> {
        let node = &self.nodes[0];
        let response = self
            .client
            .get(format!("{node}/v1/data/count"))
            .query(&[("collection", collection.to_string())])
            .bearer_auth(&self.root_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        let parsed: CountResponse = response.json().await?;
        Ok(parsed.count)
    }
}
