use std::time::Duration;

use anyhow::{Context, Result};
use fieldsync_core::config::RemoteConfig;
use fieldsync_core::{BlobStore, RemoteError, RemoteStore};
use fieldsync_kernel::Record;
use once_cell::sync::OnceCell;
use reqwest::{RequestBuilder, Response, StatusCode};

const FALLBACK_HTTP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_BUCKET: &str = "photos";

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Request timeout, read once from `FIELDSYNC_HTTP_TIMEOUT_SECS`.
fn request_timeout() -> Duration {
    static SECS: OnceCell<u64> = OnceCell::new();
    Duration::from_secs(
        *SECS.get_or_init(|| env_u64("FIELDSYNC_HTTP_TIMEOUT_SECS", FALLBACK_HTTP_TIMEOUT_SECS)),
    )
}

fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(format!("fieldsync-connector/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(3))
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(request_timeout())
}

/// Map an unsuccessful HTTP status to the remote error taxonomy.
pub fn classify_status(status: StatusCode, table: &str, body: &str) -> RemoteError {
    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.chars().take(512).collect()
    };
    match status.as_u16() {
        409 => RemoteError::Conflict {
            table: table.to_string(),
        },
        408 | 429 => RemoteError::Unavailable(format!("{}: {}", status.as_u16(), message)),
        s if status.is_server_error() => RemoteError::Unavailable(format!("{}: {}", s, message)),
        s => RemoteError::Rejected { status: s, message },
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Unavailable(err.to_string())
}

async fn check(resp: Response, table: &str) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, table, &body))
}

/// REST data service plus object storage, addressed PostgREST-style.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, bucket: &str, api_key: Option<String>) -> Result<Self> {
        let client = builder().build().context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            api_key,
        })
    }

    pub fn from_config(base_url: &str, cfg: &RemoteConfig) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty());
        if cfg.api_key_env.is_some() && api_key.is_none() {
            tracing::warn!("remote api key variable is unset; requests go out unauthenticated");
        }
        Self::new(
            base_url,
            cfg.bucket.as_deref().unwrap_or(DEFAULT_BUCKET),
            api_key,
        )
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    pub fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => rb.header("apikey", key).bearer_auth(key),
            None => rb,
        }
    }
}

fn by_id(id: &str) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

#[async_trait::async_trait]
impl RemoteStore for HttpRemote {
    async fn upsert(&self, table: &str, record: &Record) -> Result<(), RemoteError> {
        let rb = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record);
        let resp = self.authed(rb).send().await.map_err(transport)?;
        check(resp, table).await.map(|_| ())
    }

    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError> {
        let rb = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(record);
        let resp = self.authed(rb).send().await.map_err(transport)?;
        check(resp, table).await.map(|_| ())
    }

    async fn update(&self, table: &str, id: &str, patch: &Record) -> Result<(), RemoteError> {
        let rb = self
            .client
            .patch(self.table_url(table))
            .query(&by_id(id))
            .header("Prefer", "return=minimal")
            .json(patch);
        let resp = self.authed(rb).send().await.map_err(transport)?;
        check(resp, table).await.map(|_| ())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let rb = self
            .client
            .delete(self.table_url(table))
            .query(&by_id(id));
        let resp = self.authed(rb).send().await.map_err(transport)?;
        check(resp, table).await.map(|_| ())
    }

    async fn select_children(
        &self,
        table: &str,
        parent_column: &str,
        parent_id: &str,
        order_by: &str,
    ) -> Result<Vec<Record>, RemoteError> {
        let query = [
            ("select".to_string(), "*".to_string()),
            (parent_column.to_string(), format!("eq.{}", parent_id)),
            ("order".to_string(), format!("{}.asc", order_by)),
        ];
        let rb = self.client.get(self.table_url(table)).query(&query);
        let resp = self.authed(rb).send().await.map_err(transport)?;
        let resp = check(resp, table).await?;
        resp.json::<Vec<Record>>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpRemote {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let rb = self
            .client
            .post(self.object_url(path))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let resp = self.authed(rb).send().await.map_err(transport)?;
        check(resp, &self.bucket).await?;
        Ok(self.public_url(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        let t = "jobs";
        assert!(classify_status(StatusCode::CONFLICT, t, "").is_conflict());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, t, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, t, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, t, "").is_transient());
        match classify_status(StatusCode::FORBIDDEN, t, "permission denied") {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_body_falls_back_to_reason() {
        match classify_status(StatusCode::NOT_FOUND, "jobs", "") {
            RemoteError::Rejected { message, .. } => assert_eq!(message, "Not Found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let remote = HttpRemote::new("https://sync.example.com/", "site-photos", None).unwrap();
        assert_eq!(
            remote.table_url("checklist_items"),
            "https://sync.example.com/rest/v1/checklist_items"
        );
        assert_eq!(
            remote.object_url("photos/a1/x.jpg"),
            "https://sync.example.com/storage/v1/object/site-photos/photos/a1/x.jpg"
        );
        assert_eq!(
            remote.public_url("photos/a1/x.jpg"),
            "https://sync.example.com/storage/v1/object/public/site-photos/photos/a1/x.jpg"
        );
    }

    #[test]
    fn bucket_defaults_when_unconfigured() {
        let cfg = RemoteConfig::default();
        let remote = HttpRemote::from_config("http://localhost:54321", &cfg).unwrap();
        assert!(remote.object_url("p").contains("/object/photos/p"));
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        // nothing listens on port 9 locally
        let remote = HttpRemote::new("http://127.0.0.1:9", "photos", None).unwrap();
        let err = remote
            .delete("jobs", "j1")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
