//! The raw remote-drive transport boundary. The core treats this as an
//! opaque external collaborator (see SPEC_FULL.md §1); `DriveApi` is the
//! trait `remote_tree.rs` programs against, and `HttpDriveApi` is a thin
//! `reqwest`-based implementation showing the shape of a real transport,
//! in the style of the teacher's `send_authed`/`upload_blob` in `http.rs`.
//! No production iCloud Drive crate exists in the ecosystem to depend on
//! honestly, so this stub is exercised against a local mock server in
//! tests rather than against the real service.

use std::pin::Pin;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;

use crate::node_record::RemoteHandle;

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub stable_id: String,
    pub handle: RemoteHandle,
    pub is_folder: bool,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub file_count: u64,
    pub direct_children_count: u64,
    pub number_of_items: u64,
    /// For a trashed remote file, the path it should be restored to —
    /// used by the reconciler to garbage-collect the matching local file.
    pub restore_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub file_count: u64,
    pub number_of_items: u64,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Error classification surfaced to `remote_tree.rs` for retry/auth
/// handling, grounded in `icloud_tree.py`'s `handle_drive_exception`.
#[derive(Debug)]
pub enum DriveError {
    Auth(String),
    NotFound(String),
    Other(anyhow::Error),
}

impl std::fmt::Display for DriveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveError::Auth(msg) => write!(f, "authentication failed or expired: {msg}"),
            DriveError::NotFound(msg) => write!(f, "not found: {msg}"),
            DriveError::Other(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for DriveError {}

impl From<anyhow::Error> for DriveError {
    fn from(err: anyhow::Error) -> Self {
        DriveError::Other(err)
    }
}

#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn authenticate(&self) -> Result<(), DriveError>;
    async fn root_handle(&self) -> Result<RemoteHandle, DriveError>;
    async fn trash_handle(&self) -> Result<RemoteHandle, DriveError>;
    async fn fetch_children(&self, handle: &RemoteHandle) -> Result<Vec<RemoteEntry>, DriveError>;
    async fn root_counters(&self) -> Result<Counters, DriveError>;
    async fn trash_counters(&self) -> Result<Counters, DriveError>;
    async fn upload(
        &self,
        parent: &RemoteHandle,
        name: &str,
        bytes: Vec<u8>,
        mtime: DateTime<Utc>,
        ctime: DateTime<Utc>,
    ) -> Result<RemoteEntry, DriveError>;
    async fn download_stream(&self, handle: &RemoteHandle) -> Result<ByteStream, DriveError>;
    async fn delete(&self, handle: &RemoteHandle) -> Result<(), DriveError>;
    async fn rename(&self, handle: &RemoteHandle, new_name: &str) -> Result<(), DriveError>;
    async fn move_to(&self, handle: &RemoteHandle, new_parent: &RemoteHandle) -> Result<(), DriveError>;
    async fn mkdir(&self, parent: &RemoteHandle, name: &str) -> Result<RemoteEntry, DriveError>;
}

/// Minimal HTTP transport, matching the teacher's bearer-token
/// `reqwest::Client` shape. `base_url` points at whatever gateway exposes
/// drive semantics over REST; the concrete wire format is intentionally
/// unspecified since the real remote client is out of scope.
pub struct HttpDriveApi {
    client: reqwest::Client,
    base_url: String,
    session_token: tokio::sync::Mutex<Option<String>>,
}

impl HttpDriveApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            session_token: tokio::sync::Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, DriveError> {
        self.session_token
            .lock()
            .await
            .clone()
            .ok_or_else(|| DriveError::Auth("not authenticated".to_string()))
    }

    fn map_status(status: reqwest::StatusCode, body: impl Into<String>) -> DriveError {
        let body = body.into();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            DriveError::Auth(body)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            DriveError::NotFound(body)
        } else {
            DriveError::Other(anyhow!("remote drive request failed ({status}): {body}"))
        }
    }
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn authenticate(&self) -> Result<(), DriveError> {
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        #[derive(serde::Deserialize)]
        struct SessionResponse {
            token: String,
        }
        let session: SessionResponse = resp.json().await.map_err(|e| DriveError::Other(anyhow!(e)))?;
        *self.session_token.lock().await = Some(session.token);
        Ok(())
    }

    async fn root_handle(&self) -> Result<RemoteHandle, DriveError> {
        Ok(RemoteHandle("root".to_string()))
    }

    async fn trash_handle(&self) -> Result<RemoteHandle, DriveError> {
        Ok(RemoteHandle("trash".to_string()))
    }

    async fn fetch_children(&self, handle: &RemoteHandle) -> Result<Vec<RemoteEntry>, DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!("{}/nodes/{}/children", self.base_url, handle.0))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        resp.json::<Vec<RemoteEntry>>()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))
    }

    async fn root_counters(&self) -> Result<Counters, DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!("{}/nodes/root/counters", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        resp.json::<Counters>().await.map_err(|e| DriveError::Other(anyhow!(e)))
    }

    async fn trash_counters(&self) -> Result<Counters, DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!("{}/nodes/trash/counters", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        resp.json::<Counters>().await.map_err(|e| DriveError::Other(anyhow!(e)))
    }

    async fn upload(
        &self,
        parent: &RemoteHandle,
        name: &str,
        data: Vec<u8>,
        mtime: DateTime<Utc>,
        ctime: DateTime<Utc>,
    ) -> Result<RemoteEntry, DriveError> {
        let token = self.bearer().await?;
        let part = reqwest::multipart::Part::bytes(data).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("mtime", mtime.to_rfc3339())
            .text("ctime", ctime.to_rfc3339())
            .part("file", part);
        let resp = self
            .client
            .post(format!("{}/nodes/{}/children", self.base_url, parent.0))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        resp.json::<RemoteEntry>().await.map_err(|e| DriveError::Other(anyhow!(e)))
    }

    async fn download_stream(&self, handle: &RemoteHandle) -> Result<ByteStream, DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!("{}/nodes/{}/content", self.base_url, handle.0))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        use futures_util::TryStreamExt;
        let stream = resp.bytes_stream().map_err(|e| anyhow!(e));
        Ok(Box::pin(stream))
    }

    async fn delete(&self, handle: &RemoteHandle) -> Result<(), DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .delete(format!("{}/nodes/{}", self.base_url, handle.0))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        Ok(())
    }

    async fn rename(&self, handle: &RemoteHandle, new_name: &str) -> Result<(), DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .patch(format!("{}/nodes/{}", self.base_url, handle.0))
            .bearer_auth(token)
            .json(&serde_json::json!({ "name": new_name }))
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        Ok(())
    }

    async fn move_to(&self, handle: &RemoteHandle, new_parent: &RemoteHandle) -> Result<(), DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .patch(format!("{}/nodes/{}", self.base_url, handle.0))
            .bearer_auth(token)
            .json(&serde_json::json!({ "parent": new_parent.0 }))
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        Ok(())
    }

    async fn mkdir(&self, parent: &RemoteHandle, name: &str) -> Result<RemoteEntry, DriveError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .post(format!("{}/nodes/{}/folders", self.base_url, parent.0))
            .bearer_auth(token)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| DriveError::Other(anyhow!(e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }
        resp.json::<RemoteEntry>().await.map_err(|e| DriveError::Other(anyhow!(e)))
    }
}

impl serde::Serialize for Counters {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("Counters", 2)?;
        st.serialize_field("file_count", &self.file_count)?;
        st.serialize_field("number_of_items", &self.number_of_items)?;
        st.end()
    }
}

impl<'de> serde::Deserialize<'de> for Counters {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            file_count: u64,
            number_of_items: u64,
        }
        let raw = Raw::deserialize(d)?;
        Ok(Counters { file_count: raw.file_count, number_of_items: raw.number_of_items })
    }
}

impl serde::Serialize for RemoteEntry {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("RemoteEntry", 10)?;
        st.serialize_field("name", &self.name)?;
        st.serialize_field("stable_id", &self.stable_id)?;
        st.serialize_field("handle", &self.handle.0)?;
        st.serialize_field("is_folder", &self.is_folder)?;
        st.serialize_field("size", &self.size)?;
        st.serialize_field("mtime", &self.mtime)?;
        st.serialize_field("ctime", &self.ctime)?;
        st.serialize_field("file_count", &self.file_count)?;
        st.serialize_field("direct_children_count", &self.direct_children_count)?;
        st.serialize_field("number_of_items", &self.number_of_items)?;
        st.serialize_field("restore_path", &self.restore_path)?;
        st.end()
    }
}

impl<'de> serde::Deserialize<'de> for RemoteEntry {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            name: String,
            stable_id: String,
            handle: String,
            is_folder: bool,
            size: u64,
            mtime: DateTime<Utc>,
            ctime: DateTime<Utc>,
            #[serde(default)]
            file_count: u64,
            #[serde(default)]
            direct_children_count: u64,
            #[serde(default)]
            number_of_items: u64,
            #[serde(default)]
            restore_path: Option<String>,
        }
        let raw = Raw::deserialize(d)?;
        Ok(RemoteEntry {
            name: raw.name,
            stable_id: raw.stable_id,
            handle: RemoteHandle(raw.handle),
            is_folder: raw.is_folder,
            size: raw.size,
            mtime: raw.mtime,
            ctime: raw.ctime,
            file_count: raw.file_count,
            direct_children_count: raw.direct_children_count,
            number_of_items: raw.number_of_items,
            restore_path: raw.restore_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path as AxPath,
        routing::{get, post},
        Json, Router,
    };
    use std::net::SocketAddr;

    async fn session() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "token": "test-token" }))
    }

    async fn counters() -> Json<Counters> {
        Json(Counters { file_count: 3, number_of_items: 3 })
    }

    async fn children(AxPath(_id): AxPath<String>) -> Json<Vec<RemoteEntry>> {
        Json(vec![])
    }

    async fn spawn_mock() -> String {
        let app = Router::new()
            .route("/session", post(session))
            .route("/nodes/root/counters", get(counters))
            .route("/nodes/:id/children", get(children));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn authenticate_and_fetch_round_trip() {
        let base_url = spawn_mock().await;
        let api = HttpDriveApi::new(base_url);
        api.authenticate().await.unwrap();
        let root = api.root_handle().await.unwrap();
        let children = api.fetch_children(&root).await.unwrap();
        assert!(children.is_empty());
        let counters = api.root_counters().await.unwrap();
        assert_eq!(counters.file_count, 3);
    }

    #[tokio::test]
    async fn unauthenticated_calls_fail_without_a_network_round_trip() {
        let api = HttpDriveApi::new("http://127.0.0.1:1".to_string());
        let err = api.root_counters().await.unwrap_err();
        assert!(matches!(err, DriveError::Auth(_)));
    }
}
