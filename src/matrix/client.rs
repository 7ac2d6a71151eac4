use async_trait::async_trait;
use bridge_core::error::BridgeError;
use bridge_core::net::{HttpClient, HttpRequest, HttpResponse};
use log::debug;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const M_USER_IN_USE: &str = "M_USER_IN_USE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("homeserver returned {status}: {errcode} {error}")]
    Http {
        status: u16,
        errcode: String,
        error: String,
    },
    #[error("request failed: {0}")]
    Request(String),
    #[error("malformed homeserver response: {0}")]
    Malformed(String),
}

impl ChatError {
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Http { errcode, .. } => Some(errcode),
            _ => None,
        }
    }
}

impl From<ChatError> for BridgeError {
    fn from(e: ChatError) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

/// The client-server API calls the bridge makes, always as a specific user.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends a room event and returns its event id.
    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ChatError>;

    async fn joined_members(&self, as_user: &str, room_id: &str) -> Result<Vec<String>, ChatError>;

    async fn joined_rooms(&self, as_user: &str) -> Result<Vec<String>, ChatError>;

    /// Creates a direct chat with `invitee` and returns the room id.
    async fn create_direct_room(&self, as_user: &str, invitee: &str) -> Result<String, ChatError>;

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError>;

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError>;

    /// Registers a user in the application service namespace.
    async fn register_user(&self, localpart: &str) -> Result<(), ChatError>;

    async fn set_display_name(&self, as_user: &str, name: &str) -> Result<(), ChatError>;
}

/// [`ChatClient`] speaking to a homeserver with the application service token.
pub struct HomeserverClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    as_token: String,
    txn_prefix: String,
    txn_counter: AtomicU64,
}

impl HomeserverClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: &str, as_token: impl Into<String>) -> Self {
        let random: [u8; 4] = rand::random();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            as_token: as_token.into(),
            txn_prefix: format!(
                "{}.{}",
                chrono::Utc::now().timestamp_millis(),
                hex::encode(random)
            ),
            txn_counter: AtomicU64::new(0),
        }
    }

    fn next_txn_id(&self) -> String {
        let count = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.txn_prefix, count)
    }

    fn url(&self, path: &str, as_user: &str) -> String {
        format!(
            "{}/_matrix/client/v3{}?user_id={}",
            self.base_url,
            path,
            urlencoding::encode(as_user)
        )
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        request.with_header("Authorization", format!("Bearer {}", self.as_token))
    }

    async fn execute(&self, request: HttpRequest) -> Result<Value, ChatError> {
        debug!(target: "Matrix/HTTP", "--> {} {}", request.method, request.url);
        let response = self
            .http
            .execute(self.authorized(request))
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;
        check(response)
    }
}

fn check(response: HttpResponse) -> Result<Value, ChatError> {
    let body = response.json().unwrap_or(Value::Null);
    if response.is_success() {
        return Ok(body);
    }
    Err(ChatError::Http {
        status: response.status_code,
        errcode: body
            .get("errcode")
            .and_then(Value::as_str)
            .unwrap_or("M_UNKNOWN")
            .to_string(),
        error: body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn room_path(room_id: &str, rest: &str) -> String {
    format!("/rooms/{}/{}", urlencoding::encode(room_id), rest)
}

#[async_trait]
impl ChatClient for HomeserverClient {
    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ChatError> {
        let path = room_path(
            room_id,
            &format!(
                "send/{}/{}",
                urlencoding::encode(event_type),
                urlencoding::encode(&self.next_txn_id())
            ),
        );
        let body = self
            .execute(HttpRequest::put(self.url(&path, as_user)).with_json(&content))
            .await?;
        body.get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Malformed("send response without event_id".to_string()))
    }

    async fn joined_members(&self, as_user: &str, room_id: &str) -> Result<Vec<String>, ChatError> {
        let path = room_path(room_id, "joined_members");
        let body = self.execute(HttpRequest::get(self.url(&path, as_user))).await?;
        let joined = body
            .get("joined")
            .and_then(Value::as_object)
            .ok_or_else(|| ChatError::Malformed("joined_members without joined".to_string()))?;
        Ok(joined.keys().cloned().collect())
    }

    async fn joined_rooms(&self, as_user: &str) -> Result<Vec<String>, ChatError> {
        let body = self
            .execute(HttpRequest::get(self.url("/joined_rooms", as_user)))
            .await?;
        let rooms = body
            .get("joined_rooms")
            .and_then(Value::as_array)
            .ok_or_else(|| ChatError::Malformed("joined_rooms without joined_rooms".to_string()))?;
        Ok(rooms
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    async fn create_direct_room(&self, as_user: &str, invitee: &str) -> Result<String, ChatError> {
        let content = json!({
            "is_direct": true,
            "preset": "trusted_private_chat",
            "invite": [invitee],
        });
        let body = self
            .execute(HttpRequest::post(self.url("/createRoom", as_user)).with_json(&content))
            .await?;
        body.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Malformed("createRoom response without room_id".to_string()))
    }

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError> {
        let path = room_path(room_id, "join");
        self.execute(HttpRequest::post(self.url(&path, as_user)).with_json(&json!({})))
            .await?;
        Ok(())
    }

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError> {
        let path = room_path(room_id, "leave");
        self.execute(HttpRequest::post(self.url(&path, as_user)).with_json(&json!({})))
            .await?;
        Ok(())
    }

    async fn register_user(&self, localpart: &str) -> Result<(), ChatError> {
        let content = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        let url = format!("{}/_matrix/client/v3/register", self.base_url);
        self.execute(HttpRequest::post(url).with_json(&content)).await?;
        Ok(())
    }

    async fn set_display_name(&self, as_user: &str, name: &str) -> Result<(), ChatError> {
        let path = format!("/profile/{}/displayname", urlencoding::encode(as_user));
        self.execute(HttpRequest::put(self.url(&path, as_user)).with_json(&json!({ "displayname": name })))
            .await?;
        Ok(())
    }
}
