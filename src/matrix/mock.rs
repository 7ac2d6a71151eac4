use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::client::{ChatClient, ChatError, M_USER_IN_USE};

#[derive(Debug, Clone)]
pub struct SentEvent {
    pub sender: String,
    pub room_id: String,
    pub kind: String,
    pub content: Value,
}

/// An in-memory homeserver: rooms with members, and a log of every action.
#[derive(Default)]
pub struct MockChatClient {
    pub sent: Mutex<Vec<SentEvent>>,
    pub actions: Mutex<Vec<String>>,
    members: Mutex<HashMap<String, Vec<String>>>,
    registered: Mutex<Vec<String>>,
    rooms_created: AtomicUsize,
    pub fail_sends: AtomicBool,
    pub fail_joins: AtomicBool,
}

impl MockChatClient {
    pub fn with_room(self, room_id: &str, members: &[&str]) -> Self {
        self.members.lock().expect("poisoned").insert(
            room_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("poisoned")
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().expect("poisoned").clone()
    }

    fn act(&self, action: String) {
        self.actions.lock().expect("poisoned").push(action);
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ChatError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Request("connection refused".into()));
        }
        let mut sent = self.sent.lock().expect("poisoned");
        sent.push(SentEvent {
            sender: as_user.to_string(),
            room_id: room_id.to_string(),
            kind: event_type.to_string(),
            content,
        });
        Ok(format!("$event{}", sent.len()))
    }

    async fn joined_members(&self, _as_user: &str, room_id: &str) -> Result<Vec<String>, ChatError> {
        self.members
            .lock()
            .expect("poisoned")
            .get(room_id)
            .cloned()
            .ok_or_else(|| ChatError::Http {
                status: 403,
                errcode: "M_FORBIDDEN".into(),
                error: "not in room".into(),
            })
    }

    async fn joined_rooms(&self, as_user: &str) -> Result<Vec<String>, ChatError> {
        let mut rooms: Vec<String> = self
            .members
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == as_user))
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn create_direct_room(&self, as_user: &str, invitee: &str) -> Result<String, ChatError> {
        let n = self.rooms_created.fetch_add(1, Ordering::SeqCst) + 1;
        let room_id = format!("!dm{n}:example.org");
        self.members
            .lock()
            .expect("poisoned")
            .insert(room_id.clone(), vec![as_user.to_string()]);
        self.act(format!("create {as_user} {invitee}"));
        Ok(room_id)
    }

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError> {
        self.act(format!("join {as_user} {room_id}"));
        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(ChatError::Request("join refused".into()));
        }
        let mut members = self.members.lock().expect("poisoned");
        let room = members.entry(room_id.to_string()).or_default();
        if !room.iter().any(|m| m == as_user) {
            room.push(as_user.to_string());
        }
        Ok(())
    }

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), ChatError> {
        self.act(format!("leave {as_user} {room_id}"));
        if let Some(members) = self.members.lock().expect("poisoned").get_mut(room_id) {
            members.retain(|m| m != as_user);
        }
        Ok(())
    }

    async fn register_user(&self, localpart: &str) -> Result<(), ChatError> {
        let mut registered = self.registered.lock().expect("poisoned");
        if registered.iter().any(|r| r == localpart) {
            return Err(ChatError::Http {
                status: 400,
                errcode: M_USER_IN_USE.into(),
                error: "taken".into(),
            });
        }
        registered.push(localpart.to_string());
        self.act(format!("register {localpart}"));
        Ok(())
    }

    async fn set_display_name(&self, as_user: &str, name: &str) -> Result<(), ChatError> {
        self.act(format!("displayname {as_user} {name}"));
        Ok(())
    }
}
