use bridge_core::config::BridgeConfig;
use bridge_core::endpoint::{CallLifecycle, Endpoint};
use bridge_core::error::BridgeError;
use bridge_core::identity::IdentityMapper;
use bridge_core::matrix::{ROOM_MEMBER, ROOM_MESSAGE, RoomEvent, parse_call_event};
use bridge_core::mxid::MatrixId;
use bridge_core::transaction::TransactionHistory;
use bridge_core::types::{CallId, CallInfo, InviteEvent, Side, SignalingEvent};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;

use super::client::{ChatClient, M_USER_IN_USE};
use super::endpoint::ChatEndpoint;
use crate::reaper::{CallTable, Reaper};

/// Owns the application service's view of the homeserver: pushed
/// transactions, puppet users and every chat endpoint.
pub struct MatrixManager {
    client: Arc<dyn ChatClient>,
    identities: Arc<dyn IdentityMapper>,
    bot_user_id: String,
    history: Mutex<TransactionHistory>,
    endpoints: Arc<CallTable<ChatEndpoint>>,
    provisioned: DashSet<String>,
    lifecycle: RwLock<Option<Weak<dyn CallLifecycle>>>,
}

impl MatrixManager {
    pub fn new(
        config: &BridgeConfig,
        client: Arc<dyn ChatClient>,
        identities: Arc<dyn IdentityMapper>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            identities,
            bot_user_id: config.bot_user_id(),
            history: Mutex::new(TransactionHistory::new(config.call.transaction_history)),
            endpoints: Arc::new(DashMap::new()),
            provisioned: DashSet::new(),
            lifecycle: RwLock::new(None),
        })
    }

    pub fn set_lifecycle(&self, lifecycle: Weak<dyn CallLifecycle>) {
        *self.lifecycle.write().expect("RwLock should not be poisoned") = Some(lifecycle);
    }

    fn lifecycle(&self) -> Option<Arc<dyn CallLifecycle>> {
        self.lifecycle
            .read()
            .expect("RwLock should not be poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<ChatEndpoint>> {
        self.endpoints.get(call_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn new_endpoint(&self, call_id: CallId, room_id: &str, puppet: &str) -> Arc<ChatEndpoint> {
        let endpoint = ChatEndpoint::new(call_id, room_id, puppet, self.client.clone());
        endpoint.add_closed_listener(Reaper::new(&self.endpoints, &endpoint));
        endpoint
    }

    /// Processes one pushed transaction. Transactions are handled one at a
    /// time and a replayed id is acknowledged without side effects.
    pub async fn process_transaction(&self, txn_id: &str, events: Vec<RoomEvent>) {
        let mut history = self.history.lock().await;
        if history.contains(txn_id) {
            info!(target: "Matrix/AS", "Transaction {txn_id} already processed, skipping");
            return;
        }
        debug!(target: "Matrix/AS", "Transaction {txn_id}: {} event(s)", events.len());
        for event in &events {
            self.process_event(event).await;
        }
        history.record(txn_id);
    }

    async fn process_event(&self, event: &RoomEvent) {
        match event.kind.as_str() {
            ROOM_MEMBER => self.on_membership(event).await,
            ROOM_MESSAGE => {
                debug!(target: "Matrix/AS", "Ignoring message in {}", event.room_id);
            }
            _ if event.is_call_event() => self.on_call_event(event).await,
            other => {
                info!(target: "Matrix/AS", "Ignoring {other} event from {}", event.sender);
            }
        }
    }

    async fn on_membership(&self, event: &RoomEvent) {
        let (Some(target), Some(membership)) = (event.state_key.as_deref(), event.membership())
        else {
            return;
        };
        let room_id = event.room_id.as_str();
        info!(target: "Matrix/AS", "Room {room_id}: {membership} for {target}");

        if target == self.bot_user_id {
            if matches!(membership, "invite" | "join") {
                info!(target: "Matrix/AS", "Room {room_id}: the bridge bot does not join rooms, leaving");
                if let Err(e) = self.client.leave_room(target, room_id).await {
                    warn!(target: "Matrix/AS", "Room {room_id}: unable to leave: {e}");
                }
            }
            return;
        }
        if !self.identities.is_puppet(target) {
            return;
        }

        match membership {
            "invite" => {
                if let Err(e) = self.client.join_room(target, room_id).await {
                    info!(target: "Matrix/AS", "Room {room_id}: {target} cannot join, rejecting: {e}");
                    if let Err(e) = self.client.leave_room(target, room_id).await {
                        warn!(target: "Matrix/AS", "Room {room_id}: unable to leave: {e}");
                    }
                }
            }
            "leave" | "ban" => self.close_room(room_id).await,
            _ => {}
        }
    }

    /// Closes every endpoint in a room the puppet is no longer part of.
    async fn close_room(&self, room_id: &str) {
        let endpoints: Vec<Arc<ChatEndpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.value().room_id() == room_id)
            .map(|e| e.value().clone())
            .collect();
        for endpoint in endpoints {
            info!(target: "Matrix/Call", "Call {}: puppet left {room_id}", endpoint.call_id());
            endpoint.close().await;
        }
    }

    async fn on_call_event(&self, event: &RoomEvent) {
        if self.identities.is_puppet(&event.sender) {
            debug!(target: "Matrix/Call", "Ignoring our own {} in {}", event.kind, event.room_id);
            return;
        }
        let call = match parse_call_event(&event.kind, &event.content) {
            Ok(call) => call,
            Err(e) => {
                warn!(target: "Matrix/Call", "Dropping {} from {}: {e}", event.kind, event.sender);
                return;
            }
        };
        let call_id = call.call_id().clone();

        match call {
            SignalingEvent::Invite(invite) => self.on_invite(event, invite).await,
            SignalingEvent::Hangup(hangup) => {
                let removed = self
                    .endpoints
                    .remove_if(&call_id, |_, endpoint| endpoint.room_id() == event.room_id);
                let Some((_, endpoint)) = removed else {
                    info!(target: "Matrix/Call", "Call {call_id}: hangup for unknown call in {}, ignoring", event.room_id);
                    return;
                };
                info!(target: "Matrix/Call", "Call {call_id}: hangup from {}", event.sender);
                endpoint.inject(hangup.into()).await;
                if let Some(lifecycle) = self.lifecycle() {
                    lifecycle.on_call_destroyed(&call_id).await;
                }
            }
            other => match self.get(&call_id) {
                Some(endpoint) if endpoint.room_id() == event.room_id => endpoint.inject(other).await,
                Some(endpoint) => {
                    warn!(
                        target: "Matrix/Call",
                        "Call {call_id}: {} from {} but the call lives in {}, ignoring",
                        other.kind(),
                        event.room_id,
                        endpoint.room_id()
                    );
                }
                None => {
                    warn!(target: "Matrix/Call", "Call {call_id}: {} for unknown call, ignoring", other.kind());
                }
            },
        }
    }

    async fn on_invite(&self, event: &RoomEvent, invite: InviteEvent) {
        let call_id = invite.call_id.clone();
        if let Some(lifetime) = invite.lifetime {
            let age = event.age();
            if age > lifetime {
                info!(target: "Matrix/Call", "Call {call_id}: invite expired ({age} ms old, lifetime {lifetime} ms)");
                return;
            }
        }
        let Some(puppet) = self.room_puppet(&event.room_id).await else {
            return;
        };

        let endpoint = match self.endpoints.entry(call_id.clone()) {
            Entry::Occupied(_) => {
                info!(target: "Matrix/Call", "Call {call_id}: duplicate invite, ignoring");
                return;
            }
            Entry::Vacant(slot) => {
                let endpoint = self.new_endpoint(call_id.clone(), &event.room_id, &puppet);
                slot.insert(endpoint.clone());
                endpoint
            }
        };
        info!(target: "Matrix/Call", "Call {call_id}: {} is calling {puppet}", event.sender);

        let Some(lifecycle) = self.lifecycle() else {
            warn!(target: "Matrix/Call", "Call {call_id}: nobody handles calls, rejecting");
            endpoint.close().await;
            return;
        };
        let info = CallInfo::new(call_id, Side::Chat, &event.room_id, &event.sender, puppet);
        lifecycle.on_call_created(endpoint.clone(), info).await;
        endpoint.inject(invite.into()).await;
    }

    /// The single puppet in a room. Calls in rooms with zero or several
    /// puppets are not bridged.
    async fn room_puppet(&self, room_id: &str) -> Option<String> {
        let members = match self.client.joined_members(&self.bot_user_id, room_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(target: "Matrix/Call", "Room {room_id}: unable to list members: {e}");
                return None;
            }
        };
        let mut puppets = members
            .into_iter()
            .filter(|member| self.identities.is_puppet(member));
        match (puppets.next(), puppets.next()) {
            (Some(puppet), None) => Some(puppet),
            (None, _) => {
                info!(target: "Matrix/Call", "Room {room_id}: no bridged user, ignoring call");
                None
            }
            (Some(_), Some(_)) => {
                info!(target: "Matrix/Call", "Room {room_id}: not a 1:1 chat, ignoring call");
                None
            }
        }
    }

    /// Registers a puppet user and names it after its remote identity.
    async fn provision(&self, user_id: &str, remote_id: &str) -> Result<(), BridgeError> {
        if self.provisioned.contains(user_id) {
            return Ok(());
        }
        let id = MatrixId::parse(user_id)?;
        match self.client.register_user(id.localpart()).await {
            Ok(()) => info!(target: "Matrix/AS", "Registered {user_id} for {remote_id}"),
            Err(e) if e.errcode() == Some(M_USER_IN_USE) => {
                debug!(target: "Matrix/AS", "{user_id} already registered");
            }
            Err(e) => return Err(e.into()),
        }
        self.client
            .set_display_name(user_id, &format!("{remote_id} (Bridge)"))
            .await?;
        self.provisioned.insert(user_id.to_string());
        Ok(())
    }

    /// Answers the homeserver's question whether `user_id` exists, creating
    /// it when it is one of our puppets.
    pub async fn query_user(&self, user_id: &str) -> Result<bool, BridgeError> {
        let remote_id = match self.identities.resolve_remote_identity(user_id) {
            Ok(Some(remote_id)) => remote_id,
            Ok(None) => {
                warn!(target: "Matrix/AS", "Queried about {user_id}, which is not a bridged user");
                return Ok(false);
            }
            Err(e) => {
                warn!(target: "Matrix/AS", "Queried about invalid user {user_id}: {e}");
                return Ok(false);
            }
        };
        self.provision(user_id, &remote_id).await?;
        Ok(true)
    }

    /// Room aliases are never provided by this bridge.
    pub fn query_room(&self, alias: &str) -> bool {
        info!(target: "Matrix/AS", "Room {alias} was requested, but rooms are not bridged");
        false
    }

    /// Returns the endpoint through which the puppet for `caller_remote`
    /// calls `target_user`, reusing an existing 1:1 room when there is one.
    pub async fn direct_channel_endpoint(
        &self,
        caller_remote: &str,
        target_user: &str,
        call_id: &CallId,
    ) -> Result<Arc<ChatEndpoint>, BridgeError> {
        let puppet = self.identities.puppet_for(caller_remote)?;
        self.provision(&puppet, caller_remote).await?;
        let room_id = self.direct_room(&puppet, target_user).await?;

        let endpoint = self
            .endpoints
            .entry(call_id.clone())
            .or_insert_with(|| self.new_endpoint(call_id.clone(), &room_id, &puppet))
            .clone();
        Ok(endpoint)
    }

    async fn direct_room(&self, puppet: &str, target_user: &str) -> Result<String, BridgeError> {
        for room_id in self.client.joined_rooms(puppet).await? {
            let members = match self.client.joined_members(puppet, &room_id).await {
                Ok(members) => members,
                Err(e) => {
                    debug!(target: "Matrix/AS", "Room {room_id}: unable to list members: {e}");
                    continue;
                }
            };
            if members.len() == 2 && members.iter().any(|m| m == target_user) {
                debug!(target: "Matrix/AS", "Found 1:1 room {room_id} with {target_user}");
                return Ok(room_id);
            }
        }
        info!(target: "Matrix/AS", "No 1:1 room between {puppet} and {target_user}, creating one");
        Ok(self.client.create_direct_room(puppet, target_user).await?)
    }
}
