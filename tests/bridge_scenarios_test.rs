use async_trait::async_trait;
use bridge_core::config::{BridgeConfig, RouteConfig, UserTemplateConfig};
use bridge_core::identity::{IdentityMapper, TemplateIdentityMapper};
use bridge_core::matrix::RoomEvent;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use voip_bridge::Bridge;
use voip_bridge::CallId;
use voip_bridge::matrix::{ChatClient, ChatError, MatrixManager};
use voip_bridge::transport::{Transport, TransportEvent, TransportFactory};
use voip_bridge::verto::VertoManager;

const ALICE: &str = "@alice:example.org";
const PUPPET: &str = "@_voip_5551234:example.org";
const ROOM: &str = "!room:example.org";
const CANDIDATE: &str = "candidate:1 1 UDP 2122252543 10.0.0.1 50000 typ host";

/// The media server end of the control channel. Requests from the bridge
/// are acknowledged immediately and everything sent is handed to the test.
struct FakeMediaServer {
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl Transport for FakeMediaServer {
    async fn send(&self, message: &str) -> Result<(), anyhow::Error> {
        let value: Value = serde_json::from_str(message)?;
        if let (Some(id), Some(method)) = (value.get("id"), value.get("method")) {
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"method": method}});
            self.inbound
                .send(TransportEvent::MessageReceived(reply.to_string()))
                .await?;
        }
        let _ = self.outbound.send(value);
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct FakeFactory {
    parts: Mutex<Option<(Arc<FakeMediaServer>, mpsc::Receiver<TransportEvent>)>>,
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (server, events) = self
            .parts
            .lock()
            .expect("poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("only one connection in tests"))?;
        Ok((server, events))
    }
}

/// A homeserver with one direct room between Alice and the puppet.
#[derive(Default)]
struct FakeHomeserver {
    sent: Mutex<Vec<(String, String, Value)>>,
    rooms: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeHomeserver {
    fn sent(&self, kind: &str) -> Vec<Value> {
        self.sent
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, k, _)| k == kind)
            .map(|(_, _, content)| content.clone())
            .collect()
    }
}

#[async_trait]
impl ChatClient for FakeHomeserver {
    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, ChatError> {
        assert_eq!(as_user, PUPPET);
        assert_eq!(room_id, ROOM);
        self.sent
            .lock()
            .expect("poisoned")
            .push((room_id.to_string(), event_type.to_string(), content));
        Ok("$sent".to_string())
    }

    async fn joined_members(&self, _as_user: &str, room_id: &str) -> Result<Vec<String>, ChatError> {
        Ok(self
            .rooms
            .lock()
            .expect("poisoned")
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn joined_rooms(&self, as_user: &str) -> Result<Vec<String>, ChatError> {
        Ok(self
            .rooms
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == as_user))
            .map(|(room, _)| room.clone())
            .collect())
    }

    async fn create_direct_room(&self, _as_user: &str, _invitee: &str) -> Result<String, ChatError> {
        Err(ChatError::Request("no new rooms in tests".to_string()))
    }

    async fn join_room(&self, _as_user: &str, _room_id: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn leave_room(&self, _as_user: &str, _room_id: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn register_user(&self, _localpart: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn set_display_name(&self, _as_user: &str, _name: &str) -> Result<(), ChatError> {
        Ok(())
    }
}

struct Harness {
    bridge: Arc<Bridge>,
    matrix: Arc<MatrixManager>,
    verto: Arc<VertoManager>,
    homeserver: Arc<FakeHomeserver>,
    to_bridge: mpsc::Sender<TransportEvent>,
    from_bridge: mpsc::UnboundedReceiver<Value>,
    /// Messages already received but not yet expected.
    backlog: VecDeque<Value>,
}

impl Harness {
    async fn start() -> Self {
        let mut config = BridgeConfig::default();
        config.matrix.domain = "example.org".into();
        config.matrix.users = vec![UserTemplateConfig {
            template: "_voip_%REMOTE_ID%".into(),
        }];
        config.homeserver.localpart = "voip".into();
        config.verto.login = "1000@fs.example.org".into();
        config.verto.password = "secret".into();
        config.call.routes = vec![RouteConfig {
            remote: "100".into(),
            user: ALICE.into(),
        }];

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, mut from_bridge) = mpsc::unbounded_channel();
        let server = Arc::new(FakeMediaServer {
            inbound: inbound_tx.clone(),
            outbound: outbound_tx,
        });
        let factory = FakeFactory {
            parts: Mutex::new(Some((server, inbound_rx))),
        };
        let verto = VertoManager::connect(&config, &factory)
            .await
            .expect("login succeeds");
        let login = from_bridge.recv().await.expect("login sent");
        assert_eq!(login["method"], "login");
        assert_eq!(login["params"]["login"], "1000@fs.example.org");

        let homeserver = Arc::new(FakeHomeserver::default());
        homeserver
            .rooms
            .lock()
            .expect("poisoned")
            .insert(ROOM.to_string(), vec![ALICE.to_string(), PUPPET.to_string()]);
        let identities: Arc<dyn IdentityMapper> = Arc::new(
            TemplateIdentityMapper::new("example.org", &config.matrix.users, &config.call.routes)
                .expect("templates are valid"),
        );
        let matrix = MatrixManager::new(&config, homeserver.clone(), identities.clone());
        let bridge = Bridge::new(matrix.clone(), verto.clone(), identities);

        Self {
            bridge,
            matrix,
            verto,
            homeserver,
            to_bridge: inbound_tx,
            from_bridge,
            backlog: VecDeque::new(),
        }
    }

    /// The next message the bridge sends that satisfies `matches`.
    async fn expect(&mut self, what: &str, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&matches) {
            if let Some(message) = self.backlog.remove(pos) {
                return message;
            }
        }
        let (from_bridge, backlog) = (&mut self.from_bridge, &mut self.backlog);
        let wait = async {
            loop {
                let message = from_bridge.recv().await.expect("bridge is connected");
                if matches(&message) {
                    return message;
                }
                backlog.push_back(message);
            }
        };
        timeout(Duration::from_secs(30), wait)
            .await
            .unwrap_or_else(|_| panic!("bridge never sent {what}"))
    }

    async fn expect_method(&mut self, method: &str) -> Value {
        self.expect(method, |m| m["method"] == method).await
    }

    /// Pushes a server request and waits until the bridge has answered it.
    async fn server_request(&mut self, id: u64, method: &str, params: Value) {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.to_bridge
            .send(TransportEvent::MessageReceived(request.to_string()))
            .await
            .expect("bridge is reading");
        let reply = self
            .expect("a reply", |m| m["id"] == id && m.get("method").is_none())
            .await;
        assert_eq!(reply["result"]["method"], method, "request {id} succeeded");
    }

    async fn push(&self, txn_id: &str, events: Vec<Value>) {
        let events = events
            .into_iter()
            .map(|e| serde_json::from_value::<RoomEvent>(e).expect("valid room event"))
            .collect();
        self.matrix.process_transaction(txn_id, events).await;
    }
}

fn room_event(kind: &str, content: Value) -> Value {
    json!({
        "event_id": "$remote",
        "type": kind,
        "room_id": ROOM,
        "sender": ALICE,
        "content": content,
        "unsigned": {"age": 120}
    })
}

fn chat_invite(call_id: &str) -> Value {
    room_event(
        "m.call.invite",
        json!({
            "call_id": call_id,
            "version": 0,
            "lifetime": 60000,
            "offer": {"type": "offer", "sdp": "v=0..."}
        }),
    )
}

fn chat_candidate(call_id: &str) -> Value {
    room_event(
        "m.call.candidates",
        json!({
            "call_id": call_id,
            "version": 0,
            "candidates": [{"candidate": CANDIDATE, "sdpMid": "audio", "sdpMLineIndex": 0}]
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn chat_call_reaches_the_carrier_with_its_candidates() {
    let mut h = Harness::start().await;

    h.push("t1", vec![chat_invite("c1"), chat_candidate("c1")]).await;

    let invite = h.expect_method("verto.invite").await;
    let params = &invite["params"];
    assert_eq!(params["dialogParams"]["callID"], "c1");
    assert_eq!(params["dialogParams"]["destination_number"], "5551234");
    let sdp = params["sdp"].as_str().expect("sdp");
    assert!(sdp.starts_with("v=0..."));
    assert!(sdp.trim_end().ends_with(&format!("a={CANDIDATE}")));
    assert_eq!(h.bridge.calls().len(), 1);

    h.server_request(
        100,
        "verto.answer",
        json!({"callID": "c1", "sdp": "v=0 answer"}),
    )
    .await;
    let answers = h.homeserver.sent("m.call.answer");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["answer"]["sdp"], "v=0 answer");
    assert_eq!(answers[0]["answer"]["type"], "answer");

    let hangup = room_event("m.call.hangup", json!({"call_id": "c1", "version": 0}));
    h.push("t2", vec![hangup]).await;
    let bye = h.expect_method("verto.bye").await;
    assert_eq!(bye["params"]["dialogParams"]["callID"], "c1");
    assert!(h.bridge.calls().is_empty());
    assert!(h.verto.get(&CallId::from("c1")).is_none());
    assert!(h.homeserver.sent("m.call.hangup").is_empty(), "no hangup echoed");
}

#[tokio::test(start_paused = true)]
async fn unroutable_carrier_call_is_rejected_at_once() {
    let mut h = Harness::start().await;

    h.server_request(
        7,
        "verto.invite",
        json!({
            "callID": "c2",
            "sdp": "v=0 offer",
            "caller_id_number": "5551234",
            "callee_id_number": "999"
        }),
    )
    .await;

    let bye = h.expect_method("verto.bye").await;
    assert_eq!(bye["params"]["dialogParams"]["callID"], "c2");
    assert!(h.bridge.calls().is_empty());
    assert!(h.verto.get(&CallId::from("c2")).is_none());
    assert!(h.homeserver.sent("m.call.invite").is_empty());
}

#[tokio::test(start_paused = true)]
async fn replayed_transaction_has_no_further_effect() {
    let mut h = Harness::start().await;

    h.push("t1", vec![chat_invite("c1"), chat_candidate("c1")]).await;
    h.expect_method("verto.invite").await;

    h.push("t1", vec![chat_invite("c1"), chat_candidate("c1")]).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.backlog.is_empty(), "nothing more was sent");
    assert!(h.from_bridge.try_recv().is_err(), "nothing more was sent");
    assert_eq!(h.bridge.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn carrier_call_rings_the_routed_chat_user() {
    let mut h = Harness::start().await;

    h.server_request(
        8,
        "verto.invite",
        json!({
            "callID": "c3",
            "sdp": "v=0 offer",
            "caller_id_number": "5551234",
            "callee_id_number": "100"
        }),
    )
    .await;

    let invites = h.homeserver.sent("m.call.invite");
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0]["call_id"], "c3");
    assert_eq!(invites[0]["offer"]["sdp"], "v=0 offer");
    assert_eq!(invites[0]["lifetime"], 60000);
    assert_eq!(h.bridge.calls().len(), 1);

    let answer = room_event(
        "m.call.answer",
        json!({"call_id": "c3", "version": 0, "answer": {"type": "answer", "sdp": "v=0 chat"}}),
    );
    h.push("t1", vec![answer]).await;
    let answer = h.expect_method("verto.answer").await;
    assert_eq!(answer["params"]["dialogParams"]["callID"], "c3");
    assert_eq!(answer["params"]["sdp"], "v=0 chat");

    h.server_request(
        9,
        "verto.bye",
        json!({"callID": "c3", "cause": "NORMAL_CLEARING"}),
    )
    .await;
    let hangups = h.homeserver.sent("m.call.hangup");
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0]["call_id"], "c3");
    assert!(hangups[0].get("reason").is_none_or(Value::is_null));
    assert!(h.bridge.calls().is_empty());
}
