use async_trait::async_trait;
use bridge_core::endpoint::{ClosedListener, Endpoint, SignalingListener};
use bridge_core::types::{CallId, CallInfo, Side, SignalingEvent};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::reaper::{CallTable, Reaper};

type Legs = (Arc<dyn Endpoint>, Arc<dyn Endpoint>);

/// A bridged call: two endpoints relaying signaling to each other until
/// either side hangs up or closes.
pub struct Call {
    info: CallInfo,
    /// Chat leg first, VoIP leg second. `None` once terminated.
    legs: Mutex<Option<Legs>>,
}

struct Relay {
    call: Weak<Call>,
    from: Side,
}

#[async_trait]
impl SignalingListener for Relay {
    async fn on_signal(&self, event: SignalingEvent) -> anyhow::Result<()> {
        if let Some(call) = self.call.upgrade() {
            call.relay(self.from, event).await;
        }
        Ok(())
    }
}

struct Terminator {
    call: Weak<Call>,
}

#[async_trait]
impl ClosedListener for Terminator {
    async fn on_closed(&self, _call_id: &CallId) {
        if let Some(call) = self.call.upgrade() {
            call.terminate(None).await;
        }
    }
}

impl Call {
    /// Binds both legs and subscribes to their signaling and close events.
    pub fn new(info: CallInfo, chat: Arc<dyn Endpoint>, voip: Arc<dyn Endpoint>) -> Arc<Self> {
        let call = Arc::new(Self {
            info,
            legs: Mutex::new(Some((chat.clone(), voip.clone()))),
        });
        for (leg, side) in [(&chat, Side::Chat), (&voip, Side::Voip)] {
            leg.add_signal_listener(Arc::new(Relay {
                call: Arc::downgrade(&call),
                from: side,
            }));
            leg.add_closed_listener(Arc::new(Terminator {
                call: Arc::downgrade(&call),
            }));
        }
        call
    }

    pub fn call_id(&self) -> &CallId {
        &self.info.call_id
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn is_terminated(&self) -> bool {
        self.legs
            .lock()
            .expect("Mutex should not be poisoned")
            .is_none()
    }

    fn peer(&self, from: Side) -> Option<Arc<dyn Endpoint>> {
        let legs = self.legs.lock().expect("Mutex should not be poisoned");
        legs.as_ref().map(|(chat, voip)| match from {
            Side::Chat => voip.clone(),
            Side::Voip => chat.clone(),
        })
    }

    async fn relay(&self, from: Side, event: SignalingEvent) {
        let Some(peer) = self.peer(from) else {
            debug!(target: "Bridge/Call", "Call {}: dropping {} after termination", self.call_id(), event.kind());
            return;
        };
        debug!(target: "Bridge/Call", "Call {}: {from} -> {}", self.call_id(), event.kind());
        let hangup = match &event {
            SignalingEvent::Hangup(h) => Some(h.reason.clone()),
            _ => None,
        };
        peer.handle(event).await;
        if let Some(reason) = hangup {
            self.terminate(reason).await;
        }
    }

    /// Closes both legs. Only the first call has any effect.
    pub async fn terminate(&self, reason: Option<String>) {
        let Some((chat, voip)) = self
            .legs
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        else {
            return;
        };
        info!(
            target: "Bridge/Call",
            "Call {}: terminating ({})",
            self.call_id(),
            reason.as_deref().unwrap_or("normal")
        );
        chat.close().await;
        voip.close().await;
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("info", &self.info)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// The bridged calls, keyed by call id.
#[derive(Default)]
pub struct CallRegistry {
    calls: Arc<CallTable<Call>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Bridges two legs under `info.call_id`. A call already registered
    /// under that id is returned as `Err` and nothing is subscribed.
    ///
    /// A leg that closed before it was bound never notifies the new call, so
    /// such a call is terminated and dropped here. The returned call is then
    /// already terminated.
    pub async fn register(
        &self,
        info: CallInfo,
        chat: Arc<dyn Endpoint>,
        voip: Arc<dyn Endpoint>,
    ) -> Result<Arc<Call>, Arc<Call>> {
        let call = match self.calls.entry(info.call_id.clone()) {
            Entry::Occupied(existing) => return Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                let call = Call::new(info, chat.clone(), voip.clone());
                chat.add_closed_listener(Reaper::new(&self.calls, &call));
                voip.add_closed_listener(Reaper::new(&self.calls, &call));
                slot.insert(call.clone());
                call
            }
        };

        if chat.is_closed() || voip.is_closed() {
            info!(target: "Bridge/Call", "Call {}: a leg closed before it was bridged", call.call_id());
            self.calls
                .remove_if(call.call_id(), |_, current| Arc::ptr_eq(current, &call));
            call.terminate(Some("leg closed before bridging".to_string()))
                .await;
        }
        Ok(call)
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls.get(call_id).map(|c| c.value().clone())
    }

    pub fn remove(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls.remove(call_id).map(|(_, call)| call)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn calls(&self) -> Vec<Arc<Call>> {
        self.calls.iter().map(|c| c.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::endpoint::EndpointCore;
    use bridge_core::types::{AnswerEvent, CandidatesEvent, HangupEvent, InviteEvent};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// An endpoint that records what it is asked to do.
    pub(crate) struct MockEndpoint {
        core: EndpointCore,
        pub handled: Mutex<Vec<String>>,
        closed: AtomicBool,
        pub closes: AtomicUsize,
    }

    impl MockEndpoint {
        pub(crate) fn new(call_id: &str) -> Arc<Self> {
            Arc::new(Self {
                core: EndpointCore::new(call_id.into(), "channel", "user"),
                handled: Mutex::new(Vec::new()),
                closed: Default::default(),
                closes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn handled(&self) -> Vec<String> {
            self.handled.lock().expect("poisoned").clone()
        }

        fn record(&self, what: &str) {
            if !self.is_closed() {
                self.handled.lock().expect("poisoned").push(what.to_string());
            }
        }
    }

    #[async_trait]
    impl Endpoint for MockEndpoint {
        fn core(&self) -> &EndpointCore {
            &self.core
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn handle_invite(&self, _event: InviteEvent) {
            self.record("invite");
        }

        async fn handle_candidates(&self, _event: CandidatesEvent) {
            self.record("candidates");
        }

        async fn handle_answer(&self, _event: AnswerEvent) {
            self.record("answer");
        }

        async fn handle_hangup(&self, _event: HangupEvent) {
            self.record("hangup");
        }

        async fn close(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.core.fire_closed().await;
        }
    }

    fn info(call_id: &str) -> CallInfo {
        CallInfo::new(
            call_id.into(),
            Side::Chat,
            "!room:example.org",
            "@alice:example.org",
            "@_voip_1:example.org",
        )
    }

    #[tokio::test]
    async fn relays_signaling_both_ways() {
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        let _call = Call::new(info("c1"), chat.clone(), voip.clone());

        chat.core()
            .fire_signal(InviteEvent::new("c1".into(), "v=0", 60000).into())
            .await;
        chat.core()
            .fire_signal(CandidatesEvent::new("c1".into(), Vec::new()).into())
            .await;
        voip.core()
            .fire_signal(AnswerEvent::new("c1".into(), "v=0").into())
            .await;

        assert_eq!(voip.handled(), vec!["invite", "candidates"]);
        assert_eq!(chat.handled(), vec!["answer"]);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        let call = Call::new(info("c1"), chat.clone(), voip.clone());

        call.terminate(None).await;
        call.terminate(Some("again".into())).await;

        assert!(call.is_terminated());
        assert_eq!(chat.closes.load(Ordering::SeqCst), 1);
        assert_eq!(voip.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hangup_is_relayed_before_both_legs_close() {
        for from_chat in [true, false] {
            let chat = MockEndpoint::new("c1");
            let voip = MockEndpoint::new("c1");
            let call = Call::new(info("c1"), chat.clone(), voip.clone());
            let (from, to) = if from_chat { (&chat, &voip) } else { (&voip, &chat) };

            from.core().fire_hangup(Some("busy".into())).await;

            assert_eq!(to.handled(), vec!["hangup"]);
            assert!(call.is_terminated());
            assert_eq!(chat.closes.load(Ordering::SeqCst), 1);
            assert_eq!(voip.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn closing_one_leg_closes_the_other() {
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        let registry = CallRegistry::new();
        registry
            .register(info("c1"), chat.clone(), voip.clone())
            .await
            .expect("registered");

        voip.close().await;

        assert_eq!(chat.closes.load(Ordering::SeqCst), 1);
        assert!(chat.handled().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registry_never_holds_two_calls_for_one_id() {
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        let registry = CallRegistry::new();

        let first = registry
            .register(info("c1"), chat.clone(), voip.clone())
            .await
            .expect("registered");
        let existing = registry
            .register(info("c1"), chat.clone(), voip.clone())
            .await
            .expect_err("already registered");
        assert!(Arc::ptr_eq(&first, &existing));
        assert_eq!(registry.len(), 1);

        chat.core()
            .fire_signal(AnswerEvent::new("c1".into(), "v=0").into())
            .await;
        assert_eq!(voip.handled(), vec!["answer"], "relayed exactly once");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_bridge_one_call() {
        let registry = Arc::new(CallRegistry::new());
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (registry, barrier) = (registry.clone(), barrier.clone());
                let (chat, voip) = (chat.clone(), voip.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.register(info("c1"), chat, voip).await
                })
            })
            .collect();

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for task in tasks {
            match task.await.expect("task completes") {
                Ok(call) => winners.push(call),
                Err(existing) => losers.push(existing),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(losers.len(), 7);
        assert!(losers.iter().all(|call| Arc::ptr_eq(call, &winners[0])));
        assert_eq!(registry.len(), 1);

        chat.core()
            .fire_signal(AnswerEvent::new("c1".into(), "v=0").into())
            .await;
        assert_eq!(voip.handled(), vec!["answer"], "one relay subscribed");
    }

    #[tokio::test]
    async fn leg_closed_before_binding_terminates_the_call() {
        let registry = CallRegistry::new();
        let chat = MockEndpoint::new("c1");
        let voip = MockEndpoint::new("c1");
        voip.close().await;

        let call = registry
            .register(info("c1"), chat.clone(), voip.clone())
            .await
            .expect("no other call");

        assert!(call.is_terminated());
        assert_eq!(chat.closes.load(Ordering::SeqCst), 1);
        assert_eq!(voip.closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stale_call_does_not_remove_its_successor() {
        let registry = CallRegistry::new();
        let (chat, voip) = (MockEndpoint::new("c1"), MockEndpoint::new("c1"));
        let first = registry
            .register(info("c1"), chat.clone(), voip.clone())
            .await
            .expect("registered");
        registry.remove(&"c1".into());

        let (chat2, voip2) = (MockEndpoint::new("c1"), MockEndpoint::new("c1"));
        let second = registry
            .register(info("c1"), chat2, voip2)
            .await
            .expect("registered");

        first.terminate(None).await;
        let current = registry.get(&"c1".into()).expect("successor kept");
        assert!(Arc::ptr_eq(&current, &second));
    }
}
