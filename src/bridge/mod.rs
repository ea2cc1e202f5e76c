//! Bridge module - Couples the cluster connection to the polling runtime
//!
//! One [`Bridge`] exists per connection and owns every queue, so connection
//! delivery and runtime polls are serialized by ownership rather than locks:
//! - inbound events are drained from the link on each poll (or awaited with
//!   [`Bridge::process_next`])
//! - the runtime pulls one frame per [`Bridge::poll`] call

mod correlator;
mod gate;
mod inject;
mod outbound;
mod poll;
mod traits;

pub use correlator::*;
pub use gate::*;
pub use inject::*;
pub use outbound::*;
pub use poll::*;
pub use traits::*;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::network::{ConnectionEvent, ConnectionLink};
use crate::protocol::{AuthEnvelope, CodecError, Envelope, PacketKind};

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Correlator error: {0}")]
    Correlator(#[from] CorrelatorError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Configuration for a bridge instance
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Packet kind that starts a world load
    pub map_change: Option<PacketKind>,
    /// What may pass while a world loads
    pub policy: DeferralPolicy,
}

/// Per-connection bridge state
pub struct Bridge<R: Runtime> {
    session_id: Uuid,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    outbound: OutboundQueue,
    correlator: CommandCorrelator,
    gate: WorldLoadGate,
    poller: PollBridge,
    injector: BatchInjector,
    runtime: R,
    observer: Box<dyn SessionObserver>,
    closed: Option<String>,
}

impl<R: Runtime> Bridge<R> {
    pub fn new(session_id: Uuid, link: ConnectionLink, runtime: R, config: &BridgeConfig) -> Self {
        let ConnectionLink { events, outbound } = link;
        Self {
            session_id,
            events,
            outbound: OutboundQueue::new(outbound),
            correlator: CommandCorrelator::new(),
            gate: WorldLoadGate::new(
                config.map_change.unwrap_or(PacketKind::MAP_CHANGE),
                config.policy.clone(),
            ),
            poller: PollBridge::new(),
            injector: BatchInjector::new(),
            runtime,
            observer: Box::new(LogObserver),
            closed: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_id_source(mut self, ids: Box<dyn IdSource>) -> Self {
        self.correlator = CommandCorrelator::with_id_source(ids);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Drain every connection event already delivered, without waiting
    pub fn pump(&mut self) -> usize {
        self.injector.replay(&mut self.runtime);
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next connection event and handle it.
    ///
    /// Returns false once the connection task is gone.
    pub async fn process_next(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                tracing::info!(session = %self.session_id, "Connection open");
                if let Err(e) = self.outbound.open() {
                    tracing::warn!("Could not flush queued envelopes: {}", e);
                }
            }
            ConnectionEvent::Message(envelope) => self.dispatch(envelope),
            ConnectionEvent::Closed { reason } => {
                tracing::info!(session = %self.session_id, "Connection closed: {}", reason);
                if self.correlator.outstanding() > 0 {
                    tracing::warn!(
                        "{} commands will never be answered",
                        self.correlator.outstanding()
                    );
                }
                if self.outbound.pending() > 0 {
                    tracing::warn!("Dropping {} envelopes never sent", self.outbound.pending());
                }
                self.outbound.close();
                self.closed = Some(reason);
            }
        }
    }

    /// Route one inbound envelope to its consumer
    pub fn dispatch(&mut self, envelope: Envelope) {
        tracing::debug!("Dispatching {:?}", envelope.op());

        match envelope {
            Envelope::Info { cluster, master } => {
                let mut servers = master;
                servers.extend(cluster);
                match self.injector.inject(&mut self.runtime, servers) {
                    Injection::Delivered(count) => tracing::debug!("Injected {} servers", count),
                    Injection::Cached(count) => tracing::debug!("Holding {} servers for the runtime", count),
                }
            }
            Envelope::ServerResponse {
                id,
                payload,
                success,
            } => {
                self.correlator.resolve(id, payload, success);
            }
            Envelope::Packet { .. } => {
                self.gate.admit_packet(envelope);
            }
            Envelope::Auth(auth) => self.observer.on_auth(&auth),
            Envelope::Chat { message } => self.observer.on_chat(&message),
            Envelope::ServerConnected {
                ref server,
                internal,
                owned,
            } => {
                self.observer.on_server_connected(server, internal, owned);
                self.gate.admit(envelope);
            }
            other => {
                self.gate.admit(other);
            }
        }
    }

    /// Next runtime frame, if any. Valid until the next call.
    pub fn poll(&mut self) -> Option<&[u8]> {
        self.pump();
        self.poller.poll(&mut self.gate)
    }

    /// The runtime finished applying a map change
    pub fn world_ready(&mut self) -> usize {
        self.gate.world_ready()
    }

    /// The runtime's ingestion entry points just became available
    pub fn runtime_ready(&mut self) -> Option<usize> {
        self.injector.replay(&mut self.runtime)
    }

    /// Send a command and get a handle to its eventual response
    pub fn issue(&mut self, text: &str) -> BridgeResult<CommandHandle> {
        let (handle, envelope) = self.correlator.issue(text)?;
        if let Err(e) = self.outbound.send(&envelope) {
            self.correlator.forget(handle.id());
            return Err(e);
        }
        Ok(handle)
    }

    /// Ask the cluster for a private game
    pub fn create_game(&mut self, preset: &str, mode: &str) -> BridgeResult<CommandHandle> {
        self.issue(&format!("creategame {} {}", preset, mode))
    }

    /// Join a server by name; an empty name means the lobby
    pub fn connect_to(&mut self, name: &str) -> BridgeResult<()> {
        let target = if name.is_empty() { "lobby" } else { name };
        self.outbound.send(&Envelope::Connect {
            target: target.to_string(),
        })
    }

    /// Forward a runtime packet to the game server
    pub fn send_packet(&mut self, channel: u16, data: &[u8]) -> BridgeResult<()> {
        self.outbound.send(&Envelope::packet(channel, data.to_vec()))
    }

    /// Leave the current game server
    pub fn disconnect(&mut self) -> BridgeResult<()> {
        self.outbound.send(&Envelope::Disconnect)
    }

    /// Outbound path for the auth collaborator
    pub fn send_auth(&mut self, envelope: AuthEnvelope) -> BridgeResult<()> {
        self.outbound.send(&Envelope::Auth(envelope))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn gate(&self) -> &WorldLoadGate {
        &self.gate
    }

    pub fn poller(&self) -> &PollBridge {
        &self.poller
    }

    pub fn outstanding_commands(&self) -> usize {
        self.correlator.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::correlator::tests::ScriptedIds;
    use super::inject::tests::RecordingRuntime;
    use super::*;
    use crate::network::LinkPeer;
    use crate::protocol::{decode_envelope, enet_event, Op, ServerEntry};
    use std::sync::{Arc, Mutex};

    fn bridge() -> (Bridge<RecordingRuntime>, LinkPeer) {
        let (link, peer) = ConnectionLink::pair();
        let bridge = Bridge::new(
            Uuid::new_v4(),
            link,
            RecordingRuntime::default(),
            &BridgeConfig::default(),
        );
        (bridge, peer)
    }

    fn deliver(peer: &LinkPeer, envelope: Envelope) {
        peer.events.send(ConnectionEvent::Message(envelope)).unwrap();
    }

    fn sent(peer: &mut LinkPeer) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(body) = peer.outbound.try_recv() {
            out.push(decode_envelope(&body).unwrap());
        }
        out
    }

    fn frames(bridge: &mut Bridge<RecordingRuntime>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = bridge.poll() {
            out.push(frame.to_vec());
        }
        out
    }

    fn receive_frame(channel: u16, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&enet_event::RECEIVE.to_le_bytes());
        frame.extend_from_slice(&channel.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    #[derive(Default, Clone)]
    struct SharedObserver(Arc<Mutex<Vec<String>>>);

    impl SessionObserver for SharedObserver {
        fn on_server_connected(&mut self, server: &str, _internal: bool, owned: bool) {
            self.0.lock().unwrap().push(format!("connected {} {}", server, owned));
        }

        fn on_auth(&mut self, envelope: &AuthEnvelope) {
            self.0.lock().unwrap().push(format!("auth {:?}", envelope.op));
        }

        fn on_chat(&mut self, message: &str) {
            self.0.lock().unwrap().push(format!("chat {}", message));
        }
    }

    #[test]
    fn test_sends_wait_for_open() {
        let (mut bridge, mut peer) = bridge();

        bridge.connect_to("").unwrap();
        bridge.send_packet(1, &[5, 1]).unwrap();
        assert!(sent(&mut peer).is_empty());

        peer.events.send(ConnectionEvent::Open).unwrap();
        bridge.pump();
        bridge.disconnect().unwrap();

        assert_eq!(
            sent(&mut peer),
            vec![
                Envelope::Connect { target: "lobby".to_string() },
                Envelope::packet(1, vec![5, 1]),
                Envelope::Disconnect,
            ]
        );
    }

    #[test]
    fn test_command_round_trip() {
        let (bridge, mut peer) = bridge();
        let mut bridge = bridge.with_id_source(Box::new(ScriptedIds::new(&[5, 5, 5, 9])));
        peer.events.send(ConnectionEvent::Open).unwrap();
        bridge.pump();

        let mut first = bridge.create_game("ffa", "complex").unwrap();
        let mut second = bridge.issue("servers").unwrap();
        assert_eq!((first.id(), second.id()), (5, 9));
        assert_eq!(
            sent(&mut peer),
            vec![
                Envelope::Command { text: "creategame ffa complex".to_string(), id: 5 },
                Envelope::Command { text: "servers".to_string(), id: 9 },
            ]
        );

        deliver(&peer, Envelope::ServerResponse { id: 9, payload: "nope".to_string(), success: false });
        deliver(&peer, Envelope::ServerResponse { id: 5, payload: "abc".to_string(), success: true });
        deliver(&peer, Envelope::ServerResponse { id: 77, payload: "stray".to_string(), success: true });
        bridge.pump();

        assert_eq!(first.try_result(), Some(Ok("abc".to_string())));
        assert_eq!(second.try_result(), Some(Err(CommandError::Failed("nope".to_string()))));
        assert_eq!(bridge.outstanding_commands(), 0);
        assert!(bridge.poll().is_none());
    }

    #[test]
    fn test_map_change_scenario() {
        let (link, peer) = ConnectionLink::pair();
        let config = BridgeConfig {
            map_change: None,
            policy: DeferralPolicy::AllowList([PacketKind(4)].into_iter().collect()),
        };
        let mut bridge = Bridge::new(Uuid::new_v4(), link, RecordingRuntime::default(), &config);

        let map_change = [PacketKind::MAP_CHANGE.0 as u8, b'c', b'o', b'm', b'p', 0];
        let allowed = [4u8, 10, 20];
        let held = [PacketKind::SPAWN.0 as u8, 1];

        deliver(&peer, Envelope::packet(1, map_change.to_vec()));
        deliver(&peer, Envelope::packet(0, allowed.to_vec()));
        deliver(&peer, Envelope::packet(1, held.to_vec()));
        bridge.pump();
        assert_eq!(bridge.gate().state(), LoadState::Loading);
        assert_eq!(bridge.gate().deferred_len(), 1);

        assert_eq!(bridge.world_ready(), 1);
        assert_eq!(
            frames(&mut bridge),
            vec![
                receive_frame(1, &map_change),
                receive_frame(0, &allowed),
                receive_frame(1, &held),
            ]
        );
    }

    #[test]
    fn test_frames_held_until_world_ready() {
        let (mut bridge, peer) = bridge();

        deliver(&peer, Envelope::packet(1, vec![PacketKind::MAP_CHANGE.0 as u8]));
        deliver(&peer, Envelope::packet(1, vec![PacketKind::ITEM_LIST.0 as u8]));
        deliver(&peer, Envelope::ServerDisconnected { reason: 3, message: None });

        assert_eq!(frames(&mut bridge).len(), 1);
        assert!(bridge.poll().is_none());

        bridge.world_ready();
        assert_eq!(
            frames(&mut bridge),
            vec![
                receive_frame(1, &[PacketKind::ITEM_LIST.0 as u8]),
                vec![2, 0, 3, 0],
            ]
        );
    }

    #[test]
    fn test_server_connected_notifies_and_queues() {
        let (bridge, peer) = bridge();
        let observer = SharedObserver::default();
        let mut bridge = bridge.with_observer(Box::new(observer.clone()));

        deliver(&peer, Envelope::ServerConnected { server: "ffa-1".to_string(), internal: false, owned: true });
        deliver(&peer, Envelope::Chat { message: "gl hf".to_string() });
        deliver(&peer, Envelope::Auth(AuthEnvelope::new(Op::AuthFailed)));

        assert_eq!(frames(&mut bridge), vec![vec![1, 0]]);
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                "connected ffa-1 true".to_string(),
                "chat gl hf".to_string(),
                "auth AuthFailed".to_string(),
            ]
        );
    }

    #[test]
    fn test_info_cached_until_runtime_ready() {
        let (mut bridge, peer) = bridge();

        deliver(&peer, Envelope::Info {
            cluster: vec![ServerEntry::new("cluster", 1, vec![1])],
            master: vec![ServerEntry::new("master", 2, vec![2])],
        });
        bridge.pump();
        assert!(bridge.runtime().servers.is_empty());

        bridge.runtime_mut().ready = true;
        assert!(bridge.poll().is_none());

        let hosts: Vec<&str> = bridge.runtime().servers.iter().map(|(host, _, _)| host.as_str()).collect();
        assert_eq!(hosts, vec!["master", "cluster"]);
        assert_eq!(bridge.runtime().commands, vec![SORT_COMMAND.to_string()]);
        assert_eq!(bridge.runtime_ready(), None);
    }

    #[test]
    fn test_cached_info_lands_before_fresh_info() {
        let (mut bridge, peer) = bridge();

        deliver(&peer, Envelope::Info {
            cluster: vec![ServerEntry::new("old", 1, vec![])],
            master: vec![],
        });
        bridge.pump();

        bridge.runtime_mut().ready = true;
        deliver(&peer, Envelope::Info {
            cluster: vec![ServerEntry::new("new", 2, vec![])],
            master: vec![],
        });
        bridge.pump();
        bridge.pump();

        let hosts: Vec<&str> = bridge.runtime().servers.iter().map(|(host, _, _)| host.as_str()).collect();
        assert_eq!(hosts, vec!["old", "new"]);
        assert_eq!(bridge.runtime().commands.len(), 2);
        assert_eq!(bridge.runtime_ready(), None);
    }

    #[test]
    fn test_handled_envelopes_skip_loading_gate() {
        let (bridge, peer) = bridge();
        let observer = SharedObserver::default();
        let mut bridge = bridge
            .with_observer(Box::new(observer.clone()))
            .with_id_source(Box::new(ScriptedIds::new(&[31])));
        let mut handle = bridge.issue("whoami").unwrap();

        deliver(&peer, Envelope::packet(1, vec![PacketKind::MAP_CHANGE.0 as u8]));
        deliver(&peer, Envelope::ServerResponse { id: 31, payload: "guest".to_string(), success: true });
        deliver(&peer, Envelope::Chat { message: "loading...".to_string() });
        deliver(&peer, Envelope::Auth(AuthEnvelope::new(Op::AuthFailed)));
        bridge.pump();

        assert_eq!(bridge.gate().state(), LoadState::Loading);
        assert_eq!(bridge.gate().deferred_len(), 0);
        assert_eq!(handle.try_result(), Some(Ok("guest".to_string())));
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec!["chat loading...".to_string(), "auth AuthFailed".to_string()]
        );
        assert_eq!(frames(&mut bridge), vec![receive_frame(1, &[PacketKind::MAP_CHANGE.0 as u8])]);
    }

    #[test]
    fn test_closed_connection_rejects_sends() {
        let (mut bridge, peer) = bridge();
        peer.events.send(ConnectionEvent::Open).unwrap();
        let mut pending = {
            bridge.pump();
            bridge.issue("slow").unwrap()
        };

        peer.events.send(ConnectionEvent::Closed { reason: "bye".to_string() }).unwrap();
        bridge.pump();

        assert!(bridge.is_closed());
        assert_eq!(bridge.close_reason(), Some("bye"));
        assert!(matches!(bridge.disconnect(), Err(BridgeError::ConnectionClosed)));
        assert!(matches!(bridge.issue("late"), Err(BridgeError::ConnectionClosed)));
        assert_eq!(bridge.outstanding_commands(), 1);
        assert!(pending.try_result().is_none());

        drop(bridge);
        assert_eq!(pending.try_result(), Some(Err(CommandError::ConnectionClosed)));
    }

    #[test]
    fn test_auth_goes_out_through_queue() {
        let (mut bridge, mut peer) = bridge();
        let code = AuthEnvelope::new(Op::DiscordCode)
            .with_field("Code", ciborium::Value::Text("oauth-code".to_string()));

        bridge.send_auth(code.clone()).unwrap();
        peer.events.send(ConnectionEvent::Open).unwrap();
        bridge.pump();

        assert_eq!(sent(&mut peer), vec![Envelope::Auth(code)]);
    }

    #[tokio::test]
    async fn test_process_next_resolves_without_polling() {
        let (bridge, peer) = bridge();
        let mut bridge = bridge.with_id_source(Box::new(ScriptedIds::new(&[12])));
        let handle = bridge.issue("ping").unwrap();

        deliver(&peer, Envelope::ServerResponse { id: 12, payload: "pong".to_string(), success: true });
        assert!(bridge.process_next().await);
        assert_eq!(handle.await, Ok("pong".to_string()));

        drop(peer);
        assert!(!bridge.process_next().await);
    }
}
