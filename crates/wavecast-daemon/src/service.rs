//! Audio session service
//!
//! One actor task owns the signaling connection and whichever role is active
//! (observer, host or client). Commands arrive over an mpsc channel with a
//! oneshot reply; socket, peer and timer callbacks are posted to the same
//! loop, so session state is only ever touched from that task.
//!
//! ```text
//!  SessionHandle ──commands──▶ ┌──────────────────────┐ ──watch──▶ status
//!  SignalingClient ──events──▶ │ AudioSessionService  │
//!  PeerLink ─────────events──▶ │  Role::Host(..)      │
//!  start timers ─────events──▶ │  Role::Client(..)    │
//!                              └──────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use wavecast_core::{
    normalize_optional, normalize_or, CaptureSource, ClientSessionStatus, ClientState,
    DiscoveredHost, HostSessionStatus, HostState, PeerRole, SessionConfig, SessionError,
    DEFAULT_ROOM,
};
use wavecast_signal::messages::{Hello, HostMetaUpdate};
use wavecast_signal::SignalMessage;

use crate::capture::{capture_host_audio, CaptureDevice};
use crate::client::{ClientSession, StartTimer};
use crate::host::HostSession;
use crate::peer::{PeerEnvelope, PeerEvents, PeerFactory, RtcPeerFactory};
use crate::signaling::{SignalingClient, SignalingEnvelope, SignalingEvent, SignalingEvents};
use crate::sink::SinkFactory;

const COMMAND_BUFFER: usize = 32;

const MIN_TICK: Duration = Duration::from_millis(10);

const DEFAULT_HOST_NAME: &str = "Host";
const DEFAULT_CLIENT_NAME: &str = "Client";
const OBSERVER_NAME: &str = "observer";

#[derive(Debug, Clone)]
pub struct StartHostOptions {
    /// Falls back to the configured signaling URL
    pub signaling_url: Option<String>,
    pub room_id: String,
    pub name: String,
    pub source: CaptureSource,
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectClientOptions {
    pub signaling_url: Option<String>,
    pub room_id: String,
    pub host_id: String,
    pub name: String,
}

/// Platform pieces the service drives
#[derive(Clone)]
pub struct SessionBackends {
    pub peers: Arc<dyn PeerFactory>,
    pub capture: Arc<dyn CaptureDevice>,
    pub sinks: SinkFactory,
}

impl SessionBackends {
    /// WebRTC transport over the given capture device and sinks
    pub fn webrtc(
        config: &SessionConfig,
        capture: Arc<dyn CaptureDevice>,
        sinks: SinkFactory,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())?),
            capture,
            sinks,
        })
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    StartDiscovery {
        signaling_url: Option<String>,
        reply: Reply<()>,
    },
    RefreshHosts,
    StopDiscovery {
        reply: Reply<()>,
    },
    StartHost {
        options: StartHostOptions,
        reply: Reply<()>,
    },
    ConnectClient {
        options: ConnectClientOptions,
        reply: Reply<()>,
    },
    UpdateHostMetadata {
        name: String,
        room_id: String,
        address: Option<String>,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
}

/// Cloneable front end to a running [`AudioSessionService`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    host_status: watch::Receiver<HostSessionStatus>,
    client_status: watch::Receiver<ClientSessionStatus>,
    hosts: watch::Receiver<Vec<DiscoveredHost>>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        response.await.map_err(|_| SessionError::ServiceStopped)?
    }

    /// Observe hosts without hosting or listening; no-op while in a session
    pub async fn start_discovery(&self, signaling_url: Option<&str>) -> Result<(), SessionError> {
        let signaling_url = signaling_url.map(str::to_string);
        self.request(|reply| Command::StartDiscovery {
            signaling_url,
            reply,
        })
        .await
    }

    pub async fn refresh_hosts(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::RefreshHosts)
            .await
            .map_err(|_| SessionError::ServiceStopped)
    }

    pub async fn stop_discovery(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopDiscovery { reply }).await
    }

    pub async fn start_host(&self, options: StartHostOptions) -> Result<(), SessionError> {
        self.request(|reply| Command::StartHost { options, reply })
            .await
    }

    pub async fn connect_client(&self, options: ConnectClientOptions) -> Result<(), SessionError> {
        self.request(|reply| Command::ConnectClient { options, reply })
            .await
    }

    pub async fn update_host_metadata(
        &self,
        name: &str,
        room_id: &str,
        address: Option<&str>,
    ) -> Result<(), SessionError> {
        let (name, room_id) = (name.to_string(), room_id.to_string());
        let address = address.map(str::to_string);
        self.request(|reply| Command::UpdateHostMetadata {
            name,
            room_id,
            address,
            reply,
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn host_status(&self) -> watch::Receiver<HostSessionStatus> {
        self.host_status.clone()
    }

    pub fn client_status(&self) -> watch::Receiver<ClientSessionStatus> {
        self.client_status.clone()
    }

    pub fn hosts(&self) -> watch::Receiver<Vec<DiscoveredHost>> {
        self.hosts.clone()
    }
}

enum Role {
    Idle,
    Observer,
    Host(HostSession),
    Client(ClientSession),
}

/// Publish only real changes so watchers are not woken for nothing
fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

fn host_error(err: &SessionError) -> HostSessionStatus {
    HostSessionStatus {
        state: HostState::Error,
        message: err.to_string(),
        error: Some(err.to_string()),
        ..HostSessionStatus::idle()
    }
}

fn client_error(host_id: Option<String>, err: &SessionError) -> ClientSessionStatus {
    ClientSessionStatus {
        state: ClientState::Error,
        host_id,
        message: err.to_string(),
        error: Some(err.to_string()),
        ..ClientSessionStatus::idle()
    }
}

pub struct AudioSessionService {
    config: SessionConfig,
    backends: SessionBackends,
    signaling: Option<SignalingClient>,
    epoch: u64,
    client_id: Option<String>,
    role: Role,
    signal_tx: SignalingEvents,
    peer_tx: PeerEvents,
    timer_tx: mpsc::UnboundedSender<StartTimer>,
    host_status: watch::Sender<HostSessionStatus>,
    client_status: watch::Sender<ClientSessionStatus>,
    hosts: watch::Sender<Vec<DiscoveredHost>>,
}

impl AudioSessionService {
    /// Start the service task and return its handle
    pub fn spawn(config: SessionConfig, backends: SessionBackends) -> SessionHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (host_status, host_status_rx) = watch::channel(HostSessionStatus::idle());
        let (client_status, client_status_rx) = watch::channel(ClientSessionStatus::idle());
        let (hosts, hosts_rx) = watch::channel(Vec::new());

        let service = Self {
            config,
            backends,
            signaling: None,
            epoch: 0,
            client_id: None,
            role: Role::Idle,
            signal_tx,
            peer_tx,
            timer_tx,
            host_status,
            client_status,
            hosts,
        };
        tokio::spawn(service.run(command_rx, signal_rx, peer_rx, timer_rx));

        SessionHandle {
            commands,
            host_status: host_status_rx,
            client_status: client_status_rx,
            hosts: hosts_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signal_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEnvelope>,
        mut timer_rx: mpsc::UnboundedReceiver<StartTimer>,
    ) {
        let mut beacon = interval(self.config.clock_beacon_interval().max(MIN_TICK));
        beacon.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = interval(self.config.stats_interval().max(MIN_TICK));
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = signal_rx.recv() => self.handle_signaling(envelope).await,
                Some(envelope) = peer_rx.recv() => self.handle_peer(envelope).await,
                Some(timer) = timer_rx.recv() => {
                    if let Role::Client(client) = &mut self.role {
                        client.on_start_timer(timer);
                    }
                    self.publish_role();
                }
                _ = beacon.tick(), if matches!(self.role, Role::Host(_)) => {
                    if let Role::Host(host) = &mut self.role {
                        host.beacon().await;
                    }
                }
                _ = stats.tick(), if matches!(self.role, Role::Client(_)) => {
                    if let Role::Client(client) = &mut self.role {
                        client.poll_stats().await;
                    }
                    self.publish_role();
                }
            }
        }

        debug!("Session service shutting down");
        self.stop_all().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartDiscovery {
                signaling_url,
                reply,
            } => {
                let result = self.start_discovery(signaling_url).await;
                let _ = reply.send(result);
            }
            Command::RefreshHosts => self.send(&SignalMessage::HostsRequest),
            Command::StopDiscovery { reply } => {
                if matches!(self.role, Role::Observer) {
                    self.close_signaling();
                    self.role = Role::Idle;
                    publish(&self.hosts, Vec::new());
                }
                let _ = reply.send(Ok(()));
            }
            Command::StartHost { options, reply } => {
                let result = self.start_host(options).await;
                let _ = reply.send(result);
            }
            Command::ConnectClient { options, reply } => {
                let result = self.connect_client(options).await;
                let _ = reply.send(result);
            }
            Command::UpdateHostMetadata {
                name,
                room_id,
                address,
                reply,
            } => {
                self.update_host_metadata(&name, &room_id, address.as_deref());
                let _ = reply.send(Ok(()));
            }
            Command::Stop { reply } => {
                self.stop_all().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn signaling_url(&self, requested: Option<&str>) -> String {
        normalize_optional(requested).unwrap_or_else(|| self.config.signaling_url.clone())
    }

    async fn open_signaling(&mut self, url: &str) -> Result<(), SessionError> {
        self.close_signaling();
        self.epoch += 1;
        let client = SignalingClient::connect(
            url,
            self.epoch,
            self.config.connect_timeout(),
            self.signal_tx.clone(),
        )
        .await?;
        self.signaling = Some(client);
        Ok(())
    }

    fn close_signaling(&mut self) {
        if let Some(signaling) = self.signaling.take() {
            signaling.close();
        }
        self.client_id = None;
    }

    fn send(&self, msg: &SignalMessage) {
        match &self.signaling {
            Some(signaling) => signaling.send(msg),
            None => debug!("No signaling connection, dropping {}", msg.kind()),
        }
    }

    fn send_all(&self, messages: Vec<SignalMessage>) {
        for msg in &messages {
            self.send(msg);
        }
    }

    async fn start_discovery(&mut self, signaling_url: Option<String>) -> Result<(), SessionError> {
        if matches!(self.role, Role::Host(_) | Role::Client(_)) {
            debug!("Discovery ignored while in a session");
            return Ok(());
        }

        let url = self.signaling_url(signaling_url.as_deref());
        if let (Role::Observer, Some(signaling)) = (&self.role, &self.signaling) {
            if signaling.url() == url && signaling.is_open() {
                self.send(&SignalMessage::HostsRequest);
                return Ok(());
            }
        }

        self.role = Role::Idle;
        self.open_signaling(&url).await?;
        self.send(&SignalMessage::Hello(Hello {
            role: Some(PeerRole::Observer),
            room_id: Some(DEFAULT_ROOM.to_string()),
            name: Some(OBSERVER_NAME.to_string()),
            ..Hello::default()
        }));
        self.send(&SignalMessage::HostsRequest);
        self.role = Role::Observer;
        info!("Discovering hosts via {}", url);
        Ok(())
    }

    async fn start_host(&mut self, options: StartHostOptions) -> Result<(), SessionError> {
        self.stop_all().await;

        let room_id = normalize_or(&options.room_id, DEFAULT_ROOM);
        let name = normalize_or(&options.name, DEFAULT_HOST_NAME);
        let address = normalize_optional(options.address.as_deref());

        publish(
            &self.host_status,
            HostSessionStatus {
                state: HostState::Starting,
                message: "Requesting audio capture permission...".into(),
                ..HostSessionStatus::idle()
            },
        );

        // Capture first so a refusal never touches the network
        let tracks = match capture_host_audio(self.backends.capture.as_ref(), options.source).await
        {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("Capture failed: {}", e);
                publish(&self.host_status, host_error(&e));
                return Err(e);
            }
        };

        let url = self.signaling_url(options.signaling_url.as_deref());
        if let Err(e) = self.open_signaling(&url).await {
            for track in &tracks {
                track.stop();
            }
            publish(&self.host_status, host_error(&e));
            return Err(e);
        }

        self.send(&SignalMessage::Hello(Hello {
            role: Some(PeerRole::Host),
            room_id: Some(room_id.clone()),
            name: Some(name.clone()),
            address,
            ..Hello::default()
        }));
        self.send(&SignalMessage::HostsRequest);

        info!("Hosting \"{}\" in room {}", name, room_id);
        self.role = Role::Host(HostSession::new(
            room_id,
            tracks,
            self.backends.peers.clone(),
            self.peer_tx.clone(),
            self.config.sync_lead_ms,
        ));
        self.publish_role();
        Ok(())
    }

    async fn connect_client(&mut self, options: ConnectClientOptions) -> Result<(), SessionError> {
        self.stop_all().await;

        let Some(host_id) = normalize_optional(Some(&options.host_id)) else {
            let err = SessionError::PeerUnreachable("No host selected.".into());
            publish(&self.client_status, client_error(None, &err));
            return Err(err);
        };
        let room_id = normalize_or(&options.room_id, DEFAULT_ROOM);
        let name = normalize_or(&options.name, DEFAULT_CLIENT_NAME);

        let session = ClientSession::new(
            host_id.clone(),
            self.backends.peers.clone(),
            self.backends.sinks.clone(),
            self.peer_tx.clone(),
            self.timer_tx.clone(),
        );
        publish(&self.client_status, session.status().clone());

        let url = self.signaling_url(options.signaling_url.as_deref());
        if let Err(e) = self.open_signaling(&url).await {
            publish(&self.client_status, client_error(Some(host_id), &e));
            return Err(e);
        }

        self.send(&SignalMessage::Hello(Hello {
            role: Some(PeerRole::Client),
            room_id: Some(room_id),
            name: Some(name),
            target_host_id: Some(host_id.clone()),
            ..Hello::default()
        }));
        self.send(&SignalMessage::HostsRequest);

        info!("Listening to host {}", host_id);
        self.role = Role::Client(session);
        self.publish_role();
        Ok(())
    }

    fn update_host_metadata(&mut self, name: &str, room_id: &str, address: Option<&str>) {
        let Role::Host(host) = &mut self.role else {
            debug!("Metadata update ignored, not hosting");
            return;
        };
        let room_id = normalize_or(room_id, host.room_id());
        let name = normalize_or(name, DEFAULT_HOST_NAME);
        host.set_room_id(room_id.clone());

        let update = SignalMessage::HostMetaUpdate(HostMetaUpdate {
            name: Some(name),
            room_id: Some(room_id),
            address: normalize_optional(address),
        });
        self.send(&update);
        self.publish_role();
    }

    /// Tear down whatever is active and publish idle statuses
    async fn stop_all(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Host(mut host) => host.stop().await,
            Role::Client(mut client) => client.stop().await,
            Role::Idle | Role::Observer => {}
        }
        self.close_signaling();
        publish(&self.host_status, HostSessionStatus::idle());
        publish(&self.client_status, ClientSessionStatus::idle());
        publish(&self.hosts, Vec::new());
    }

    async fn handle_signaling(&mut self, envelope: SignalingEnvelope) {
        let current = self.signaling.as_ref().map(SignalingClient::epoch);
        if current != Some(envelope.epoch) {
            debug!("Dropping event from signaling epoch {}", envelope.epoch);
            return;
        }

        let msg = match envelope.event {
            SignalingEvent::Message(msg) => msg,
            SignalingEvent::Closed => {
                warn!("Signaling connection lost");
                self.signaling = None;
                match &mut self.role {
                    Role::Host(host) => host.fail(
                        "Signaling connection closed.",
                        "Connection to signaling server was lost.",
                    ),
                    Role::Client(client) => client.fail(
                        "Signaling connection closed.",
                        "Connection to signaling server was lost.",
                    ),
                    Role::Idle | Role::Observer => {}
                }
                self.publish_role();
                return;
            }
        };

        match msg {
            SignalMessage::Welcome(welcome) => {
                debug!("Signaling assigned id {}", welcome.client_id);
                self.client_id = Some(welcome.client_id);
            }
            SignalMessage::HostsState(state) => {
                let hosts = state.hosts.into_iter().map(DiscoveredHost::from).collect();
                publish(&self.hosts, hosts);
            }
            SignalMessage::HelloAck(ack) => {
                if self.client_id.as_deref() != Some(ack.client_id.as_str()) {
                    warn!("hello-ack for {} does not match welcome", ack.client_id);
                }
                debug!("Registered as {} in {}", ack.role, ack.room_id);
            }
            msg => {
                let out = match &mut self.role {
                    Role::Host(host) => host.handle_signal(msg).await,
                    Role::Client(client) => client.handle_signal(msg).await,
                    Role::Idle | Role::Observer => {
                        if let SignalMessage::Error(err) = &msg {
                            warn!("Signaling error: {}", err.message);
                        }
                        Vec::new()
                    }
                };
                self.send_all(out);
                self.publish_role();
            }
        }
    }

    async fn handle_peer(&mut self, envelope: PeerEnvelope) {
        let out = match &mut self.role {
            Role::Host(host) => host.handle_peer(envelope).await,
            Role::Client(client) => client.handle_peer(envelope).await,
            Role::Idle | Role::Observer => {
                debug!("Dropping peer event for {}", envelope.peer_id);
                Vec::new()
            }
        };
        self.send_all(out);
        self.publish_role();
    }

    fn publish_role(&self) {
        match &self.role {
            Role::Host(host) => publish(&self.host_status, host.status().clone()),
            Role::Client(client) => publish(&self.client_status, client.status().clone()),
            Role::Idle | Role::Observer => {}
        }
    }
}
