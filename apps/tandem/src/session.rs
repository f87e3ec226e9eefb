use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use tandem_proto::{ClientEnvelope, PartnerInfo, ServerEnvelope};

use crate::assist::AssistClient;
use crate::error::MediaError;
use crate::media::{AudioSource, AudioTrack};
use crate::signaling::Connector;
use crate::voice::{LinkEvent, VoiceLink, CANDIDATE_BUFFER_CAP};

pub const DEFAULT_VOICE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Searching,
    Connected,
}

/// Voice sub-state, meaningful only while the session is `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    /// We asked; waiting for mic and then the partner's answer.
    Requesting,
    /// The partner asked; waiting for the local accept/reject.
    Incoming,
    /// Accepted on either side; SDP/ICE exchange in flight.
    Connecting,
    Active,
}

/// User-initiated actions, from whatever front end drives the controller.
#[derive(Debug)]
pub enum Command {
    StartMatching { topic: String },
    SendChat(String),
    RequestVoice,
    AcceptVoice,
    RejectVoice,
    HangUp,
    Assist(String),
    Leave,
}

/// Everything the controller surfaces back to the user.
#[derive(Debug)]
pub enum Notice {
    Searching,
    Matched {
        partner: PartnerInfo,
        topic: String,
    },
    Chat {
        from: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    PartnerLeft(String),
    VoiceRequested,
    VoiceIncoming,
    VoiceRejected,
    VoiceActive,
    VoiceReconnecting,
    VoiceEnded {
        reason: String,
    },
    AssistReply(String),
    Error(String),
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceRole {
    Caller,
    Callee,
}

/// Results of spawned work, tagged with the voice epoch they were started
/// under. A result whose epoch no longer matches is discarded so a torn-down
/// negotiation cannot be resurrected.
enum InternalEvent {
    MicReady {
        epoch: u64,
        role: VoiceRole,
        track: AudioTrack,
    },
    MicFailed {
        epoch: u64,
        role: VoiceRole,
        error: MediaError,
    },
}

enum Tick {
    Command(Option<Command>),
    Inbound(Option<ServerEnvelope>),
    Internal(InternalEvent),
    Link(LinkEvent),
    GraceElapsed,
}

pub struct SessionHandles {
    pub commands: mpsc::UnboundedSender<Command>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
}

/// Single-task owner of all session state. Commands, inbound envelopes,
/// spawned-work results, and link events are serialized through one loop, so
/// every transition sees a consistent picture.
pub struct SessionController<C: Connector> {
    connector: C,
    audio: Arc<dyn AudioSource>,
    assist: AssistClient,
    grace: Duration,

    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<InternalEvent>>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,

    state: SessionState,
    voice: VoiceState,
    channel: Option<crate::signaling::SignalingHandle>,
    link: Option<VoiceLink>,
    /// Caller's mic, held between mic acquisition and `voice_accept` arriving.
    pending_track: Option<AudioTrack>,
    /// Remote candidates that beat the link's construction on this side.
    early_candidates: Vec<serde_json::Value>,
    partner: Option<PartnerInfo>,
    topic: Option<String>,
    chat_log: Vec<String>,
    epoch: u64,
    grace_deadline: Option<Instant>,
    restart_attempted: bool,
}

impl<C: Connector> SessionController<C> {
    pub fn new(
        connector: C,
        audio: Arc<dyn AudioSource>,
        assist: AssistClient,
        grace: Duration,
    ) -> (Self, SessionHandles) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            connector,
            audio,
            assist,
            grace,
            commands_rx: Some(commands_rx),
            notices_tx,
            internal_tx,
            internal_rx: Some(internal_rx),
            link_events_tx,
            link_events_rx: Some(link_events_rx),
            state: SessionState::Idle,
            voice: VoiceState::Idle,
            channel: None,
            link: None,
            pending_track: None,
            early_candidates: Vec::new(),
            partner: None,
            topic: None,
            chat_log: Vec::new(),
            epoch: 0,
            grace_deadline: None,
            restart_attempted: false,
        };
        let handles = SessionHandles {
            commands: commands_tx,
            notices: notices_rx,
        };
        (controller, handles)
    }

    pub async fn run(mut self) {
        let mut commands = self.commands_rx.take().expect("run called once");
        let mut internal = self.internal_rx.take().expect("run called once");
        let mut link_events = self.link_events_rx.take().expect("run called once");
        let mut inbound: Option<mpsc::UnboundedReceiver<ServerEnvelope>> = None;

        loop {
            let tick = tokio::select! {
                command = commands.recv() => Tick::Command(command),
                envelope = recv_opt(&mut inbound), if inbound.is_some() => Tick::Inbound(envelope),
                Some(event) = internal.recv() => Tick::Internal(event),
                Some(event) = link_events.recv() => Tick::Link(event),
                _ = sleep_until_opt(self.grace_deadline), if self.grace_deadline.is_some() => Tick::GraceElapsed,
            };
            match tick {
                Tick::Command(None) => {
                    self.teardown_session().await;
                    break;
                }
                Tick::Command(Some(command)) => {
                    if let Some(rx) = self.handle_command(command).await {
                        inbound = Some(rx);
                    }
                }
                Tick::Inbound(None) => {
                    self.transport_lost().await;
                }
                Tick::Inbound(Some(envelope)) => {
                    self.handle_envelope(envelope).await;
                }
                Tick::Internal(event) => self.handle_internal(event).await,
                Tick::Link(event) => self.handle_link_event(event).await,
                Tick::GraceElapsed => self.handle_grace_elapsed().await,
            }
            if self.channel.is_none() {
                inbound = None;
            }
        }
    }

    // ---- commands ----

    async fn handle_command(
        &mut self,
        command: Command,
    ) -> Option<mpsc::UnboundedReceiver<ServerEnvelope>> {
        match command {
            Command::StartMatching { topic } => return self.start_matching(topic).await,
            Command::SendChat(content) => self.send_chat(content).await,
            Command::RequestVoice => self.request_voice(),
            Command::AcceptVoice => self.accept_voice(),
            Command::RejectVoice => self.reject_voice().await,
            Command::HangUp => self.hang_up().await,
            Command::Assist(message) => self.assist(message),
            Command::Leave => self.leave().await,
        }
        None
    }

    async fn start_matching(
        &mut self,
        topic: String,
    ) -> Option<mpsc::UnboundedReceiver<ServerEnvelope>> {
        let topic = topic.trim().to_string();
        if topic.is_empty() {
            self.notify(Notice::Error("pick a topic before matching".to_string()));
            return None;
        }
        if self.state != SessionState::Idle {
            self.notify(Notice::Error(
                "already searching or in a session".to_string(),
            ));
            return None;
        }
        self.state = SessionState::Connecting;
        match self.connector.connect().await {
            Ok(pair) => {
                self.channel = Some(pair.handle);
                if !self
                    .send(ClientEnvelope::JoinQueue {
                        topic: Some(topic.clone()),
                    })
                    .await
                {
                    return None;
                }
                self.topic = Some(topic);
                self.state = SessionState::Searching;
                self.notify(Notice::Searching);
                Some(pair.inbound)
            }
            Err(err) => {
                self.state = SessionState::Idle;
                self.notify(Notice::Error(err.to_string()));
                None
            }
        }
    }

    async fn send_chat(&mut self, content: String) {
        if self.state != SessionState::Connected {
            self.notify(Notice::Error("not in a session".to_string()));
            return;
        }
        self.chat_log.push(format!("me: {content}"));
        self.send(ClientEnvelope::Chat { content }).await;
    }

    /// Mic first, envelope second: if acquisition fails nothing is sent and
    /// the partner never learns a request was attempted.
    fn request_voice(&mut self) {
        if self.state != SessionState::Connected {
            self.notify(Notice::Error("not in a session".to_string()));
            return;
        }
        if self.voice != VoiceState::Idle {
            self.notify(Notice::Error("a voice call is already in progress".to_string()));
            return;
        }
        self.voice = VoiceState::Requesting;
        self.spawn_mic(VoiceRole::Caller);
    }

    fn accept_voice(&mut self) {
        if self.voice != VoiceState::Incoming {
            self.notify(Notice::Error("no incoming voice request".to_string()));
            return;
        }
        self.voice = VoiceState::Connecting;
        self.spawn_mic(VoiceRole::Callee);
    }

    async fn reject_voice(&mut self) {
        if self.voice != VoiceState::Incoming {
            self.notify(Notice::Error("no incoming voice request".to_string()));
            return;
        }
        self.voice = VoiceState::Idle;
        self.send(ClientEnvelope::VoiceReject).await;
    }

    async fn hang_up(&mut self) {
        if self.voice == VoiceState::Idle {
            return;
        }
        self.send(ClientEnvelope::VoiceEnd).await;
        // A failed send has already torn the whole session down.
        if self.voice != VoiceState::Idle {
            self.teardown_voice().await;
            self.notify(Notice::VoiceEnded {
                reason: "call ended".to_string(),
            });
        }
    }

    fn assist(&self, message: String) {
        let assist = self.assist.clone();
        let notices = self.notices_tx.clone();
        let context = self.chat_log.join("\n");
        tokio::spawn(async move {
            match assist.suggest(&message, &context).await {
                Ok(reply) => {
                    let _ = notices.send(Notice::AssistReply(reply));
                }
                Err(err) => {
                    let _ = notices.send(Notice::Error(err.to_string()));
                }
            }
        });
    }

    async fn leave(&mut self) {
        let had_channel = self.channel.is_some();
        match self.state {
            SessionState::Searching => {
                self.send(ClientEnvelope::CancelQueue).await;
            }
            SessionState::Connected => {
                self.send(ClientEnvelope::Leave).await;
            }
            _ => {}
        }
        self.teardown_session().await;
        if had_channel {
            self.notify(Notice::Left);
        }
    }

    // ---- inbound envelopes ----

    async fn handle_envelope(&mut self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::Connected | ServerEnvelope::Searching => {}
            ServerEnvelope::Matched {
                partner, topic, ..
            } => {
                self.state = SessionState::Connected;
                self.partner = Some(partner.clone());
                self.topic = Some(topic.clone());
                self.notify(Notice::Matched { partner, topic });
            }
            ServerEnvelope::Chat {
                content,
                timestamp,
                ..
            } => {
                let from = self.partner_name();
                self.chat_log.push(format!("{from}: {content}"));
                self.notify(Notice::Chat {
                    from,
                    content,
                    timestamp,
                });
            }
            ServerEnvelope::PartnerLeft { message } => {
                self.teardown_session().await;
                self.notify(Notice::PartnerLeft(message));
            }
            ServerEnvelope::VoiceRequest => {
                if self.voice == VoiceState::Idle {
                    self.voice = VoiceState::Incoming;
                    self.notify(Notice::VoiceIncoming);
                } else {
                    debug!("voice request while not idle, ignoring");
                }
            }
            ServerEnvelope::VoiceAccept => self.on_voice_accepted().await,
            ServerEnvelope::VoiceReject => {
                if self.voice == VoiceState::Requesting {
                    self.teardown_voice().await;
                    self.notify(Notice::VoiceRejected);
                }
            }
            ServerEnvelope::VoiceEnd => {
                if self.voice != VoiceState::Idle {
                    self.teardown_voice().await;
                    self.notify(Notice::VoiceEnded {
                        reason: "partner ended the call".to_string(),
                    });
                }
            }
            ServerEnvelope::Offer { data } => self.on_offer(data).await,
            ServerEnvelope::Answer { data } => self.on_answer(data).await,
            ServerEnvelope::IceCandidate { data } => self.on_candidate(data).await,
            ServerEnvelope::Error { message } => self.notify(Notice::Error(message)),
        }
    }

    /// Partner accepted: the mic was already acquired when the request went
    /// out, so the link can be built and the offer sent straight away.
    async fn on_voice_accepted(&mut self) {
        if self.voice != VoiceState::Requesting {
            debug!("voice accept in {:?}, ignoring", self.voice);
            return;
        }
        let Some(track) = self.pending_track.take() else {
            debug!("voice accept before mic was ready, ignoring");
            return;
        };
        match self.build_link(track, true).await {
            Ok(()) => {
                self.voice = VoiceState::Connecting;
                if let Err(err) = self.send_offer(false).await {
                    self.fail_voice(err).await;
                }
            }
            Err(err) => {
                // The partner has accepted and is waiting for an offer that
                // will never come; release it explicitly.
                self.send(ClientEnvelope::VoiceEnd).await;
                self.fail_voice(err).await;
            }
        }
    }

    async fn on_offer(&mut self, data: serde_json::Value) {
        let Some(link) = &self.link else {
            debug!("offer with no link in place, ignoring");
            return;
        };
        match link.accept_offer(data).await {
            Ok(answer) => {
                self.send(ClientEnvelope::Answer { data: answer }).await;
            }
            Err(err) => self.fail_voice(err.to_string()).await,
        }
    }

    async fn on_answer(&mut self, data: serde_json::Value) {
        let Some(link) = &self.link else {
            debug!("answer with no link in place, ignoring");
            return;
        };
        if let Err(err) = link.accept_answer(data).await {
            self.fail_voice(err.to_string()).await;
        }
    }

    async fn on_candidate(&mut self, data: serde_json::Value) {
        match &self.link {
            Some(link) => {
                if let Err(err) = link.handle_remote_candidate(data).await {
                    warn!("remote candidate rejected: {err}");
                }
            }
            // Candidate outran the link's construction; replay once it
            // exists. Bounded like the in-link buffer.
            None if self.voice != VoiceState::Idle => {
                if self.early_candidates.len() == CANDIDATE_BUFFER_CAP {
                    warn!("early candidate stash full, dropping oldest");
                    self.early_candidates.remove(0);
                }
                self.early_candidates.push(data);
            }
            None => debug!("candidate with no negotiation in progress, dropping"),
        }
    }

    // ---- spawned-work results ----

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::MicReady { epoch, role, track } => {
                if epoch != self.epoch {
                    // Acquired for a negotiation that no longer exists.
                    track.stop();
                    return;
                }
                match role {
                    VoiceRole::Caller if self.voice == VoiceState::Requesting => {
                        self.pending_track = Some(track);
                        if self.send(ClientEnvelope::VoiceRequest).await {
                            self.notify(Notice::VoiceRequested);
                        }
                    }
                    VoiceRole::Callee if self.voice == VoiceState::Connecting => {
                        match self.build_link(track, false).await {
                            Ok(()) => {
                                self.send(ClientEnvelope::VoiceAccept).await;
                            }
                            Err(err) => {
                                self.send(ClientEnvelope::VoiceReject).await;
                                self.fail_voice(err).await;
                            }
                        }
                    }
                    _ => track.stop(),
                }
            }
            InternalEvent::MicFailed { epoch, role, error } => {
                if epoch != self.epoch {
                    return;
                }
                match role {
                    // No envelope went out; the failure stays local.
                    VoiceRole::Caller if self.voice == VoiceState::Requesting => {
                        self.voice = VoiceState::Idle;
                        self.notify(Notice::Error(error.to_string()));
                    }
                    // The partner is waiting on our accept; release it.
                    VoiceRole::Callee if self.voice == VoiceState::Connecting => {
                        self.send(ClientEnvelope::VoiceReject).await;
                        self.voice = VoiceState::Idle;
                        self.notify(Notice::Error(error.to_string()));
                    }
                    _ => {}
                }
            }
        }
    }

    // ---- link events ----

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate { epoch, payload } => {
                if epoch == self.epoch {
                    self.send(ClientEnvelope::IceCandidate { data: payload })
                        .await;
                }
            }
            LinkEvent::IceState { epoch, state } => {
                if epoch != self.epoch {
                    return;
                }
                match state {
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        self.grace_deadline = None;
                        self.restart_attempted = false;
                        if self.voice != VoiceState::Active {
                            self.voice = VoiceState::Active;
                            self.notify(Notice::VoiceActive);
                        }
                    }
                    RTCIceConnectionState::Disconnected => {
                        if self.grace_deadline.is_none() {
                            self.grace_deadline = Some(Instant::now() + self.grace);
                            self.notify(Notice::VoiceReconnecting);
                        }
                    }
                    RTCIceConnectionState::Failed => {
                        self.attempt_restart().await;
                        // A failed restart already tore the call down; only
                        // a still-live call gets a recovery window.
                        if self.voice != VoiceState::Idle && self.grace_deadline.is_none() {
                            self.grace_deadline = Some(Instant::now() + self.grace);
                            self.notify(Notice::VoiceReconnecting);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Re-key ICE from the offering side. The answering side holds its
    /// state; it will see the restart as an incoming offer.
    async fn attempt_restart(&mut self) {
        self.restart_attempted = true;
        let is_initiator = self.link.as_ref().map(VoiceLink::is_initiator);
        if is_initiator == Some(true) {
            if let Err(err) = self.send_offer(true).await {
                self.fail_voice(err).await;
            }
        }
    }

    async fn handle_grace_elapsed(&mut self) {
        self.grace_deadline = None;
        if self.voice == VoiceState::Idle {
            return;
        }
        if !self.restart_attempted {
            self.attempt_restart().await;
            if self.voice != VoiceState::Idle {
                self.grace_deadline = Some(Instant::now() + self.grace);
            }
            return;
        }
        self.send(ClientEnvelope::VoiceEnd).await;
        if self.voice != VoiceState::Idle {
            self.teardown_voice().await;
            self.notify(Notice::VoiceEnded {
                reason: "connection lost".to_string(),
            });
        }
    }

    // ---- plumbing ----

    fn spawn_mic(&self, role: VoiceRole) {
        let audio = self.audio.clone();
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            match audio.open().await {
                Ok(track) => {
                    let _ = internal.send(InternalEvent::MicReady { epoch, role, track });
                }
                Err(error) => {
                    let _ = internal.send(InternalEvent::MicFailed { epoch, role, error });
                }
            }
        });
    }

    async fn build_link(&mut self, track: AudioTrack, initiator: bool) -> Result<(), String> {
        let link = VoiceLink::new(track, initiator, self.epoch, self.link_events_tx.clone())
            .await
            .map_err(|err| err.to_string())?;
        for data in self.early_candidates.drain(..) {
            if let Err(err) = link.handle_remote_candidate(data).await {
                warn!("early candidate rejected: {err}");
            }
        }
        self.link = Some(link);
        Ok(())
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), String> {
        let Some(link) = &self.link else {
            return Err("no active negotiation".to_string());
        };
        let offer = link.create_offer(ice_restart).await.map_err(|err| err.to_string())?;
        self.send(ClientEnvelope::Offer { data: offer }).await;
        Ok(())
    }

    async fn fail_voice(&mut self, reason: String) {
        self.teardown_voice().await;
        self.notify(Notice::Error(reason));
    }

    /// Every exit path for a voice attempt funnels here: bump the epoch so
    /// in-flight work is orphaned, stop any capture, close the link.
    async fn teardown_voice(&mut self) {
        self.epoch += 1;
        self.grace_deadline = None;
        self.restart_attempted = false;
        self.early_candidates.clear();
        if let Some(track) = self.pending_track.take() {
            track.stop();
        }
        if let Some(link) = self.link.take() {
            link.teardown().await;
        }
        self.voice = VoiceState::Idle;
    }

    async fn teardown_session(&mut self) {
        self.teardown_voice().await;
        self.channel = None;
        self.partner = None;
        self.topic = None;
        self.chat_log.clear();
        self.state = SessionState::Idle;
    }

    /// A dead signaling channel is indistinguishable from the remote
    /// leaving: full teardown back to idle, never retried in the background.
    async fn transport_lost(&mut self) {
        if self.state != SessionState::Idle {
            self.notify(Notice::Error("connection to lobby lost".to_string()));
        }
        self.teardown_session().await;
    }

    /// Push an envelope out. A send failure means the writer task is gone
    /// and triggers the transport-loss teardown. Returns whether the
    /// envelope was handed to a live channel.
    async fn send(&mut self, envelope: ClientEnvelope) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        if channel.send(envelope).is_err() {
            self.transport_lost().await;
            return false;
        }
        true
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices_tx.send(notice);
    }

    fn partner_name(&self) -> String {
        self.partner
            .as_ref()
            .map(|p| p.full_name.clone())
            .unwrap_or_else(|| "partner".to_string())
    }
}

async fn recv_opt(
    inbound: &mut Option<mpsc::UnboundedReceiver<ServerEnvelope>>,
) -> Option<ServerEnvelope> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
