//! Streamer: signalling loop and session manager
//!
//! Owns the `ConnectionId -> Session` table. Every signalling and peer
//! connection callback runs on one dedicated thread with its own
//! current-thread runtime; the fan-out API (`send_freeze_frame`,
//! `send_player_message`, ...) is callable from any thread.
//!
//! ```text
//! signalling server <-ws-> SignallingConnection --+
//!                                                 v
//!      peer events / faults ---------------> signalling thread
//!                                                 |
//!                                       PlayerTable (one lock)
//!                                         |       |       |
//!                                      Session Session Session
//! ```

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RtcConfiguration;
use super::protocol::{FromPlayerMessage, ToPlayerMessage, ToPlayerType};
use super::session::{Session, SessionFault};
use super::signaling::{ClientMessage, ConnectionId, ConnectionState, IceCandidate, ServerMessage};
use super::signaling_client::{SignallingConnection, SignallingSender};
use super::source::MediaSources;
use super::transport::{PeerEvent, PeerEventSender, PeerFactory};
use crate::config::{EncoderSettings, SignallingConfig, WebRtcSettings};
use crate::error::{AppError, Result};
use crate::events::{EventBus, StreamerEvent};
use crate::runtime::{ExecToken, StreamingContext, ThreadRole};
use crate::video::encoder::{EncoderCodec, EncoderRegistry};
use crate::video::latency::LatencyTester;

const SIGNALLING_THREAD_NAME: &str = "pixelcast-signalling";

/// Streamer configuration
#[derive(Debug, Clone, Default)]
pub struct StreamerConfig {
    pub signalling: SignallingConfig,
    pub encoder: EncoderSettings,
    pub webrtc: WebRtcSettings,
}

/// Sessions plus the state that must change atomically with them
#[derive(Default)]
struct PlayerTable {
    sessions: HashMap<ConnectionId, Arc<Session>>,
    next_seq: u64,
    freeze_frame: Option<Bytes>,
}

struct StreamerShared {
    config: StreamerConfig,
    players: Mutex<PlayerTable>,
    sources: Arc<MediaSources>,
    events: Arc<EventBus>,
    factory: Mutex<Option<Arc<dyn PeerFactory>>>,
    rtc_config: RwLock<RtcConfiguration>,
    signalling: Mutex<Option<SignallingSender>>,
    streaming_started: AtomicBool,
    latency: Arc<LatencyTester>,
    peer_events: mpsc::UnboundedSender<(ConnectionId, PeerEvent)>,
    faults: mpsc::UnboundedSender<SessionFault>,
}

/// Receivers drained by the signalling loop
struct LoopInputs {
    peer_events: mpsc::UnboundedReceiver<(ConnectionId, PeerEvent)>,
    faults: mpsc::UnboundedReceiver<SessionFault>,
}

/// Session manager and signalling endpoint
pub struct Streamer {
    shared: Arc<StreamerShared>,
    inputs: Option<LoopInputs>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    context: Option<Arc<StreamingContext>>,
}

impl Streamer {
    /// Create a streamer. Nothing is started until [`Streamer::start`].
    ///
    /// Fails when no H.264 encoder is registered.
    pub fn new(
        config: StreamerConfig,
        registry: &EncoderRegistry,
        factory: Arc<dyn PeerFactory>,
        sources: Arc<MediaSources>,
        events: Arc<EventBus>,
        latency: Arc<LatencyTester>,
        context: Arc<StreamingContext>,
    ) -> Result<Self> {
        if !registry.has_encoder_for_codec(EncoderCodec::H264) {
            error!("No H.264 encoder available, streaming is disabled");
            return Err(AppError::NoEncoder(EncoderCodec::H264.to_string()));
        }

        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (faults_tx, faults) = mpsc::unbounded_channel();
        let rtc_config = RtcConfiguration::new(config.webrtc.ice_servers.clone());

        let shared = Arc::new(StreamerShared {
            config,
            players: Mutex::new(PlayerTable::default()),
            sources,
            events,
            factory: Mutex::new(Some(factory)),
            rtc_config: RwLock::new(rtc_config),
            signalling: Mutex::new(None),
            streaming_started: AtomicBool::new(false),
            latency,
            peer_events: peer_events_tx,
            faults: faults_tx,
        });

        Ok(Self {
            shared,
            inputs: Some(LoopInputs {
                peer_events,
                faults,
            }),
            cancel: CancellationToken::new(),
            thread: None,
            context: Some(context),
        })
    }

    /// Start the signalling thread
    pub fn start(&mut self) -> Result<()> {
        let inputs = self
            .inputs
            .take()
            .ok_or_else(|| AppError::InvalidState("streamer already started".to_string()))?;

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name(SIGNALLING_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build signalling runtime: {}", e);
                        return;
                    }
                };
                let token = ExecToken::bind(ThreadRole::Signalling);
                runtime.block_on(shared.run(token, cancel, inputs));
            })?;

        self.thread = Some(handle);
        info!("Streamer started ({})", self.shared.config.signalling.url);
        Ok(())
    }

    /// Delete every session, stop and join the signalling thread, then
    /// release the peer factory and the streaming context.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Signalling thread panicked");
            }
        }
        self.shared.factory.lock().take();
        self.context.take();
        info!("Streamer stopped");
    }

    pub fn sources(&self) -> &Arc<MediaSources> {
        &self.shared.sources
    }

    pub fn latency_tester(&self) -> &Arc<LatencyTester> {
        &self.shared.latency
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming_started.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.shared.players.lock().sessions.len()
    }

    pub fn quality_controller(&self) -> Option<ConnectionId> {
        self.shared.quality_controller()
    }

    // Signalling-thread entry points

    pub async fn on_config(&self, token: &ExecToken, config: RtcConfiguration) -> Result<()> {
        self.shared.on_config(token, config)
    }

    pub async fn on_offer(&self, token: &ExecToken, id: ConnectionId, sdp: String) -> Result<()> {
        self.shared.on_offer(token, id, sdp).await
    }

    pub async fn on_remote_ice_candidate(
        &self,
        token: &ExecToken,
        id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.shared.on_remote_ice_candidate(token, id, candidate).await
    }

    pub async fn on_player_disconnected(&self, token: &ExecToken, id: &ConnectionId) -> Result<()> {
        self.shared.on_player_disconnected(token, id).await
    }

    pub async fn on_signalling_server_disconnected(
        &self,
        token: &ExecToken,
        reason: &str,
    ) -> Result<()> {
        self.shared.on_signalling_server_disconnected(token, reason).await
    }

    pub async fn on_peer_event(
        &self,
        token: &ExecToken,
        id: ConnectionId,
        event: PeerEvent,
    ) -> Result<()> {
        self.shared.on_peer_event(token, id, event).await
    }

    pub async fn on_fault(&self, token: &ExecToken, fault: SessionFault) -> Result<()> {
        self.shared.on_fault(token, fault).await
    }

    // Control API, any thread

    /// Send a freeze frame to every viewer and cache it for late joiners
    pub fn send_freeze_frame(&self, jpeg: Bytes) {
        self.shared.send_freeze_frame(jpeg);
    }

    pub fn send_unfreeze_frame(&self) {
        self.shared.send_unfreeze_frame();
    }

    /// Send the cached freeze frame to one viewer, if there is one
    pub fn send_cached_freeze_frame_to(&self, id: &ConnectionId) -> bool {
        self.shared.send_cached_freeze_frame_to(id)
    }

    pub fn is_frozen(&self) -> bool {
        self.shared.players.lock().freeze_frame.is_some()
    }

    /// Send a message to every viewer
    pub fn send_player_message(&self, kind: ToPlayerType, descriptor: &str) {
        self.shared.send_player_message(kind, descriptor);
    }

    /// Send a message to one viewer; `false` if it is not connected
    pub fn send_to(&self, id: &ConnectionId, message: ToPlayerMessage) -> bool {
        match self.shared.session(id) {
            Some(session) => {
                session.send(message);
                true
            }
            None => false,
        }
    }

    pub fn on_quality_ownership(&self, id: &ConnectionId) {
        self.shared.on_quality_ownership(id);
    }

    pub fn force_key_frame(&self) {
        self.shared.force_key_frame();
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

impl StreamerShared {
    async fn run(self: Arc<Self>, token: ExecToken, cancel: CancellationToken, mut inputs: LoopInputs) {
        let mut qp = self.sources.watch_qp();
        let reconnect = Duration::from_millis(self.config.signalling.reconnect_interval_ms);

        loop {
            let connection = tokio::select! {
                _ = cancel.cancelled() => break,
                connection = SignallingConnection::connect(&self.config.signalling) => connection,
            };

            match connection {
                Ok(mut connection) => {
                    *self.signalling.lock() = Some(connection.sender());
                    self.events.publish(StreamerEvent::SignallingConnected {
                        url: self.config.signalling.url.clone(),
                    });

                    let lost = self
                        .serve(&token, &cancel, &mut connection, &mut inputs, &mut qp)
                        .await;

                    connection.close();
                    self.signalling.lock().take();
                    if !lost {
                        break;
                    }
                    if let Err(e) = self
                        .on_signalling_server_disconnected(&token, "connection lost")
                        .await
                    {
                        warn!("Signalling teardown failed: {}", e);
                    }
                }
                Err(e) => warn!("{}", e),
            }

            debug!("Reconnecting to signalling server in {:?}", reconnect);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(reconnect) => {}
            }
        }

        self.delete_all(&token).await;
        debug!("Signalling loop stopped");
    }

    /// Serve one connection. `true` when the server went away, `false` on
    /// cancellation.
    async fn serve(
        &self,
        token: &ExecToken,
        cancel: &CancellationToken,
        connection: &mut SignallingConnection,
        inputs: &mut LoopInputs,
        qp: &mut watch::Receiver<Option<u32>>,
    ) -> bool {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                message = connection.recv() => match message {
                    Some(message) => self.on_server_message(token, message).await,
                    None => return true,
                },
                Some((id, event)) = inputs.peer_events.recv() => {
                    self.on_peer_event(token, id, event).await
                }
                Some(fault) = inputs.faults.recv() => self.on_fault(token, fault).await,
                Ok(()) = qp.changed() => {
                    let value = *qp.borrow_and_update();
                    if let Some(value) = value {
                        self.send_qp_to_controller(value);
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("{}", e);
            }
        }
    }

    async fn on_server_message(&self, token: &ExecToken, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Config {
                peer_connection_options,
            } => self.on_config(token, peer_connection_options),
            ServerMessage::Offer { player_id, sdp } => self.on_offer(token, player_id, sdp).await,
            ServerMessage::IceCandidate {
                player_id,
                candidate,
            } => {
                self.on_remote_ice_candidate(token, &player_id, candidate)
                    .await
            }
            ServerMessage::PlayerConnected {
                player_id,
                data_channel,
                sfu,
            } => {
                debug!(
                    "Player {} connected (data channel: {}, sfu: {})",
                    player_id, data_channel, sfu
                );
                Ok(())
            }
            ServerMessage::PlayerDisconnected { player_id } => {
                self.on_player_disconnected(token, &player_id).await
            }
            other => {
                debug!("Ignoring signalling message {:?}", other);
                Ok(())
            }
        }
    }

    fn on_config(&self, token: &ExecToken, config: RtcConfiguration) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_config")?;
        info!(
            "Peer connection options received ({} ICE servers)",
            config.ice_servers.len()
        );
        *self.rtc_config.write() = config;
        Ok(())
    }

    async fn on_offer(&self, token: &ExecToken, id: ConnectionId, sdp: String) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_offer")?;
        info!("Offer from player {}", id);

        let session = match self.session(&id) {
            Some(session) => session,
            None => self.create_session(&id).await?,
        };

        let answer = async {
            session
                .add_streams(&self.sources, self.config.webrtc.degradation_preference)
                .await?;
            session.on_offer(sdp).await
        }
        .await;

        match answer {
            Ok(sdp) => {
                self.signal(ClientMessage::Answer {
                    player_id: id.clone(),
                    sdp,
                });
                self.send_cached_freeze_frame_to(&id);
                self.for_each_session(|s| s.send_key_frame());
                Ok(())
            }
            Err(e) => {
                self.fail_session(&id, "negotiation failed").await;
                Err(e)
            }
        }
    }

    async fn create_session(&self, id: &ConnectionId) -> Result<Arc<Session>> {
        let factory = self
            .factory
            .lock()
            .clone()
            .ok_or_else(|| AppError::InvalidState("streamer is shut down".to_string()))?;
        let rtc_config = self.rtc_config.read().clone();
        let transport = factory
            .create_peer(
                &rtc_config,
                PeerEventSender::new(id.clone(), self.peer_events.clone()),
            )
            .await?;

        let (session, session_count) = {
            let mut players = self.players.lock();
            let seq = players.next_seq;
            players.next_seq += 1;
            let quality_controller = players.sessions.is_empty();
            let session = Session::new(
                id.clone(),
                seq,
                transport,
                quality_controller,
                self.faults.clone(),
            );
            players.sessions.insert(id.clone(), session.clone());
            (session, players.sessions.len())
        };

        session.send_quality_control_ownership();
        info!(
            "Created session {} (quality controller: {}, {} sessions)",
            id,
            session.is_quality_controller(),
            session_count
        );
        self.events.publish(StreamerEvent::SessionCreated {
            connection_id: id.to_string(),
            quality_controller: session.is_quality_controller(),
            session_count,
        });
        Ok(session)
    }

    async fn on_remote_ice_candidate(
        &self,
        token: &ExecToken,
        id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_remote_ice_candidate")?;
        match self.session(id) {
            Some(session) => session.on_remote_ice_candidate(candidate).await,
            None => {
                warn!("ICE candidate for unknown player {}", id);
                Ok(())
            }
        }
    }

    async fn on_player_disconnected(&self, token: &ExecToken, id: &ConnectionId) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_player_disconnected")?;
        info!("Player {} disconnected", id);
        self.delete_session(id).await;
        Ok(())
    }

    async fn on_signalling_server_disconnected(&self, token: &ExecToken, reason: &str) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_signalling_server_disconnected")?;
        warn!("Signalling server disconnected: {}", reason);
        self.delete_all(token).await;
        self.events.publish(StreamerEvent::SignallingDisconnected {
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn on_peer_event(&self, token: &ExecToken, id: ConnectionId, event: PeerEvent) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_peer_event")?;
        let Some(session) = self.session(&id) else {
            debug!("Dropping {:?} for removed player {}", event, id);
            return Ok(());
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => self.signal(ClientMessage::IceCandidate {
                player_id: id,
                candidate,
            }),
            PeerEvent::StateChanged(ConnectionState::Connected) => {
                if session.set_connected() && !self.streaming_started.swap(true, Ordering::AcqRel) {
                    info!("Streaming started");
                }
            }
            PeerEvent::StateChanged(ConnectionState::Failed) => {
                self.fail_session(&id, "peer connection failed").await;
            }
            PeerEvent::StateChanged(ConnectionState::Closed) => {
                self.fail_session(&id, "peer connection closed").await;
            }
            PeerEvent::StateChanged(state) => debug!("Player {} is {}", id, state),
            PeerEvent::DataChannelOpen => {
                info!("Data channel open for player {}", id);
                session.on_data_channel_open();
            }
            PeerEvent::DataMessage(data) => self.on_data_message(&session, &data),
        }
        Ok(())
    }

    fn on_data_message(&self, session: &Arc<Session>, data: &[u8]) {
        let id = session.id();
        let message = match FromPlayerMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Bad data channel message from {}: {}", id, e);
                return;
            }
        };

        match message {
            FromPlayerMessage::IFrameRequest => self.force_key_frame(),
            FromPlayerMessage::RequestQualityControl => self.on_quality_ownership(id),
            FromPlayerMessage::MaxFpsRequest(fps) => {
                if !session.is_quality_controller() {
                    debug!("Ignoring MaxFpsRequest from non-controller {}", id);
                } else if fps > 0 {
                    info!("Player {} requested {} fps", id, fps);
                    self.sources.video().request_max_fps(fps as u32);
                }
            }
            FromPlayerMessage::AverageBitrateRequest { min, max } => {
                if !session.is_quality_controller() {
                    debug!("Ignoring AverageBitrateRequest from non-controller {}", id);
                } else if max > 0 {
                    info!("Player {} requested {}-{} kbps", id, min, max);
                    self.sources
                        .video()
                        .request_bitrate(min as i32 * 1000, max as i32 * 1000);
                }
            }
            FromPlayerMessage::StartStreaming => session.set_media_enabled(true),
            FromPlayerMessage::StopStreaming => session.set_media_enabled(false),
            FromPlayerMessage::LatencyTest(descriptor) => {
                debug!("Latency test from {}: {}", id, descriptor);
                if !self.latency.start(id.as_str()) {
                    debug!("Latency test already running, ignoring {}", id);
                }
            }
            FromPlayerMessage::RequestInitialSettings => {
                session.send(ToPlayerMessage::InitialSettings(self.initial_settings()));
            }
            FromPlayerMessage::UiInteraction(descriptor) => {
                self.events.publish(StreamerEvent::UiInteraction {
                    connection_id: id.to_string(),
                    descriptor,
                })
            }
            FromPlayerMessage::Command(descriptor) => self.events.publish(StreamerEvent::Command {
                connection_id: id.to_string(),
                descriptor,
            }),
            FromPlayerMessage::Input {
                message_type,
                payload,
            } => self.events.publish(StreamerEvent::InputEvent {
                connection_id: id.to_string(),
                message_type,
                payload: payload.to_vec(),
            }),
        }
    }

    async fn on_fault(&self, token: &ExecToken, fault: SessionFault) -> Result<()> {
        token.check(ThreadRole::Signalling, "on_fault")?;
        self.fail_session(&fault.id, &fault.reason).await;
        Ok(())
    }

    /// Drop a broken session and tell the server to disconnect the viewer
    async fn fail_session(&self, id: &ConnectionId, reason: &str) {
        if self.delete_session(id).await {
            warn!("Disconnecting player {}: {}", id, reason);
            self.signal(ClientMessage::DisconnectPlayer {
                player_id: id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Remove and close a session. Returns `false` for unknown ids.
    async fn delete_session(&self, id: &ConnectionId) -> bool {
        let (session, remaining, new_controller) = {
            let mut players = self.players.lock();
            let Some(session) = players.sessions.remove(id) else {
                return false;
            };
            let remaining = players.sessions.len();
            let mut new_controller = None;
            if remaining > 0 && session.is_quality_controller() {
                if let Some(next) = players.sessions.values().min_by_key(|s| s.seq()) {
                    next.set_quality_controller(true);
                    new_controller = Some(next.clone());
                }
            }
            (session, remaining, new_controller)
        };

        session.close().await;
        self.events.publish(StreamerEvent::SessionClosed {
            connection_id: id.to_string(),
            session_count: remaining,
        });

        if let Some(next) = new_controller {
            info!("Quality control passed to {}", next.id());
            next.send_quality_control_ownership();
            self.events.publish(StreamerEvent::QualityControllerChanged {
                connection_id: next.id().to_string(),
            });
        }

        if remaining == 0 {
            if self.streaming_started.swap(false, Ordering::AcqRel) {
                info!("Streaming stopped");
            }
            self.latency.cancel();
            info!("All connections closed");
            self.events.publish(StreamerEvent::AllConnectionsClosed);
        }
        true
    }

    async fn delete_all(&self, token: &ExecToken) {
        if token.check(ThreadRole::Signalling, "delete_all").is_err() {
            return;
        }
        let ids: Vec<ConnectionId> = self.players.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.delete_session(&id).await;
        }
    }

    fn session(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.players.lock().sessions.get(id).cloned()
    }

    fn for_each_session(&self, f: impl Fn(&Session)) {
        let players = self.players.lock();
        players.sessions.values().for_each(|s| f(s.as_ref()));
    }

    fn quality_controller(&self) -> Option<ConnectionId> {
        self.players
            .lock()
            .sessions
            .values()
            .find(|s| s.is_quality_controller())
            .map(|s| s.id().clone())
    }

    fn signal(&self, message: ClientMessage) {
        match self.signalling.lock().as_ref() {
            Some(sender) => sender.send(message),
            None => debug!("No signalling connection, dropping {:?}", message),
        }
    }

    fn send_freeze_frame(&self, jpeg: Bytes) {
        let mut players = self.players.lock();
        debug!(
            "Sending {} byte freeze frame to {} players",
            jpeg.len(),
            players.sessions.len()
        );
        players
            .sessions
            .values()
            .for_each(|s| s.send_freeze_frame(jpeg.clone()));
        players.freeze_frame = Some(jpeg);
    }

    fn send_unfreeze_frame(&self) {
        let mut players = self.players.lock();
        players
            .sessions
            .values()
            .for_each(|s| s.send_unfreeze_frame());
        players.freeze_frame = None;
    }

    fn send_cached_freeze_frame_to(&self, id: &ConnectionId) -> bool {
        let players = self.players.lock();
        match (&players.freeze_frame, players.sessions.get(id)) {
            (Some(jpeg), Some(session)) => {
                debug!("Sending cached freeze frame to {}", id);
                session.send_freeze_frame(jpeg.clone());
                true
            }
            _ => false,
        }
    }

    fn send_player_message(&self, kind: ToPlayerType, descriptor: &str) {
        self.for_each_session(|s| s.send_message(kind, descriptor));
    }

    fn on_quality_ownership(&self, id: &ConnectionId) {
        let changed: Vec<Arc<Session>> = {
            let players = self.players.lock();
            if !players.sessions.contains_key(id) {
                warn!("Quality control requested for unknown player {}", id);
                return;
            }
            players
                .sessions
                .values()
                .filter(|s| s.set_quality_controller(s.id() == id))
                .cloned()
                .collect()
        };

        if changed.is_empty() {
            return;
        }
        for session in &changed {
            session.send_quality_control_ownership();
        }
        info!("Quality control passed to {}", id);
        self.events.publish(StreamerEvent::QualityControllerChanged {
            connection_id: id.to_string(),
        });
    }

    fn force_key_frame(&self) {
        if let Some(video) = self.sources.video_if_created() {
            video.request_key_frame();
        }
    }

    fn send_qp_to_controller(&self, qp: u32) {
        let players = self.players.lock();
        if let Some(session) = players.sessions.values().find(|s| s.is_quality_controller()) {
            session.send_video_encoder_qp(qp);
        }
    }

    fn initial_settings(&self) -> String {
        let encoder = &self.config.encoder;
        let webrtc = &self.config.webrtc;
        serde_json::json!({
            "Encoder": {
                "TargetBitrate": encoder.target_bitrate,
                "MaxBitrate": encoder.max_bitrate_vbr,
                "MinQP": encoder.min_qp,
                "MaxQP": encoder.max_qp,
                "RateControl": encoder.rate_control,
                "Multipass": encoder.multipass,
                "FillerData": encoder.enable_filler_data,
            },
            "WebRTC": {
                "DegradationPref": webrtc.degradation_preference,
                "FPS": webrtc.max_fps,
                "MinBitrate": webrtc.min_bitrate,
                "MaxBitrate": webrtc.max_bitrate,
                "LowQP": webrtc.low_qp_threshold,
                "HighQP": webrtc.high_qp_threshold,
            },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::transport::testing::FakeFactory;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct Harness {
        streamer: Streamer,
        factory: Arc<FakeFactory>,
        token: ExecToken,
        signalling: mpsc::UnboundedReceiver<ClientMessage>,
        events: tokio::sync::broadcast::Receiver<StreamerEvent>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(FakeFactory::default());
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let streamer = Streamer::new(
            StreamerConfig::default(),
            &EncoderRegistry::with_default_encoders(),
            factory.clone(),
            Arc::new(MediaSources::new()),
            bus,
            Arc::new(LatencyTester::new()),
            StreamingContext::init().unwrap(),
        )
        .unwrap();
        let (sender, signalling) = SignallingSender::channel();
        *streamer.shared.signalling.lock() = Some(sender);
        Harness {
            streamer,
            factory,
            token: ExecToken::bind(ThreadRole::Signalling),
            signalling,
            events,
        }
    }

    impl Harness {
        async fn offer(&self, id: &str) {
            self.streamer
                .on_offer(&self.token, ConnectionId::from(id), "v=0 offer".into())
                .await
                .unwrap();
            let events = self.factory.events(id);
            self.streamer
                .on_peer_event(&self.token, events.id().clone(), PeerEvent::DataChannelOpen)
                .await
                .unwrap();
        }

        async fn disconnect(&self, id: &str) {
            self.streamer
                .on_player_disconnected(&self.token, &ConnectionId::from(id))
                .await
                .unwrap();
        }

        fn drain_events(&mut self) -> Vec<StreamerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn count_idle(events: &[StreamerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StreamerEvent::AllConnectionsClosed))
            .count()
    }

    #[test]
    fn test_requires_h264_encoder() {
        let result = Streamer::new(
            StreamerConfig::default(),
            &EncoderRegistry::new(),
            Arc::new(FakeFactory::default()),
            Arc::new(MediaSources::new()),
            Arc::new(EventBus::new()),
            Arc::new(LatencyTester::new()),
            StreamingContext::init().unwrap(),
        );
        assert!(matches!(result, Err(AppError::NoEncoder(_))));
    }

    #[tokio::test]
    async fn test_offer_answers_and_elects_controller() {
        let mut h = harness();
        h.offer("p1").await;

        match h.signalling.try_recv().unwrap() {
            ClientMessage::Answer { player_id, sdp } => {
                assert_eq!(player_id, ConnectionId::from("p1"));
                assert_eq!(sdp, "v=0 answer");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.streamer.quality_controller(), Some(ConnectionId::from("p1")));
        assert_eq!(h.factory.peer("p1").tracks.lock().len(), 2);
        assert!(h.streamer.sources().video().take_key_frame_request());

        // QualityControlOwnership(true) reaches the viewer
        let peer = h.factory.peer("p1");
        eventually(|| !peer.sent.lock().is_empty()).await;
        assert_eq!(&peer.sent.lock()[0][..], &[0, 1]);
    }

    #[tokio::test]
    async fn test_second_offer_reuses_session() {
        let h = harness();
        h.offer("p1").await;
        h.offer("p1").await;
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.peer("p1").tracks.lock().len(), 2);
        assert_eq!(h.streamer.session_count(), 1);
    }

    #[tokio::test]
    async fn test_two_players_single_idle_notification() {
        let mut h = harness();
        h.offer("p1").await;
        let video = h.streamer.sources().video();
        assert!(video.take_key_frame_request());

        h.offer("p2").await;
        assert_eq!(h.streamer.quality_controller(), Some(ConnectionId::from("p1")));
        // Every viewer gets a key frame when one joins
        assert!(video.take_key_frame_request());
        let requests = |id: &str| {
            let session = h.streamer.shared.session(&ConnectionId::from(id)).unwrap();
            session.key_frame_requests()
        };
        assert_eq!(requests("p1"), 2);
        assert_eq!(requests("p2"), 1);

        h.disconnect("p1").await;
        assert_eq!(h.streamer.quality_controller(), Some(ConnectionId::from("p2")));
        assert_eq!(count_idle(&h.drain_events()), 0);

        let p2 = h.factory.peer("p2");
        eventually(|| p2.sent.lock().iter().any(|m| m[..] == [0u8, 1])).await;

        h.disconnect("p2").await;
        // Unknown ids are a no-op
        h.disconnect("p2").await;
        let events = h.drain_events();
        assert_eq!(count_idle(&events), 1);
        assert_eq!(h.streamer.session_count(), 0);
        assert!(h.factory.peer("p1").closed.load(Ordering::SeqCst));
        assert!(p2.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_quality_controller_unique() {
        let h = harness();
        for id in ["a", "b", "c"] {
            h.offer(id).await;
        }
        h.streamer.on_quality_ownership(&ConnectionId::from("b"));
        h.streamer.on_quality_ownership(&ConnectionId::from("b"));
        h.streamer.on_quality_ownership(&ConnectionId::from("nobody"));

        let owners: Vec<_> = h
            .streamer
            .shared
            .players
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_quality_controller())
            .map(|s| s.id().clone())
            .collect();
        assert_eq!(owners, vec![ConnectionId::from("b")]);

        // Removing a non-controller keeps the controller
        h.disconnect("a").await;
        assert_eq!(h.streamer.quality_controller(), Some(ConnectionId::from("b")));
    }

    #[tokio::test]
    async fn test_freeze_cache() {
        let h = harness();
        h.offer("p1").await;
        let jpeg = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]);
        h.streamer.send_freeze_frame(jpeg.clone());
        assert!(h.streamer.is_frozen());

        // Late joiner gets the cached frame right after its answer
        h.offer("p2").await;
        let p2 = h.factory.peer("p2");
        eventually(|| p2.sent_types().contains(&3)).await;
        let frame = p2
            .sent
            .lock()
            .iter()
            .find(|m| m[0] == 3)
            .cloned()
            .unwrap();
        assert_eq!(&frame[5..], &jpeg[..]);

        h.streamer.send_unfreeze_frame();
        assert!(!h.streamer.is_frozen());
        assert!(!h.streamer.send_cached_freeze_frame_to(&ConnectionId::from("p2")));

        let p1 = h.factory.peer("p1");
        eventually(|| p1.sent_types().ends_with(&[3, 4])).await;

        // Players leaving do not clear the cache
        h.streamer.send_freeze_frame(jpeg);
        h.disconnect("p1").await;
        h.disconnect("p2").await;
        assert!(h.streamer.is_frozen());
    }

    #[tokio::test]
    async fn test_failed_send_disconnects_player() {
        let mut h = harness();
        h.offer("p1").await;
        h.offer("p2").await;
        while h.signalling.try_recv().is_ok() {}

        let p2 = h.factory.peer("p2");
        p2.fail_sends.store(true, Ordering::SeqCst);
        h.streamer.send_player_message(ToPlayerType::Command, "{}");

        let fault = tokio::time::timeout(Duration::from_secs(1), async {
            let mut inputs = h.streamer.inputs.take().unwrap();
            inputs.faults.recv().await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(fault.id, ConnectionId::from("p2"));
        h.streamer.on_fault(&h.token, fault).await.unwrap();

        assert_eq!(h.streamer.session_count(), 1);
        match h.signalling.try_recv().unwrap() {
            ClientMessage::DisconnectPlayer { player_id, .. } => {
                assert_eq!(player_id, ConnectionId::from("p2"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_channel_requests() {
        let mut h = harness();
        h.offer("p1").await;
        h.offer("p2").await;
        h.drain_events();
        let video = h.streamer.sources().video();
        video.take_key_frame_request();

        let p2 = h.factory.events("p2");
        let send = |events: &PeerEventSender, data: &'static [u8]| {
            (events.id().clone(), PeerEvent::DataMessage(Bytes::from_static(data)))
        };

        // Non-controllers cannot change encoder settings
        let (id, ev) = send(&p2, &[2, 30]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert_eq!(video.requested_max_fps(), None);

        let (id, ev) = send(&p2, &[1]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert_eq!(h.streamer.quality_controller(), Some(ConnectionId::from("p2")));

        let (id, ev) = send(&p2, &[2, 30]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert_eq!(video.requested_max_fps(), Some(30));

        let (id, ev) = send(&p2, &[3, 0xE8, 0x03, 0x10, 0x27]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert_eq!(video.requested_bitrate(), Some((1_000_000, 10_000_000)));

        let (id, ev) = send(&p2, &[0]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert!(video.take_key_frame_request());

        let (id, ev) = send(&p2, &[51, 2, 0, b'h', 0, b'i', 0]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamerEvent::Command { connection_id, descriptor }
                if connection_id == "p2" && descriptor == "hi"
        )));

        let (id, ev) = send(&p2, &[6]);
        h.streamer.on_peer_event(&h.token, id, ev).await.unwrap();
        assert_eq!(h.streamer.latency_tester().requester().as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_handlers_check_thread_role() {
        let h = harness();
        let control = ExecToken::bind(ThreadRole::Control);
        let err = h
            .streamer
            .on_offer(&control, ConnectionId::from("x"), "v=0".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WrongThread { .. }));
        assert_eq!(h.streamer.session_count(), 0);
    }

    #[tokio::test]
    async fn test_signalling_server_loss_tears_down() {
        let mut h = harness();
        h.offer("p1").await;
        h.offer("p2").await;
        h.drain_events();
        h.streamer
            .on_signalling_server_disconnected(&h.token, "test")
            .await
            .unwrap();
        assert_eq!(h.streamer.session_count(), 0);
        let events = h.drain_events();
        assert_eq!(count_idle(&events), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamerEvent::SignallingDisconnected { .. })));
    }

    #[tokio::test]
    async fn test_start_leaves_sources_unallocated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let sources = Arc::new(MediaSources::new());
        let mut config = StreamerConfig::default();
        config.signalling.url = url;
        config.signalling.keepalive_interval_secs = 0;
        let mut streamer = Streamer::new(
            config,
            &EncoderRegistry::with_default_encoders(),
            Arc::new(FakeFactory::default()),
            sources.clone(),
            Arc::new(EventBus::new()),
            Arc::new(LatencyTester::new()),
            StreamingContext::init().unwrap(),
        )
        .unwrap();
        streamer.start().unwrap();

        // The loop is connected, and nobody has offered yet
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        assert!(sources.video_if_created().is_none());
        assert!(sources.audio_if_created().is_none());

        streamer.shutdown();
        assert!(sources.video_if_created().is_none());
    }

    #[tokio::test]
    async fn test_signalling_loop_answers_offer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"offer","playerId":101,"sdp":"v=0 offer"}"#.into(),
            ))
            .await
            .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "answer" {
                        return value;
                    }
                }
            }
            panic!("no answer");
        });

        let factory = Arc::new(FakeFactory::default());
        let mut config = StreamerConfig::default();
        config.signalling.url = url;
        config.signalling.keepalive_interval_secs = 0;
        let mut streamer = Streamer::new(
            config,
            &EncoderRegistry::with_default_encoders(),
            factory.clone(),
            Arc::new(MediaSources::new()),
            Arc::new(EventBus::new()),
            Arc::new(LatencyTester::new()),
            StreamingContext::init().unwrap(),
        )
        .unwrap();
        streamer.start().unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer["playerId"], "101");
        assert_eq!(answer["sdp"], "v=0 answer");
        assert_eq!(streamer.session_count(), 1);

        streamer.shutdown();
        assert_eq!(streamer.session_count(), 0);
        assert!(factory.peer("101").closed.load(Ordering::SeqCst));
    }
}
