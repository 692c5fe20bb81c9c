/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! [`PeerConnection`] backed by the `webrtc` crate.

use super::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    RemoteTrack, SignalingState,
};
use crate::config::IceServer;
use crate::constants::{
    AUDIO_CHANNELS, AUDIO_MIME_TYPE, AUDIO_SAMPLE_RATE, VIDEO_CLOCK_RATE, VIDEO_MIME_TYPE,
};
use crate::error::NegotiationError;
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use roomcall_types::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use std::sync::{Arc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn backend(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Backend(e.to_string())
}

/// Builds connections from one shared media engine and interceptor stack.
pub struct RtcPeerConnectionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    stream_id: String,
}

impl RtcPeerConnectionFactory {
    pub fn new(
        ice_servers: &[IceServer],
        local_id: &ParticipantId,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            stream_id: local_id.to_string(),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        peer: &ParticipantId,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for {}", sink.peer());
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to convert ICE candidate for {}: {e}", sink.peer()),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        debug!("Ignoring remote track of kind {other}");
                        return;
                    }
                };
                sink.emit(PeerEvent::TrackAdded(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            })
        }));

        let sink = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                let state = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                sink.emit(PeerEvent::ConnectionStateChanged(state));
            })
        }));

        info!("Created WebRTC peer connection for {peer}");
        Ok(Arc::new(RtcPeerConnection {
            peer: peer.clone(),
            pc,
            stream_id: self.stream_id.clone(),
            senders: Mutex::new(Vec::new()),
        }))
    }
}

struct OutboundSender {
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
}

struct RtcPeerConnection {
    peer: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
    senders: Mutex<Vec<OutboundSender>>,
}

impl RtcPeerConnection {
    fn local_track(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: AUDIO_MIME_TYPE.to_owned(),
                clock_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: VIDEO_MIME_TYPE.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_owned(),
            self.stream_id.clone(),
        ))
    }

    fn video_sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|s| s.kind == TrackKind::Video)
            .map(|s| s.sender.clone())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let invalid = |e: webrtc::Error| NegotiationError::InvalidDescription(e.to_string());
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(invalid),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(invalid),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(invalid),
        SdpType::Rollback => Err(NegotiationError::InvalidDescription(
            "rollback is not supported".to_string(),
        )),
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let local = self.local_track(track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(OutboundSender {
                kind: track.kind(),
                sender,
            });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, NegotiationError> {
        let Some(sender) = self.video_sender() else {
            return Ok(false);
        };
        let local = self.local_track(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(backend)?;
        debug!("Outbound video for {} now {}", self.peer, track.label());
        Ok(true)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Error closing connection to {}: {e}", self.peer);
        }
    }
}
