//! WebRTC Peer Connection auf Basis von webrtc-rs
//!
//! Hinweis: Es gibt keine Encoding-Pipeline. Jeder lokale Track wird als
//! ein `TrackLocalStaticSample` angemeldet, den sich alle Verbindungen eines
//! Connectors teilen. Die einbettende Anwendung holt ihn über
//! `RtcConnector::sample_track` und schreibt die kodierten Samples selbst.

use super::connection::{PeerConnection, PeerConnector};
use super::state::{IceCandidate, LinkEvents, LinkState, NegotiationError, RemoteTrack};
use crate::config::CallConfig;
use crate::media::{LocalTrack, TrackKind, SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::sdp::extmap::AUDIO_LEVEL_URI;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream-ID aller lokalen Tracks
const STREAM_ID: &str = "call-core";

/// Nur jedes n-te RTP-Paket liefert ein Audio-Level Event (~200ms bei 20ms Frames)
const LEVEL_EVERY_N_PACKETS: u32 = 10;

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRtc(e.to_string())
}

/// webrtc-Tracks pro lokaler Track-ID, geteilt von allen Verbindungen
type SampleTracks = Arc<Mutex<HashMap<String, (LocalTrack, Arc<TrackLocalStaticSample>)>>>;

/// Liefert den webrtc-Track zu einem lokalen Track, legt ihn bei Bedarf an
fn sample_track_for(samples: &SampleTracks, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let mut samples = samples.lock();
    // Gestoppte Tracks werden nicht mehr gesendet
    samples.retain(|_, (local, _)| local.is_live());
    let (_, sample) = samples
        .entry(track.id().to_owned())
        .or_insert_with(|| (track.clone(), new_sample_track(track)));
    Arc::clone(sample)
}

fn new_sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let capability = match track.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: SAMPLE_RATE,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    };

    Arc::new(TrackLocalStaticSample::new(
        capability,
        track.id().to_owned(),
        STREAM_ID.to_owned(),
    ))
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erstellt webrtc-rs Peer Connections mit den konfigurierten ICE-Servern
///
/// Klone teilen sich die Sample-Tracks.
#[derive(Clone)]
pub struct RtcConnector {
    ice_servers: Vec<RTCIceServer>,
    samples: SampleTracks,
}

impl RtcConnector {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.rtc_ice_servers(),
            samples: SampleTracks::default(),
        }
    }

    /// Track, in den die Samples von `track` geschrieben werden
    ///
    /// Ein Schreibvorgang erreicht jede Verbindung, die den Track sendet.
    pub fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        sample_track_for(&self.samples, track)
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // RFC 6464 Audio-Level für die Sprechanzeige
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: AUDIO_LEVEL_URI.to_owned(),
                },
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverDirection::Sendrecv),
            )
            .map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: LinkEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let pc = self.create_peer_connection().await?;
        setup_peer_connection_handlers(&pc, events);

        Ok(Arc::new(RtcConnection {
            pc,
            samples: Arc::clone(&self.samples),
            video_sender: Mutex::new(None),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn setup_peer_connection_handlers(pc: &RTCPeerConnection, events: LinkEvents) {
    // Connection State Handler
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!(remote = %state_events.remote(), "Peer connection state: {:?}", s);
        if let Some(state) = LinkState::from_rtc(s) {
            state_events.state_changed(state);
        }
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events.local_candidate(IceCandidate::from(init)),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler
    pc.on_track(Box::new(move |track, _, _| {
        let events = events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            tracing::info!(remote = %events.remote(), "Received track: {:?}", track.codec());
            events.remote_track(RemoteTrack {
                id: track.id(),
                kind,
            });

            if kind == TrackKind::Audio {
                tokio::spawn(meter_remote_audio(track, events));
            }
        })
    }));
}

/// Liest RTP-Pakete und meldet das Audio-Level aus der Header Extension
async fn meter_remote_audio(track: Arc<TrackRemote>, events: LinkEvents) {
    let mut packets: u32 = 0;

    while let Ok((packet, _)) = track.read_rtp().await {
        packets = packets.wrapping_add(1);
        if packets % LEVEL_EVERY_N_PACKETS != 0 {
            continue;
        }

        // Es ist nur eine Extension registriert
        if let Some(level) = packet
            .header
            .extensions
            .first()
            .and_then(|ext| ext.payload.first())
            .map(|b| b & 0x7F)
        {
            events.audio_level(level_from_dbov(level));
        }
    }

    tracing::debug!(remote = %events.remote(), "Remote audio track ended");
}

/// RFC 6464: 0 = 0 dBov (laut), 127 = -127 dBov (still)
fn level_from_dbov(level: u8) -> f32 {
    10f32.powf(-(level.min(127) as f32) / 20.0)
}

// ============================================================================
// CONNECTION
// ============================================================================

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    samples: SampleTracks,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let local = sample_track_for(&self.samples, track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        // RTCP muss gelesen werden, sonst laufen die Interceptors nicht
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<&LocalTrack>,
    ) -> Result<bool, NegotiationError> {
        let sender = self.video_sender.lock().clone();
        let Some(sender) = sender else {
            return Ok(false);
        };

        let replacement = track
            .map(|t| sample_track_for(&self.samples, t) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await.map_err(webrtc_err)?;
        Ok(true)
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, NegotiationError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_owned())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_owned())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.video_sender.lock().take();
        self.pc.close().await.map_err(webrtc_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    fn offline_connector() -> RtcConnector {
        RtcConnector {
            ice_servers: Vec::new(),
            samples: SampleTracks::default(),
        }
    }

    #[test]
    fn test_audio_level_conversion() {
        assert_eq!(level_from_dbov(0), 1.0);
        assert!(level_from_dbov(127) < 0.001);
        assert!(level_from_dbov(20) > level_from_dbov(40));
    }

    #[tokio::test]
    async fn test_local_offer_answer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = offline_connector();

        let caller = connector
            .connect(LinkEvents::new("callee".into(), 1, tx.clone()))
            .await
            .unwrap();
        let callee = connector
            .connect(LinkEvents::new("caller".into(), 2, tx))
            .await
            .unwrap();

        caller
            .add_track(&LocalTrack::new(TrackSource::Microphone))
            .await
            .unwrap();
        caller
            .add_track(&LocalTrack::new(TrackSource::Camera))
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));

        let answer = callee.create_answer(&offer).await.unwrap();
        caller.apply_answer(&answer).await.unwrap();

        // Video-Sender existiert: Tausch ohne Neuverhandlung
        let screen = LocalTrack::new(TrackSource::Screen);
        assert!(caller.replace_video_track(Some(&screen)).await.unwrap());
        // Callee hat keinen eigenen Video-Sender
        assert!(!callee.replace_video_track(Some(&screen)).await.unwrap());

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_offer_rejected_while_own_offer_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = offline_connector();
        let mic = LocalTrack::new(TrackSource::Microphone);

        let alice = connector
            .connect(LinkEvents::new("dave".into(), 1, tx.clone()))
            .await
            .unwrap();
        let dave = connector
            .connect(LinkEvents::new("alice".into(), 2, tx))
            .await
            .unwrap();
        alice.add_track(&mic).await.unwrap();
        dave.add_track(&mic).await.unwrap();

        let dave_offer = dave.create_offer().await.unwrap();
        alice.create_offer().await.unwrap();

        let result = alice.create_answer(&dave_offer).await;
        assert!(matches!(result, Err(NegotiationError::InvalidSdp(_))));

        alice.close().await.unwrap();
        dave.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sample_track_shared_across_connections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = offline_connector();
        let mic = LocalTrack::new(TrackSource::Microphone);

        let first = connector
            .connect(LinkEvents::new("bob".into(), 1, tx.clone()))
            .await
            .unwrap();
        let second = connector
            .connect(LinkEvents::new("carol".into(), 2, tx))
            .await
            .unwrap();
        first.add_track(&mic).await.unwrap();
        second.add_track(&mic).await.unwrap();

        let sample = connector.sample_track(&mic);
        assert_eq!(sample.id(), mic.id());
        assert_eq!(sample.stream_id(), STREAM_ID);
        assert!(Arc::ptr_eq(&sample, &connector.clone().sample_track(&mic)));
        assert_eq!(connector.samples.lock().len(), 1);

        // Gestoppte Tracks werden beim nächsten Zugriff entfernt
        mic.stop();
        let camera = LocalTrack::new(TrackSource::Camera);
        connector.sample_track(&camera);
        assert!(!connector.samples.lock().contains_key(mic.id()));

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_offer_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = offline_connector()
            .connect(LinkEvents::new("peer".into(), 1, tx))
            .await
            .unwrap();

        let result = connection.create_answer("not an sdp").await;
        assert!(matches!(result, Err(NegotiationError::InvalidSdp(_))));
        connection.close().await.unwrap();
    }
}
