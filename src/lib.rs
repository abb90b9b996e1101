//! simple-sfu
//!
//! Per-participant forwarding core of a selective forwarding unit carrying
//! opus audio over [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! Each participant session is a [`Peer`]: it terminates one inbound opus
//! track, keeps a replay window of recently forwarded packets, reports
//! upstream loss with transport-layer NACKs and answers NACKs arriving from
//! its subscribers by replaying out of that window.
//!
//! Signalling, SDP negotiation and room membership stay with the embedding
//! application: a `Peer` is handed an already created `RTCPeerConnection`
//! (built from [`create_api`]) and takes over from the first media packet.
//! Wiring one peer's stream into another is done with [`Peer::subscribe`].

use std::time::Duration;

use anyhow::Result;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

mod buffer;
mod forward;
mod nack;
mod peer;
mod sender;

// public exports
pub use peer::Peer;
pub use sender::{MediaSender, Sender, TrackSender};

/// opus always runs on a 48 kHz RTP clock
pub const RTP_CLOCK_RATE: u32 = 48_000;
/// payload type the media engine negotiates for opus
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Packets more than half a second of media time behind the stream are past
/// saving: not forwarded, not replayed, not worth asking for again.
pub(crate) const RTP_PACKET_EXPIRATION: u32 = RTP_CLOCK_RATE / 2;

/// ingress packets awaiting the forwarder
pub(crate) const QUEUE_CAPACITY: usize = 48_000;
/// one NACK report window: the base sequence plus a 16-bit bitmap
pub(crate) const NACK_WINDOW: u16 = 17;
/// synthesised loss headers awaiting coalescing
pub(crate) const LOST_CAPACITY: usize = NACK_WINDOW as usize;
/// replay requests awaiting service
pub(crate) const NACK_CAPACITY: usize = 48_000;
/// pending losses that force a feedback flush
pub(crate) const NACK_FLUSH_COUNT: usize = 16;

/// media must arrive this soon after construction
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// the forwarder gives up after this long without a packet or a request
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// upstream feedback cadence, a quarter of the expiration window
pub(crate) const NACK_INTERVAL: Duration = Duration::from_millis(125);

/// generation stamp of a closed peer
pub(crate) const CLOSED_CID: &str = "CLOSED";

/// The codec every track in and out of the unit is negotiated with.
pub fn opus_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: RTP_CLOCK_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// Build the webrtc API object the embedding application creates peer
/// connections with. Only opus is registered, so any other codec fails
/// negotiation before it ever reaches a peer.
pub fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_codec(
        RTCRtpCodecParameters {
            capability: opus_codec_capability(),
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides RTCP Reports and other features. If you use `webrtc.NewPeerConnection`
    // this is enabled by default. If you are manually managing You MUST create a InterceptorRegistry
    // for each PeerConnection.
    let mut registry = Registry::new();

    // Use the default set of Interceptors
    registry = register_default_interceptors(registry, &mut media)?;

    // Create the API object with the MediaEngine
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
