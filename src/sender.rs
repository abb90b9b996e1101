use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use webrtc::rtcp;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// One outbound RTP leg: packets go down it, feedback comes back up.
///
/// The forwarding pipeline only ever needs these two operations, so the
/// transport handle sits behind a trait; tests substitute a recorder.
#[async_trait]
pub trait MediaSender: Send + Sync {
    /// Send one RTP packet down this leg.
    async fn send_rtp(&self, pkt: &rtp::packet::Packet) -> Result<usize>;
    /// Read the next batch of RTCP reports arriving on this leg.
    async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>;
}

/// An outbound subscription, stamped with the remote peer's connection
/// generation at the time it was attached. A replay request addressed to an
/// older generation is rejected.
#[derive(Clone)]
pub struct Sender {
    /// the remote peer's `cid` captured at attachment
    pub id: String,
    pub out: Arc<dyn MediaSender>,
}

/// Production [`MediaSender`] over a dedicated local track and the RTP
/// sender handle its `add_track` returned.
pub struct TrackSender {
    track: Arc<TrackLocalStaticRTP>,
    rtp: Arc<RTCRtpSender>,
}

impl TrackSender {
    pub fn new(track: Arc<TrackLocalStaticRTP>, rtp: Arc<RTCRtpSender>) -> Self {
        TrackSender { track, rtp }
    }
}

#[async_trait]
impl MediaSender for TrackSender {
    async fn send_rtp(&self, pkt: &rtp::packet::Packet) -> Result<usize> {
        Ok(self.track.write_rtp(pkt).await?)
    }

    async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>> {
        // interceptors only process the reports if someone drains the sender
        let mut buf = vec![0u8; 1500];
        let (n, _) = self.rtp.read(&mut buf).await?;
        let mut raw = &buf[..n];
        Ok(rtcp::packet::unmarshal(&mut raw)?)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Records everything sent down the leg and feeds canned RTCP batches
    /// back up.
    pub(crate) struct MockSender {
        pub sent: Mutex<Vec<rtp::packet::Packet>>,
        pub rtcp: Mutex<Vec<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>>,
    }

    impl MockSender {
        pub fn new() -> Arc<Self> {
            Arc::new(MockSender {
                sent: Mutex::new(Vec::new()),
                rtcp: Mutex::new(Vec::new()),
            })
        }

        pub fn sent_sequences(&self) -> Vec<u16> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.header.sequence_number)
                .collect()
        }
    }

    #[async_trait]
    impl MediaSender for MockSender {
        async fn send_rtp(&self, pkt: &rtp::packet::Packet) -> Result<usize> {
            self.sent.lock().unwrap().push(pkt.clone());
            Ok(pkt.payload.len())
        }

        async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>> {
            let mut queued = self.rtcp.lock().unwrap();
            if queued.is_empty() {
                anyhow::bail!("sender closed");
            }
            Ok(queued.remove(0))
        }
    }
}
