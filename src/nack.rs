use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp;

use crate::buffer::ts_elapsed;
use crate::{NACK_FLUSH_COUNT, NACK_INTERVAL, RTP_PACKET_EXPIRATION};

/// Replay request from one subscriber, tagged with the generation it was
/// addressed to so requests for a replaced sender can be dropped.
#[derive(Debug, Clone)]
pub(crate) struct NackRequest {
    pub uid: String,
    pub cid: String,
    pub pair: NackPair,
}

/// Feedback path toward the publisher. The peer connection in production;
/// tests substitute a recorder.
#[async_trait]
pub(crate) trait FeedbackWriter: Send + Sync {
    /// Push one NACK report upstream.
    async fn write_feedback(&self, nack: TransportLayerNack) -> Result<()>;
}

#[async_trait]
impl FeedbackWriter for RTCPeerConnection {
    async fn write_feedback(&self, nack: TransportLayerNack) -> Result<()> {
        let report: Box<dyn rtcp::packet::Packet + Send + Sync> = Box::new(nack);
        self.write_rtcp(&[report]).await?;
        Ok(())
    }
}

/// Coalesce detected gaps into transport-layer NACK feedback for the
/// publisher.
///
/// Losses wait until a full report is pending or the oldest entry has aged
/// a quarter of the expiration window against the stream clock, whichever
/// comes first. The task ends when the loss channel closes; a feedback
/// write error ends it early without touching the rest of the peer.
pub(crate) async fn originate(
    writer: Arc<dyn FeedbackWriter>,
    timestamp: Arc<AtomicU32>,
    mut lost_rx: mpsc::Receiver<rtp::header::Header>,
) -> Result<()> {
    let sender_ssrc = rand::random::<u32>();
    let mut pending: Vec<rtp::header::Header> = Vec::new();
    let mut ticker = tokio::time::interval(NACK_INTERVAL);
    loop {
        tokio::select! {
            header = lost_rx.recv() => match header {
                Some(header) => pending.push(header),
                None => return Ok(()),
            },
            _ = ticker.tick() => {}
        }

        let first = match pending.first() {
            Some(first) => first,
            None => continue,
        };
        let age = ts_elapsed(timestamp.load(Ordering::SeqCst), first.timestamp);
        let due = age < 1 << 31 && age >= RTP_PACKET_EXPIRATION / 4;
        if pending.len() < NACK_FLUSH_COUNT && !due {
            continue;
        }

        writer
            .write_feedback(batch(sender_ssrc, &mut pending))
            .await
            .context("write nack feedback")?;
    }
}

/// Fold the pending headers into a single NACK pair anchored at the first
/// pending sequence. Entries that cannot be expressed relative to the
/// anchor are dropped.
fn batch(sender_ssrc: u32, pending: &mut Vec<rtp::header::Header>) -> TransportLayerNack {
    let anchor = pending[0].sequence_number;
    let media_ssrc = pending[0].ssrc;
    let mut pair = NackPair {
        packet_id: anchor,
        lost_packets: 0,
    };
    for header in pending.iter().skip(1) {
        let delta = header.sequence_number.wrapping_sub(anchor);
        if delta == 0 || delta > 16 {
            continue;
        }
        pair.lost_packets |= 1 << (delta - 1);
    }
    pending.clear();
    TransportLayerNack {
        sender_ssrc,
        media_ssrc,
        nacks: vec![pair],
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::LOST_CAPACITY;

    fn header(seq: u16, ts: u32) -> rtp::header::Header {
        rtp::header::Header {
            version: 2,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0xabc,
            ..Default::default()
        }
    }

    /// Records every report pushed upstream.
    struct MockWriter {
        sent: Mutex<Vec<TransportLayerNack>>,
    }

    impl MockWriter {
        fn new() -> Arc<Self> {
            Arc::new(MockWriter {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FeedbackWriter for MockWriter {
        async fn write_feedback(&self, nack: TransportLayerNack) -> Result<()> {
            self.sent.lock().unwrap().push(nack);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_loss_emitted_after_aging() {
        let writer = MockWriter::new();
        // the stream stands where the gap was found
        let timestamp = Arc::new(AtomicU32::new(57_040));
        let (lost_tx, lost_rx) = mpsc::channel(LOST_CAPACITY);
        let task = tokio::spawn(originate(writer.clone(), timestamp.clone(), lost_rx));

        lost_tx.send(header(1050, 57_040)).await.unwrap();
        // ticks pass but the gap is too fresh to report
        tokio::time::sleep(NACK_INTERVAL * 2).await;
        assert!(writer.sent.lock().unwrap().is_empty());

        // the stream clock moves a quarter window past the gap
        timestamp.store(57_040 + RTP_PACKET_EXPIRATION / 4, Ordering::SeqCst);
        tokio::time::sleep(NACK_INTERVAL * 2).await;

        drop(lost_tx);
        task.await.unwrap().unwrap();

        let sent = writer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].media_ssrc, 0xabc);
        assert_eq!(
            sent[0].nacks,
            vec![NackPair {
                packet_id: 1050,
                lost_packets: 0,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_loss_emitted_as_one_report() {
        let writer = MockWriter::new();
        let timestamp = Arc::new(AtomicU32::new(57_040));
        let (lost_tx, lost_rx) = mpsc::channel(LOST_CAPACITY);
        let task = tokio::spawn(originate(writer.clone(), timestamp.clone(), lost_rx));

        for seq in 1050..=1055u16 {
            lost_tx.send(header(seq, 57_040)).await.unwrap();
        }
        // let the whole burst accumulate while it is still fresh, then age it
        tokio::time::sleep(NACK_INTERVAL).await;
        assert!(writer.sent.lock().unwrap().is_empty());
        timestamp.store(57_040 + RTP_PACKET_EXPIRATION / 4, Ordering::SeqCst);
        tokio::time::sleep(NACK_INTERVAL * 2).await;

        drop(lost_tx);
        task.await.unwrap().unwrap();

        let sent = writer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nacks[0].packet_id, 1050);
        assert_eq!(sent[0].nacks[0].lost_packets, 0b0001_1111);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_flushes_without_aging() {
        let writer = MockWriter::new();
        let timestamp = Arc::new(AtomicU32::new(57_040));
        let (lost_tx, lost_rx) = mpsc::channel(LOST_CAPACITY);
        let task = tokio::spawn(originate(writer.clone(), timestamp.clone(), lost_rx));

        // a full report's worth of pending losses flushes even though none
        // has aged against the stream clock
        for seq in 1000..=1015u16 {
            lost_tx.send(header(seq, 57_040)).await.unwrap();
        }
        tokio::time::sleep(NACK_INTERVAL).await;

        drop(lost_tx);
        task.await.unwrap().unwrap();

        let sent = writer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nacks[0].packet_id, 1000);
        assert_eq!(sent[0].nacks[0].lost_packets, 0b0111_1111_1111_1111);
    }

    #[test]
    fn test_batch_single_loss() {
        let mut pending = vec![header(1050, 10_000)];
        let nack = batch(7, &mut pending);
        assert_eq!(nack.sender_ssrc, 7);
        assert_eq!(nack.media_ssrc, 0xabc);
        assert_eq!(
            nack.nacks,
            vec![NackPair {
                packet_id: 1050,
                lost_packets: 0,
            }]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_batch_burst() {
        let mut pending: Vec<_> = (1050..=1055).map(|seq| header(seq, 10_000)).collect();
        let nack = batch(7, &mut pending);
        assert_eq!(nack.nacks[0].packet_id, 1050);
        assert_eq!(nack.nacks[0].lost_packets, 0b0001_1111);
    }

    #[test]
    fn test_batch_drops_unencodable() {
        // behind the anchor, a duplicate of it, one past the bitmap, and the
        // last sequence the bitmap can still express
        let mut pending = vec![
            header(1050, 0),
            header(1049, 0),
            header(1050, 0),
            header(1067, 0),
            header(1066, 0),
        ];
        let nack = batch(7, &mut pending);
        assert_eq!(nack.nacks[0].packet_id, 1050);
        assert_eq!(nack.nacks[0].lost_packets, 1 << 15);
    }

    #[test]
    fn test_batch_across_wrap() {
        let mut pending = vec![header(65535, 0), header(0, 0), header(1, 0)];
        let nack = batch(7, &mut pending);
        assert_eq!(nack.nacks[0].packet_id, 65535);
        assert_eq!(nack.nacks[0].lost_packets, 0b11);
    }
}
