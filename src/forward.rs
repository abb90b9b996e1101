use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use webrtc::rtp;

use crate::buffer::{ts_after, ts_elapsed, PacketRing};
use crate::nack::NackRequest;
use crate::peer::{Peer, Pipeline};
use crate::{NACK_WINDOW, READ_TIMEOUT, RTP_PACKET_EXPIRATION};

/// Decision for one ingress packet.
pub(crate) enum Admission {
    /// store and fan out, reporting any sequence gap that opened up
    Accept { lost: Vec<rtp::header::Header> },
    /// stale, expired or duplicate
    Discard,
}

/// Admission state of the inbound stream: the replay ring plus the most
/// recently accepted (sequence, timestamp) pair.
///
/// Acceptance goes by timestamp rather than sequence monotonicity, so the
/// 16-bit sequence space can wrap freely and a late packet may still fill
/// the slot for an equal-or-older position without corrupting the
/// "most recent" view.
pub(crate) struct FlowState {
    ring: PacketRing,
    sequence: u16,
    timestamp: u32,
    started: bool,
}

impl FlowState {
    pub fn new() -> Self {
        FlowState {
            ring: PacketRing::new(),
            sequence: 0,
            timestamp: 0,
            started: false,
        }
    }

    /// Apply the admission policy to one header, advancing the stream state
    /// on accept. Storing the packet is the caller's step.
    pub fn admit(&mut self, h: &rtp::header::Header) -> Admission {
        // an equal-or-newer packet already occupies the slot
        if let Some(prev) = self.ring.get(h.sequence_number) {
            if !ts_after(h.timestamp, prev.header.timestamp) {
                return Admission::Discard;
            }
        }
        if self.started {
            // more than the expiration window behind the stream
            if ts_after(self.timestamp, h.timestamp)
                && ts_elapsed(self.timestamp, h.timestamp) > RTP_PACKET_EXPIRATION
            {
                return Admission::Discard;
            }
            if self.timestamp == h.timestamp {
                return Admission::Discard;
            }
        }

        let mut lost = Vec::new();
        if !self.started {
            self.started = true;
            self.sequence = h.sequence_number;
            self.timestamp = h.timestamp;
        } else if ts_after(h.timestamp, self.timestamp) {
            lost = self.missing_before(h);
            self.sequence = h.sequence_number;
            self.timestamp = h.timestamp;
        }
        Admission::Accept { lost }
    }

    /// Header-only descriptors for the sequences skipped between the
    /// previous in-order packet and `h`. The synthesised headers carry the
    /// stream timestamp the missing packets were expected around.
    fn missing_before(&self, h: &rtp::header::Header) -> Vec<rtp::header::Header> {
        let mut gap = h.sequence_number.wrapping_sub(self.sequence);
        if gap <= 1 {
            return Vec::new();
        }
        // the jump itself is a quarter second of media time old; a replay
        // would arrive long past its playout point
        if ts_elapsed(h.timestamp, self.timestamp) > RTP_PACKET_EXPIRATION / 2 {
            return Vec::new();
        }
        let mut next = self.sequence.wrapping_add(1);
        if gap > NACK_WINDOW {
            // only the most recent window fits one report; skip the front
            next = next.wrapping_add(gap - NACK_WINDOW);
            gap = NACK_WINDOW;
        }
        let mut lost = Vec::with_capacity(gap as usize - 1);
        while next != h.sequence_number {
            lost.push(rtp::header::Header {
                version: 2,
                payload_type: h.payload_type,
                sequence_number: next,
                timestamp: self.timestamp,
                ssrc: h.ssrc,
                ..Default::default()
            });
            next = next.wrapping_add(1);
        }
        lost
    }

    pub fn store(&mut self, pkt: rtp::packet::Packet) {
        self.ring.put(pkt);
    }

    /// Buffered packet eligible for retransmission, unless it has aged out
    /// of the expiration window.
    pub fn replay(&self, seq: u16) -> Option<&rtp::packet::Packet> {
        let pkt = self.ring.get(seq)?;
        if ts_after(self.timestamp, pkt.header.timestamp)
            && ts_elapsed(self.timestamp, pkt.header.timestamp) > RTP_PACKET_EXPIRATION
        {
            return None;
        }
        Some(pkt)
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

/// Per-peer forwarding task.
///
/// Owns the replay ring outright: it is the only writer, and replay
/// requests are serviced inline here rather than by a separate task, so no
/// lock guards the ring.
pub(crate) struct Forwarder {
    peer: Arc<Peer>,
    flow: FlowState,
}

impl Forwarder {
    pub fn new(peer: Arc<Peer>) -> Self {
        Forwarder {
            peer,
            flow: FlowState::new(),
        }
    }

    /// Drain ingress packets and replay requests until the peer shuts down.
    /// Going [`READ_TIMEOUT`] without either event means the inbound stream
    /// is dead; the caller reacts by closing the peer.
    pub async fn run(mut self, pipe: Pipeline) -> Result<()> {
        let Pipeline {
            mut queue_rx,
            mut nack_rx,
            lost_tx,
        } = pipe;
        loop {
            tokio::select! {
                pkt = queue_rx.recv() => match pkt {
                    Some(pkt) => self.ingest(pkt, &lost_tx).await,
                    None => return Ok(()),
                },
                req = nack_rx.recv() => match req {
                    Some(req) => self.service(req).await,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(READ_TIMEOUT) => {
                    bail!("no ingress traffic for {:?}", READ_TIMEOUT);
                }
            }
        }
    }

    /// Admit one ingress packet, record any losses it reveals, store it and
    /// fan it out to every subscriber leg.
    pub(crate) async fn ingest(
        &mut self,
        pkt: rtp::packet::Packet,
        lost_tx: &mpsc::Sender<rtp::header::Header>,
    ) {
        let lost = match self.flow.admit(&pkt.header) {
            Admission::Discard => return,
            Admission::Accept { lost } => lost,
        };
        for header in lost {
            // the loss channel is sized to one report window; overflow is shed
            let _ = lost_tx.try_send(header);
        }
        self.peer
            .timestamp
            .store(self.flow.timestamp(), Ordering::SeqCst);
        self.peer
            .sequence
            .store(self.flow.sequence(), Ordering::SeqCst);

        self.flow.store(pkt.clone());
        for (uid, out) in self.peer.subscriber_legs().await {
            if let Err(e) = out.send_rtp(&pkt).await {
                log::warn!("{}: forward to {} failed: {}", self.peer.uid, uid, e);
            }
        }
    }

    /// Replay buffered packets for one subscriber NACK. Requests for a
    /// missing or replaced sender are dropped; per-packet send errors are
    /// logged and skipped.
    pub(crate) async fn service(&self, req: NackRequest) {
        let out = match self.peer.subscriber_leg(&req.uid, &req.cid).await {
            Some(out) => out,
            None => return,
        };
        for seq in req.pair.packet_list() {
            let pkt = match self.flow.replay(seq) {
                Some(pkt) => pkt,
                None => continue,
            };
            if let Err(e) = out.send_rtp(pkt).await {
                log::warn!(
                    "{}: retransmit {} to {} failed: {}",
                    self.peer.uid,
                    seq,
                    req.uid,
                    e
                );
            }
        }
    }
}
