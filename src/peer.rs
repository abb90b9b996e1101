use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::forward::Forwarder;
use crate::nack::{self, NackRequest};
use crate::sender::{MediaSender, Sender, TrackSender};
use crate::{
    opus_codec_capability, CLOSED_CID, CONNECT_TIMEOUT, LOST_CAPACITY, NACK_CAPACITY,
    QUEUE_CAPACITY,
};

/// State guarded by the peer's read/write lock: the connection generation,
/// the publishing descriptor and the subscription maps. The maps are
/// mutated by the room manager through [`Peer::attach_subscriber`] and
/// friends.
struct Shared {
    cid: String,
    track: Option<Arc<TrackLocalStaticRTP>>,
    publishers: HashMap<String, Sender>,
    subscribers: HashMap<String, Sender>,
}

/// Receiving halves of the forwarding pipeline plus the loss feed, claimed
/// by the forwarder when the first inbound track arrives.
pub(crate) struct Pipeline {
    pub(crate) queue_rx: mpsc::Receiver<rtp::packet::Packet>,
    pub(crate) nack_rx: mpsc::Receiver<NackRequest>,
    pub(crate) lost_tx: mpsc::Sender<rtp::header::Header>,
}

/// One participant session.
///
/// A peer uploads a single opus stream and fans it out to the subscriber
/// legs other peers attach. Construction starts the connection watchdog and
/// the NACK originator; the ingress reader and the forwarder start when the
/// first track arrives. Everything winds down through [`Peer::close`],
/// which is safe to call any number of times.
pub struct Peer {
    /// room this peer belongs to
    pub rid: String,
    /// participant within the room, unique per room
    pub uid: String,
    /// negotiated connection, established by the embedding application
    pub connection: Arc<RTCPeerConnection>,
    shared: RwLock<Shared>,
    /// highest RTP timestamp accepted from the inbound stream
    pub(crate) timestamp: Arc<AtomicU32>,
    /// sequence number of the most recent in-order packet
    pub(crate) sequence: AtomicU16,
    queue_tx: mpsc::Sender<rtp::packet::Packet>,
    nack_tx: mpsc::Sender<NackRequest>,
    connected_tx: mpsc::Sender<()>,
    pipeline: Mutex<Option<Pipeline>>,
}

impl Peer {
    /// Anchor a new session on an established peer connection. Must run
    /// inside a tokio runtime; the watchdog and the NACK originator are
    /// spawned here.
    pub fn build(rid: &str, uid: &str, connection: Arc<RTCPeerConnection>) -> Arc<Peer> {
        let cid = Uuid::new_v4().to_string();
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (nack_tx, nack_rx) = mpsc::channel(NACK_CAPACITY);
        let (lost_tx, lost_rx) = mpsc::channel(LOST_CAPACITY);
        let (connected_tx, connected_rx) = mpsc::channel(1);
        let timestamp = Arc::new(AtomicU32::new(0));

        log::debug!("{}:{}:{}: peer created", rid, uid, cid);
        let peer = Arc::new(Peer {
            rid: rid.to_owned(),
            uid: uid.to_owned(),
            connection: connection.clone(),
            shared: RwLock::new(Shared {
                cid,
                track: None,
                publishers: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            timestamp: timestamp.clone(),
            sequence: AtomicU16::new(0),
            queue_tx,
            nack_tx,
            connected_tx,
            pipeline: Mutex::new(Some(Pipeline {
                queue_rx,
                nack_rx,
                lost_tx,
            })),
        });

        // connection state is only observed
        let tag = format!("{}:{}", rid, uid);
        connection.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            log::debug!("{}: signaling state changed to {}", tag, state);
            Box::pin(async {})
        }));
        let tag = format!("{}:{}", rid, uid);
        connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                log::info!("{}: ice connection state changed to {}", tag, state);
                Box::pin(async {})
            },
        ));
        let tag = format!("{}:{}", rid, uid);
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::info!("{}: connection state changed to {}", tag, state);
                Box::pin(async {})
            },
        ));

        // media arrival drives the rest of the pipeline
        let weak = Arc::downgrade(&peer);
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let (Some(track), Some(peer)) = (track, weak.upgrade()) {
                        peer.accept_track(track).await;
                    }
                })
            },
        ));

        tokio::spawn(watch_connection(Arc::clone(&peer), connected_rx));

        let tag = format!("{}:{}", rid, uid);
        tokio::spawn(async move {
            if let Err(e) = nack::originate(connection, timestamp, lost_rx).await {
                log::warn!("{}: nack originator stopped: {}", tag, e);
            }
        });

        peer
    }

    /// First-track policy: one inbound track per peer, opus only, anything
    /// else is silently ignored. Accepting a track creates the outbound
    /// descriptor and brings up the forwarder and the ingress reader.
    async fn accept_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let mime = track.codec().await.capability.mime_type;
        if !mime.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            log::debug!("{}:{}: ignoring {} track", self.rid, self.uid, mime);
            return;
        }
        // the pipeline ends go to the first accepted track; later tracks
        // find them gone
        let pipe = match self.pipeline.lock().await.take() {
            Some(pipe) => pipe,
            None => {
                log::debug!("{}:{}: additional track ignored", self.rid, self.uid);
                return;
            }
        };
        // release the watchdog; if it already fired the channel is gone and
        // the send result does not matter
        let _ = self.connected_tx.try_send(());

        {
            let mut shared = self.shared.write().await;
            if shared.cid == CLOSED_CID {
                return;
            }
            shared.track = Some(Arc::new(TrackLocalStaticRTP::new(
                opus_codec_capability(),
                shared.cid.clone(),
                self.uid.clone(),
            )));
        }
        log::info!("{}: publishing", self.tag().await);

        let fwd_peer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = Forwarder::new(Arc::clone(&fwd_peer)).run(pipe).await {
                log::warn!("{}: forwarder stopped: {}", fwd_peer.uid, e);
            }
            if let Err(e) = fwd_peer.close().await {
                log::error!("{}: close failed: {}", fwd_peer.uid, e);
            }
        });

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = peer.copy_track(&track).await {
                log::warn!("{}: inbound track failed: {}", peer.uid, e);
            }
            if let Err(e) = peer.close().await {
                log::error!("{}: close failed: {}", peer.uid, e);
            }
        });
    }

    /// Read RTP off the inbound track and hand each packet to the
    /// forwarder. Returns cleanly when the peer is torn down underneath it.
    async fn copy_track(&self, track: &TrackRemote) -> Result<()> {
        loop {
            let (pkt, _) = match track.read_rtp().await {
                Ok(v) => v,
                Err(e) => {
                    // reads fail once the connection goes down; that is the
                    // normal end of the stream
                    if self.is_closed().await {
                        return Ok(());
                    }
                    return Err(e).context("read inbound rtp");
                }
            };
            if self.queue_tx.send(pkt).await.is_err() {
                // forwarder is gone, the peer is on its way down
                return Ok(());
            }
        }
    }

    /// Drain RTCP arriving on one outbound leg, turning transport-layer
    /// NACKs into replay requests for the forwarder. Every request carries
    /// the generation the leg was attached under, so requests aimed at a
    /// replaced leg die in the lookup. Runs until the leg fails.
    pub async fn loop_rtcp(&self, uid: &str, sender: &Sender) -> Result<()> {
        loop {
            let reports = sender.out.read_rtcp().await?;
            for report in reports {
                let nack = match report.as_any().downcast_ref::<TransportLayerNack>() {
                    Some(nack) => nack,
                    None => continue,
                };
                for pair in &nack.nacks {
                    let req = NackRequest {
                        uid: uid.to_owned(),
                        cid: sender.id.clone(),
                        pair: *pair,
                    };
                    // a full queue means the forwarder is drowning; shed it
                    if self.nack_tx.try_send(req).is_err() {
                        log::debug!("{}: nack from {} dropped", self.uid, uid);
                    }
                }
            }
        }
    }

    /// Wire `subscriber` to receive `publisher`'s stream: build the
    /// outbound leg, register it on both sides and start the publisher's
    /// RTCP reader for the leg. Called by the room manager once the
    /// publisher is publishing.
    pub async fn subscribe(publisher: &Arc<Peer>, subscriber: &Arc<Peer>) -> Result<()> {
        let (capability, id, stream_id) = {
            let shared = publisher.shared.read().await;
            let track = shared.track.as_ref().with_context(|| {
                format!("{}:{} is not publishing", publisher.rid, publisher.uid)
            })?;
            (
                track.codec(),
                track.id().to_owned(),
                track.stream_id().to_owned(),
            )
        };
        let feed = Arc::new(TrackLocalStaticRTP::new(capability, id, stream_id));
        let rtp_sender = subscriber
            .connection
            .add_track(feed.clone())
            .await
            .context("add outbound track")?;
        let out: Arc<dyn MediaSender> = Arc::new(TrackSender::new(feed, rtp_sender));

        let publisher_gen = publisher.cid().await;
        let subscriber_gen = subscriber.cid().await;
        let leg = Sender {
            id: subscriber_gen,
            out: out.clone(),
        };
        publisher
            .attach_subscriber(&subscriber.uid, leg.clone())
            .await?;
        subscriber
            .attach_publisher(
                &publisher.uid,
                Sender {
                    id: publisher_gen,
                    out,
                },
            )
            .await?;

        let peer = Arc::clone(publisher);
        let sub_uid = subscriber.uid.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.loop_rtcp(&sub_uid, &leg).await {
                log::debug!("{}: rtcp loop for {} ended: {}", peer.uid, sub_uid, e);
            }
        });
        Ok(())
    }

    /// Register the outbound leg toward `uid`, replacing any prior
    /// generation. Called by the room manager.
    pub async fn attach_subscriber(&self, uid: &str, sender: Sender) -> Result<()> {
        let mut shared = self.shared.write().await;
        if shared.cid == CLOSED_CID {
            bail!("{}:{}: peer is closed", self.rid, self.uid);
        }
        shared.subscribers.insert(uid.to_owned(), sender);
        Ok(())
    }

    /// Register the inbound subscription this peer holds against `uid`.
    pub async fn attach_publisher(&self, uid: &str, sender: Sender) -> Result<()> {
        let mut shared = self.shared.write().await;
        if shared.cid == CLOSED_CID {
            bail!("{}:{}: peer is closed", self.rid, self.uid);
        }
        shared.publishers.insert(uid.to_owned(), sender);
        Ok(())
    }

    pub async fn detach_subscriber(&self, uid: &str) {
        self.shared.write().await.subscribers.remove(uid);
    }

    pub async fn detach_publisher(&self, uid: &str) {
        self.shared.write().await.publishers.remove(uid);
    }

    /// Tear the session down: clear the publishing descriptor, stamp the
    /// generation as closed and close the underlying connection. Dependent
    /// loops exit at their next read or send. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        {
            let mut shared = self.shared.write().await;
            if shared.cid == CLOSED_CID {
                return Ok(());
            }
            log::info!("{}:{}:{}: closing", self.rid, self.uid, shared.cid);
            shared.track = None;
            shared.cid = CLOSED_CID.to_owned();
        }
        // unclaimed pipeline ends would keep the nack originator parked on
        // a live channel; let go of them so it can exit
        self.pipeline.lock().await.take();
        self.connection
            .close()
            .await
            .context("close peer connection")
    }

    /// Current connection generation; `"CLOSED"` once the peer is down.
    pub async fn cid(&self) -> String {
        self.shared.read().await.cid.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.read().await.cid == CLOSED_CID
    }

    /// Highest RTP timestamp accepted from the inbound stream.
    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// Sequence number of the most recent in-order packet.
    pub fn sequence(&self) -> u16 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Composite identifier rendered for logs.
    async fn tag(&self) -> String {
        let shared = self.shared.read().await;
        format!("{}:{}:{}", self.rid, self.uid, shared.cid)
    }

    /// The leg toward `uid`, provided the request targets the generation
    /// currently attached.
    pub(crate) async fn subscriber_leg(
        &self,
        uid: &str,
        cid: &str,
    ) -> Option<Arc<dyn MediaSender>> {
        let shared = self.shared.read().await;
        match shared.subscribers.get(uid) {
            Some(sender) if sender.id == cid => Some(sender.out.clone()),
            Some(_) => {
                log::debug!("{}: nack from {} targets a replaced sender", self.uid, uid);
                None
            }
            None => None,
        }
    }

    /// Snapshot of the outbound legs, cloned so no lock is held while
    /// writing to them.
    pub(crate) async fn subscriber_legs(&self) -> Vec<(String, Arc<dyn MediaSender>)> {
        let shared = self.shared.read().await;
        shared
            .subscribers
            .iter()
            .map(|(uid, sender)| (uid.clone(), sender.out.clone()))
            .collect()
    }
}

/// Close the peer if no media shows up within the connection timeout.
async fn watch_connection(peer: Arc<Peer>, mut connected_rx: mpsc::Receiver<()>) {
    match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx.recv()).await {
        // first track arrived, nothing left to watch
        Ok(_) => {}
        Err(_) => {
            log::warn!("{}: no media within {:?}", peer.tag().await, CONNECT_TIMEOUT);
            if let Err(e) = peer.close().await {
                log::error!("{}: close failed: {}", peer.uid, e);
            }
        }
    }
}
