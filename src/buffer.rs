use webrtc::rtp;

/// One slot per distinct 16-bit RTP sequence value.
const RING_SIZE: usize = 1 << 16;

/// Fixed ring holding the most recent packet seen for every sequence value.
///
/// Written only by the forwarder and read back when a subscriber asks for a
/// retransmission. Slots hold owned packets; an overwrite drops the previous
/// value.
pub(crate) struct PacketRing {
    slots: Vec<Option<rtp::packet::Packet>>,
}

impl PacketRing {
    pub fn new() -> Self {
        PacketRing {
            slots: vec![None; RING_SIZE],
        }
    }

    /// Store `pkt` in the slot matching its own sequence number.
    pub fn put(&mut self, pkt: rtp::packet::Packet) {
        let idx = pkt.header.sequence_number as usize;
        self.slots[idx] = Some(pkt);
    }

    pub fn get(&self, seq: u16) -> Option<&rtp::packet::Packet> {
        self.slots[seq as usize].as_ref()
    }
}

/// Wrap-aware "is `a` strictly ahead of `b`" for 32-bit RTP timestamps.
pub(crate) fn ts_after(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 1 << 31
}

/// Media ticks from `then` to `now`; meaningful when `now` is not behind.
pub(crate) fn ts_elapsed(now: u32, then: u32) -> u32 {
    now.wrapping_sub(then)
}
