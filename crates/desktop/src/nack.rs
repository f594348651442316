//! Send-side NACK retransmission.
//!
//! Every outbound video packet is recorded in a bounded ring keyed by
//! sequence number. When a viewer reports loss via a transport-layer NACK,
//! the buffered originals are written to the track again, bit for bit, in
//! ascending sequence order. Sequences that have already been overwritten
//! are skipped silently. PLI is deliberately not handled: the upstream
//! encoder cannot produce a keyframe on demand.

use std::sync::Arc;

use parking_lot::Mutex;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::packet::Packet;
use tracing::{debug, trace};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// Default ring size. At the 1200-byte MTU this is at most ~38 MB per
/// video track.
pub const DEFAULT_NACK_CAPACITY: usize = 32768;

pub struct NackBuffer {
    slots: Mutex<Vec<Option<Packet>>>,
}

impl NackBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "NACK ring needs at least one slot");
        Arc::new(Self {
            slots: Mutex::new(vec![None; capacity]),
        })
    }

    /// Record an outbound packet, evicting whatever shared its slot.
    pub fn record(&self, packet: Packet) {
        let mut slots = self.slots.lock();
        let index = packet.header.sequence_number as usize % slots.len();
        slots[index] = Some(packet);
    }

    pub fn get(&self, sequence: u16) -> Option<Packet> {
        let slots = self.slots.lock();
        let index = sequence as usize % slots.len();
        slots[index]
            .as_ref()
            .filter(|p| p.header.sequence_number == sequence)
            .cloned()
    }

    /// Expand a NACK into the buffered packets it names, ascending by
    /// request order (pid first, then each set mask bit).
    pub fn lookup(&self, nack: &TransportLayerNack) -> Vec<Packet> {
        let mut found = Vec::new();
        for pair in &nack.nacks {
            for sequence in expand_pair(pair.packet_id, pair.lost_packets) {
                match self.get(sequence) {
                    Some(packet) => found.push(packet),
                    None => trace!(sequence, "NACKed packet no longer buffered"),
                }
            }
        }
        found
    }

    /// Retransmit everything the NACK names that is still buffered.
    /// Returns the number of packets re-sent.
    pub async fn retransmit(
        &self,
        nack: &TransportLayerNack,
        track: &TrackLocalStaticRTP,
    ) -> usize {
        let packets = self.lookup(nack);
        let mut sent = 0;
        for packet in &packets {
            match track.write_rtp(packet).await {
                Ok(_) => sent += 1,
                Err(e) => debug!(
                    sequence = packet.header.sequence_number,
                    "NACK retransmission failed: {e}"
                ),
            }
        }
        if sent > 0 {
            debug!(sent, "retransmitted NACKed packets");
        }
        sent
    }
}

/// Standard NACK pair semantics: the pid itself is always lost, and mask
/// bit k names pid + k + 1.
fn expand_pair(packet_id: u16, lost_packets: u16) -> impl Iterator<Item = u16> {
    std::iter::once(packet_id).chain(
        (0u16..16)
            .filter(move |bit| lost_packets & (1 << bit) != 0)
            .map(move |bit| packet_id.wrapping_add(bit + 1)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtcp::transport_feedbacks::transport_layer_nack::NackPair;
    use rtp::header::Header;

    fn packet(sequence: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 102,
                sequence_number: sequence,
                timestamp: sequence as u32 * 3000,
                ssrc: 0x1234,
                ..Default::default()
            },
            payload: Bytes::from(vec![sequence as u8; 32]),
        }
    }

    fn nack(pid: u16, blp: u16) -> TransportLayerNack {
        TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 0x1234,
            nacks: vec![NackPair {
                packet_id: pid,
                lost_packets: blp,
            }],
        }
    }

    #[test]
    fn expand_pair_standard_semantics() {
        assert_eq!(expand_pair(100, 0).collect::<Vec<_>>(), vec![100]);
        assert_eq!(
            expand_pair(100, 0b0000_0101).collect::<Vec<_>>(),
            vec![100, 101, 103]
        );
        assert_eq!(
            expand_pair(100, 0xFFFF).collect::<Vec<_>>().len(),
            17 // pid plus all 16 mask bits
        );
    }

    #[test]
    fn mask_expansion_follows_standard_semantics() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        for seq in 100..110 {
            buffer.record(packet(seq));
        }
        // pid is always included; mask bit k means pid + k + 1.
        let found = buffer.lookup(&nack(100, 0b0000_0101));
        let seqs: Vec<u16> = found.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![100, 101, 103]);
    }

    #[test]
    fn retransmitted_payloads_are_bit_identical() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        for seq in 100..110 {
            buffer.record(packet(seq));
        }
        let found = buffer.lookup(&nack(102, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], packet(102));
    }

    #[test]
    fn absent_sequences_are_skipped_silently() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        buffer.record(packet(100));
        buffer.record(packet(103));
        let found = buffer.lookup(&nack(100, 0b0000_0111)); // 100,101,102,103
        let seqs: Vec<u16> = found.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![100, 103]);
    }

    #[test]
    fn results_are_in_ascending_order() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        for seq in [105u16, 100, 103, 101] {
            buffer.record(packet(seq));
        }
        let found = buffer.lookup(&nack(100, 0b0001_1111)); // 100..=105
        let seqs: Vec<u16> = found.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![100, 101, 103, 105]);
    }

    #[test]
    fn ring_evicts_colliding_slots() {
        let buffer = NackBuffer::new(16);
        buffer.record(packet(5));
        buffer.record(packet(5 + 16)); // same slot
        assert!(buffer.get(5).is_none());
        assert_eq!(buffer.get(21).unwrap().header.sequence_number, 21);
    }

    #[test]
    fn multiple_pairs_in_one_nack() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        for seq in 0..300 {
            buffer.record(packet(seq));
        }
        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 0x1234,
            nacks: vec![
                NackPair {
                    packet_id: 10,
                    lost_packets: 0,
                },
                NackPair {
                    packet_id: 200,
                    lost_packets: 0b1,
                },
            ],
        };
        let seqs: Vec<u16> = buffer
            .lookup(&nack)
            .iter()
            .map(|p| p.header.sequence_number)
            .collect();
        assert_eq!(seqs, vec![10, 200, 201]);
    }

    #[test]
    fn wraparound_sequences_resolve() {
        let buffer = NackBuffer::new(DEFAULT_NACK_CAPACITY);
        buffer.record(packet(u16::MAX));
        buffer.record(packet(0));
        let found = buffer.lookup(&nack(u16::MAX, 0b1));
        let seqs: Vec<u16> = found.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![u16::MAX, 0]);
    }
}
