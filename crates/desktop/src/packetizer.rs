//! RTP packetization with drop-on-full delivery.
//!
//! One packetizer per media source; it is the only writer for its SSRC, so
//! sequence numbers are strictly monotonic modulo 2^16. Sequence and
//! timestamp both start at random values; the timestamp advances by the
//! caller-supplied sample count after every payload.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;
use rtp::packetizer::Payloader;
use tokio::sync::mpsc;
use tracing::warn;

/// Hard ceiling per packet, header included.
pub const RTP_OUTBOUND_MTU: usize = 1200;
const RTP_HEADER_SIZE: usize = 12;

pub struct RtpPacketizer {
    payloader: Box<dyn Payloader + Send + Sync>,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpPacketizer {
    pub fn new(payload_type: u8, payloader: Box<dyn Payloader + Send + Sync>) -> Self {
        Self {
            payloader,
            payload_type,
            ssrc: rand::random(),
            sequence: rand::random(),
            timestamp: rand::random(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Split one media unit into RTP packets. The marker bit is set on the
    /// final packet of the batch; `samples` advances the clock afterwards.
    pub fn packetize(&mut self, payload: &Bytes, samples: u32) -> Result<Vec<Packet>, rtp::Error> {
        let payloads = self
            .payloader
            .payload(RTP_OUTBOUND_MTU - RTP_HEADER_SIZE, payload)?;
        let count = payloads.len();
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                self.sequence = self.sequence.wrapping_add(1);
                Packet {
                    header: Header {
                        version: 2,
                        marker: i == count - 1,
                        payload_type: self.payload_type,
                        sequence_number: self.sequence,
                        timestamp: self.timestamp,
                        ssrc: self.ssrc,
                        ..Default::default()
                    },
                    payload,
                }
            })
            .collect();
        self.timestamp = self.timestamp.wrapping_add(samples);
        Ok(packets)
    }
}

/// Offer a packet to the mixer channel without ever blocking. A full
/// channel drops the packet and bumps the counter; a closed channel is
/// reported so the producer can stop.
pub fn offer_packet(
    packets: &mpsc::Sender<Packet>,
    packet: Packet,
    dropped: &AtomicU64,
) -> Result<(), mpsc::error::TrySendError<Packet>> {
    match packets.try_send(packet) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(p)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 1000 == 0 {
                warn!(dropped = total, "mixer channel full, dropping RTP packet");
            }
            Ok(())
        }
        Err(closed) => Err(closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::codecs::g7xx::G711Payloader;
    use rtp::codecs::h264::H264Payloader;

    fn pcmu_packetizer() -> RtpPacketizer {
        RtpPacketizer::new(0, Box::<G711Payloader>::default())
    }

    #[test]
    fn sequences_are_strictly_monotonic_mod_2_16() {
        let mut packetizer = pcmu_packetizer();
        let payload = Bytes::from(vec![0u8; 160]);
        let mut last = None;
        for _ in 0..200 {
            for packet in packetizer.packetize(&payload, 160).unwrap() {
                if let Some(prev) = last {
                    assert_eq!(packet.header.sequence_number, u16::wrapping_add(prev, 1));
                }
                last = Some(packet.header.sequence_number);
            }
        }
    }

    #[test]
    fn sequence_wraps_at_u16_boundary() {
        let mut packetizer = pcmu_packetizer();
        packetizer.sequence = u16::MAX - 1;
        let payload = Bytes::from(vec![0u8; 160]);
        let seqs: Vec<u16> = (0..4)
            .flat_map(|_| packetizer.packetize(&payload, 160).unwrap())
            .map(|p| p.header.sequence_number)
            .collect();
        assert_eq!(seqs, vec![u16::MAX, 0, 1, 2]);
    }

    #[test]
    fn timestamp_advances_by_samples_per_batch() {
        let mut packetizer = pcmu_packetizer();
        packetizer.timestamp = 1000;
        let payload = Bytes::from(vec![0u8; 160]);
        let first = packetizer.packetize(&payload, 960).unwrap();
        let second = packetizer.packetize(&payload, 960).unwrap();
        assert_eq!(first[0].header.timestamp, 1000);
        assert_eq!(second[0].header.timestamp, 1960);
    }

    #[test]
    fn large_h264_nal_fragments_under_mtu() {
        let mut packetizer = RtpPacketizer::new(102, Box::<H264Payloader>::default());
        // A NAL unit much larger than the MTU forces FU-A fragmentation.
        let mut nal = vec![0x65u8]; // IDR slice header
        nal.extend(std::iter::repeat(0xAB).take(10_000));
        let packets = packetizer.packetize(&Bytes::from(nal), 3000).unwrap();
        assert!(packets.len() > 1);
        for packet in &packets {
            assert!(packet.payload.len() <= RTP_OUTBOUND_MTU - RTP_HEADER_SIZE);
            assert_eq!(packet.header.version, 2);
            assert_eq!(packet.header.payload_type, 102);
        }
        // All fragments of one unit share a timestamp; marker only on last.
        let timestamps: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] == w[1]));
        let markers: Vec<bool> = packets.iter().map(|p| p.header.marker).collect();
        assert!(markers[..markers.len() - 1].iter().all(|&m| !m));
        assert!(markers[markers.len() - 1]);
    }

    #[test]
    fn ssrc_is_stable_per_packetizer() {
        let mut packetizer = pcmu_packetizer();
        let ssrc = packetizer.ssrc();
        let payload = Bytes::from(vec![0u8; 160]);
        for _ in 0..10 {
            for packet in packetizer.packetize(&payload, 160).unwrap() {
                assert_eq!(packet.header.ssrc, ssrc);
            }
        }
    }

    #[tokio::test]
    async fn offer_never_blocks_and_counts_drops() {
        let (tx, mut rx) = mpsc::channel(2);
        let dropped = AtomicU64::new(0);
        let mut packetizer = pcmu_packetizer();
        let payload = Bytes::from(vec![0u8; 160]);

        // Fill the channel, then offer 10 more; every extra one must be
        // refused immediately and counted.
        for _ in 0..2 {
            let packet = packetizer.packetize(&payload, 160).unwrap().remove(0);
            offer_packet(&tx, packet, &dropped).unwrap();
        }
        for _ in 0..10 {
            let packet = packetizer.packetize(&payload, 160).unwrap().remove(0);
            offer_packet(&tx, packet, &dropped).unwrap();
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 10);
        assert!(rx.recv().await.is_some());

        // A closed channel is an error, not a drop.
        rx.close();
        let packet = packetizer.packetize(&payload, 160).unwrap().remove(0);
        assert!(offer_packet(&tx, packet, &dropped).is_err());
        assert_eq!(dropped.load(Ordering::Relaxed), 10);
    }
}
