//! Fans packets from every capture source into one shared RTP track per
//! source. Sessions bind the tracks; a packet written once reaches every
//! bound viewer. The mixer never learns who the viewers are.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::api::{AudioSource, VideoSource};
use crate::nack::{NackBuffer, DEFAULT_NACK_CAPACITY};

/// Per-source channel depth between producer and consumer. Producers drop
/// on full rather than block.
pub const MIXER_CHANNEL_CAPACITY: usize = 5000;

struct VideoEntry {
    source: Arc<dyn VideoSource>,
    track: Arc<TrackLocalStaticRTP>,
    nack: Arc<NackBuffer>,
}

struct AudioEntry {
    source: Arc<dyn AudioSource>,
    track: Arc<TrackLocalStaticRTP>,
}

pub struct Mixer {
    video: Vec<VideoEntry>,
    audio: Vec<AudioEntry>,
    /// Fault injection: probability of discarding a packet after it leaves
    /// the channel. 0 disables.
    loss_rate: f32,
}

impl Mixer {
    pub fn new(loss_rate: f32) -> Self {
        Self {
            video: Vec::new(),
            audio: Vec::new(),
            loss_rate,
        }
    }

    /// Track maps are fixed once streaming starts; sources are only added
    /// during startup wiring.
    pub fn add_video_source(&mut self, source: Arc<dyn VideoSource>) {
        let track = Arc::new(TrackLocalStaticRTP::new(
            source.video_codec().capability,
            "video".to_string(),
            "padcast-video".to_string(),
        ));
        self.video.push(VideoEntry {
            source,
            track,
            nack: NackBuffer::new(DEFAULT_NACK_CAPACITY),
        });
    }

    pub fn add_audio_source(&mut self, source: Arc<dyn AudioSource>) {
        let track = Arc::new(TrackLocalStaticRTP::new(
            source.audio_codec().capability,
            "audio".to_string(),
            "padcast-audio".to_string(),
        ));
        self.audio.push(AudioEntry { source, track });
    }

    pub fn video_codecs(&self) -> Vec<RTCRtpCodecParameters> {
        self.video.iter().map(|e| e.source.video_codec()).collect()
    }

    pub fn audio_codecs(&self) -> Vec<RTCRtpCodecParameters> {
        self.audio.iter().map(|e| e.source.audio_codec()).collect()
    }

    /// Video tracks with their retransmission rings, for session binding.
    pub fn video_outputs(&self) -> Vec<(Arc<TrackLocalStaticRTP>, Arc<NackBuffer>)> {
        self.video
            .iter()
            .map(|e| (Arc::clone(&e.track), Arc::clone(&e.nack)))
            .collect()
    }

    pub fn audio_outputs(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.audio.iter().map(|e| Arc::clone(&e.track)).collect()
    }

    /// Run every source until cancellation. Each source gets a producer
    /// task (owning the source's lifetime) and a consumer task feeding the
    /// shared track; a closed channel is EOF for that source only.
    pub async fn stream(&self, token: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = Vec::new();

        for entry in &self.video {
            let (tx, rx) = mpsc::channel(MIXER_CHANNEL_CAPACITY);
            let source = Arc::clone(&entry.source);
            let source_token = token.child_token();
            tasks.push(tokio::spawn(async move {
                info!(source = source.name(), "video producer starting");
                if let Err(e) = source.stream_video(source_token, tx).await {
                    error!(source = source.name(), "video source failed: {e:#}");
                }
            }));
            tasks.push(tokio::spawn(consume(
                rx,
                Arc::clone(&entry.track),
                Some(Arc::clone(&entry.nack)),
                self.loss_rate,
                token.clone(),
            )));
        }

        for entry in &self.audio {
            let (tx, rx) = mpsc::channel(MIXER_CHANNEL_CAPACITY);
            let source = Arc::clone(&entry.source);
            let source_token = token.child_token();
            tasks.push(tokio::spawn(async move {
                info!(source = source.name(), "audio producer starting");
                if let Err(e) = source.stream_audio(source_token, tx).await {
                    error!(source = source.name(), "audio source failed: {e:#}");
                }
            }));
            tasks.push(tokio::spawn(consume(
                rx,
                Arc::clone(&entry.track),
                None,
                self.loss_rate,
                token.clone(),
            )));
        }

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn consume(
    mut packets: mpsc::Receiver<rtp::packet::Packet>,
    track: Arc<TrackLocalStaticRTP>,
    nack: Option<Arc<NackBuffer>>,
    loss_rate: f32,
    token: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => {
                    debug!(track = track.id(), "packet channel closed");
                    return;
                }
            },
            _ = token.cancelled() => return,
        };

        if loss_rate > 0.0 && rand::random::<f32>() < loss_rate {
            trace!(track = track.id(), "fault injection dropped a packet");
            continue;
        }

        if let Some(nack) = &nack {
            nack.record(packet.clone());
        }
        // A failed write only means some viewer's binding hiccuped.
        if let Err(e) = track.write_rtp(&packet).await {
            trace!(track = track.id(), "failed to write RTP packet: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rtp::packet::Packet;
    use std::time::Duration;

    use crate::capture::h264_codec_parameters;

    /// Emits `count` packets, then ends its stream.
    struct BurstSource {
        count: u16,
    }

    #[async_trait]
    impl VideoSource for BurstSource {
        fn name(&self) -> &str {
            "burst"
        }

        fn video_codec(&self) -> RTCRtpCodecParameters {
            h264_codec_parameters()
        }

        async fn stream_video(
            &self,
            _token: CancellationToken,
            packets: mpsc::Sender<Packet>,
        ) -> anyhow::Result<()> {
            for sequence in 0..self.count {
                let packet = Packet {
                    header: rtp::header::Header {
                        version: 2,
                        payload_type: 102,
                        sequence_number: sequence,
                        ssrc: 7,
                        ..Default::default()
                    },
                    payload: Bytes::from_static(b"payload"),
                };
                packets.send(packet).await?;
            }
            Ok(())
        }
    }

    /// Never produces; returns only when cancelled.
    struct IdleSource;

    #[async_trait]
    impl VideoSource for IdleSource {
        fn name(&self) -> &str {
            "idle"
        }

        fn video_codec(&self) -> RTCRtpCodecParameters {
            h264_codec_parameters()
        }

        async fn stream_video(
            &self,
            token: CancellationToken,
            _packets: mpsc::Sender<Packet>,
        ) -> anyhow::Result<()> {
            token.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn video_packets_land_in_the_nack_ring() {
        let mut mixer = Mixer::new(0.0);
        mixer.add_video_source(Arc::new(BurstSource { count: 20 }));
        let outputs = mixer.video_outputs();
        let (_track, nack) = &outputs[0];

        let token = CancellationToken::new();
        mixer.stream(token).await.unwrap();

        for sequence in 0..20 {
            assert!(
                nack.get(sequence).is_some(),
                "sequence {sequence} missing from ring"
            );
        }
        assert!(nack.get(20).is_none());
    }

    #[tokio::test]
    async fn stream_returns_when_sources_end() {
        let mut mixer = Mixer::new(0.0);
        mixer.add_video_source(Arc::new(BurstSource { count: 3 }));
        tokio::time::timeout(Duration::from_secs(5), mixer.stream(CancellationToken::new()))
            .await
            .expect("mixer must return once every source has ended")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_idle_sources() {
        let mut mixer = Mixer::new(0.0);
        mixer.add_video_source(Arc::new(IdleSource));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), mixer.stream(token))
            .await
            .expect("mixer must honor cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn full_loss_rate_starves_the_ring() {
        let mut mixer = Mixer::new(1.0);
        mixer.add_video_source(Arc::new(BurstSource { count: 20 }));
        let outputs = mixer.video_outputs();
        let (_track, nack) = &outputs[0];

        mixer.stream(CancellationToken::new()).await.unwrap();
        for sequence in 0..20 {
            assert!(nack.get(sequence).is_none());
        }
    }
}
