//! Capture sources: external encoder processes feeding RTP into the mixer.
//!
//! Three transports cover every encoder we run:
//! - a named pipe carrying an H.264 Annex-B elementary stream,
//! - a named pipe carrying Ogg/Opus (or raw μ-law blocks),
//! - a loopback UDP socket carrying ready-made RTP.
//!
//! Pipes live in the system temp directory under unique names and are
//! unlinked when the source stops. Pipe readers are plain threads; the
//! reads block in the kernel and only resolve when data arrives.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::stat::Mode;
use rtp::codecs::g7xx::G711Payloader;
use rtp::codecs::h264::H264Payloader;
use rtp::codecs::opus::OpusPayloader;
use rtp::packet::Packet;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMU};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::util::Unmarshal;

use crate::api::{AudioSource, VideoSource};
use crate::packetizer::{offer_packet, RtpPacketizer};
use crate::runner::{substitute, ProgramRunner};

pub const H264_PAYLOAD_TYPE: u8 = 102;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/// 20 ms of 8 kHz μ-law.
const PCMU_BLOCK_BYTES: usize = 160;

pub fn h264_codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
            // NACK only. PLI is left out on purpose: the encoder cannot
            // produce a keyframe on demand, so advertising it would lie.
            rtcp_feedback: vec![RTCPFeedback {
                typ: "nack".to_string(),
                parameter: String::new(),
            }],
        },
        payload_type: H264_PAYLOAD_TYPE,
        ..Default::default()
    }
}

pub fn opus_codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        payload_type: OPUS_PAYLOAD_TYPE,
        ..Default::default()
    }
}

pub fn pcmu_codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_string(),
            clock_rate: 8000,
            channels: 1,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type: PCMU_PAYLOAD_TYPE,
        ..Default::default()
    }
}

/// An external encoder invocation. `{path}` / `{port}` placeholders in the
/// arguments are filled in when the transport is set up.
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl CapturePipeline {
    pub fn from_command(name: &str, command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("capture command must not be empty")?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// A named pipe that unlinks itself when the source stops.
struct FifoGuard {
    path: PathBuf,
}

impl FifoGuard {
    /// Create and open the pipe read/write. Holding the write side
    /// ourselves keeps the reader from seeing EOF between encoder
    /// restarts.
    fn create(name: &str, extension: &str) -> anyhow::Result<(Self, File)> {
        let path = std::env::temp_dir().join(format!(
            "pipe-{}-{name}.{extension}",
            Uuid::new_v4()
        ));
        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o777))
            .with_context(|| format!("creating fifo at {}", path.display()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening fifo at {}", path.display()))?;
        debug!(path = %path.display(), "fifo created");
        Ok((Self { path }, file))
    }

    fn path_str(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for FifoGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// H.264 Annex-B over a named pipe. Each NAL unit is one packetized batch.
pub struct H264CommandCapture {
    pipeline: CapturePipeline,
    dropped: Arc<AtomicU64>,
}

impl H264CommandCapture {
    pub fn new(pipeline: CapturePipeline) -> Self {
        Self {
            pipeline,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl VideoSource for H264CommandCapture {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn video_codec(&self) -> RTCRtpCodecParameters {
        h264_codec_parameters()
    }

    async fn stream_video(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        let (fifo, file) = FifoGuard::create(&self.pipeline.name, "h264")?;

        let name = self.pipeline.name.clone();
        let dropped = Arc::clone(&self.dropped);
        // The thread parks on the pipe read; it ends when the NAL stream
        // errors or the packet channel closes, and is not joined.
        std::thread::Builder::new()
            .name(format!("h264-read-{name}"))
            .spawn(move || read_h264_nals(&name, file, packets, &dropped))?;

        let runner = ProgramRunner::new(
            self.pipeline.program.clone(),
            substitute(&self.pipeline.args, "{path}", &fifo.path_str()),
        );
        info!(source = %self.pipeline.name, "starting H.264 capture");
        runner.run(&self.pipeline.name, token).await
    }
}

fn read_h264_nals(
    name: &str,
    file: File,
    packets: mpsc::Sender<Packet>,
    dropped: &AtomicU64,
) {
    let mut reader = H264Reader::new(file, 1_048_576);
    let mut packetizer = RtpPacketizer::new(H264_PAYLOAD_TYPE, Box::<H264Payloader>::default());
    loop {
        let nal = match reader.next_nal() {
            Ok(nal) => nal,
            Err(e) => {
                debug!(source = name, "H.264 stream ended: {e}");
                return;
            }
        };
        // One sample unit per NAL batch; wall-clock pacing comes from the
        // encoder writing in real time.
        let batch = match packetizer.packetize(&nal.data.freeze(), 1) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = name, "failed to packetize NAL: {e}");
                continue;
            }
        };
        for packet in batch {
            if offer_packet(&packets, packet, dropped).is_err() {
                debug!(source = name, "packet channel closed, stopping reader");
                return;
            }
        }
    }
}

/// Ogg-encapsulated Opus over a named pipe. The granule delta of each page
/// is the sample count handed to the packetizer.
pub struct OggCommandCapture {
    pipeline: CapturePipeline,
    dropped: Arc<AtomicU64>,
}

impl OggCommandCapture {
    pub fn new(pipeline: CapturePipeline) -> Self {
        Self {
            pipeline,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl AudioSource for OggCommandCapture {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn audio_codec(&self) -> RTCRtpCodecParameters {
        opus_codec_parameters()
    }

    async fn stream_audio(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        let (fifo, file) = FifoGuard::create(&self.pipeline.name, "ogg")?;

        let name = self.pipeline.name.clone();
        let dropped = Arc::clone(&self.dropped);
        std::thread::Builder::new()
            .name(format!("ogg-read-{name}"))
            .spawn(move || read_ogg_pages(&name, file, packets, &dropped))?;

        let runner = ProgramRunner::new(
            self.pipeline.program.clone(),
            substitute(&self.pipeline.args, "{path}", &fifo.path_str()),
        );
        info!(source = %self.pipeline.name, "starting Ogg/Opus capture");
        runner.run(&self.pipeline.name, token).await
    }
}

fn read_ogg_pages(name: &str, file: File, packets: mpsc::Sender<Packet>, dropped: &AtomicU64) {
    let (mut reader, _header) = match OggReader::new(file, true) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(source = name, "failed to read Ogg header: {e}");
            return;
        }
    };
    let mut packetizer = RtpPacketizer::new(OPUS_PAYLOAD_TYPE, Box::<OpusPayloader>::default());
    let mut last_granule = 0u64;
    loop {
        let (page, header) = match reader.parse_next_page() {
            Ok(page) => page,
            Err(e) => {
                debug!(source = name, "Ogg stream ended: {e}");
                return;
            }
        };
        let samples = header.granule_position.saturating_sub(last_granule);
        last_granule = header.granule_position;
        let batch = match packetizer.packetize(&page.freeze(), samples as u32) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = name, "failed to packetize Ogg page: {e}");
                continue;
            }
        };
        for packet in batch {
            if offer_packet(&packets, packet, dropped).is_err() {
                debug!(source = name, "packet channel closed, stopping reader");
                return;
            }
        }
    }
}

/// Raw μ-law blocks over a named pipe, 20 ms per packet.
pub struct PcmuCommandCapture {
    pipeline: CapturePipeline,
    dropped: Arc<AtomicU64>,
}

impl PcmuCommandCapture {
    pub fn new(pipeline: CapturePipeline) -> Self {
        Self {
            pipeline,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl AudioSource for PcmuCommandCapture {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn audio_codec(&self) -> RTCRtpCodecParameters {
        pcmu_codec_parameters()
    }

    async fn stream_audio(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        let (fifo, file) = FifoGuard::create(&self.pipeline.name, "ul")?;

        let name = self.pipeline.name.clone();
        let dropped = Arc::clone(&self.dropped);
        std::thread::Builder::new()
            .name(format!("pcmu-read-{name}"))
            .spawn(move || read_pcmu_blocks(&name, file, packets, &dropped))?;

        let runner = ProgramRunner::new(
            self.pipeline.program.clone(),
            substitute(&self.pipeline.args, "{path}", &fifo.path_str()),
        );
        info!(source = %self.pipeline.name, "starting μ-law capture");
        runner.run(&self.pipeline.name, token).await
    }
}

fn read_pcmu_blocks(name: &str, file: File, packets: mpsc::Sender<Packet>, dropped: &AtomicU64) {
    use std::io::Read;
    let mut file = file;
    let mut packetizer = RtpPacketizer::new(PCMU_PAYLOAD_TYPE, Box::<G711Payloader>::default());
    let mut block = [0u8; PCMU_BLOCK_BYTES];
    loop {
        if let Err(e) = file.read_exact(&mut block) {
            debug!(source = name, "μ-law stream ended: {e}");
            return;
        }
        let batch = match packetizer.packetize(&Bytes::copy_from_slice(&block), PCMU_BLOCK_BYTES as u32)
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = name, "failed to packetize μ-law block: {e}");
                continue;
            }
        };
        for packet in batch {
            if offer_packet(&packets, packet, dropped).is_err() {
                return;
            }
        }
    }
}

/// An encoder that already emits RTP onto loopback UDP; datagrams are
/// validated and forwarded unchanged.
pub struct RtpCommandCapture {
    pipeline: CapturePipeline,
    video_params: RTCRtpCodecParameters,
    audio_params: RTCRtpCodecParameters,
    dropped: Arc<AtomicU64>,
}

impl RtpCommandCapture {
    pub fn new(
        pipeline: CapturePipeline,
        video_params: RTCRtpCodecParameters,
        audio_params: RTCRtpCodecParameters,
    ) -> Self {
        Self {
            pipeline,
            video_params,
            audio_params,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn stream(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .context("binding RTP capture socket")?;
        let port = socket.local_addr()?.port();

        let name = self.pipeline.name.clone();
        let dropped = Arc::clone(&self.dropped);
        let reader_token = token.child_token();
        tokio::spawn(forward_rtp_datagrams(
            name,
            socket,
            packets,
            dropped,
            reader_token,
        ));

        let runner = ProgramRunner::new(
            self.pipeline.program.clone(),
            substitute(&self.pipeline.args, "{port}", &port.to_string()),
        );
        info!(source = %self.pipeline.name, port, "starting RTP capture");
        runner.run(&self.pipeline.name, token).await
    }
}

async fn forward_rtp_datagrams(
    name: String,
    socket: UdpSocket,
    packets: mpsc::Sender<Packet>,
    dropped: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 24000];
    loop {
        let n = tokio::select! {
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    warn!(source = %name, "RTP socket read failed: {e}");
                    return;
                }
            },
            _ = token.cancelled() => return,
        };
        if n == buf.len() {
            warn!(source = %name, "datagram filled the whole buffer, likely truncated");
            continue;
        }
        let packet = match Packet::unmarshal(&mut &buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(source = %name, "dropping datagram that is not valid RTP: {e}");
                continue;
            }
        };
        if offer_packet(&packets, packet, &dropped).is_err() {
            return;
        }
    }
}

#[async_trait]
impl VideoSource for RtpCommandCapture {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn video_codec(&self) -> RTCRtpCodecParameters {
        self.video_params.clone()
    }

    async fn stream_video(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        self.stream(token, packets).await
    }
}

#[async_trait]
impl AudioSource for RtpCommandCapture {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn audio_codec(&self) -> RTCRtpCodecParameters {
        self.audio_params.clone()
    }

    async fn stream_audio(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<Packet>,
    ) -> anyhow::Result<()> {
        self.stream(token, packets).await
    }
}
