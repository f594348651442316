use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use padcast_desktop::capture::{
    h264_codec_parameters, opus_codec_parameters, CapturePipeline, H264CommandCapture,
    OggCommandCapture, PcmuCommandCapture, RtpCommandCapture,
};
use padcast_desktop::config::{AudioFormat, DesktopConfig, VideoTransport};
use padcast_desktop::desktop::DesktopBuilder;
use padcast_desktop::input::{UinputGamepad, UinputKeyboard, UinputMouse};
use padcast_desktop::rtc::RtcFactoryConfig;
use padcast_desktop::signaler::{LocalConfigurator, MqttSignaler};
use padcast_vinput::Udev;

/// Standard Xbox One controller identity; games probe for it.
const GAMEPAD_VENDOR: u16 = 0x045E;
const GAMEPAD_PRODUCT: u16 = 0x02D1;
const GAMEPAD_COUNT: u8 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DesktopConfig::from_env().context("invalid configuration")?;
    info!(
        desktop_id = %config.desktop_id,
        mqtt_host = %config.mqtt_host,
        webrtc_port = config.webrtc_port,
        ice_servers = config.ice_servers.len(),
        "starting padcast desktop"
    );

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    // The udev manager feeds every virtual device; without it games inside
    // the container cannot discover the gamepads.
    let udev = Udev::open().context("opening netlink sockets (CAP_NET_ADMIN needed?)")?;

    let signaler = MqttSignaler::new(Arc::new(LocalConfigurator::new(
        &config.mqtt_host,
        &config.desktop_id,
        &config.desktop_psk,
    )));

    let video_pipeline = CapturePipeline::from_command("screen-capture", &config.video_capture_cmd)?;
    let audio_pipeline = CapturePipeline::from_command("audio-capture", &config.audio_capture_cmd)?;

    let mut builder = DesktopBuilder::new()
        .packet_loss(config.packet_loss)
        .with_signaler(Arc::new(signaler));
    builder = match config.video_transport {
        VideoTransport::H264Fifo => {
            builder.with_video_source(Arc::new(H264CommandCapture::new(video_pipeline)))
        }
        VideoTransport::RtpUdp => builder.with_video_source(Arc::new(RtpCommandCapture::new(
            video_pipeline,
            h264_codec_parameters(),
            opus_codec_parameters(),
        ))),
    };
    builder = match config.audio_format {
        AudioFormat::Ogg => {
            builder.with_audio_source(Arc::new(OggCommandCapture::new(audio_pipeline)))
        }
        AudioFormat::Pcmu => {
            builder.with_audio_source(Arc::new(PcmuCommandCapture::new(audio_pipeline)))
        }
        AudioFormat::RtpUdp => builder.with_audio_source(Arc::new(RtpCommandCapture::new(
            audio_pipeline,
            h264_codec_parameters(),
            opus_codec_parameters(),
        ))),
    };
    builder = builder
        .with_keyboard(Arc::new(UinputKeyboard::new(Arc::clone(&udev))))
        .with_mouse(Arc::new(UinputMouse::new(Arc::clone(&udev))));
    for pad_id in 0..GAMEPAD_COUNT {
        builder = builder.with_gamepad(Arc::new(UinputGamepad::new(
            Arc::clone(&udev),
            pad_id,
            GAMEPAD_VENDOR,
            GAMEPAD_PRODUCT,
        )));
    }

    let desktop = builder
        .build(
            &RtcFactoryConfig {
                single_port: config.webrtc_port,
                external_ips: config.webrtc_ips.clone(),
            },
            config.ice_servers.clone(),
        )
        .await?;

    let result = desktop.run(token).await;
    udev.close();
    result
}

fn spawn_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        token.cancel();
        // A second signal means someone wants out now.
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });
    Ok(())
}
