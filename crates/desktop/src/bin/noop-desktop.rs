//! A desktop without input devices, streaming a synthetic test pattern.
//! Useful for exercising signaling and media against a real broker and
//! browser on machines with no `/dev/uinput` or capture stack.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use padcast_desktop::capture::{CapturePipeline, H264CommandCapture};
use padcast_desktop::config::DesktopConfig;
use padcast_desktop::desktop::DesktopBuilder;
use padcast_desktop::rtc::RtcFactoryConfig;
use padcast_desktop::signaler::{LocalConfigurator, MqttSignaler};

const TEST_PATTERN_CMD: &[&str] = &[
    "gst-launch-1.0",
    "videotestsrc",
    "!",
    "video/x-raw,width=1280,height=720,framerate=30/1",
    "!",
    "x264enc",
    "tune=zerolatency",
    "!",
    "filesink",
    "location={path}",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DesktopConfig::from_env().context("invalid configuration")?;
    info!(desktop_id = %config.desktop_id, mqtt_host = %config.mqtt_host, "starting noop desktop");

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted, shutting down");
        cancel.cancel();
    });

    let test_pattern: Vec<String> = TEST_PATTERN_CMD.iter().map(|s| s.to_string()).collect();
    let desktop = DesktopBuilder::new()
        .with_signaler(Arc::new(MqttSignaler::new(Arc::new(
            LocalConfigurator::new(&config.mqtt_host, &config.desktop_id, &config.desktop_psk),
        ))))
        .with_video_source(Arc::new(H264CommandCapture::new(
            CapturePipeline::from_command("test-pattern", &test_pattern)?,
        )))
        .build(
            &RtcFactoryConfig {
                single_port: config.webrtc_port,
                external_ips: config.webrtc_ips.clone(),
            },
            config.ice_servers.clone(),
        )
        .await?;

    desktop.run(token).await
}
