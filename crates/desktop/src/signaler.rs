//! Broker-mediated signaling.
//!
//! Topic surface, rooted at the configurator-supplied prefix
//! (`<tenant>/desktops/<id>/`):
//!
//! | topic                                  | dir       | retained |
//! |----------------------------------------|-----------|----------|
//! | `status`                               | publish   | yes      |
//! | `sessions/+/webrtc-offer`              | subscribe | no       |
//! | `sessions/+/webrtc-answer`             | publish   | no       |
//! | `sessions/+/offer-ice-candidate`       | subscribe | no       |
//! | `sessions/+/answer-ice-candidate`      | publish   | no       |
//! | `server/ice-servers` (global)          | subscribe | yes      |
//!
//! Transport errors are never fatal: the client reconnects forever with
//! exponential backoff, re-fetching credentials from the configurator on
//! every attempt so rotating cloud-issued credentials keep working.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use padcast_protocol::IceServerInfo;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, Publish, QoS};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::api::{SessionId, Signaler};
use crate::desktop::{is_terminal, Desktop};
use crate::session::Session;

const ICE_SERVERS_TOPIC: &str = "server/ice-servers";
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const HEARTBEAT: Duration = Duration::from_secs(60);

/// Broker endpoint and identity, fetched fresh for every connection
/// attempt.
#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    /// Broker URL, e.g. `tcp://broker.example:1883`.
    pub host: String,
    pub username: String,
    pub password: String,
    /// Per-desktop topic prefix, trailing slash included.
    pub topic_prefix: String,
    pub client_id: String,
}

#[async_trait]
pub trait MqttConfigurator: Send + Sync {
    async fn configuration(&self) -> MqttEndpoint;
}

/// Static credentials from the environment.
pub struct LocalConfigurator {
    endpoint: MqttEndpoint,
}

impl LocalConfigurator {
    pub fn new(host: &str, desktop_id: &str, psk: &str) -> Self {
        Self {
            endpoint: MqttEndpoint {
                host: host.to_string(),
                username: format!("desktop:{desktop_id}"),
                password: psk.to_string(),
                topic_prefix: format!("desktops/{desktop_id}/"),
                client_id: format!("desktop-{desktop_id}"),
            },
        }
    }
}

#[async_trait]
impl MqttConfigurator for LocalConfigurator {
    async fn configuration(&self) -> MqttEndpoint {
        self.endpoint.clone()
    }
}

pub struct MqttSignaler {
    configurator: Arc<dyn MqttConfigurator>,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<Session>>>>,
    extra_ice: Arc<RwLock<Vec<IceServerInfo>>>,
}

impl MqttSignaler {
    pub fn new(configurator: Arc<dyn MqttConfigurator>) -> Self {
        Self {
            configurator,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            extra_ice: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the broker-pushed ICE list. The startup list lives in the
    /// desktop and is composed in front of this one per session.
    fn update_ice_servers(&self, payload: &[u8]) {
        match std::str::from_utf8(payload)
            .map_err(anyhow::Error::from)
            .and_then(|json| IceServerInfo::parse_list(json).map_err(Into::into))
        {
            Ok(servers) => {
                info!(count = servers.len(), "updated ICE servers from broker");
                *self.extra_ice.write() = servers;
            }
            Err(e) => warn!("ignoring unparseable ice-servers payload: {e}"),
        }
    }

    async fn connect_and_serve(
        &self,
        endpoint: &MqttEndpoint,
        token: &CancellationToken,
        desktop: &Arc<Desktop>,
    ) -> anyhow::Result<()> {
        let (host, port) = parse_broker_url(&endpoint.host)?;
        let status_topic = format!("{}status", endpoint.topic_prefix);

        let mut options = MqttOptions::new(endpoint.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if !endpoint.password.is_empty() {
            options.set_credentials(endpoint.username.clone(), endpoint.password.clone());
        }
        // The retained will covers abrupt loss; clean shutdown publishes
        // offline explicitly below.
        options.set_last_will(LastWill::new(
            &status_topic,
            "offline",
            QoS::AtMostOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("signaler shutting down, publishing offline status");
                    let _ = client
                        .publish(&status_topic, QoS::AtMostOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let _ = client
                        .publish(&status_topic, QoS::AtMostOnce, true, "online")
                        .await;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.on_connect(&client, endpoint).await?;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(publish, &client, endpoint, desktop).await;
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e).context("broker connection lost"),
                }
            }
        }
    }

    async fn on_connect(
        &self,
        client: &AsyncClient,
        endpoint: &MqttEndpoint,
    ) -> anyhow::Result<()> {
        let prefix = &endpoint.topic_prefix;
        info!(prefix = %prefix, "connected to broker");
        client
            .subscribe(format!("{prefix}sessions/+/webrtc-offer"), QoS::AtMostOnce)
            .await?;
        client
            .subscribe(
                format!("{prefix}sessions/+/offer-ice-candidate"),
                QoS::AtMostOnce,
            )
            .await?;
        // Watch our own retained status to heal a stale last-will.
        client
            .subscribe(format!("{prefix}status"), QoS::AtMostOnce)
            .await?;
        client.subscribe(ICE_SERVERS_TOPIC, QoS::AtMostOnce).await?;
        client
            .publish(format!("{prefix}status"), QoS::AtMostOnce, true, "online")
            .await?;
        Ok(())
    }

    async fn handle_publish(
        &self,
        publish: Publish,
        client: &AsyncClient,
        endpoint: &MqttEndpoint,
        desktop: &Arc<Desktop>,
    ) {
        let topic = publish.topic.as_str();
        let prefix = &endpoint.topic_prefix;

        if topic == ICE_SERVERS_TOPIC {
            self.update_ice_servers(&publish.payload);
            return;
        }

        if topic == format!("{prefix}status") {
            // Seeing our own retained offline while alive means a stale
            // last-will fired; put the record straight.
            if publish.payload.as_ref() == b"offline" {
                info!("observed stale offline status, republishing online");
                let _ = client
                    .publish(format!("{prefix}status"), QoS::AtMostOnce, true, "online")
                    .await;
            }
            return;
        }

        match parse_session_topic(prefix, topic) {
            Some((session_id, "webrtc-offer")) => {
                let sdp = String::from_utf8_lossy(&publish.payload).into_owned();
                self.handle_offer(session_id, sdp, client, endpoint, desktop)
                    .await;
            }
            Some((session_id, "offer-ice-candidate")) => {
                self.handle_remote_candidate(session_id, &publish.payload)
                    .await;
            }
            Some((session_id, leaf)) => {
                debug!(session = %session_id, leaf, "ignoring session topic");
            }
            None => debug!(topic, "ignoring unrecognized topic"),
        }
    }

    async fn handle_offer(
        &self,
        session_id: SessionId,
        sdp: String,
        client: &AsyncClient,
        endpoint: &MqttEndpoint,
        desktop: &Arc<Desktop>,
    ) {
        debug!(session = %session_id, "received offer");

        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&session_id) {
                Some(session) => Arc::clone(session),
                None => {
                    let extra = self.extra_ice.read().clone();
                    let session = match desktop.create_session(session_id.clone(), &extra).await {
                        Ok(session) => session,
                        Err(e) => {
                            error!(session = %session_id, "failed to create session: {e:#}");
                            return;
                        }
                    };
                    self.wire_session(&session, client, endpoint, desktop);
                    sessions.insert(session_id.clone(), Arc::clone(&session));
                    info!(session = %session_id, "session created");
                    session
                }
            }
        };

        match session.handle_offer(sdp).await {
            Ok(answer) => {
                // The answer is the one signaling message that must arrive.
                let topic = format!("{}sessions/{session_id}/webrtc-answer", endpoint.topic_prefix);
                if let Err(e) = client
                    .publish(topic, QoS::AtLeastOnce, false, answer)
                    .await
                {
                    warn!(session = %session_id, "failed to publish answer: {e}");
                }
            }
            Err(e) => error!(session = %session_id, "failed to handle offer: {e:#}"),
        }
    }

    /// Hook local ICE trickle and lifecycle teardown onto a fresh session.
    fn wire_session(
        &self,
        session: &Arc<Session>,
        client: &AsyncClient,
        endpoint: &MqttEndpoint,
        desktop: &Arc<Desktop>,
    ) {
        let peer_connection = session.peer_connection();
        let session_id = session.id().clone();

        let candidate_topic = format!(
            "{}sessions/{session_id}/answer-ice-candidate",
            endpoint.topic_prefix
        );
        let candidate_client = client.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let client = candidate_client.clone();
            let topic = candidate_topic.clone();
            Box::pin(async move {
                // A nil candidate only marks end-of-gathering.
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("failed to serialize ICE candidate: {e}");
                        return;
                    }
                };
                match serde_json::to_vec(&init) {
                    Ok(payload) => {
                        let _ = client.publish(topic, QoS::AtMostOnce, false, payload).await;
                    }
                    Err(e) => warn!("failed to encode ICE candidate: {e}"),
                }
            })
        }));

        let sessions = Arc::clone(&self.sessions);
        let desktop = Arc::clone(desktop);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            if !is_terminal(state) {
                debug!(session = %session_id, ?state, "peer connection state changed");
                return Box::pin(async {});
            }
            info!(session = %session_id, ?state, "peer gone, removing session");
            let sessions = Arc::clone(&sessions);
            let desktop = Arc::clone(&desktop);
            let session_id = session_id.clone();
            Box::pin(async move {
                if let Some(session) = sessions.lock().await.remove(&session_id) {
                    session.close().await;
                }
                desktop.remove_input_channel(&session_id);
            })
        }));
    }

    async fn handle_remote_candidate(&self, session_id: SessionId, payload: &[u8]) {
        let init: RTCIceCandidateInit = match serde_json::from_slice(payload) {
            Ok(init) => init,
            Err(e) => {
                warn!(session = %session_id, "payload is not an ICE candidate: {e}");
                return;
            }
        };
        let session = self.sessions.lock().await.get(&session_id).cloned();
        match session {
            Some(session) => {
                if let Err(e) = session.add_remote_candidate(init).await {
                    warn!(session = %session_id, "failed to add ICE candidate: {e:#}");
                }
            }
            None => warn!(session = %session_id, "ICE candidate for unknown session"),
        }
    }
}

#[async_trait]
impl Signaler for MqttSignaler {
    fn name(&self) -> &str {
        "mqtt-signaler"
    }

    async fn run(&self, token: CancellationToken, desktop: Arc<Desktop>) -> anyhow::Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            let endpoint = self.configurator.configuration().await;
            info!(host = %endpoint.host, "connecting to broker");
            match self.connect_and_serve(&endpoint, &token, &desktop).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("broker connection failed: {e:#}");
                    info!(seconds = backoff.as_secs(), "reconnecting after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.cancelled() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// `tcp://host:port` (or `mqtt://`); port defaults to 1883.
fn parse_broker_url(url: &str) -> anyhow::Result<(String, u16)> {
    let hostport = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    if hostport.is_empty() {
        anyhow::bail!("broker URL {url:?} has no host");
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("broker URL {url:?} has an invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((hostport.to_string(), 1883)),
    }
}

/// Strip the desktop prefix and the `sessions/` segment, yielding the
/// session id and the leaf topic.
fn parse_session_topic<'a>(prefix: &str, topic: &'a str) -> Option<(SessionId, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("sessions/")?;
    let (session_id, leaf) = rest.split_once('/')?;
    if session_id.is_empty() || leaf.contains('/') {
        return None;
    }
    Some((SessionId::from(session_id), leaf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_topic_parsing() {
        let prefix = "desktops/alpha/";
        assert_eq!(
            parse_session_topic(prefix, "desktops/alpha/sessions/s1/webrtc-offer"),
            Some((SessionId::from("s1"), "webrtc-offer"))
        );
        assert_eq!(
            parse_session_topic(prefix, "desktops/alpha/sessions/abc-123/offer-ice-candidate"),
            Some((SessionId::from("abc-123"), "offer-ice-candidate"))
        );
        assert_eq!(parse_session_topic(prefix, "desktops/alpha/status"), None);
        assert_eq!(parse_session_topic(prefix, "desktops/beta/sessions/s1/webrtc-offer"), None);
        assert_eq!(parse_session_topic(prefix, "desktops/alpha/sessions//webrtc-offer"), None);
        assert_eq!(
            parse_session_topic(prefix, "desktops/alpha/sessions/s1/extra/deep"),
            None
        );
    }

    #[test]
    fn tenant_scoped_prefixes_parse() {
        let prefix = "tenant-7/desktops/alpha/";
        assert_eq!(
            parse_session_topic(prefix, "tenant-7/desktops/alpha/sessions/s9/webrtc-offer"),
            Some((SessionId::from("s9"), "webrtc-offer"))
        );
    }

    #[test]
    fn broker_url_forms() {
        assert_eq!(
            parse_broker_url("tcp://broker.example:1883").unwrap(),
            ("broker.example".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.example:8883").unwrap(),
            ("broker.example".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(parse_broker_url("tcp://broker.example:notaport").is_err());
        assert!(parse_broker_url("tcp://").is_err());
    }

    #[test]
    fn local_configurator_shapes_identity() {
        let configurator = LocalConfigurator::new("tcp://localhost:1883", "alpha", "secret");
        let endpoint = configurator.endpoint.clone();
        assert_eq!(endpoint.username, "desktop:alpha");
        assert_eq!(endpoint.password, "secret");
        assert_eq!(endpoint.topic_prefix, "desktops/alpha/");
        assert_eq!(endpoint.client_id, "desktop-alpha");
    }

    #[test]
    fn ice_server_updates_replace_previous_extras() {
        let signaler = MqttSignaler::new(Arc::new(LocalConfigurator::new(
            "tcp://localhost:1883",
            "alpha",
            "",
        )));
        signaler.update_ice_servers(br#"[{"urls":["turn:one.example"]}]"#);
        assert_eq!(signaler.extra_ice.read().len(), 1);

        signaler.update_ice_servers(br#"[{"urls":["turn:two.example"]},{"urls":["stun:s.example"]}]"#);
        let extras = signaler.extra_ice.read().clone();
        assert_eq!(extras.len(), 2);
        assert_eq!(extras[0].urls, vec!["turn:two.example"]);

        // Garbage leaves the last good list in place.
        signaler.update_ice_servers(b"not json");
        assert_eq!(signaler.extra_ice.read().len(), 2);
    }
}
