//! One viewer, one peer connection.
//!
//! Sessions exist from the first offer for their id until the peer
//! transitions to Disconnected, Failed, or Closed. Offer/answer runs under
//! a session-scoped lock so renegotiation cannot interleave; the answer is
//! published immediately, before gathering ends (trickle ICE).

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::debug;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::api::SessionId;

pub struct Session {
    id: SessionId,
    peer_connection: Arc<RTCPeerConnection>,
    negotiation: Mutex<()>,
}

impl Session {
    pub async fn new(
        id: SessionId,
        api: &API,
        config: RTCConfiguration,
    ) -> anyhow::Result<Arc<Self>> {
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("creating peer connection")?,
        );
        Ok(Arc::new(Self {
            id,
            peer_connection,
            negotiation: Mutex::new(()),
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Apply a remote offer and return our answer SDP. The local
    /// description is set before returning, so candidates start trickling
    /// while the answer is still in flight.
    pub async fn handle_offer(&self, sdp: String) -> anyhow::Result<String> {
        let _guard = self.negotiation.lock().await;
        debug!(session = %self.id, "applying remote offer");

        let offer = RTCSessionDescription::offer(sdp).context("parsing SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("setting remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("creating answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("setting local description")?;

        Ok(answer.sdp)
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> anyhow::Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .context("adding remote ICE candidate")
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            debug!(session = %self.id, "closing peer connection: {e}");
        }
    }
}
