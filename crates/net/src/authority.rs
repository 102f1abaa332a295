use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::NetError;
use crate::event::{NetEvent, Reliability};
use crate::packet::Packet;
use crate::registry::{PeerId, PeerRegistry, UNKNOWN_PEER};
use crate::runtime;
use crate::transport::endpoint::Endpoint;
use crate::transport::link::{DEFAULT_TIMEOUT, LinkId, LinkState, LinkTable};
use crate::transport::wire::{CHANNEL_COUNT, Frame, FrameBody, FrameHeader, MAX_PAYLOAD_SIZE};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Server-role endpoint: accepts many connections and addresses each by a
/// stable peer identity.
///
/// Single-threaded by design: every operation takes `&mut self` and runs to
/// completion on the calling thread. The only suspension point is
/// [`AuthorityHost::service`].
pub struct AuthorityHost {
    endpoint: Endpoint,
    links: LinkTable,
    registry: PeerRegistry,
    events: VecDeque<NetEvent>,
    timeout: Duration,
}

impl AuthorityHost {
    /// Binds the listening endpoint. `max_peers` bounds concurrently
    /// accepted connections; attempts beyond it are refused during the
    /// handshake. Port 0 binds an ephemeral port, reported by
    /// [`AuthorityHost::local_addr`].
    pub fn bind(port: u16, max_peers: usize) -> Result<Self, NetError> {
        runtime::ensure_initialized()?;
        let endpoint = Endpoint::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(NetError::Bind)?;
        log::info!("authority listening on {}", endpoint.local_addr());

        Ok(Self {
            endpoint,
            links: LinkTable::new(max_peers),
            registry: PeerRegistry::new(),
            events: VecDeque::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Number of currently live peer identities.
    pub fn connected_count(&self) -> usize {
        self.registry.len()
    }

    /// Drains every queued transport notification, returning the produced
    /// events in receipt order. A zero timeout polls without blocking;
    /// otherwise the call may block up to `timeout` waiting for the first
    /// event. Failures encountered while draining are absorbed and never
    /// abort the remaining queue.
    pub fn service(&mut self, timeout: Duration) -> Vec<NetEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if !self.events.is_empty() || timeout.is_zero() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        self.events.drain(..).collect()
    }

    /// Sends one payload to `peer`. The datagram is written to the socket
    /// before this returns; Reliable payloads are additionally retained for
    /// retransmission until acknowledged.
    pub fn send_to(
        &mut self,
        peer: PeerId,
        packet: &Packet,
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), NetError> {
        validate_outgoing(packet, channel)?;
        let link_id = self
            .registry
            .link_of(peer)
            .ok_or(NetError::UnknownPeer { peer })?;
        let Some(link) = self.links.get_mut(link_id) else {
            return Err(NetError::UnknownPeer { peer });
        };
        let reliable = reliability == Reliability::Reliable;
        if let Err(e) = link.send_payload(&self.endpoint, channel, reliable, packet.as_bytes()) {
            log::warn!("send to peer {} failed: {}", peer, e);
        }
        Ok(())
    }

    /// Sends one payload to every currently connected peer.
    pub fn broadcast(
        &mut self,
        packet: &Packet,
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), NetError> {
        validate_outgoing(packet, channel)?;
        let reliable = reliability == Reliability::Reliable;
        let live: Vec<(PeerId, LinkId)> = self
            .registry
            .links()
            .filter_map(|link| self.registry.peer_of(link).map(|peer| (peer, link)))
            .collect();

        for (peer, link_id) in live {
            if let Some(link) = self.links.get_mut(link_id) {
                if let Err(e) =
                    link.send_payload(&self.endpoint, channel, reliable, packet.as_bytes())
                {
                    log::warn!("broadcast to peer {} failed: {}", peer, e);
                }
            }
        }
        Ok(())
    }

    /// Requests graceful removal of `peer`. The Disconnect event and
    /// registry cleanup are delivered on a later `service` call.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<(), NetError> {
        let link_id = self
            .registry
            .link_of(peer)
            .ok_or(NetError::UnknownPeer { peer })?;
        if let Some(link) = self.links.get_mut(link_id) {
            if let Err(e) = link.send_control(&self.endpoint, FrameBody::Disconnect) {
                log::warn!("disconnect notice to peer {} failed: {}", peer, e);
            }
            link.state = LinkState::Closing;
        }
        Ok(())
    }

    fn pump(&mut self) {
        let frames = match self.endpoint.receive() {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("socket receive failed: {}", e);
                Vec::new()
            }
        };
        for (frame, addr) in frames {
            self.handle_frame(frame, addr);
        }

        let now = Instant::now();
        for (_, link) in self.links.iter_mut() {
            if link.state != LinkState::Connected {
                continue;
            }
            link.resend_due(&self.endpoint, now);
            link.keepalive_if_idle(&self.endpoint);
        }

        self.reap_closing();
        self.sweep_timed_out();
    }

    fn handle_frame(&mut self, frame: Frame, addr: SocketAddr) {
        match frame.body {
            FrameBody::ConnectRequest { client_salt } => {
                self.handle_connect_request(addr, client_salt);
            }
            FrameBody::ChallengeResponse { combined_salt } => {
                self.handle_challenge_response(addr, combined_salt);
            }
            FrameBody::Payload {
                channel,
                reliable,
                message_seq,
                data,
            } => {
                self.handle_payload(&frame.header, addr, channel, reliable, message_seq, data);
            }
            FrameBody::KeepAlive => {
                if let Some(link) = self.links.id_of(&addr).and_then(|id| self.links.get_mut(id)) {
                    link.observe(&frame.header);
                }
            }
            FrameBody::Disconnect => self.handle_remote_disconnect(addr),
            body => log::debug!("ignoring unexpected {:?} from {}", body, addr),
        }
    }

    fn handle_connect_request(&mut self, addr: SocketAddr, client_salt: u64) {
        let link_id = match self.links.admit(addr, client_salt) {
            Ok(id) => id,
            Err(reason) => {
                log::info!("refusing connection from {}: {}", addr, reason);
                self.deny(addr, reason);
                return;
            }
        };
        let Some(link) = self.links.get_mut(link_id) else {
            return;
        };

        // retransmitted requests re-elicit whichever answer is current
        let answer = match link.state {
            LinkState::Connected => FrameBody::ConnectAccepted,
            _ => FrameBody::ConnectChallenge {
                server_salt: link.server_salt(),
                challenge: link.combined_salt(),
            },
        };
        if let Err(e) = link.send_control(&self.endpoint, answer) {
            log::warn!("handshake reply to {} failed: {}", addr, e);
        }
    }

    fn handle_challenge_response(&mut self, addr: SocketAddr, combined_salt: u64) {
        let Some(link_id) = self.links.id_of(&addr) else {
            log::debug!("challenge response from unknown {}", addr);
            return;
        };
        let state = match self.links.get_mut(link_id) {
            Some(link) if combined_salt != link.combined_salt() => {
                log::warn!("invalid challenge response from {}", addr);
                return;
            }
            Some(link) => link.state,
            None => return,
        };

        match state {
            LinkState::Pending => {
                let Some(peer) = self.registry.allocate(link_id) else {
                    log::warn!("refusing {}: peer identity space exhausted", addr);
                    self.links.remove(link_id);
                    self.deny(addr, "identity space exhausted");
                    return;
                };
                if let Some(link) = self.links.get_mut(link_id) {
                    link.state = LinkState::Connected;
                    if let Err(e) = link.send_control(&self.endpoint, FrameBody::ConnectAccepted) {
                        log::warn!("accept notice to {} failed: {}", addr, e);
                    }
                }
                log::info!("peer {} connected from {}", peer, addr);
                self.events.push_back(NetEvent::Connect { peer });
            }
            LinkState::Connected => {
                // accept frame was lost; answer the retransmitted response
                if let Some(link) = self.links.get_mut(link_id) {
                    if let Err(e) = link.send_control(&self.endpoint, FrameBody::ConnectAccepted) {
                        log::warn!("accept notice to {} failed: {}", addr, e);
                    }
                }
            }
            LinkState::Closing => {}
        }
    }

    fn handle_payload(
        &mut self,
        header: &FrameHeader,
        addr: SocketAddr,
        channel: u8,
        reliable: bool,
        message_seq: u32,
        data: Vec<u8>,
    ) {
        let Some(link_id) = self.links.id_of(&addr) else {
            log::debug!("payload from unconnected {}", addr);
            return;
        };
        let Some(link) = self.links.get_mut(link_id) else {
            return;
        };
        if link.state != LinkState::Connected {
            log::debug!("payload from {} before handshake completed", addr);
            return;
        }
        if !link.observe(header) {
            return;
        }

        // an unmapped but connected link is surfaced with the sentinel
        // identity rather than aborting the drain
        let peer = self.registry.peer_of(link_id).unwrap_or(UNKNOWN_PEER);
        for payload in link.accept_payload(channel, reliable, message_seq, data) {
            self.events.push_back(NetEvent::Receive {
                peer,
                packet: Packet::from_bytes(payload),
            });
        }
    }

    fn handle_remote_disconnect(&mut self, addr: SocketAddr) {
        let Some(link_id) = self.links.id_of(&addr) else {
            return;
        };
        self.retire_link(link_id, "disconnected");
    }

    fn reap_closing(&mut self) {
        for link_id in self.links.ids() {
            let closing = self
                .links
                .get_mut(link_id)
                .is_some_and(|link| link.state == LinkState::Closing);
            if closing {
                self.retire_link(link_id, "removed");
            }
        }
    }

    fn sweep_timed_out(&mut self) {
        for (link_id, link) in self.links.sweep_timed_out(self.timeout) {
            match self.registry.release_link(link_id) {
                Some(peer) => {
                    log::info!("peer {} timed out", peer);
                    self.events.push_back(NetEvent::Disconnect { peer });
                }
                None if link.state == LinkState::Connected => {
                    self.events.push_back(NetEvent::Disconnect { peer: UNKNOWN_PEER });
                }
                None => {} // abandoned handshake, nothing to surface
            }
        }
    }

    /// Removes a link and its registry entry, surfacing the Disconnect
    /// event after both are gone.
    fn retire_link(&mut self, link_id: LinkId, why: &str) {
        let Some(link) = self.links.remove(link_id) else {
            return;
        };
        match self.registry.release_link(link_id) {
            Some(peer) => {
                log::info!("peer {} {}", peer, why);
                self.events.push_back(NetEvent::Disconnect { peer });
            }
            None if link.state == LinkState::Connected => {
                self.events.push_back(NetEvent::Disconnect { peer: UNKNOWN_PEER });
            }
            None => {}
        }
    }

    fn deny(&self, addr: SocketAddr, reason: &str) {
        let frame = Frame::new(
            FrameHeader::new(0, 0, 0),
            FrameBody::ConnectDenied {
                reason: reason.to_owned(),
            },
        );
        if let Err(e) = self.endpoint.send_frame(&frame, addr) {
            log::warn!("denial to {} failed: {}", addr, e);
        }
    }
}

pub(crate) fn validate_outgoing(packet: &Packet, channel: u8) -> Result<(), NetError> {
    if channel >= CHANNEL_COUNT {
        return Err(NetError::InvalidChannel { channel });
    }
    if packet.len() > MAX_PAYLOAD_SIZE {
        return Err(NetError::PayloadTooLarge { size: packet.len() });
    }
    Ok(())
}
