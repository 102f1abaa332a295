use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::authority::validate_outgoing;
use crate::error::NetError;
use crate::event::{NetEvent, Reliability};
use crate::packet::Packet;
use crate::registry::{PeerId, UNKNOWN_PEER};
use crate::runtime;
use crate::transport::endpoint::Endpoint;
use crate::transport::link::{DEFAULT_TIMEOUT, Link, LinkState, entropy_u64};
use crate::transport::wire::{Frame, FrameBody, FrameHeader};

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const HANDSHAKE_RETRY: Duration = Duration::from_millis(100);

/// The identity a peer host presents for its single remote connection.
const REMOTE: PeerId = UNKNOWN_PEER;

/// Client-role endpoint holding one outbound connection. The remote end is
/// always identity 0 in the events and operations of this host.
#[derive(Debug)]
pub struct PeerHost {
    endpoint: Endpoint,
    link: Option<Link>,
    events: VecDeque<NetEvent>,
    timeout: Duration,
}

impl PeerHost {
    /// Establishes the connection synchronously, blocking the caller until
    /// it is confirmed, refused (`ConnectFailure`) or `timeout` elapses
    /// (`ConnectTimeout`). On failure every transport resource acquired so
    /// far is released before returning.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, NetError> {
        runtime::ensure_initialized()?;

        let remote = resolve(host, port)?;
        let mut endpoint =
            Endpoint::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(NetError::Exhausted)?;

        let client_salt = entropy_u64();
        let deadline = Instant::now() + timeout;
        let mut server_salt: Option<u64> = None;

        log::info!("connecting to {}", remote);
        send_handshake(&endpoint, remote, FrameBody::ConnectRequest { client_salt });
        let mut last_attempt = Instant::now();

        loop {
            if Instant::now() >= deadline {
                log::info!("connection to {} timed out", remote);
                return Err(NetError::ConnectTimeout);
            }

            let frames = match endpoint.receive() {
                Ok(frames) => frames,
                Err(e) => {
                    log::warn!("socket receive failed: {}", e);
                    Vec::new()
                }
            };
            for (frame, addr) in frames {
                if addr != remote {
                    continue;
                }
                match frame.body {
                    FrameBody::ConnectChallenge {
                        server_salt: salt,
                        challenge,
                    } => {
                        if challenge != client_salt ^ salt {
                            log::warn!("challenge from {} does not match our salt", remote);
                            continue;
                        }
                        server_salt = Some(salt);
                        send_handshake(
                            &endpoint,
                            remote,
                            FrameBody::ChallengeResponse {
                                combined_salt: client_salt ^ salt,
                            },
                        );
                        last_attempt = Instant::now();
                    }
                    FrameBody::ConnectAccepted => {
                        let Some(salt) = server_salt else {
                            continue;
                        };
                        log::info!("connected to {}", remote);
                        return Ok(Self {
                            endpoint,
                            link: Some(Link::established(remote, client_salt, salt)),
                            events: VecDeque::new(),
                            timeout: DEFAULT_TIMEOUT,
                        });
                    }
                    FrameBody::ConnectDenied { reason } => {
                        log::info!("connection refused by {}: {}", remote, reason);
                        return Err(NetError::ConnectFailure { reason });
                    }
                    _ => {}
                }
            }

            // the current handshake stage is retried until answered
            if last_attempt.elapsed() >= HANDSHAKE_RETRY {
                let retry = match server_salt {
                    None => FrameBody::ConnectRequest { client_salt },
                    Some(salt) => FrameBody::ChallengeResponse {
                        combined_salt: client_salt ^ salt,
                    },
                };
                send_handshake(&endpoint, remote, retry);
                last_attempt = Instant::now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.state == LinkState::Connected)
    }

    /// Drains every queued transport notification, returning the produced
    /// events in receipt order. Semantics match
    /// [`AuthorityHost::service`](crate::AuthorityHost::service).
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

    /// Sends one payload to the remote end. Fails with `UnknownPeer` once
    /// the connection is gone.
    pub fn send(
        &mut self,
        packet: &Packet,
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), NetError> {
        validate_outgoing(packet, channel)?;
        let Some(link) = self.link.as_mut() else {
            return Err(NetError::UnknownPeer { peer: REMOTE });
        };
        let reliable = reliability == Reliability::Reliable;
        if let Err(e) = link.send_payload(&self.endpoint, channel, reliable, packet.as_bytes()) {
            log::warn!("send failed: {}", e);
        }
        Ok(())
    }

    /// Requests graceful disconnection. The Disconnect event is delivered
    /// on a later `service` call.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.as_mut() {
            if link.state == LinkState::Connected {
                if let Err(e) = link.send_control(&self.endpoint, FrameBody::Disconnect) {
                    log::warn!("disconnect notice failed: {}", e);
                }
            }
            link.state = LinkState::Closing;
        }
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
            let expected = self.link.as_ref().map(|link| link.addr);
            if expected != Some(addr) {
                continue;
            }
            self.handle_frame(frame);
        }

        if let Some(link) = self.link.as_mut() {
            if link.state == LinkState::Connected {
                link.resend_due(&self.endpoint, Instant::now());
                link.keepalive_if_idle(&self.endpoint);
            }
        }

        let lost = self
            .link
            .as_ref()
            .is_some_and(|link| link.state == LinkState::Closing || link.timed_out(self.timeout));
        if lost {
            let timed_out = self
                .link
                .as_ref()
                .is_some_and(|link| link.state != LinkState::Closing);
            if timed_out {
                log::warn!("server connection lost");
            }
            self.link = None;
            self.events.push_back(NetEvent::Disconnect { peer: REMOTE });
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        if matches!(frame.body, FrameBody::Disconnect) {
            if self.link.take().is_some() {
                log::info!("remote end closed the connection");
                self.events.push_back(NetEvent::Disconnect { peer: REMOTE });
            }
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match frame.body {
            FrameBody::Payload {
                channel,
                reliable,
                message_seq,
                data,
            } => {
                if !link.observe(&frame.header) {
                    return;
                }
                for payload in link.accept_payload(channel, reliable, message_seq, data) {
                    self.events.push_back(NetEvent::Receive {
                        peer: REMOTE,
                        packet: Packet::from_bytes(payload),
                    });
                }
            }
            FrameBody::KeepAlive => {
                link.observe(&frame.header);
            }
            // a late duplicate of the handshake tail
            FrameBody::ConnectAccepted => {}
            body => log::debug!("ignoring unexpected {:?}", body),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| NetError::ConnectFailure {
            reason: format!("could not resolve {}:{}", host, port),
        })
}

fn send_handshake(endpoint: &Endpoint, remote: SocketAddr, body: FrameBody) {
    // handshake frames carry a throwaway header; sequencing starts once
    // the connection is established
    let frame = Frame::new(FrameHeader::new(0, 0, 0), body);
    if let Err(e) = endpoint.send_frame(&frame, remote) {
        log::warn!("handshake send to {} failed: {}", remote, e);
    }
}
