use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::endpoint::Endpoint;
use super::tracking::{ReceiveWindow, SendTracker};
use super::wire::{CHANNEL_COUNT, Frame, FrameBody, FrameHeader, sequence_newer};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const MAX_IN_FLIGHT: usize = 256;

/// Opaque handle naming one transport-owned connection. Holders may store
/// and compare it but never interpret its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake in progress: request seen, challenge sent.
    Pending,
    Connected,
    /// Graceful local disconnect requested; reaped on the next pump.
    Closing,
}

/// In-order delivery state for one reliable channel.
#[derive(Debug, Default)]
struct ChannelOrdering {
    next_expected: u32,
    held: BTreeMap<u32, Vec<u8>>,
}

impl ChannelOrdering {
    /// Accepts one reliable message, returning every payload now
    /// deliverable in order.
    fn accept(&mut self, message_seq: u32, data: Vec<u8>) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        if message_seq == self.next_expected {
            ready.push(data);
            self.next_expected = self.next_expected.wrapping_add(1);
            while let Some(held) = self.held.remove(&self.next_expected) {
                ready.push(held);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
        } else if sequence_newer(message_seq, self.next_expected) {
            self.held.entry(message_seq).or_insert(data);
        }
        // older than expected: already delivered
        ready
    }
}

/// Per-connection transport state, shared by both host roles.
#[derive(Debug)]
pub struct Link {
    pub addr: SocketAddr,
    pub state: LinkState,
    client_salt: u64,
    server_salt: u64,
    send_sequence: u32,
    next_message_seq: [u32; CHANNEL_COUNT as usize],
    ordering: [ChannelOrdering; CHANNEL_COUNT as usize],
    send_tracker: SendTracker,
    receive_window: ReceiveWindow,
    last_receive: Instant,
    last_send: Instant,
}

impl Link {
    /// Authority-side link for an incoming connection request.
    pub fn pending(addr: SocketAddr, client_salt: u64) -> Self {
        Self::with_state(addr, client_salt, entropy_u64(), LinkState::Pending)
    }

    /// Peer-side link for a connection whose handshake already completed.
    pub fn established(addr: SocketAddr, client_salt: u64, server_salt: u64) -> Self {
        Self::with_state(addr, client_salt, server_salt, LinkState::Connected)
    }

    fn with_state(addr: SocketAddr, client_salt: u64, server_salt: u64, state: LinkState) -> Self {
        Self {
            addr,
            state,
            client_salt,
            server_salt,
            send_sequence: 0,
            next_message_seq: [0; CHANNEL_COUNT as usize],
            ordering: Default::default(),
            send_tracker: SendTracker::new(MAX_IN_FLIGHT),
            receive_window: ReceiveWindow::new(),
            last_receive: Instant::now(),
            last_send: Instant::now(),
        }
    }

    pub fn server_salt(&self) -> u64 {
        self.server_salt
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    fn next_header(&mut self) -> FrameHeader {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        let (ack, ack_bits) = self.receive_window.ack_data();
        FrameHeader::new(sequence, ack, ack_bits)
    }

    /// Runs an incoming post-handshake header through duplicate detection
    /// and ack processing. Returns false for duplicates.
    pub fn observe(&mut self, header: &FrameHeader) -> bool {
        self.last_receive = Instant::now();
        if !self.receive_window.record(header.sequence) {
            return false;
        }
        self.send_tracker.process_ack(header.ack, header.ack_bits);
        true
    }

    /// Orders one payload, returning everything now deliverable.
    pub fn accept_payload(
        &mut self,
        channel: u8,
        reliable: bool,
        message_seq: u32,
        data: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        if channel >= CHANNEL_COUNT {
            log::debug!("dropping payload on out-of-range channel {}", channel);
            return Vec::new();
        }
        if !reliable {
            return vec![data];
        }
        self.ordering[usize::from(channel)].accept(message_seq, data)
    }

    pub fn send_payload(
        &mut self,
        endpoint: &Endpoint,
        channel: u8,
        reliable: bool,
        data: &[u8],
    ) -> io::Result<()> {
        let message_seq = if reliable {
            let seq = self.next_message_seq[usize::from(channel)];
            self.next_message_seq[usize::from(channel)] = seq.wrapping_add(1);
            seq
        } else {
            0
        };
        let header = self.next_header();
        let frame = Frame::new(
            header,
            FrameBody::Payload {
                channel,
                reliable,
                message_seq,
                data: data.to_vec(),
            },
        );
        let datagram = endpoint.send_frame(&frame, self.addr)?;
        self.send_tracker
            .record_sent(header.sequence, reliable, &datagram);
        self.last_send = Instant::now();
        Ok(())
    }

    /// Sends a handshake or lifecycle frame. Control frames are never
    /// retransmitted by timer; their retransmission is request-driven.
    pub fn send_control(&mut self, endpoint: &Endpoint, body: FrameBody) -> io::Result<()> {
        let header = self.next_header();
        endpoint.send_frame(&Frame::new(header, body), self.addr)?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Retransmits reliable frames whose timer expired as of `now`.
    pub fn resend_due(&mut self, endpoint: &Endpoint, now: Instant) {
        for datagram in self.send_tracker.due_for_resend(now) {
            if let Err(e) = endpoint.resend(&datagram, self.addr) {
                log::warn!("resend to {} failed: {}", self.addr, e);
            }
        }
    }

    /// Keeps an otherwise idle connection alive (and its acks flowing).
    pub fn keepalive_if_idle(&mut self, endpoint: &Endpoint) {
        if self.last_send.elapsed() < KEEPALIVE_INTERVAL {
            return;
        }
        let header = self.next_header();
        let frame = Frame::new(header, FrameBody::KeepAlive);
        match endpoint.send_frame(&frame, self.addr) {
            Ok(datagram) => {
                self.send_tracker.record_sent(header.sequence, false, &datagram);
                self.last_send = Instant::now();
            }
            Err(e) => log::warn!("keepalive to {} failed: {}", self.addr, e),
        }
    }

    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.last_receive.elapsed() > timeout
    }
}

/// Authority-side table of links, keyed both by address and by handle.
#[derive(Debug)]
pub struct LinkTable {
    by_addr: HashMap<SocketAddr, LinkId>,
    links: HashMap<LinkId, Link>,
    next_link: u64,
    capacity: usize,
}

impl LinkTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_addr: HashMap::new(),
            links: HashMap::new(),
            next_link: 1,
            capacity,
        }
    }

    /// Admits a connection request, reusing the existing link for a
    /// retransmitted request from the same address. Refuses at capacity.
    pub fn admit(&mut self, addr: SocketAddr, client_salt: u64) -> Result<LinkId, &'static str> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Ok(id);
        }
        if self.links.len() >= self.capacity {
            return Err("server full");
        }

        let id = LinkId::from_raw(self.next_link);
        self.next_link += 1;
        self.links.insert(id, Link::pending(addr, client_salt));
        self.by_addr.insert(addr, id);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn id_of(&self, addr: &SocketAddr) -> Option<LinkId> {
        self.by_addr.get(addr).copied()
    }

    /// Removes both directions; returns the retired link.
    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.remove(&id)?;
        self.by_addr.remove(&link.addr);
        Some(link)
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LinkId, &mut Link)> {
        self.links.iter_mut().map(|(&id, link)| (id, link))
    }

    /// Removes every link idle past `timeout`, returning the removed links.
    pub fn sweep_timed_out(&mut self, timeout: Duration) -> Vec<(LinkId, Link)> {
        let expired: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, link)| link.timed_out(timeout))
            .map(|(&id, _)| id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.remove(id).map(|link| (id, link)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }
}

/// Process-local entropy for handshake salts.
pub fn entropy_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn ordering_delivers_in_sequence() {
        let mut channel = ChannelOrdering::default();
        assert_eq!(channel.accept(0, vec![0]), vec![vec![0]]);
        assert_eq!(channel.accept(1, vec![1]), vec![vec![1]]);
    }

    #[test]
    fn ordering_holds_gaps_until_filled() {
        let mut channel = ChannelOrdering::default();
        assert!(channel.accept(2, vec![2]).is_empty());
        assert!(channel.accept(1, vec![1]).is_empty());
        assert_eq!(
            channel.accept(0, vec![0]),
            vec![vec![0], vec![1], vec![2]]
        );
    }

    #[test]
    fn ordering_drops_already_delivered() {
        let mut channel = ChannelOrdering::default();
        assert_eq!(channel.accept(0, vec![0]), vec![vec![0]]);
        assert!(channel.accept(0, vec![0]).is_empty());
    }

    #[test]
    fn admit_reuses_link_for_same_address() {
        let mut table = LinkTable::new(4);
        let first = table.admit(addr(5000), 1).unwrap();
        let second = table.admit(addr(5000), 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn admit_refuses_at_capacity() {
        let mut table = LinkTable::new(1);
        table.admit(addr(5000), 1).unwrap();
        assert!(table.admit(addr(5001), 2).is_err());

        // freeing the slot admits the next request
        let id = table.id_of(&addr(5000)).unwrap();
        table.remove(id);
        assert!(table.admit(addr(5001), 2).is_ok());
    }

    #[test]
    fn remove_clears_both_directions() {
        let mut table = LinkTable::new(4);
        let id = table.admit(addr(5000), 1).unwrap();

        let link = table.remove(id).unwrap();
        assert_eq!(link.addr, addr(5000));
        assert!(table.id_of(&addr(5000)).is_none());
        assert!(table.get_mut(id).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_frames_are_observed_once() {
        let mut link = Link::established(addr(5000), 1, 2);
        let header = FrameHeader::new(0, 0, 0);
        assert!(link.observe(&header));
        assert!(!link.observe(&header));
    }
}
