use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::wire::{Frame, MAX_DATAGRAM_SIZE};

/// Non-blocking UDP socket speaking the frame format.
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
}

impl Endpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encodes and sends one frame, returning the encoded datagram so the
    /// caller can retain it for retransmission.
    pub fn send_frame(&self, frame: &Frame, addr: SocketAddr) -> io::Result<Vec<u8>> {
        let data = frame
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds datagram limit",
            ));
        }
        self.socket.send_to(&data, addr)?;
        Ok(data)
    }

    /// Re-sends a previously encoded datagram verbatim.
    pub fn resend(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, addr)?;
        Ok(())
    }

    /// Drains every readable datagram. Undecodable or foreign frames are
    /// dropped here so callers only see valid protocol traffic.
    pub fn receive(&mut self) -> io::Result<Vec<(Frame, SocketAddr)>> {
        let mut frames = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => match Frame::deserialize(&self.recv_buffer[..size]) {
                    Ok(frame) if frame.header.is_valid() => frames.push((frame, addr)),
                    Ok(_) => log::debug!("dropping frame with foreign magic from {}", addr),
                    Err(e) => log::debug!("dropping undecodable datagram from {}: {}", addr, e),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::{FrameBody, FrameHeader};

    #[test]
    fn frames_cross_a_socket_pair() {
        let mut a = Endpoint::bind("127.0.0.1:0").unwrap();
        let b = Endpoint::bind("127.0.0.1:0").unwrap();

        let frame = Frame::new(FrameHeader::new(1, 0, 0), FrameBody::KeepAlive);
        b.send_frame(&frame, a.local_addr()).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        let received = loop {
            let frames = a.receive().unwrap();
            if !frames.is_empty() {
                break frames;
            }
            assert!(std::time::Instant::now() < deadline, "no datagram arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        };

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, b.local_addr());
        assert!(matches!(received[0].0.body, FrameBody::KeepAlive));
    }

    #[test]
    fn garbage_datagrams_are_dropped() {
        let mut a = Endpoint::bind("127.0.0.1:0").unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0x00, 0x01, 0x02], a.local_addr()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(a.receive().unwrap().is_empty());
    }
}
