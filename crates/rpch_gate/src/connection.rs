// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! A single transport endpoint: socket, optional TLS session, peer identity,
//! last-activity stamp.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Instant;

use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslStream};

/// Transport state. TLS accept is a state, not a blocking call.
pub enum Transport {
    None,
    Plain(TcpStream),
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Tls(SslStream<TcpStream>),
}

/// Result of a non-blocking read or write.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    Done(usize),
    /// The peer closed: a zero-length read or write.
    Closed,
    /// Would block; park the context.
    NotReady,
    /// Anything else. Fatal for the tunnel.
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Done,
    NotReady,
    Failed,
}

pub struct Connection {
    pub transport: Transport,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub last_activity: Instant,
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            transport: Transport::None,
            peer: None,
            local: None,
            last_activity: Instant::now(),
        }
    }
}

fn outcome_from_err(e: std::io::Error) -> IoOutcome {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => IoOutcome::NotReady,
        _ => IoOutcome::Failed,
    }
}

impl Connection {
    pub fn open(stream: TcpStream) -> Connection {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        Connection {
            transport: Transport::Plain(stream),
            peer,
            local,
            last_activity: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.transport, Transport::None)
    }

    pub fn raw_fd(&self) -> Option<i32> {
        match &self.transport {
            Transport::None => None,
            Transport::Plain(s) => Some(s.as_raw_fd()),
            Transport::Handshaking(mid) => Some(mid.get_ref().as_raw_fd()),
            Transport::Tls(s) => Some(s.get_ref().as_raw_fd()),
        }
    }

    /// Starts or resumes the TLS handshake.
    pub fn drive_handshake(&mut self, ctx: &SslContext) -> HandshakeOutcome {
        match std::mem::replace(&mut self.transport, Transport::None) {
            Transport::Plain(stream) => {
                let ssl = match Ssl::new(ctx) {
                    Ok(ssl) => ssl,
                    Err(e) => {
                        tracing::error!("Ssl::new: {e}");
                        self.transport = Transport::Plain(stream);
                        return HandshakeOutcome::Failed;
                    }
                };
                self.resolve_handshake(ssl.accept(stream))
            }
            Transport::Handshaking(mid) => self.resolve_handshake(mid.handshake()),
            done @ Transport::Tls(_) => {
                self.transport = done;
                HandshakeOutcome::Done
            }
            Transport::None => HandshakeOutcome::Failed,
        }
    }

    fn resolve_handshake(
        &mut self,
        result: Result<SslStream<TcpStream>, HandshakeError<TcpStream>>,
    ) -> HandshakeOutcome {
        match result {
            Ok(stream) => {
                self.transport = Transport::Tls(stream);
                HandshakeOutcome::Done
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.transport = Transport::Handshaking(mid);
                HandshakeOutcome::NotReady
            }
            Err(e) => {
                tracing::debug!("failed to accept TLS connection: {e}");
                HandshakeOutcome::Failed
            }
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        let result = match &mut self.transport {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
            _ => return IoOutcome::Failed,
        };
        match result {
            Ok(0) => IoOutcome::Closed,
            Ok(n) => IoOutcome::Done(n),
            Err(e) => outcome_from_err(e),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> IoOutcome {
        if buf.is_empty() {
            return IoOutcome::Done(0);
        }
        let result = match &mut self.transport {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
            _ => return IoOutcome::Failed,
        };
        match result {
            Ok(0) => IoOutcome::Closed,
            Ok(n) => IoOutcome::Done(n),
            Err(e) => outcome_from_err(e),
        }
    }

    /// MSG_PEEK liveness probe used by idle OUT channels. A zero-length
    /// result means the peer went away.
    pub fn peer_alive(&self) -> bool {
        let Some(fd) = self.raw_fd() else {
            return false;
        };
        let mut probe = [0u8; 1];
        let n = unsafe {
            nix::libc::recv(
                fd,
                probe.as_mut_ptr().cast(),
                1,
                nix::libc::MSG_PEEK | nix::libc::MSG_DONTWAIT,
            )
        };
        n != 0
    }

    /// Drops the transport, closing the socket.
    pub fn reset(&mut self) {
        self.transport = Transport::None;
        self.peer = None;
        self.local = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn nonblocking_read_reports_not_ready() {
        let (_client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::open(server);
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf), IoOutcome::NotReady);
    }

    #[test]
    fn read_sees_data_and_close() {
        let (mut client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::open(server);
        client.write_all(b"ping").unwrap();
        // Give the loopback a moment.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf), IoOutcome::Done(4));
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(conn.read(&mut buf), IoOutcome::Closed);
    }

    #[test]
    fn peek_probe_detects_closed_peer() {
        let (client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::open(server);
        assert!(conn.peer_alive());
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!conn.peer_alive());
    }
}
