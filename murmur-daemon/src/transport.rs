//! UDP multicast transport. Owns the shutdown flag every loop watches.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct Transport {
    socket: UdpSocket,
    dest: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Bind `port` on all interfaces and join `group`.
    pub fn bind(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = make_multicast_socket(group, port)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            socket,
            dest: SocketAddr::V4(SocketAddrV4::new(group, port)),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram to the group.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.socket.send_to(datagram, self.dest).await.map(|_| ())
    }

    /// Receive one datagram into `buf`. `None` once the transport is closed.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(None);
        }
        tokio::select! {
            r = self.socket.recv_from(buf) => r.map(|(n, _)| Some(n)),
            _ = shutdown.changed() => Ok(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Wake every pending receive and stop every loop. Idempotent.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    if !group.is_multicast() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{group} is not a multicast address"),
        ));
    }
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    // Other nodes on this host must hear us; our own frames are dropped by sender id.
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
