use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram on a UDP socket, introduced
///  to facilitate mocking the I/O part away for testing.
///
/// The result matters: a failed transmit must not count towards the bytes on
///  the wire, and must not demote the packet from its fresh-send priority.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }
}

/// Binds an unconnected socket for outgoing datagrams, on the address family
///  matching the destination.
pub async fn bind_send_socket(peer_addr: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
    let bind_addr = if peer_addr.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    trace!("bound outgoing datagram socket to {:?}", socket.local_addr()?);
    Ok(Arc::new(socket))
}
