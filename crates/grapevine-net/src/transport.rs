//! Connection plumbing
//!
//! Every exchange is one short conversation over a fresh TCP connection:
//! the initiator writes one frame and the two sides may trade replies on the
//! same connection until one of them closes. The connection must live for
//! the whole gossip -> request -> response dance.

use crate::framing::FrameCodec;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// A framed connection to a peer.
pub type Conn = Framed<TcpStream, FrameCodec>;

/// Open a framed connection to a peer.
///
/// Callers treat failures as non-fatal: dead peers refuse connections and
/// the failure detector handles them independently.
pub async fn dial(addr: SocketAddr) -> io::Result<Conn> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Framed::new(stream, FrameCodec::new()))
}

/// Wrap an accepted stream in the frame codec.
pub fn accept(stream: TcpStream) -> Conn {
    Framed::new(stream, FrameCodec::new())
}
