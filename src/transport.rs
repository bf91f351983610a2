//! Adapters between h3/QUIC's frame-oriented API and the two shapes this
//! tunnel actually needs: a byte stream for the capsule control channel,
//! and a datagram capability for IP packets.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h3::ext::Datagram;
use h3::quic::{RecvStream, SendStream, StreamId};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::DatagramEndpoint;
use crate::error::{Result, TunnelError};

/// Buffer depth of the byte pipe bridging an h3 request stream to the
/// capsule codec's `AsyncRead + AsyncWrite` expectations.
pub const CONTROL_STREAM_BUFFER: usize = 64 * 1024;

/// Bridge an h3 request stream's DATA frames onto a byte-oriented duplex
/// pipe, so the capsule codec never has to deal with h3's frame API
/// directly. Returns the local half of the pipe plus the background task
/// driving the bridge; dropping the returned stream ends the task.
///
/// Takes the send/recv halves already split out of the request stream,
/// rather than the stream itself, since `h3::client::RequestStream` and
/// `h3::server::RequestStream` are distinct wrapper types but both hand
/// back the same `h3::quic::{SendStream, RecvStream}` shapes from
/// `.split()` — this lets one function serve both the client's and the
/// server's control stream.
pub fn spawn_control_bridge<Snd, Rcv>(mut send: Snd, mut recv: Rcv) -> (DuplexStream, JoinHandle<()>)
where
    Snd: SendStream<Bytes> + Send + 'static,
    Rcv: RecvStream + Send + 'static,
{
    let (local, remote) = duplex(CONTROL_STREAM_BUFFER);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let handle = tokio::spawn(async move {
        let upload = async {
            let mut buf = [0u8; 4096];
            loop {
                match remote_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if send.send_data(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = send.finish().await;
        };

        let download = async {
            loop {
                match recv.recv_data().await {
                    Ok(Some(mut chunk)) => {
                        let bytes = chunk.copy_to_bytes(chunk.remaining());
                        if remote_wr.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        };

        tokio::join!(upload, download);
        debug!("control stream bridge ended");
    });

    (local, handle)
}

/// A [`DatagramEndpoint`] backed by an h3 connection's QUIC datagram
/// extension: IP packets travel as HTTP/3 datagrams addressed to the
/// control stream's id, per CONNECT-IP.
pub struct H3DatagramEndpoint<C> {
    conn: Arc<Mutex<C>>,
    stream_id: StreamId,
}

impl<C> H3DatagramEndpoint<C> {
    pub fn new(conn: Arc<Mutex<C>>, stream_id: StreamId) -> Self {
        Self { conn, stream_id }
    }
}

#[async_trait]
impl<C> DatagramEndpoint for H3DatagramEndpoint<C>
where
    C: h3::quic::SendDatagramExt<Bytes> + h3::quic::RecvDatagramExt<Buf = Bytes> + Send,
{
    async fn recv(&self) -> Result<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        match conn.recv_datagram().await {
            Ok(Some(datagram)) => Ok(datagram.into_payload().to_vec()),
            Ok(None) => Err(TunnelError::Transport("datagram stream closed".into())),
            Err(err) => Err(TunnelError::Transport(format!("datagram recv failed: {err}"))),
        }
    }

    async fn send(&self, packet: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        let datagram = Datagram::new(self.stream_id, Bytes::copy_from_slice(packet));
        conn.send_datagram(datagram)
            .map_err(|err| TunnelError::Transport(format!("datagram send failed: {err}")))
    }
}
