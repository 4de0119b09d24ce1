// QUIC endpoints and the per-connection stream topology of the broker.
//
// Every peer session is built from the same small set of streams: one
// one-way stream per direction of application data (control events or
// message payloads) and one bidirectional stream dedicated to pings.
// `PeerConnection` names those roles instead of exposing raw stream
// constructors.
use anyhow::{Context, Result, bail};
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

pub mod event;
pub mod ping;
pub mod tls;

pub use event::{ReceiveError, receive_event};
pub use ping::{PingError, Pinger, PingerConfig};

// A peer only ever uses its one-way stream plus the ping stream, so the
// per-connection stream budget stays tight.
const STREAMS_PER_PEER: u32 = 4;

fn transport_params() -> quinn::TransportConfig {
    let mut params = quinn::TransportConfig::default();
    params.max_concurrent_uni_streams(VarInt::from_u32(STREAMS_PER_PEER));
    params.max_concurrent_bidi_streams(VarInt::from_u32(STREAMS_PER_PEER));
    // Pings are the liveness signal; the transport must not expire idle
    // connections on its own.
    params.max_idle_timeout(None);
    params
}

/// Listening endpoint for one class of peers (publishers or subscribers).
pub struct Listener {
    endpoint: Endpoint,
}

impl Listener {
    pub fn bind(addr: SocketAddr, mut tls: ServerConfig) -> Result<Self> {
        tls.transport_config(Arc::new(transport_params()));
        let endpoint =
            Endpoint::server(tls, addr).with_context(|| format!("bind listener on {addr}"))?;
        Ok(Self { endpoint })
    }

    /// Next incoming connection, handshake completed.
    pub async fn accept(&self) -> Result<PeerConnection> {
        let Some(incoming) = self.endpoint.accept().await else {
            bail!("listener endpoint closed");
        };
        let conn = incoming.await.context("QUIC handshake")?;
        Ok(PeerConnection { conn })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("listener local address")
    }
}

/// Dialing endpoint for the publisher and subscriber clients. Binds an
/// ephemeral local port; the broker's address is given per dial.
pub struct Dialer {
    endpoint: Endpoint,
}

impl Dialer {
    pub fn new(mut tls: ClientConfig) -> Result<Self> {
        tls.transport_config(Arc::new(transport_params()));
        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .context("bind client endpoint")?;
        endpoint.set_default_client_config(tls);
        Ok(Self { endpoint })
    }

    pub async fn dial(&self, addr: SocketAddr, server_name: &str) -> Result<PeerConnection> {
        let conn = self
            .endpoint
            .connect(addr, server_name)
            .with_context(|| format!("dial {addr}"))?
            .await
            .context("QUIC handshake")?;
        Ok(PeerConnection { conn })
    }
}

/// One peer's connection, seen through the roles its streams play.
///
/// Which side opens which stream is fixed by the protocol: the producing
/// side opens the one-way stream its data travels on, and the client opens
/// the ping stream. Opening is local in QUIC, so the `incoming_*` calls
/// only resolve once the peer writes its first bytes to the stream.
pub struct PeerConnection {
    conn: quinn::Connection,
}

impl PeerConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Open the one-way stream this side produces on: events or fanned-out
    /// messages when we are the broker, payloads when we are a publisher.
    pub async fn open_send_stream(&self) -> Result<SendStream> {
        self.conn.open_uni().await.context("open send stream")
    }

    /// Park until the peer's one-way stream shows up.
    pub async fn incoming_recv_stream(&self) -> Result<RecvStream> {
        self.conn
            .accept_uni()
            .await
            .context("wait for the peer's stream")
    }

    /// Open the dedicated ping stream; the clients do this after dialing.
    pub async fn open_ping_stream(&self) -> Result<PingStream> {
        let (send, recv) = self.conn.open_bi().await.context("open ping stream")?;
        Ok(PingStream { send, recv })
    }

    /// Park until the peer opens the ping stream; the broker does this.
    pub async fn incoming_ping_stream(&self) -> Result<PingStream> {
        let (send, recv) = self
            .conn
            .accept_bi()
            .await
            .context("wait for the ping stream")?;
        Ok(PingStream { send, recv })
    }
}

/// The two halves of a peer's dedicated ping stream.
pub struct PingStream {
    pub send: SendStream,
    pub recv: RecvStream,
}

/// Error from [`write_full`].
#[derive(Debug, thiserror::Error)]
pub enum WriteFullError {
    /// The stream accepted fewer bytes than the payload length. Fatal for
    /// the session; a truncated record is indistinguishable from corruption
    /// on the receive side.
    #[error("wrote {written} bytes, payload is {expected} bytes")]
    Short { written: usize, expected: usize },
    #[error("stream write: {0}")]
    Write(#[from] quinn::WriteError),
}

/// Write one payload as a single stream write, verifying nothing was cut
/// short. One call per logical record; records carry no framing.
pub async fn write_full(send: &mut SendStream, payload: &[u8]) -> Result<(), WriteFullError> {
    let written = send.write(payload).await?;
    if written < payload.len() {
        return Err(WriteFullError::Short {
            written,
            expected: payload.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_wire::Event;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn self_signed_endpoints() -> Result<(ServerConfig, ClientConfig)> {
        let certified = rcgen::generate_simple_self_signed(vec!["fanout-test".into()])?;
        let cert = certified.cert.der().clone();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        let server = ServerConfig::with_single_cert(vec![cert.clone()], key.into())?;
        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert)?;
        let client = ClientConfig::with_root_certificates(Arc::new(roots))?;
        Ok((server, client))
    }

    #[tokio::test]
    async fn event_stream_surfaces_with_the_first_record() -> Result<()> {
        let (server_tls, client_tls) = self_signed_endpoints()?;
        let listener = Listener::bind("127.0.0.1:0".parse()?, server_tls)?;
        let addr = listener.local_addr()?;

        // The broker opens the event stream and writes one control record;
        // only then does the stream become visible to the publisher.
        let broker = tokio::spawn(async move {
            let peer = listener.accept().await?;
            let mut events = peer.open_send_stream().await?;
            write_full(&mut events, &Event::ExistsSubscriber.encode()?).await?;
            anyhow::Ok(peer)
        });

        let dialer = Dialer::new(client_tls)?;
        let peer = dialer.dial(addr, "fanout-test").await?;
        assert_eq!(peer.remote_addr(), addr);
        let mut events = peer.incoming_recv_stream().await?;
        let event = receive_event(&mut events, 1000).await?;
        assert_eq!(event, Event::ExistsSubscriber);

        broker.await??;
        Ok(())
    }

    #[tokio::test]
    async fn write_full_delivers_a_max_size_payload() -> Result<()> {
        let (server_tls, client_tls) = self_signed_endpoints()?;
        let listener = Listener::bind("127.0.0.1:0".parse()?, server_tls)?;
        let addr = listener.local_addr()?;

        let broker = tokio::spawn(async move {
            let peer = listener.accept().await?;
            let mut messages = peer.incoming_recv_stream().await?;
            let payload = messages.read_to_end(2048).await?;
            anyhow::Ok(payload)
        });

        let dialer = Dialer::new(client_tls)?;
        let peer = dialer.dial(addr, "fanout-test").await?;
        let mut messages = peer.open_send_stream().await?;
        let payload = vec![0x42u8; 1000];
        write_full(&mut messages, &payload).await?;
        messages.finish()?;

        assert_eq!(broker.await??, payload);
        Ok(())
    }

    #[tokio::test]
    async fn ping_stream_connects_the_peer_pingers() -> Result<()> {
        let (server_tls, client_tls) = self_signed_endpoints()?;
        let listener = Listener::bind("127.0.0.1:0".parse()?, server_tls)?;
        let addr = listener.local_addr()?;
        let pinger = Pinger::new(PingerConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(1),
        });

        let broker_cancel = CancellationToken::new();
        let broker = {
            let cancel = broker_cancel.clone();
            tokio::spawn(async move {
                let peer = listener.accept().await?;
                let mut ping = peer.incoming_ping_stream().await?;
                pinger
                    .accept_pings(&cancel, &mut ping.recv, &mut ping.send)
                    .await?;
                anyhow::Ok(peer)
            })
        };

        let dialer = Dialer::new(client_tls)?;
        let peer = dialer.dial(addr, "fanout-test").await?;
        let mut ping = peer.open_ping_stream().await?;
        let client_cancel = CancellationToken::new();
        let client = {
            let cancel = client_cancel.clone();
            tokio::spawn(async move {
                pinger.send_pings(&cancel, &mut ping.recv, &mut ping.send).await?;
                // Hold the stream open so the broker sees silence, not a reset.
                anyhow::Ok(ping)
            })
        };

        // Let a few exchanges happen, then stop the client first so the
        // broker side winds down on cancellation rather than on an error.
        tokio::time::sleep(Duration::from_millis(150)).await;
        client_cancel.cancel();
        let _ping = client.await??;
        broker_cancel.cancel();
        let _peer = broker.await??;
        Ok(())
    }
}
