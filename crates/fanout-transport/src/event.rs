// Read-and-parse primitive for control records arriving from the broker.
use bytes::Bytes;
use fanout_wire::Event;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// A read or write deadline was exceeded.
    #[error("network timeout")]
    Timeout,
    /// The peer finished the stream.
    #[error("event stream closed")]
    Closed,
    /// The bytes did not parse as an event. The raw payload is kept so the
    /// caller can log what arrived.
    #[error("unmarshal event")]
    Unmarshal {
        data: Bytes,
        #[source]
        source: fanout_wire::Error,
    },
    #[error("read event: {0}")]
    Io(#[source] io::Error),
}

/// Read up to `max_message_bytes` from the stream and parse the result as
/// one [`Event`]. One record per read; records carry no framing.
pub async fn receive_event<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_message_bytes: usize,
) -> Result<Event, ReceiveError> {
    let mut buf = vec![0u8; max_message_bytes];
    let read = stream.read(&mut buf).await.map_err(|err| {
        if err.kind() == io::ErrorKind::TimedOut {
            ReceiveError::Timeout
        } else {
            ReceiveError::Io(err)
        }
    })?;
    if read == 0 {
        return Err(ReceiveError::Closed);
    }
    buf.truncate(read);
    Event::decode(&buf).map_err(|source| ReceiveError::Unmarshal {
        data: Bytes::from(buf),
        source,
    })
}
