// Control records sent broker -> publisher to gate message production.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encode event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Subscriber-presence notification delivered to publishers.
///
/// One record per stream write, encoded as a JSON mapping with a `code`
/// discriminant and no framing:
///
/// ```
/// use fanout_wire::Event;
///
/// let encoded = Event::ExistsSubscriber.encode().expect("encode");
/// assert_eq!(&encoded[..], br#"{"code":"exists_subscriber"}"#);
/// assert_eq!(Event::decode(&encoded).expect("decode"), Event::ExistsSubscriber);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Event {
    /// At least one subscriber is connected; publishers may produce.
    ExistsSubscriber,
    /// The subscriber pool is empty; publishers should stop producing.
    NoSubscribers,
}

impl Event {
    pub fn encode(&self) -> Result<Bytes> {
        let encoded = serde_json::to_vec(self).map_err(Error::Encode)?;
        Ok(Bytes::from(encoded))
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        serde_json::from_slice(input).map_err(Error::Decode)
    }
}
