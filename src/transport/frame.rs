//! Relay wire framing
//!
//! A relay message is three frames (`topic`, `origin`, `payload`). Each frame
//! is a big-endian `u32` length followed by that many UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::CacheError;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const FRAMES: usize = 3;
const LEN_PREFIX: usize = 4;

/// One relayed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub origin: String,
    pub payload: String,
}

impl RelayMessage {
    pub fn new(
        topic: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            origin: origin.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, CacheError> {
        let frames = [&self.topic, &self.origin, &self.payload];
        let total: usize = frames.iter().map(|f| LEN_PREFIX + f.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for frame in frames {
            if frame.len() > MAX_FRAME_LEN {
                return Err(CacheError::Frame(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    frame.len(),
                    MAX_FRAME_LEN
                )));
            }
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame.as_bytes());
        }
        Ok(buf.freeze())
    }

    /// Take one complete message off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the message is
    /// still incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, CacheError> {
        let mut offset = 0;
        for _ in 0..FRAMES {
            if buf.len() < offset + LEN_PREFIX {
                return Ok(None);
            }
            let mut prefix = &buf[offset..offset + LEN_PREFIX];
            let frame_len = prefix.get_u32() as usize;
            if frame_len > MAX_FRAME_LEN {
                return Err(CacheError::Frame(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    frame_len, MAX_FRAME_LEN
                )));
            }
            offset += LEN_PREFIX + frame_len;
            if buf.len() < offset {
                return Ok(None);
            }
        }

        let mut message = buf.split_to(offset);
        let mut next = || -> Result<String, CacheError> {
            let len = message.get_u32() as usize;
            let body = message.split_to(len);
            String::from_utf8(body.to_vec())
                .map_err(|e| CacheError::Frame(format!("frame is not UTF-8: {}", e)))
        };
        let topic = next()?;
        let origin = next()?;
        let payload = next()?;

        Ok(Some(Self {
            topic,
            origin,
            payload,
        }))
    }
}

/// Reads whole messages from a byte stream.
///
/// Partial reads are kept in an internal buffer, so a `read_message` future
/// can be dropped (for example by a poll timeout) without losing data.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Next message, or `None` once the peer closed the stream cleanly.
    pub async fn read_message(&mut self) -> Result<Option<RelayMessage>, CacheError> {
        loop {
            if let Some(message) = RelayMessage::decode(&mut self.buf)? {
                return Ok(Some(message));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CacheError::Frame(
                    "connection closed in the middle of a message".to_owned(),
                ));
            }
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RelayMessage,
) -> Result<(), CacheError> {
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Turn a `tcp://host:port` endpoint into a socket address string.
/// A `*` host means every interface.
pub fn socket_addr(component: &str, uri: &str) -> Result<String, CacheError> {
    let rest = uri.strip_prefix("tcp://").ok_or_else(|| {
        CacheError::configuration(component, format!("unsupported endpoint \"{}\"", uri))
    })?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
        CacheError::configuration(component, format!("endpoint \"{}\" has no port", uri))
    })?;
    port.parse::<u16>().map_err(|_| {
        CacheError::configuration(component, format!("endpoint \"{}\" has an invalid port", uri))
    })?;
    let host = match host {
        "*" => "0.0.0.0",
        "" => {
            return Err(CacheError::configuration(
                component,
                format!("endpoint \"{}\" has no host", uri),
            ));
        }
        other => other,
    };
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RelayMessage {
        RelayMessage::new(
            "TridionCacheChannel",
            "RelayLeaf-1",
            r#"<cacheEvent regionPath="/com.tridion.storage.ItemMeta" type="0"/>"#,
        )
    }

    #[test]
    fn encode_layout() {
        let bytes = RelayMessage::new("t", "", "xy").encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 1, b't', 0, 0, 0, 0, 0, 0, 0, 2, b'x', b'y']
        );
    }

    #[test]
    fn decode_waits_for_complete_message() {
        let encoded = sample().encode().unwrap();
        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(7) {
            assert_eq!(RelayMessage::decode(&mut buf).unwrap(), None);
            buf.extend_from_slice(chunk);
        }
        assert_eq!(RelayMessage::decode(&mut buf).unwrap(), Some(sample()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_leaves_following_message_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&sample().encode().unwrap());
        buf.extend_from_slice(&RelayMessage::new("other", "x", "y").encode().unwrap());

        assert_eq!(RelayMessage::decode(&mut buf).unwrap(), Some(sample()));
        assert_eq!(
            RelayMessage::decode(&mut buf).unwrap().map(|m| m.topic),
            Some("other".to_owned())
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            RelayMessage::decode(&mut buf),
            Err(CacheError::Frame(_))
        ));

        let huge = RelayMessage::new("t", "o", "x".repeat(MAX_FRAME_LEN + 1));
        assert!(huge.encode().is_err());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xff);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(RelayMessage::decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn reader_reports_clean_and_truncated_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);

        write_message(&mut client, &sample()).await.unwrap();
        drop(client);
        assert_eq!(reader.read_message().await.unwrap(), Some(sample()));
        assert_eq!(reader.read_message().await.unwrap(), None);

        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);
        let encoded = sample().encode().unwrap();
        client.write_all(&encoded[..5]).await.unwrap();
        drop(client);
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn reader_survives_cancelled_reads() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server);
        let encoded = sample().encode().unwrap();

        client.write_all(&encoded[..10]).await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.read_message(),
        )
        .await;
        assert!(pending.is_err());

        client.write_all(&encoded[10..]).await.unwrap();
        assert_eq!(reader.read_message().await.unwrap(), Some(sample()));
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(socket_addr("Relay", "tcp://*:5556").unwrap(), "0.0.0.0:5556");
        assert_eq!(
            socket_addr("Relay", "tcp://localhost:5557").unwrap(),
            "localhost:5557"
        );
        for bad in ["localhost:5556", "tcp://localhost", "tcp://:1", "tcp://h:port"] {
            assert!(matches!(
                socket_addr("Relay", bad),
                Err(CacheError::Configuration(_))
            ));
        }
    }
}
