//! Call messages — the request/reply values relayed between the controlling
//! simulation and the remote worker.
//!
//! The byte layout on the local channel is fixed by the existing
//! simulation-control wire format: five big-endian `u32` header words
//! (opcode, call id, call count, error length, payload length) followed by
//! the error string bytes and the payload bytes. The same layout is used for
//! distributed-transport frames; a reply frame additionally carries one
//! trailing big-endian `u64` with the execution time measured at the remote
//! side, in microseconds.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// Wire value of the init opcode, the mandatory first call of a connection.
pub const OPCODE_INIT: u32 = 10_101_010;

/// Wire value of the stop opcode, the final call of a connection.
pub const OPCODE_STOP: u32 = 0;

/// Upper bound on the error string carried in a message.
const MAX_ERROR_LEN: usize = 64 * 1024;

/// Upper bound on a message payload.
const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

/// Size of the fixed message header: five `u32` words.
const HEADER_LEN: usize = 20;

/// Operation selector of a call.
///
/// Only `Init` and `Stop` are interpreted by the relay; every other opcode is
/// opaque and forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Opcode {
    /// First call of every connection, carries the worker description.
    Init,
    /// Final call of a connection.
    Stop,
    /// Application-defined call, not interpreted by the relay.
    Application(u32),
}

impl Opcode {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            OPCODE_INIT => Opcode::Init,
            OPCODE_STOP => Opcode::Stop,
            other => Opcode::Application(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Opcode::Init => OPCODE_INIT,
            Opcode::Stop => OPCODE_STOP,
            Opcode::Application(raw) => raw,
        }
    }
}

/// One request or reply exchanged on the local channel and on the
/// distributed transport.
#[derive(Debug, Clone)]
pub struct CallMessage {
    pub opcode: Opcode,
    /// Correlates a reply with its request.
    pub call_id: u32,
    /// Batch size of the call.
    pub call_count: u32,
    /// Error text; presence marks the message as an error reply.
    pub error: Option<String>,
    /// Opaque payload, never inspected for application opcodes.
    pub payload: Vec<u8>,
}

impl CallMessage {
    pub fn new(opcode: Opcode, call_id: u32, call_count: u32) -> Self {
        Self {
            opcode,
            call_id,
            call_count,
            error: None,
            payload: Vec::new(),
        }
    }

    /// Build an empty reply correlated to `request`.
    pub fn reply_to(request: &CallMessage) -> Self {
        Self::new(request.opcode, request.call_id, request.call_count)
    }

    /// Build an error reply correlated to `request`.
    pub fn error_reply(request: &CallMessage, text: impl Into<String>) -> Self {
        let mut reply = Self::reply_to(request);
        reply.error = Some(text.into());
        reply
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    /// Decode one message from a byte channel.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let (opcode, call_id, call_count, error_len, payload_len) = parse_header(&header)?;

        let mut error_bytes = vec![0u8; error_len];
        reader.read_exact(&mut error_bytes).await?;
        let error = decode_error(error_bytes)?;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            opcode,
            call_id,
            call_count,
            error,
            payload,
        })
    }

    /// Encode this message onto a byte channel, flushing afterwards.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encode into a distributed-transport frame.
    pub fn to_frame(&self) -> Vec<u8> {
        self.encode()
    }

    /// Encode into a reply frame with the trailing remote execution time.
    pub fn to_reply_frame(&self, remote_elapsed: Duration) -> Vec<u8> {
        let mut frame = self.encode();
        frame.extend_from_slice(&(remote_elapsed.as_micros() as u64).to_be_bytes());
        frame
    }

    /// Decode from a distributed-transport frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        let (message, _rest) = Self::decode(frame)?;
        Ok(message)
    }

    /// Decode a reply frame, returning the message and the remote-reported
    /// execution time carried after it.
    pub fn reply_from_frame(frame: &[u8]) -> Result<(Self, Duration), WireError> {
        let (message, rest) = Self::decode(frame)?;
        if rest.len() < 8 {
            return Err(WireError::Truncated("remote execution time"));
        }
        let micros = u64::from_be_bytes(rest[..8].try_into().expect("checked length"));
        Ok((message, Duration::from_micros(micros)))
    }

    fn encode(&self) -> Vec<u8> {
        let error_bytes = self.error.as_deref().unwrap_or("").as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + error_bytes.len() + self.payload.len());
        buf.extend_from_slice(&self.opcode.to_wire().to_be_bytes());
        buf.extend_from_slice(&self.call_id.to_be_bytes());
        buf.extend_from_slice(&self.call_count.to_be_bytes());
        buf.extend_from_slice(&(error_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(error_bytes);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from a byte slice, returning the message and the unread rest.
    fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated("message header"));
        }
        let (opcode, call_id, call_count, error_len, payload_len) =
            parse_header(&bytes[..HEADER_LEN])?;

        let body = &bytes[HEADER_LEN..];
        if body.len() < error_len + payload_len {
            return Err(WireError::Truncated("message body"));
        }
        let error = decode_error(body[..error_len].to_vec())?;
        let payload = body[error_len..error_len + payload_len].to_vec();

        Ok((
            Self {
                opcode,
                call_id,
                call_count,
                error,
                payload,
            },
            &body[error_len + payload_len..],
        ))
    }
}

fn parse_header(header: &[u8]) -> Result<(Opcode, u32, u32, usize, usize), WireError> {
    let word = |i: usize| {
        u32::from_be_bytes(header[i * 4..i * 4 + 4].try_into().expect("checked length"))
    };
    let opcode = Opcode::from_wire(word(0));
    let call_id = word(1);
    let call_count = word(2);
    let error_len = word(3) as usize;
    let payload_len = word(4) as usize;

    if error_len > MAX_ERROR_LEN {
        return Err(WireError::TooLarge {
            field: "error",
            size: error_len,
            limit: MAX_ERROR_LEN,
        });
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(WireError::TooLarge {
            field: "payload",
            size: payload_len,
            limit: MAX_PAYLOAD_LEN,
        });
    }
    Ok((opcode, call_id, call_count, error_len, payload_len))
}

fn decode_error(bytes: Vec<u8>) -> Result<Option<String>, WireError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| WireError::InvalidUtf8 { field: "error" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_wire_mapping() {
        assert_eq!(Opcode::from_wire(OPCODE_INIT), Opcode::Init);
        assert_eq!(Opcode::from_wire(OPCODE_STOP), Opcode::Stop);
        assert_eq!(Opcode::from_wire(42), Opcode::Application(42));
        assert_eq!(Opcode::Application(42).to_wire(), 42);
        assert_eq!(Opcode::Init.to_wire(), OPCODE_INIT);
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let message = CallMessage::new(Opcode::Application(7), 3, 2)
            .with_payload(vec![1, 2, 3, 4, 5]);

        let (mut client, mut server) = tokio::io::duplex(1024);
        message.write_to(&mut client).await.unwrap();
        let decoded = CallMessage::read_from(&mut server).await.unwrap();

        assert_eq!(decoded.opcode, Opcode::Application(7));
        assert_eq!(decoded.call_id, 3);
        assert_eq!(decoded.call_count, 2);
        assert_eq!(decoded.error, None);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn channel_round_trip_with_error() {
        let request = CallMessage::new(Opcode::Application(9), 11, 1);
        let reply = CallMessage::error_reply(&request, "worker exploded");

        let (mut client, mut server) = tokio::io::duplex(1024);
        reply.write_to(&mut client).await.unwrap();
        let decoded = CallMessage::read_from(&mut server).await.unwrap();

        assert!(decoded.is_error());
        assert_eq!(decoded.error(), Some("worker exploded"));
        assert_eq!(
            (decoded.opcode, decoded.call_id, decoded.call_count),
            (request.opcode, request.call_id, request.call_count)
        );
    }

    #[test]
    fn error_reply_echoes_correlation() {
        let request = CallMessage::new(Opcode::Stop, 99, 4);
        let reply = CallMessage::error_reply(&request, "no worker");
        assert_eq!(reply.opcode, Opcode::Stop);
        assert_eq!(reply.call_id, 99);
        assert_eq!(reply.call_count, 4);
        assert!(reply.payload.is_empty());
    }

    #[test]
    fn reply_frame_carries_remote_elapsed() {
        let reply = CallMessage::new(Opcode::Application(5), 1, 1).with_payload(vec![0xAB; 16]);
        let frame = reply.to_reply_frame(Duration::from_micros(1234));

        let (decoded, remote_elapsed) = CallMessage::reply_from_frame(&frame).unwrap();
        assert_eq!(decoded.payload, reply.payload);
        assert_eq!(remote_elapsed, Duration::from_micros(1234));
    }

    #[test]
    fn reply_frame_without_trailer_is_truncated() {
        let reply = CallMessage::new(Opcode::Application(5), 1, 1);
        let frame = reply.to_frame();
        assert!(matches!(
            CallMessage::reply_from_frame(&frame),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = CallMessage::new(Opcode::Application(5), 1, 1)
            .with_payload(vec![1, 2, 3])
            .to_frame();
        assert!(matches!(
            CallMessage::from_frame(&frame[..frame.len() - 1]),
            Err(WireError::Truncated(_))
        ));
        assert!(matches!(
            CallMessage::from_frame(&frame[..10]),
            Err(WireError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn oversized_error_length_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&OPCODE_STOP.to_be_bytes());
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&(u32::MAX).to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());

        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &raw)
            .await
            .unwrap();
        assert!(matches!(
            CallMessage::read_from(&mut server).await,
            Err(WireError::TooLarge { field: "error", .. })
        ));
    }
}
