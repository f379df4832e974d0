// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format shared by clients and the server.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of UTF-8 encoded JSON.
//! A frame with length 0 carries no payload.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a peer may announce. Larger frames are rejected before anything is allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encodes a value into a single frame.
///
/// Payloads above [`MAX_FRAME_LEN`] are refused, a peer would reject them anyway.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(EncodeError::TooLarge(payload.len()));
    }
    // Bounded by MAX_FRAME_LEN above
    let length = payload.len() as u32;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame and decodes its payload.
///
/// Returns `Ok(None)` for an empty frame, for a payload that isn't valid JSON and when the peer
/// disconnects before the frame is complete. Any other I/O error is returned to the caller.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Value>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_frame_start(reader).await? {
        Some(first) => read_message_from(reader, first).await,
        None => Ok(None),
    }
}

/// Waits for the first byte of the next frame. Returns `None` once the peer disconnected.
///
/// Nothing is consumed when the returned future is dropped before completion, so this is the
/// place to wait for a shutdown signal between frames.
pub async fn read_frame_start<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await {
        Ok(0) => {
            trace!("Stream ended between frames");
            Ok(None)
        }
        Ok(_) => Ok(Some(byte[0])),
        Err(e) if is_disconnect(&e) => {
            trace!("Stream ended between frames: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Reads the rest of a frame whose first byte was returned by [`read_frame_start`].
pub async fn read_message_from<R>(reader: &mut R, first: u8) -> io::Result<Option<Value>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [first, 0, 0, 0];
    if !read_exact_or_eof(reader, &mut prefix[1..]).await? {
        return Ok(None);
    }

    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        trace!("Received empty frame");
        return Ok(None);
    }

    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {length} bytes exceeds the limit of {MAX_FRAME_LEN} bytes"),
        ));
    }

    let mut payload = vec![0u8; length];
    if !read_exact_or_eof(reader, &mut payload).await? {
        return Ok(None);
    }

    match serde_json::from_slice(&payload) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            debug!("Discarding malformed frame of {} bytes: {}", length, e);
            Ok(None)
        }
    }
}

/// Writes one frame and flushes the writer.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let frame = encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Error returned by [`encode`].
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Failed to serialize frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the limit of {} bytes", MAX_FRAME_LEN)]
    TooLarge(usize),
}

/// Error returned by [`write_message`].
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<WriteError> for crate::errors::SinkError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Io(e) => Self::Io(e),
            WriteError::Encode(EncodeError::Json(e)) => Self::Encode(e),
            WriteError::Encode(e @ EncodeError::TooLarge(_)) => Self::InvalidRecord(e.to_string()),
        }
    }
}

impl From<WriteError> for crate::errors::EmitError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Io(e) => Self::Io(e),
            WriteError::Encode(e) => Self::Encode(e),
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Fills `buf` completely. Returns `false` if the stream ended or was reset before that.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if is_disconnect(&e) => {
            trace!("Stream ended while reading a frame: {}", e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_encode_token_frame() {
        let frame = encode(&json!({"token": "hello"})).unwrap();
        assert_eq!(frame, b"\x00\x00\x00\x11{\"token\":\"hello\"}".to_vec());
    }

    #[tokio::test]
    async fn test_read_frames() {
        let message = json!({
            "level": 42,
            "pid": 123,
            "message": "hello",
            "created_at": 0,
            "created_by": "me",
        });

        let mut data = Vec::new();
        data.extend_from_slice(b"\x00\x00\x00\x00");
        data.extend_from_slice(b"\x00\x00\x00\x02{}");
        data.extend(encode(&message).unwrap());

        let mut reader = &data[..];
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(json!({})));
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(message));
        assert!(reader.is_empty());

        // Nothing left to read
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_frame_consumes_only_prefix() {
        let data = b"\x00\x00\x00\x00\x00\x00\x00\x02{}";
        let mut reader = &data[..];
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
        assert_eq!(reader.len(), 6);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_json() {
        let data = b"\x00\x00\x00\x03{no";
        let mut reader = &data[..];
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
        assert!(logs_contain("Discarding malformed frame"));
    }

    #[tokio::test]
    async fn test_short_reads() {
        let short_prefix = b"\x00\x00";
        assert_eq!(read_message(&mut &short_prefix[..]).await.unwrap(), None);

        let short_payload = b"\x00\x00\x00\x10{\"a\":";
        assert_eq!(read_message(&mut &short_payload[..]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let err = read_message(&mut &data[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_encode_refuses_oversized_payload() {
        // Two quotes push the payload just over the limit
        let value = Value::String("x".repeat(MAX_FRAME_LEN - 1));
        assert!(matches!(
            encode(&value),
            Err(EncodeError::TooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));

        let error = crate::errors::SinkError::from(WriteError::from(EncodeError::TooLarge(1)));
        assert!(matches!(error, crate::errors::SinkError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_read_resumes_after_frame_start() {
        let frame = encode(&json!({"a": 1})).unwrap();
        let mut reader = &frame[..];

        let first = read_frame_start(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, 0);
        assert_eq!(
            read_message_from(&mut reader, first).await.unwrap(),
            Some(json!({"a": 1}))
        );
        assert_eq!(read_frame_start(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut out = Vec::new();
        write_message(&mut out, &json!({"token": "abc"})).await.unwrap();
        let mut reader = &out[..];
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(json!({"token": "abc"}))
        );
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 äöü]{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_roundtrip(value in arb_json()) {
            let frame = encode(&value).unwrap();
            let decoded = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(async { read_message(&mut &frame[..]).await.unwrap() });
            prop_assert_eq!(decoded, Some(value));
        }
    }
}
