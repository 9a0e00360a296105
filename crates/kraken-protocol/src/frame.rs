// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format of the kktool callback socket.
//!
//! kktool connects back to the agent over TCP and writes one JSON object per
//! line. Lines are bounded; a longer line is a protocol error and ends the
//! connection.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Maximum line length (1280 KiB) including the newline.
pub const MAX_LINE_SIZE: usize = 1280 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("line too long: more than {MAX_LINE_SIZE} bytes")]
    LineTooLong,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Encode a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    if buf.len() > MAX_LINE_SIZE {
        return Err(FrameError::LineTooLong);
    }
    Ok(buf)
}

/// Write a frame to an async writer
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_line(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame. Blank lines are skipped.
///
/// Returns [`FrameError::ConnectionClosed`] on a clean EOF between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(MAX_LINE_SIZE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if line.len() > MAX_LINE_SIZE {
            return Err(FrameError::LineTooLong);
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(serde_json::from_slice(trimmed)?);
    }
}

/// Line-framed JSON stream
pub struct FramedStream<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame<T: Serialize>(&mut self, msg: &T) -> Result<(), FrameError> {
        write_frame(self.stream.get_mut(), msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{StepResult, StepState};
    use serde_json::{Value, json};

    #[test]
    fn test_encode_line_terminates_with_newline() {
        let line = encode_line(&json!({"status": "done"})).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_max_line_size_constant() {
        assert_eq!(MAX_LINE_SIZE, 1_310_720);
    }

    #[tokio::test]
    async fn test_read_frames_in_order() {
        let data = b"{\"status\":\"in-progress\",\"n\":1}\n\n{\"status\":\"done\"}\n";
        let mut reader = &data[..];
        let first: StepResult = read_frame(&mut reader).await.unwrap();
        let second: StepResult = read_frame(&mut reader).await.unwrap();
        assert_eq!(first.status, StepState::InProgress);
        assert_eq!(first.data["n"], 1);
        assert_eq!(second.status, StepState::Done);
        let end: Result<Value, _> = read_frame(&mut reader).await;
        assert!(matches!(end, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_last_line_without_newline() {
        let data = b"{\"status\":\"done\"}";
        let mut reader = &data[..];
        let frame: StepResult = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.status, StepState::Done);
    }

    #[tokio::test]
    async fn test_oversized_line_rejected() {
        let mut data = vec![b'"'; MAX_LINE_SIZE + 10];
        data.push(b'\n');
        let mut reader = &data[..];
        let res: Result<Value, _> = read_frame(&mut reader).await;
        assert!(matches!(res, Err(FrameError::LineTooLong)));
    }

    #[tokio::test]
    async fn test_garbage_is_json_error() {
        let mut reader = &b"not json\n"[..];
        let res: Result<Value, _> = read_frame(&mut reader).await;
        assert!(matches!(res, Err(FrameError::Json(_))));
    }
}
