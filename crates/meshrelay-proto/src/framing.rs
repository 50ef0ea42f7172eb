//! Stream framing for the Meshtastic serial protocol
//!
//! Every packet on a stream transport is prefixed with a 4-byte header:
//! magic bytes `0x94 0xC3` followed by a big-endian 16-bit payload length.
//! Payloads are capped at 512 bytes.
//!
//! Reads are resumable: each call polls the underlying stream with a short
//! timeout so callers can check cancellation between attempts, and any bytes
//! buffered when a timeout fires are retained for the next call. On a magic
//! mismatch a single byte is discarded so the caller can decide whether to
//! `resync`; on a length violation the buffer is cleared outright.

use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use crate::error::{ProtoError, Result};

/// First magic byte of a stream frame
pub const MAGIC1: u8 = 0x94;
/// Second magic byte of a stream frame
pub const MAGIC2: u8 = 0xC3;
/// Maximum payload size in bytes
pub const MAX_PACKET_SIZE: usize = 512;
/// Header size: two magic bytes plus a big-endian length
pub const HEADER_SIZE: usize = 4;

/// Default per-read timeout, short enough for read loops to poll cancellation
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = MAX_PACKET_SIZE + HEADER_SIZE;

/// Build the wire frame for a payload
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(ProtoError::PacketTooLarge(payload.len()));
    }
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.push(MAGIC1);
    packet.push(MAGIC2);
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Framer over any async byte stream
pub struct StreamFramer<T> {
    stream: T,
    buf: BytesMut,
    read_timeout: Duration,
}

impl<T: AsyncRead + AsyncWrite + Unpin> StreamFramer<T> {
    /// Wrap a stream with the default read timeout
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK * 2),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the per-read timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Read one framed payload.
    ///
    /// Returns `IncompletePacket` when the stream stalls mid-frame; buffered
    /// bytes are kept and the same payload is returned by a later call once
    /// the rest arrives. `InvalidMagic` discards one byte so repeated calls
    /// (or `resync`) can slide to the next frame boundary.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        loop {
            if self.buf.len() >= HEADER_SIZE {
                if self.buf[0] != MAGIC1 || self.buf[1] != MAGIC2 {
                    self.buf.advance(1);
                    return Err(ProtoError::InvalidMagic);
                }

                let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                if length > MAX_PACKET_SIZE {
                    self.buf.clear();
                    return Err(ProtoError::PacketTooLarge(length));
                }

                if self.buf.len() >= HEADER_SIZE + length {
                    self.buf.advance(HEADER_SIZE);
                    let payload = self.buf.split_to(length).freeze();
                    trace!(size = payload.len(), "read framed packet");
                    return Ok(payload);
                }
            }

            self.fill_buf().await?;
        }
    }

    /// Write one framed payload as a single write
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let packet = frame(payload)?;
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read byte-by-byte until the magic pair is seen, then stage it so the
    /// next `read_packet` consumes the frame that follows. Used to recover
    /// after stream corruption.
    pub async fn resync(&mut self) -> Result<()> {
        let mut found_first = false;
        loop {
            let b = self.next_byte().await?;
            if found_first && b == MAGIC2 {
                let mut staged = BytesMut::with_capacity(self.buf.len() + 2);
                staged.extend_from_slice(&[MAGIC1, MAGIC2]);
                staged.extend_from_slice(&self.buf);
                self.buf = staged;
                return Ok(());
            }
            found_first = b == MAGIC1;
        }
    }

    /// Discard any partially buffered frame
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered past the last consumed frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    async fn next_byte(&mut self) -> Result<u8> {
        if self.buf.is_empty() {
            self.fill_buf().await?;
        }
        let b = self.buf[0];
        self.buf.advance(1);
        Ok(b)
    }

    async fn fill_buf(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        match timeout(self.read_timeout, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Err(ProtoError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            ))),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Err(ProtoError::IncompletePacket)
            }
            Ok(Err(e)) => Err(ProtoError::Io(e)),
            Err(_elapsed) => Err(ProtoError::IncompletePacket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer_pair() -> (StreamFramer<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(8192);
        (
            StreamFramer::new(a).with_read_timeout(Duration::from_millis(20)),
            b,
        )
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut framer, mut peer) = framer_pair();

        framer.write_packet(b"Hello, Meshtastic!").await.unwrap();

        // Read the raw frame on the peer side and feed it back
        let mut raw = vec![0u8; 64];
        let n = peer.read(&mut raw).await.unwrap();
        peer.write_all(&raw[..n]).await.unwrap();

        let payload = framer.read_packet().await.unwrap();
        assert_eq!(payload.as_ref(), b"Hello, Meshtastic!");
        assert_eq!(framer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_roundtrip() {
        let (mut framer, mut peer) = framer_pair();
        peer.write_all(&frame(b"").unwrap()).await.unwrap();
        let payload = framer.read_packet().await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_packets_in_order() {
        let (mut framer, mut peer) = framer_pair();

        let packets: Vec<&[u8]> = vec![b"Packet 1", b"Packet 2 with more data", b"P3"];
        let mut wire = Vec::new();
        for p in &packets {
            wire.extend_from_slice(&frame(p).unwrap());
        }
        peer.write_all(&wire).await.unwrap();

        for expected in &packets {
            let payload = framer.read_packet().await.unwrap();
            assert_eq!(payload.as_ref(), *expected);
        }
    }

    #[tokio::test]
    async fn test_frame_format() {
        let packet = frame(b"test").unwrap();
        assert_eq!(packet[0], 0x94);
        assert_eq!(packet[1], 0xC3);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 4);
        assert_eq!(&packet[4..], b"test");
    }

    #[tokio::test]
    async fn test_invalid_magic() {
        let (mut framer, mut peer) = framer_pair();
        peer.write_all(&[0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't'])
            .await
            .unwrap();

        let err = framer.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidMagic));
        // One byte slid off the front
        assert_eq!(framer.buffered(), 7);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized() {
        let (mut framer, _peer) = framer_pair();
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        let err = framer.write_packet(&big).await.unwrap_err();
        assert!(matches!(err, ProtoError::PacketTooLarge(n) if n == MAX_PACKET_SIZE + 1));
    }

    #[tokio::test]
    async fn test_oversized_length_clears_buffer() {
        let (mut framer, mut peer) = framer_pair();
        // Valid magic, length 0x0400 = 1024 > 512
        peer.write_all(&[MAGIC1, MAGIC2, 0x04, 0x00, 0xAA])
            .await
            .unwrap();

        let err = framer.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtoError::PacketTooLarge(1024)));
        assert_eq!(framer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_resync_recovers_from_corruption() {
        let (mut framer, mut peer) = framer_pair();

        let mut wire = vec![0x00, 0x01, 0x02, 0x03, 0xFF];
        wire.extend_from_slice(&frame(b"test").unwrap());
        peer.write_all(&wire).await.unwrap();

        let err = framer.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidMagic));

        framer.resync().await.unwrap();
        let payload = framer.read_packet().await.unwrap();
        assert_eq!(payload.as_ref(), b"test");
    }

    #[tokio::test]
    async fn test_resync_then_read_want_config() {
        let (mut framer, mut peer) = framer_pair();

        peer.write_all(&[
            0x00, 0x01, 0x02, 0x03, 0xFF, 0x94, 0xC3, 0x00, 0x02, 0x18, 0x01,
        ])
        .await
        .unwrap();

        let err = framer.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidMagic));

        framer.resync().await.unwrap();
        let payload = framer.read_packet().await.unwrap();
        assert_eq!(payload.as_ref(), &[0x18, 0x01]);
    }

    #[tokio::test]
    async fn test_partial_read_resumes() {
        let (mut framer, mut peer) = framer_pair();

        let wire = frame(b"resume").unwrap();
        peer.write_all(&wire[..3]).await.unwrap();

        // Only part of the header has arrived; the read times out but keeps
        // what it has
        let err = framer.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtoError::IncompletePacket));
        assert_eq!(framer.buffered(), 3);

        peer.write_all(&wire[3..]).await.unwrap();
        let payload = framer.read_packet().await.unwrap();
        assert_eq!(payload.as_ref(), b"resume");
    }

    #[tokio::test]
    async fn test_eof_reported() {
        let (mut framer, peer) = framer_pair();
        drop(peer);
        let err = framer.read_packet().await.unwrap_err();
        match err {
            ProtoError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }
    }
}
