//! Master/worker message protocol and its framing.
//!
//! Every message travels as one frame: a `u32` little-endian body length
//! followed by a MessagePack-encoded [`Message`]. Frames work over any
//! byte stream; the process pool uses each worker's stdin and stdout.
//!
//! ```text
//! master                         worker
//!   ── Assign{iteration,id,..} ──▶
//!   ◀── Heartbeat ─────────────── (every heartbeat interval)
//!   ◀── Result{id,status,..} ────
//!   ── Shutdown ────────────────▶
//! ```

use std::io::{self, Read, Write};

use ensemble_core::{IterationId, UnitFailure, UnitStatus, WorkUnitId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest frame body accepted by [`read_frame`] or produced by
/// [`write_frame`]: 256 MiB.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Master → worker: run this unit.
    Assign {
        /// Iteration the unit belongs to.
        iteration: IterationId,
        /// Unit id, echoed back in the result.
        id: WorkUnitId,
        /// 1-based attempt number for this unit.
        attempt: u32,
        /// Encoded input payload.
        input: Vec<u8>,
    },
    /// Worker → master: the unit finished.
    Result {
        /// Id from the matching `Assign`.
        id: WorkUnitId,
        /// `Complete` or `Failed`.
        status: UnitStatus,
        /// Encoded result payload; empty unless `Complete`.
        output: Vec<u8>,
        /// Failure record when `Failed`.
        failure: Option<UnitFailure>,
    },
    /// Worker → master: still alive.
    Heartbeat,
    /// Master → worker: stop after the current unit and exit.
    Shutdown,
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Assign { .. } => "assign",
            Self::Result { .. } => "result",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Errors reading or writing protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),
    /// A message could not be encoded.
    #[error("message encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// A frame body was not a valid message.
    #[error("message decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A frame length exceeded [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge {
        /// Declared or encoded length.
        len: usize,
    },
    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame after {got} of {expected} bytes")]
    Truncated {
        /// Bytes the frame needed.
        expected: usize,
        /// Bytes that arrived.
        got: usize,
    },
}

/// Encode `message` and write it as one frame, then flush.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len: body.len() });
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary,
/// which is how a closed channel looks.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut header = [0u8; 4];
    let got = read_full(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < header.len() {
        return Err(ProtocolError::Truncated {
            expected: header.len(),
            got,
        });
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    // Grow as bytes arrive so a corrupt header cannot force a large
    // allocation up front.
    let mut body = Vec::with_capacity(len.min(64 * 1024));
    (&mut *reader).take(len as u64).read_to_end(&mut body)?;
    if body.len() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            got: body.len(),
        });
    }
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Fill `buf` unless the stream ends first; returns the bytes read.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::FailureCause;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn assign() -> Message {
        Message::Assign {
            iteration: IterationId(3),
            id: WorkUnitId(17),
            attempt: 1,
            input: vec![1, 2, 3, 250],
        }
    }

    #[test]
    fn frames_are_read_back_in_order() {
        let failed = Message::Result {
            id: WorkUnitId(17),
            status: UnitStatus::Failed,
            output: Vec::new(),
            failure: Some(UnitFailure::new(FailureCause::Propagator, "diverged")),
        };
        let mut buf = Vec::new();
        for msg in [assign(), Message::Heartbeat, failed.clone(), Message::Shutdown] {
            write_frame(&mut buf, &msg).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(assign()));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Message::Heartbeat));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(failed));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Message::Shutdown));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn header_is_little_endian_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Message::Heartbeat).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &assign()).unwrap();
        buf.truncate(buf.len() - 2);
        match read_frame(&mut Cursor::new(buf)) {
            Err(ProtocolError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn truncated_header_is_an_error() {
        match read_frame(&mut Cursor::new(vec![5u8, 0])) {
            Err(ProtocolError::Truncated {
                expected: 4,
                got: 2,
            }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let header = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        match read_frame(&mut Cursor::new(header.to_vec())) {
            Err(ProtocolError::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn garbage_body_fails_to_decode() {
        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        match read_frame(&mut Cursor::new(buf)) {
            Err(ProtocolError::Decode(_)) => {}
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut cursor = Cursor::new(bytes);
            // Any outcome is fine as long as reading terminates.
            for _ in 0..64 {
                match read_frame(&mut cursor) {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
