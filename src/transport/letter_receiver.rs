use std::cmp::min;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::transport::channel::Channel;
use crate::transport::channel_events::DisconnectReason;
use crate::transport::letter::{Letter, LetterType};
use crate::transport::wire_error::WireError;

const READ_BUF_LEN: usize = 8 * 1024;

/// Reassembles the byte stream into complete frames. TCP hands us arbitrary chunk
///  boundaries, and the length prefix itself may arrive split across reads, so the
///  prefix is collected byte by byte before body accumulation starts.
///
/// Heartbeats are consumed here and never emitted.
pub struct FrameAssembler {
    max_letter_size: usize,
    /// declared total frame length; 0 = still collecting the length prefix
    current_length: usize,
    length_buf: [u8; 4],
    length_bytes_collected: usize,
    /// bytes of the current frame, length prefix included
    accumulator: BytesMut,
}

impl FrameAssembler {
    pub fn new(max_letter_size: usize) -> FrameAssembler {
        FrameAssembler {
            max_letter_size,
            current_length: 0,
            length_buf: [0u8; 4],
            length_bytes_collected: 0,
            accumulator: BytesMut::new(),
        }
    }

    /// Feed one chunk, appending every completed letter to `out`. After an error the
    ///  assembler is in an undefined state and must not be fed again.
    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<Letter>) -> Result<(), WireError> {
        while !chunk.is_empty() {
            if self.current_length == 0 {
                let take = min(4 - self.length_bytes_collected, chunk.len());
                self.length_buf[self.length_bytes_collected..self.length_bytes_collected + take]
                    .copy_from_slice(&chunk[..take]);
                self.length_bytes_collected += take;
                chunk = &chunk[take..];
                if self.length_bytes_collected < 4 {
                    break;
                }

                let total = u32::from_le_bytes(self.length_buf) as usize;
                if total < Letter::MIN_FRAME_LEN {
                    return Err(WireError::malformed(format!(
                        "declared frame length {} is shorter than the fixed header", total
                    )));
                }
                if total > self.max_letter_size {
                    return Err(WireError::malformed(format!(
                        "declared frame length {} exceeds the maximum of {}",
                        total, self.max_letter_size
                    )));
                }
                self.current_length = total;
                self.accumulator.reserve(total);
                self.accumulator.extend_from_slice(&self.length_buf);
                continue;
            }

            let missing = self.current_length - self.accumulator.len();
            let take = min(missing, chunk.len());
            self.accumulator.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.accumulator.len() == self.current_length {
                let mut frame = self.accumulator.split().freeze();
                let letter = Letter::try_deser_frame(&mut frame)?;
                if letter.letter_type == LetterType::Heartbeat {
                    trace!("dropping received heartbeat");
                }
                else {
                    out.push(letter);
                }
                self.current_length = 0;
                self.length_bytes_collected = 0;
            }
        }
        Ok(())
    }
}

/// One channel's inbound actor: reads into a scratch buffer, feeds the assembler and
///  hands completed letters to the channel. The first failure reports a disconnect cause
///  and ends the loop; nothing is emitted after that.
pub(crate) async fn receive_loop<R>(
    mut reader: R,
    channel: Arc<Channel>,
    mut cancelled: watch::Receiver<bool>,
    cause: mpsc::UnboundedSender<DisconnectReason>,
)
where
    R: AsyncRead + Unpin,
{
    let error = match run_receive(&mut reader, &channel, &mut cancelled).await {
        Ok(()) => return, // cancelled
        Err(error) => error,
    };
    let reason = match &error {
        WireError::Closed => {
            debug!(binding = ?channel.binding, "peer closed the connection");
            DisconnectReason::Remote
        }
        WireError::MalformedFrame(_) => {
            warn!(binding = ?channel.binding, "closing connection: {}", error);
            DisconnectReason::Socket
        }
        WireError::Io(_) => {
            error!(binding = ?channel.binding, "{}", error);
            DisconnectReason::Socket
        }
    };
    let _ = cause.send(reason);
}

async fn run_receive<R>(
    reader: &mut R,
    channel: &Arc<Channel>,
    cancelled: &mut watch::Receiver<bool>,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut assembler = FrameAssembler::new(channel.config.max_letter_size);
    let mut scratch = [0u8; READ_BUF_LEN];
    let mut letters = Vec::new();

    loop {
        let read = select! {
            _ = cancelled.changed() => return Ok(()),
            read = reader.read(&mut scratch) => read?,
        };
        if read == 0 {
            return Err(WireError::Closed);
        }

        channel.mark_activity();
        assembler.push(&scratch[..read], &mut letters)?;
        for letter in letters.drain(..) {
            channel.on_received(letter);
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    fn encoded(letters: &[Letter]) -> Bytes {
        let mut buf = BytesMut::new();
        for letter in letters {
            letter.ser(&mut buf);
        }
        buf.freeze()
    }

    #[rstest]
    #[case::byte_by_byte(1)]
    #[case::two(2)]
    #[case::three(3)]
    #[case::five(5)]
    #[case::thirteen(13)]
    #[case::large(64)]
    #[case::everything_at_once(usize::MAX)]
    fn test_assembler_reassembles_across_chunk_boundaries(#[case] chunk_len: usize) {
        let letters = vec![
            Letter::user(vec![Bytes::from_static(b"first")]),
            Letter::heartbeat(),
            Letter::user(vec![Bytes::from_static(b"second"), Bytes::new()]).with_ack(),
            Letter::ack(),
        ];
        let stream = encoded(&letters);

        let mut assembler = FrameAssembler::new(1024);
        let mut out = Vec::new();
        for chunk in stream.chunks(chunk_len.min(stream.len())) {
            assembler.push(chunk, &mut out).unwrap();
        }

        // the heartbeat is consumed, everything else arrives in wire order
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], letters[0]);
        assert_eq!(out[1], letters[2]);
        assert_eq!(out[2], letters[3]);
    }

    #[test]
    fn test_assembler_rejects_length_below_header() {
        let mut assembler = FrameAssembler::new(1024);
        let mut out = Vec::new();

        let result = assembler.push(&[3, 0, 0, 0], &mut out);
        assert!(matches!(result, Err(WireError::MalformedFrame(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_assembler_rejects_oversized_length_before_accumulating() {
        let mut assembler = FrameAssembler::new(64);
        let mut out = Vec::new();

        let result = assembler.push(&[200, 0, 0, 0], &mut out);
        assert!(matches!(result, Err(WireError::MalformedFrame(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_assembler_keeps_partial_state_between_pushes() {
        let letter = Letter::user(vec![Bytes::from_static(b"split across pushes")]);
        let stream = encoded(&[letter.clone()]);

        let mut assembler = FrameAssembler::new(1024);
        let mut out = Vec::new();
        // split inside the length prefix, then inside the body
        assembler.push(&stream[..2], &mut out).unwrap();
        assembler.push(&stream[2..9], &mut out).unwrap();
        assert!(out.is_empty());
        assembler.push(&stream[9..], &mut out).unwrap();

        assert_eq!(out, vec![letter]);
    }
}
