use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{error, trace};

use crate::transport::channel::Channel;
use crate::transport::channel_events::DisconnectReason;
use crate::transport::letter::Letter;

/// Handle to one channel's outbound FIFO. Enqueueing never blocks; the transmit loop
///  drains in order and notifies the channel after each completed write.
pub(crate) struct LetterTransmitter {
    queue: mpsc::UnboundedSender<Letter>,
}

impl LetterTransmitter {
    pub fn new() -> (LetterTransmitter, mpsc::UnboundedReceiver<Letter>) {
        let (queue, drain) = mpsc::unbounded_channel();
        (LetterTransmitter { queue }, drain)
    }

    /// If the transmit loop is already gone the letter simply stays in the channel's
    ///  pending queue, where the shutdown drain fails it.
    pub fn enqueue(&self, letter: Letter) {
        let _ = self.queue.send(letter);
    }
}

/// One channel's outbound actor. Writes are strictly FIFO; the channel's transmit
///  callback runs only after the final byte of a letter was accepted by the socket.
pub(crate) async fn transmit_loop<W>(
    mut writer: W,
    mut letters: mpsc::UnboundedReceiver<Letter>,
    channel: Arc<Channel>,
    mut cancelled: watch::Receiver<bool>,
    cause: mpsc::UnboundedSender<DisconnectReason>,
)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();

    loop {
        let letter = select! {
            _ = cancelled.changed() => return,
            letter = letters.recv() => match letter {
                Some(letter) => letter,
                None => return,
            },
        };

        buf.clear();
        letter.ser(&mut buf);
        trace!(binding = ?channel.binding, "transmitting {:?}", letter);

        if let Err(e) = writer.write_all(&buf).await {
            error!(binding = ?channel.binding, "socket error while transmitting: {}", e);
            let _ = cause.send(DisconnectReason::Socket);
            return;
        }
        channel.on_transmitted(letter);
    }
}
