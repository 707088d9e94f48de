//! Stream framing for protocol messages.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{QueryError, Result};
use crate::protocol::Message;

/// [`Message`] codec for `FramedRead`/`FramedWrite` over a byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = QueryError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        Message::decode(src)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = QueryError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, SessionId};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn test_framed_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, MessageCodec);
        let mut reader = FramedRead::new(server, MessageCodec);

        let frame = Frame::new(SessionId::new(1), 1, vec![Bytes::from(vec![7u8; 1000])]);
        let sent = Message::Data(frame);
        let send = async {
            writer.send(&sent).await.unwrap();
            writer.send(&Message::close(SessionId::new(1))).await.unwrap();
        };
        let recv = async {
            let first = reader.next().await.unwrap().unwrap();
            let second = reader.next().await.unwrap().unwrap();
            (first, second)
        };
        let ((), (first, second)) = tokio::join!(send, recv);

        assert_eq!(first, sent);
        assert_eq!(second, Message::close(SessionId::new(1)));
    }

    #[tokio::test]
    async fn test_message_split_across_reads() {
        let encoded = Message::close(SessionId::new(0xabc)).to_bytes().unwrap();
        let (head, tail) = encoded.split_at(3);
        let stream = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .read(&[0x07])
            .build();
        let mut reader = FramedRead::new(stream, MessageCodec);

        let message = tokio_test::assert_ok!(reader.next().await.unwrap());
        assert_eq!(message, Message::close(SessionId::new(0xabc)));
        // a lone kind byte at EOF is a truncated message
        assert!(reader.next().await.unwrap().is_err());
    }
}
