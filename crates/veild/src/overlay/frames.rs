//! Framed reads and writes over an overlay stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

use veil_core::wire::{self, FrameHeader, FrameKind, Message, WireError, HEADER_LEN};
use veil_core::NetworkError;

pub fn protocol(e: WireError) -> NetworkError {
    NetworkError::Protocol(e.to_string())
}

/// Read one complete frame. EOF before the header maps to an unreachable
/// peer, like any other dropped connection.
pub async fn read_frame<S>(io: &mut S) -> Result<(FrameKind, Vec<u8>), NetworkError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    io.read_exact(&mut header).await?;
    let (kind, len) = FrameHeader::parse(&header).map_err(protocol)?;
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok((kind, payload))
}

/// Read one frame that must carry a control message.
pub async fn read_message<S>(io: &mut S) -> Result<Message, NetworkError>
where
    S: AsyncRead + Unpin,
{
    match read_frame(io).await? {
        (FrameKind::Data, _) => Err(NetworkError::Protocol(
            "expected a control frame, got data".to_string(),
        )),
        (_, payload) => wire::decode_message(&payload).map_err(protocol),
    }
}

pub async fn write_message<S>(io: &mut S, msg: &Message) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    let frame = wire::encode_message(msg).map_err(protocol)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

pub async fn write_data<S>(io: &mut S, data: &[u8]) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(FrameKind::Data, data).map_err(protocol)?;
    io.write_all(&frame).await?;
    Ok(())
}

/// Forward the `Data` frames of one content response into `tx` until `End`.
/// Anything else, including a dropped connection, surfaces as a read error.
pub async fn pump_data<S>(mut io: S, tx: mpsc::Sender<io::Result<Bytes>>)
where
    S: AsyncRead + Unpin,
{
    loop {
        let item = match read_frame(&mut io).await {
            Ok((FrameKind::Data, payload)) => Ok(Bytes::from(payload)),
            Ok((FrameKind::End, _)) => return,
            Ok((kind, payload)) => {
                let detail = match wire::decode_message(&payload) {
                    Ok(Message::Error { message }) => message,
                    _ => format!("unexpected {kind:?} frame in content stream"),
                };
                Err(io::Error::new(io::ErrorKind::InvalidData, detail))
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())),
        };
        let stop = item.is_err();
        if tx.send(item).await.is_err() || stop {
            return;
        }
    }
}

/// Async reader over a channel of byte chunks. An `Err` item surfaces as a
/// read error; a closed channel is EOF.
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.current.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.current = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.current.len().min(buf.remaining());
        let chunk = self.current.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::ContentHash;

    #[tokio::test]
    async fn message_survives_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Want {
            hash: ContentHash::of(b"frames"),
        };
        write_message(&mut a, &msg).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn data_frame_is_not_a_message() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_data(&mut a, b"raw").await.unwrap();
        a.flush().await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(NetworkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn closed_stream_reads_as_unreachable() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn channel_reader_yields_chunks_then_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        tx.send(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .await
            .unwrap();

        let mut reader = ChannelReader::new(rx);
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        let mut rest = Vec::new();
        assert!(reader.read_to_end(&mut rest).await.is_err());
    }
}
