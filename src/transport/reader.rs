use crate::core::codec::FrameCodec;
use crate::error::ProtocolError;
use crate::transport::ChannelId;
use crate::utils::metrics::global_metrics;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What a reader hands to the decoder
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Frame(ChannelId, BytesMut),
    /// End of stream (`None`) or a framing error
    Closed(ChannelId, Option<ProtocolError>),
}

/// Read frames off one connection until it ends or breaks.
///
/// Frames and the final close event travel on the same bounded channel, so the
/// decoder sees the close after every frame read before it. A full channel
/// stops this reader until the decoder catches up.
pub(crate) fn spawn_reader<R>(
    channel: ChannelId,
    read_half: R,
    max_frame_size: usize,
    events: mpsc::Sender<InboundEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut frames = tokio_util::codec::FramedRead::new(read_half, FrameCodec::new(max_frame_size));

        loop {
            let event = match frames.next().await {
                Some(Ok(frame)) => {
                    trace!(channel, bytes = frame.len(), "Frame read");
                    global_metrics().frame_received(frame.len() as u64);
                    InboundEvent::Frame(channel, frame)
                }
                Some(Err(e)) => {
                    debug!(channel, error = %e, "Malformed frame");
                    let _ = events.send(InboundEvent::Closed(channel, Some(e))).await;
                    return;
                }
                None => {
                    let _ = events.send(InboundEvent::Closed(channel, None)).await;
                    return;
                }
            };

            if events.send(event).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::frame::{encode_header, MAX_FRAME_SIZE};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_then_close() {
        let (mut client, server) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(4);
        let _reader = spawn_reader(3, server, MAX_FRAME_SIZE, tx);

        client.write_all(&encode_header(2).to_be_bytes()).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        drop(client);

        match rx.recv().await.unwrap() {
            InboundEvent::Frame(3, frame) => assert_eq!(&frame[..], b"hi"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(InboundEvent::Closed(3, None))));
    }

    #[tokio::test]
    async fn test_garbage_reports_violation() {
        let (mut client, server) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(4);
        let _reader = spawn_reader(4, server, MAX_FRAME_SIZE, tx);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        match rx.recv().await.unwrap() {
            InboundEvent::Closed(4, Some(e)) => assert!(e.is_protocol_violation()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
