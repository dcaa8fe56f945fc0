//! WebSocket transport for relay peers.
//!
//! Wraps a `tokio_tungstenite` stream, splitting it into a read half for the
//! inbound loop and a write half for the outbound loop. Incoming pings are
//! answered by tungstenite itself.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::transport::{self, Frame, FrameKind, FrameReader, FrameWriter, Transport, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// An upgraded WebSocket connection.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn split(self) -> (WsReader<S>, WsWriter<S>) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> transport::Result<Frame> {
        loop {
            match self.stream.next().await {
                Some(Ok(msg)) => {
                    if let Some(frame) = from_message(msg) {
                        return Ok(frame);
                    }
                }
                Some(Err(e)) => return Err(map_error(e)),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

/// Write half of a WebSocket connection.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Frame) -> transport::Result<()> {
        let msg = to_message(frame)?;
        self.sink.send(msg).await.map_err(map_error)
    }

    /// Queue every frame, then flush once.
    async fn write_batch(&mut self, frames: Vec<Frame>) -> transport::Result<()> {
        for frame in frames {
            let msg = to_message(frame)?;
            self.sink.feed(msg).await.map_err(map_error)?;
        }
        self.sink.flush().await.map_err(map_error)
    }

    async fn close(&mut self) -> transport::Result<()> {
        self.sink.close().await.map_err(map_error)
    }
}

/// Convert a received message. Raw frames are never surfaced when reading.
fn from_message(msg: Message) -> Option<Frame> {
    let frame = match msg {
        Message::Text(text) => Frame::text(text),
        Message::Binary(data) => Frame::binary(data),
        Message::Ping(data) => Frame::new(FrameKind::Ping, data),
        Message::Pong(data) => Frame::new(FrameKind::Pong, data),
        Message::Close(_) => Frame::close(),
        Message::Frame(_) => return None,
    };
    Some(frame)
}

fn to_message(frame: Frame) -> transport::Result<Message> {
    let payload = frame.payload;
    let msg = match frame.kind {
        FrameKind::Text => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| TransportError::Protocol(format!("Text frame is not UTF-8: {}", e)))?;
            Message::Text(text)
        }
        FrameKind::Binary => Message::Binary(payload.to_vec()),
        FrameKind::Ping => Message::Ping(payload.to_vec()),
        FrameKind::Pong => Message::Pong(payload.to_vec()),
        FrameKind::Close => Message::Close(None),
    };
    Ok(msg)
}

fn map_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_messages_keep_their_kind() {
        let text = from_message(Message::Text("hi".to_string())).unwrap();
        assert_eq!(text, Frame::text("hi"));

        let binary = from_message(Message::Binary(vec![1, 2])).unwrap();
        assert_eq!(binary, Frame::binary(vec![1, 2]));

        assert_eq!(to_message(text).unwrap(), Message::Text("hi".to_string()));
        assert_eq!(to_message(binary).unwrap(), Message::Binary(vec![1, 2]));
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(
            from_message(Message::Pong(Vec::new())).map(|f| f.kind),
            Some(FrameKind::Pong)
        );
        assert_eq!(
            from_message(Message::Close(None)).map(|f| f.kind),
            Some(FrameKind::Close)
        );
        assert_eq!(to_message(Frame::close()).unwrap(), Message::Close(None));
        assert_eq!(to_message(Frame::ping()).unwrap(), Message::Ping(Vec::new()));
    }

    #[test]
    fn test_invalid_utf8_text_rejected() {
        let frame = Frame::new(FrameKind::Text, vec![0xff, 0xfe]);
        assert!(matches!(
            to_message(frame),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_closed_errors_map_to_closed() {
        assert_eq!(map_error(WsError::ConnectionClosed), TransportError::Closed);
        assert_eq!(map_error(WsError::AlreadyClosed), TransportError::Closed);
    }
}
