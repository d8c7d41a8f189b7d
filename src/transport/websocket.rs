//! WebSocket transport over tokio-tungstenite.

use std::io;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::frame::Frame;
use crate::transport::{BoxTransport, Transport, TransportFactory};

/// WebSocket transport. Frames travel as binary messages; pings are
/// answered internally and never reach the session.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self { stream }
    }
}

impl Transport for WsTransport {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let payload = frame
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            self.stream
                .send(WsMessage::Binary(payload.into()))
                .await
                .map_err(io::Error::other)
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Frame>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let frame = Frame::decode(&data).map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                        })?;
                        return Ok(Some(frame));
                    }
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = self.stream.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "text frames not allowed",
                        ));
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => return Err(io::Error::other(e.to_string())),
                    None => return Ok(None),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.stream.close(None).await;
        })
    }
}

/// Dials the metadata URL with the token appended as a query parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsFactory;

impl TransportFactory for WsFactory {
    fn connect(&self, url: &str, token: &str) -> BoxFuture<'static, io::Result<BoxTransport>> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let url = format!("{url}{separator}token={token}");
        Box::pin(async move {
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(Box::new(WsTransport::new(stream)) as BoxTransport)
        })
    }
}
