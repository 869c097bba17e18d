use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::SignalingError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SignalingError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SignalingError>> + Send>>;

/// Both directions of one open control socket, carrying text frames.
pub struct SocketHalves {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens control sockets to the rendezvous service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SocketHalves, SignalingError>;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(endpoint: &str) -> Result<Self, SignalingError> {
        Ok(Self {
            url: normalize_endpoint(endpoint)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<SocketHalves, SignalingError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        tracing::debug!(
            target: "huddle::signaling",
            url = %self.url,
            "signaling websocket connected"
        );
        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .sink_map_err(SignalingError::from)
            .with(|text: String| future::ready(Ok::<_, SignalingError>(Message::Text(text))));

        let stream = ws_read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!(
                            target: "huddle::signaling",
                            "dropping non-utf8 binary frame"
                        );
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(SignalingError::from(err))),
            })
        });

        Ok(SocketHalves {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Turns a configured endpoint into a websocket URL.
///
/// `http`/`https` map to `ws`/`wss`. A bare `host[:port][/path]` gets `ws://`
/// when it points at a loopback host and `wss://` otherwise.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty endpoint".into()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else if trimmed.starts_with("localhost") || trimmed.starts_with("127.0.0.1") {
        format!("ws://{trimmed}")
    } else {
        format!("wss://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| invalid("invalid websocket scheme".into()))?;
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}
