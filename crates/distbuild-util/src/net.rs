//! Framing helpers for the newline-delimited JSON streams used by the coordinator's build-status
//! response and by clients consuming it.

use anyhow::{Context as _, Result};
use bytes::Bytes;
use futures::StreamExt as _;
use hyper::body::Sender as BodySender;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The write side of a streaming-JSON HTTP response body: one JSON object per line.
pub struct JsonLineSender {
    inner: BodySender,
}

impl JsonLineSender {
    pub fn new(inner: BodySender) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, value: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(value).context("serializing status line")?;
        line.push(b'\n');
        self.inner
            .send_data(Bytes::from(line))
            .await
            .context("writing status line to response stream")
    }
}

/// Reads newline-delimited JSON objects from an async byte stream, such as a `reqwest` response
/// body. Used by clients consuming the coordinator's build-status stream. `f` is awaited once per
/// line, in order, before the next chunk is read.
pub async fn for_each_json_line<T, S, E, F, Fut>(mut stream: S, mut f: F) -> Result<()>
where
    T: DeserializeOwned,
    S: futures::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(T) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading status stream")?;
        buf.extend_from_slice(&chunk);
        loop {
            let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let value: T = serde_json::from_slice(line).context("parsing status line")?;
            f(value).await?;
        }
    }
    Ok(())
}
