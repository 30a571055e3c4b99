//! Local engine backend: HTTP/1.1 over the Docker UNIX socket.
//!
//! Uses a real HTTP client end to end, including the exec-attach path:
//! the 101 upgrade is negotiated by hyper and the resulting duplex
//! stream is pumped into the same [`ExecClientEvent`] channel the
//! tunnel backend uses. Multiplexed log streams are split with an
//! explicit two-state parser (header accumulation, then payload)
//! instead of ad hoc scanning.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyperlocal::{UnixConnector, Uri as LocalUri};
use log::{debug, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use async_trait::async_trait;
use flotilla_protocol::{EngineResponse, StdStream};

use super::{EngineBackend, EngineCall};
use crate::environment::Environment;
use crate::tunnel::{ExecClientEvent, ExecHandle, ExecInput, ExecParams, StreamEvent, StreamHandle};

/// Read buffer for the exec duplex stream.
const EXEC_READ_BUFFER: usize = 8192;

/// Chunk buffer for streamed responses.
const STREAM_BUFFER_SIZE: usize = 64;

/// Content type the engine uses for stdout/stderr-multiplexed streams.
const MULTIPLEXED_CONTENT_TYPE: &str = "application/vnd.docker.multiplexed-stream";

/// Engine access over a local UNIX socket.
pub struct LocalEngine {
    socket_path: String,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl LocalEngine {
    pub fn new(socket_path: String) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket_path,
            client,
        }
    }

    fn socket_for<'a>(&'a self, env: &'a Environment) -> &'a str {
        env.docker_socket.as_deref().unwrap_or(&self.socket_path)
    }

    fn build_request(&self, socket: &str, call: &EngineCall) -> Result<Request<Full<Bytes>>> {
        let uri: hyper::Uri = LocalUri::new(socket, &call.path).into();
        let mut builder = Request::builder().method(call.method.as_str()).uri(uri);
        if let Some(headers) = &call.headers {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let body = match &call.body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(
                    serde_json::to_vec(value).context("serializing engine request body")?,
                ))
            }
            None => Full::default(),
        };
        builder.body(body).context("building engine request")
    }
}

#[async_trait]
impl EngineBackend for LocalEngine {
    async fn request(&self, env: &Environment, call: EngineCall) -> Result<EngineResponse> {
        let request = self.build_request(self.socket_for(env), &call)?;
        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("engine request {} {} failed", call.method, call.path))?;

        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("reading engine response body")?
            .to_bytes();

        Ok(build_engine_response(status, headers, &bytes))
    }

    async fn request_streamed(&self, env: &Environment, call: EngineCall) -> Result<StreamHandle> {
        let request = self.build_request(self.socket_for(env), &call)?;
        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("engine stream {} {} failed", call.method, call.path))?;

        if !response.status().is_success() {
            bail!("engine stream request failed with status {}", response.status());
        }

        let multiplexed = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct == MULTIPLEXED_CONTENT_TYPE);

        let request_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        let task = tokio::spawn(async move {
            let mut body = response.into_body();
            let mut demuxer = multiplexed.then(StreamDemuxer::new);
            while let Some(next) = body.frame().await {
                let frame = match next {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Engine stream body error: {e}");
                        break;
                    }
                };
                let Some(data) = frame.data_ref() else {
                    continue;
                };
                match &mut demuxer {
                    Some(demuxer) => {
                        for (substream, text) in demuxer.push(data) {
                            let event = StreamEvent::Data {
                                data: text,
                                substream: Some(substream),
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    None => {
                        let event = StreamEvent::Data {
                            data: String::from_utf8_lossy(data).into_owned(),
                            substream: None,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx
                .send(StreamEvent::End {
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(StreamHandle::new(
            request_id,
            rx,
            Box::new(move || task.abort()),
        ))
    }

    async fn open_exec(
        &self,
        env: &Environment,
        params: ExecParams,
        client: mpsc::Sender<ExecClientEvent>,
    ) -> Result<ExecHandle> {
        // Create the exec instance.
        let create = EngineCall::new("POST", format!("/containers/{}/exec", params.container_id))
            .with_body(json!({
                "AttachStdin": true,
                "AttachStdout": true,
                "AttachStderr": true,
                "Tty": true,
                "Cmd": params.cmd,
                "User": params.user,
                "ConsoleSize": [params.rows, params.cols],
            }));
        let created = self.request(env, create).await?;
        if created.status_code != 201 {
            bail!("exec create failed with status {}", created.status_code);
        }
        let exec_id = created
            .body
            .as_ref()
            .and_then(|body| body.get("Id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| anyhow!("exec create response missing Id"))?
            .to_string();

        // Start it over a conformant HTTP/1.1 upgrade.
        let socket = self.socket_for(env).to_string();
        let uri: hyper::Uri = LocalUri::new(&socket, &format!("/exec/{exec_id}/start")).into();
        let start_body =
            serde_json::to_vec(&json!({"Detach": false, "Tty": true})).context("exec start body")?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(start_body)))
            .context("building exec start request")?;

        let response = self.client.request(request).await.context("starting exec")?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            bail!("engine refused exec upgrade with status {}", response.status());
        }
        let upgraded = hyper::upgrade::on(response)
            .await
            .context("upgrading exec connection")?;
        let (mut read_half, mut write_half) = tokio::io::split(TokioIo::new(upgraded));

        let _ = client.try_send(ExecClientEvent::Ready);

        // Output pump: engine -> local client.
        let output_client = client.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; EXEC_READ_BUFFER];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_client
                            .send(ExecClientEvent::Output(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = output_client
                .send(ExecClientEvent::End {
                    reason: "exec ended".to_string(),
                })
                .await;
        });

        // Input pump: local client -> engine. Resizes go out of band.
        let (input_tx, mut input_rx) = mpsc::channel::<ExecInput>(32);
        let resize_client = self.client.clone();
        let resize_exec = exec_id.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                match input {
                    ExecInput::Data(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    ExecInput::Resize { cols, rows } => {
                        let uri: hyper::Uri = LocalUri::new(
                            &socket,
                            &format!("/exec/{resize_exec}/resize?h={rows}&w={cols}"),
                        )
                        .into();
                        let request = Request::builder()
                            .method(Method::POST)
                            .uri(uri)
                            .body(Full::default());
                        match request {
                            Ok(request) => {
                                if let Err(e) = resize_client.request(request).await {
                                    warn!("Exec resize failed for {resize_exec}: {e}");
                                }
                            }
                            Err(e) => warn!("Exec resize request invalid: {e}"),
                        }
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        Ok(ExecHandle::new(exec_id, input_tx))
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

fn header_map(headers: &hyper::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn build_engine_response(
    status_code: u16,
    headers: HashMap<String, String>,
    bytes: &[u8],
) -> EngineResponse {
    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_default();

    let (body, is_binary) = if bytes.is_empty() {
        (None, false)
    } else if content_type.starts_with("application/json") {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => (Some(value), false),
            Err(_) => (
                Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
                false,
            ),
        }
    } else if content_type.starts_with("text/") {
        (
            Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
            false,
        )
    } else {
        use base64::Engine as _;
        (
            Some(Value::String(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            )),
            true,
        )
    };

    EngineResponse {
        request_id: Uuid::new_v4(),
        status_code,
        headers,
        body,
        is_binary,
    }
}

/// Splits the engine's stdout/stderr-multiplexed stream format.
///
/// Each frame is an 8-byte header (stream type, three zero bytes, a
/// big-endian payload length) followed by the payload. Frames may
/// arrive split across arbitrary chunk boundaries, so the parser
/// accumulates until a full header and a full payload are present.
#[derive(Debug, Default)]
pub struct StreamDemuxer {
    buf: Vec<u8>,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes in; complete frames come out, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<(StdStream, String)> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 8 {
                break;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < 8 + len {
                break;
            }
            let substream = match self.buf[0] {
                2 => StdStream::Stderr,
                _ => StdStream::Stdout,
            };
            let payload = String::from_utf8_lossy(&self.buf[8..8 + len]).into_owned();
            self.buf.drain(..8 + len);
            frames.push((substream, payload));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_demux_single_frame() {
        let mut demuxer = StreamDemuxer::new();
        let frames = demuxer.push(&frame(1, b"hello\n"));
        assert_eq!(frames, vec![(StdStream::Stdout, "hello\n".to_string())]);
    }

    #[test]
    fn test_demux_split_across_chunks() {
        let mut demuxer = StreamDemuxer::new();
        let bytes = frame(2, b"oops\n");
        // Header split mid-way, payload split again.
        assert!(demuxer.push(&bytes[..3]).is_empty());
        assert!(demuxer.push(&bytes[3..10]).is_empty());
        let frames = demuxer.push(&bytes[10..]);
        assert_eq!(frames, vec![(StdStream::Stderr, "oops\n".to_string())]);
    }

    #[test]
    fn test_demux_multiple_frames_one_chunk() {
        let mut demuxer = StreamDemuxer::new();
        let mut bytes = frame(1, b"out");
        bytes.extend_from_slice(&frame(2, b"err"));
        let frames = demuxer.push(&bytes);
        assert_eq!(
            frames,
            vec![
                (StdStream::Stdout, "out".to_string()),
                (StdStream::Stderr, "err".to_string()),
            ]
        );
    }

    #[test]
    fn test_demux_empty_payload() {
        let mut demuxer = StreamDemuxer::new();
        let frames = demuxer.push(&frame(1, b""));
        assert_eq!(frames, vec![(StdStream::Stdout, String::new())]);
    }

    #[test]
    fn test_engine_response_json_body() {
        let headers: HashMap<String, String> =
            [("content-type".to_string(), "application/json".to_string())].into();
        let response = build_engine_response(200, headers, br#"{"Containers": 3}"#);
        assert_eq!(response.status_code, 200);
        assert!(!response.is_binary);
        assert_eq!(response.body.unwrap()["Containers"], 3);
    }

    #[test]
    fn test_engine_response_binary_body() {
        let headers: HashMap<String, String> = [(
            "content-type".to_string(),
            "application/octet-stream".to_string(),
        )]
        .into();
        let response = build_engine_response(200, headers, &[0xde, 0xad, 0xbe, 0xef]);
        assert!(response.is_binary);
        assert_eq!(
            response.body.unwrap(),
            Value::String("3q2+7w==".to_string())
        );
    }

    #[test]
    fn test_engine_response_empty_body() {
        let response = build_engine_response(204, HashMap::new(), b"");
        assert!(response.body.is_none());
        assert!(!response.is_binary);
    }
}
