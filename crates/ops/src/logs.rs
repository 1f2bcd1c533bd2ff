//! Log tails: one cluster-side stream per call, re-chunked into frames of
//! at most 64 KiB that never split a UTF-8 scalar.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use vantage_kubehub::ClientHub;

use crate::{ops_queue_cap, CancelHandle, StreamHandle};

/// Upper bound on one emitted frame.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub container: Option<String>,
    /// Server-side tail; `Some(0)` means an empty capture (or "start at
    /// now" when following).
    pub tail_lines: Option<i64>,
    pub previous: bool,
    pub timestamps: bool,
    pub follow: bool,
}

fn log_params(opts: &LogOptions) -> LogParams {
    let mut lp = LogParams {
        follow: opts.follow,
        previous: opts.previous,
        timestamps: opts.timestamps,
        ..LogParams::default()
    };
    lp.tail_lines = opts.tail_lines;
    lp.container = opts.container.clone();
    lp
}

/// Open a log stream. Follow streams live until cancelled or the pod-side
/// stream ends; either way the channel closes.
pub async fn stream_logs(
    hub: &Arc<ClientHub>,
    namespace: &str,
    pod: &str,
    opts: LogOptions,
) -> Result<StreamHandle<LogChunk>> {
    let api: Api<Pod> = Api::namespaced(hub.client(), namespace);
    let lp = log_params(&opts);
    let (tx, rx) = mpsc::channel::<LogChunk>(ops_queue_cap());
    let (cancel, cancel_rx) = CancelHandle::pair();

    let pod_name = pod.to_string();
    tokio::spawn(async move {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
        info!(pod = %pod_name, follow = lp.follow, tail = ?lp.tail_lines, "log stream starting");
        let reader = match api.log_stream(&pod_name, &lp).await {
            Ok(r) => r,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "log stream failed to open");
                return;
            }
        };
        let stream = ReaderStream::new(reader.compat());
        pump_bytes_to_chunks(stream, tx, cancel_rx).await;
        info!(pod = %pod_name, "log stream ended");
    });

    Ok(StreamHandle { rx, cancel })
}

/// Non-follow capture: drain the whole stream into one buffer.
pub async fn collect_logs(
    hub: &Arc<ClientHub>,
    namespace: &str,
    pod: &str,
    mut opts: LogOptions,
) -> Result<String> {
    opts.follow = false;
    if opts.tail_lines == Some(0) {
        return Ok(String::new());
    }
    let api: Api<Pod> = Api::namespaced(hub.client(), namespace);
    let logs = api
        .logs(pod, &log_params(&opts))
        .await
        .with_context(|| format!("fetching logs for {}/{}", namespace, pod))?;
    Ok(logs)
}

/// Containers of a pod, for the container picker.
pub fn pod_containers(pod: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    for path in [["spec", "initContainers"], ["spec", "containers"]] {
        if let Some(containers) = vantage_core::nested::array_field(pod, &path) {
            for c in containers {
                if let Some(name) = c.get("name").and_then(|n| n.as_str()) {
                    out.push(name.to_string());
                }
            }
        }
    }
    out
}

/// Validate that a requested container exists on the pod.
pub fn resolve_container(pod: &serde_json::Value, requested: Option<&str>) -> Result<Option<String>> {
    let containers = pod_containers(pod);
    match requested {
        Some(name) => {
            if containers.iter().any(|c| c == name) {
                Ok(Some(name.to_string()))
            } else {
                Err(anyhow!("container {:?} not found in pod", name))
            }
        }
        None => Ok(None),
    }
}

async fn pump_bytes_to_chunks<S, E>(
    stream: S,
    tx: mpsc::Sender<LogChunk>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            next = stream.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        for chunk in drain_complete(&mut buf) {
                            if tx.send(LogChunk { data: chunk }).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "log stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    // Flush whatever is left, including a trailing incomplete sequence.
    if !buf.is_empty() {
        let text = String::from_utf8_lossy(&buf).into_owned();
        for chunk in split_at_char_boundaries(text, MAX_CHUNK_BYTES) {
            if tx.send(LogChunk { data: chunk }).await.is_err() {
                return;
            }
        }
    }
}

/// Decode everything except a trailing incomplete UTF-8 sequence and cut
/// the result into bounded frames. Invalid interior bytes decode to the
/// replacement character.
fn drain_complete(buf: &mut BytesMut) -> Vec<String> {
    let keep = incomplete_suffix_len(buf);
    let take = buf.len() - keep;
    if take == 0 {
        return Vec::new();
    }
    let bytes = buf.split_to(take);
    let text = String::from_utf8_lossy(&bytes).into_owned();
    split_at_char_boundaries(text, MAX_CHUNK_BYTES)
}

/// Length of a trailing, possibly-incomplete multi-byte sequence.
fn incomplete_suffix_len(b: &[u8]) -> usize {
    let len = b.len();
    let start = len.saturating_sub(3);
    for i in (start..len).rev() {
        let byte = b[i];
        let expected = if byte >= 0xF0 {
            4
        } else if byte >= 0xE0 {
            3
        } else if byte >= 0xC0 {
            2
        } else {
            continue;
        };
        let have = len - i;
        return if have < expected { have } else { 0 };
    }
    0
}

fn split_at_char_boundaries(text: String, max: usize) -> Vec<String> {
    if text.len() <= max {
        return if text.is_empty() { Vec::new() } else { vec![text] };
    }
    let mut out = Vec::new();
    let mut rest = text.as_str();
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn chunks_never_split_scalars() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(64);
        let (_cancel, cancel_rx) = CancelHandle::pair();
        // "é" is 0xC3 0xA9; split it across reads.
        let chunks = vec![
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"caf\xc3")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"\xa9 au lait\n")),
        ];
        pump_bytes_to_chunks(stream::iter(chunks), tx, cancel_rx).await;
        let mut out = String::new();
        while let Some(c) = rx.recv().await {
            out.push_str(&c.data);
        }
        assert_eq!(out, "café au lait\n");
    }

    #[tokio::test]
    async fn invalid_bytes_become_replacement_chars() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(64);
        let (_cancel, cancel_rx) = CancelHandle::pair();
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(
            b"ok \xff\xfe bad\n",
        ))];
        pump_bytes_to_chunks(stream::iter(chunks), tx, cancel_rx).await;
        let c = rx.recv().await.unwrap();
        assert!(c.data.contains('\u{FFFD}'));
        assert!(c.data.starts_with("ok "));
    }

    #[tokio::test]
    async fn large_output_is_bounded_per_frame() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(64);
        let (_cancel, cancel_rx) = CancelHandle::pair();
        let big = "x".repeat(MAX_CHUNK_BYTES * 2 + 10);
        let chunks = vec![Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(
            big.clone(),
        ))];
        pump_bytes_to_chunks(stream::iter(chunks), tx, cancel_rx).await;
        let mut total = 0usize;
        let mut frames = 0usize;
        while let Some(c) = rx.recv().await {
            assert!(c.data.len() <= MAX_CHUNK_BYTES);
            total += c.data.len();
            frames += 1;
        }
        assert_eq!(total, big.len());
        assert!(frames >= 3);
    }

    #[tokio::test]
    async fn cancel_stops_pump() {
        let (tx, mut rx) = mpsc::channel::<LogChunk>(4);
        let (cancel, cancel_rx) = CancelHandle::pair();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"line\n"));
            }
        };
        let handle = tokio::spawn(pump_bytes_to_chunks(s, tx, cancel_rx));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump stopped after cancel")
            .unwrap();
        while rx.recv().await.is_some() {}
    }

    #[test]
    fn incomplete_suffix_detection() {
        assert_eq!(incomplete_suffix_len(b"abc"), 0);
        assert_eq!(incomplete_suffix_len(b"ab\xc3"), 1);
        assert_eq!(incomplete_suffix_len(b"ab\xe2\x82"), 2);
        assert_eq!(incomplete_suffix_len(b"ab\xf0\x9f\x92"), 3);
        assert_eq!(incomplete_suffix_len("café".as_bytes()), 0);
    }

    #[test]
    fn container_resolution() {
        let pod = serde_json::json!({"spec": {
            "initContainers": [{"name": "init"}],
            "containers": [{"name": "app"}, {"name": "sidecar"}],
        }});
        assert_eq!(pod_containers(&pod), vec!["init", "app", "sidecar"]);
        assert!(resolve_container(&pod, Some("app")).is_ok());
        assert!(resolve_container(&pod, Some("nope")).is_err());
        assert_eq!(resolve_container(&pod, None).unwrap(), None);
    }
}
