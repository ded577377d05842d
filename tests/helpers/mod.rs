#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use rivus::advisory::{Advisory, ChannelSink};
use rivus::consumer::waiting::NextRequest;
use rivus::stream::message::status_code;
use rivus::{Envelope, Stream, StreamConfig};

// ==========================================
// SETUP HELPERS
// ==========================================

pub struct Harness {
    pub stream: Arc<Stream>,
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
    pub advisories: mpsc::UnboundedReceiver<(String, Advisory)>,
}

pub fn setup_stream(name: &str) -> Harness {
    setup_stream_with_config(StreamConfig::new(name))
}

pub fn setup_stream_with_config(cfg: StreamConfig) -> Harness {
    rivus::init_logging();
    let (sink, advisories) = ChannelSink::new();
    let (stream, outbound) =
        Stream::with_parts(cfg, Arc::new(rivus::stream::OpenInterest), Arc::new(sink));
    Harness {
        stream,
        outbound,
        advisories,
    }
}

// ==========================================
// WIRE HELPERS
// ==========================================

/// Next outbound envelope, failing the test after `ms` of silence.
pub async fn recv_envelope(rx: &mut mpsc::UnboundedReceiver<Envelope>, ms: u64) -> Envelope {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .expect("timed out waiting for an outbound envelope")
        .expect("outbound channel closed")
}

pub async fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<Envelope>, ms: u64) {
    let got = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await;
    if let Ok(Some(env)) = got {
        panic!(
            "expected silence but received envelope for '{}' (status {:?})",
            env.deliver_to,
            env.headers.as_ref().and_then(status_code)
        );
    }
}

pub fn envelope_status(env: &Envelope) -> Option<u16> {
    env.headers.as_ref().and_then(status_code)
}

pub fn header_value(env: &Envelope, name: &str) -> Option<String> {
    let headers = env.headers.as_ref()?;
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.split("\r\n") {
        if let Some(rest) = line.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix(": ") {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Tokens of the `$JS.ACK` reply: (delivery_count, stream_seq, deliver_seq, pending).
pub fn ack_tokens(env: &Envelope) -> (u64, u64, u64, u64) {
    let tokens: Vec<&str> = env.reply.split('.').collect();
    assert_eq!(tokens.len(), 9, "ack reply should have 9 tokens: {}", env.reply);
    (
        tokens[4].parse().unwrap(),
        tokens[5].parse().unwrap(),
        tokens[6].parse().unwrap(),
        tokens[8].parse().unwrap(),
    )
}

pub fn pull_body(batch: usize, expires: Duration) -> Bytes {
    let req = NextRequest {
        batch,
        expires: expires.as_nanos() as i64,
        ..Default::default()
    };
    Bytes::from(serde_json::to_vec(&req).unwrap())
}

pub async fn next_advisory(
    rx: &mut mpsc::UnboundedReceiver<(String, Advisory)>,
    ms: u64,
) -> (String, Advisory) {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .expect("timed out waiting for an advisory")
        .expect("advisory channel closed")
}

/// Drain advisories until one matches `kind` (the subject token), or panic.
pub async fn wait_advisory(
    rx: &mut mpsc::UnboundedReceiver<(String, Advisory)>,
    kind: &str,
    ms: u64,
) -> Advisory {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        let (subject, adv) = tokio::time::timeout(remaining, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} advisory", kind))
            .expect("advisory channel closed");
        if subject.contains(kind) {
            return adv;
        }
    }
}
