//! A scripted remote end for a `Transport` running over `tokio::io::duplex`.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;
use tether_client::{Transport, TransportConfig};
use tether_proto::{FrameDecoder, Framing, Notification, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

pub struct Peer {
    framing: Framing,
    reader:  ReadHalf<DuplexStream>,
    writer:  WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
}

/// A transport and the peer on the other end of its pipe.
pub fn pair(config: &TransportConfig) -> (Transport, Peer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let transport = Transport::from_stream(local, config);
    let (reader, writer) = tokio::io::split(remote);
    let peer = Peer {
        framing: config.framing,
        reader,
        writer,
        decoder: FrameDecoder::new(config.framing),
    };
    (transport, peer)
}

/// Short timeouts so failures show up quickly.
pub fn quick_config() -> TransportConfig {
    TransportConfig {
        call_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(30),
        ..TransportConfig::default()
    }
}

impl Peer {
    /// Next request the transport wrote.
    pub async fn next_request(&mut self) -> Request {
        self.next_request_or_eof().await.expect("transport closed its write half")
    }

    /// Next request, or `None` once the transport's side of the pipe is gone.
    pub async fn next_request_or_eof(&mut self) -> Option<Request> {
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("framing") {
                return Some(tether_proto::decode_request(&frame).expect("request"));
            }
            let mut buf = [0u8; 4096];
            match self.reader.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n)          => self.decoder.push(&buf[..n]),
            }
        }
    }

    pub async fn send_raw(&mut self, payload: &[u8]) {
        let mut wire = Vec::new();
        tether_proto::encode(self.framing, payload, &mut wire).expect("encode");
        self.writer.write_all(&wire).await.expect("write");
    }

    pub async fn respond(&mut self, response: Response) {
        self.send_raw(&response.to_bytes().unwrap()).await;
    }

    pub async fn reply(&mut self, id: u64, result: Value) {
        self.respond(Response::ok(id, result)).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send_raw(&Notification::new(method, params).to_bytes().unwrap()).await;
    }

    /// Answer every request with its own method name until the pipe closes.
    pub fn echo_methods(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut buf = [0u8; 4096];
                while let Ok(Some(frame)) = self.decoder.next_frame() {
                    let req = tether_proto::decode_request(&frame).expect("request");
                    self.reply(req.id, Value::String(req.method)).await;
                }
                match self.reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n)          => self.decoder.push(&buf[..n]),
                }
            }
        })
    }
}
