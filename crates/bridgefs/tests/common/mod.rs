//! Shared test harness: a session running over an in-memory stream plus a
//! minimal client that speaks the wire protocol.

// Not every test binary uses every helper.
#![allow(dead_code)]

use bridgefs::executor::Executor;
use bridgefs::protocol::{
    encode_request, ErrorCode, Request, Response, ResponseBody, ResponseFrameCodec,
};
use bridgefs::{Config, Session};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

/// Config rooted in a fresh temporary directory
pub fn test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        root_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    (config, temp_dir)
}

/// Client end of a live session
pub struct BridgeClient {
    io: DuplexStream,
    codec: ResponseFrameCodec,
    buf: BytesMut,
    shutdown: CancellationToken,
    session: JoinHandle<bridgefs::Result<()>>,
}

impl BridgeClient {
    /// Spawn a session over an in-memory duplex stream and return the
    /// client side.
    pub fn start(config: Config) -> Self {
        let (client_io, server_io) = tokio::io::duplex(4 * 1024 * 1024);
        let shutdown = CancellationToken::new();

        let executor = Arc::new(Executor::new(&config));
        let session = Session::new(&config, executor);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { session.run(server_io, token).await });

        Self {
            io: client_io,
            codec: ResponseFrameCodec,
            buf: BytesMut::new(),
            shutdown,
            session: handle,
        }
    }

    /// Send one request frame
    pub async fn send(&mut self, request_id: u64, request: &Request) {
        let mut frame = BytesMut::new();
        encode_request(request_id, request, &mut frame);
        self.io.write_all(&frame).await.unwrap();
    }

    /// Send raw bytes, bypassing the request encoder
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Receive the next response frame, whichever request it answers
    pub async fn recv(&mut self) -> Response {
        loop {
            if let Some(response) = self.codec.decode(&mut self.buf).unwrap() {
                return response;
            }
            let n = self.io.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "session closed the stream mid-read");
        }
    }

    /// Receive `count` responses and index them by request id
    pub async fn recv_many(&mut self, count: usize) -> HashMap<u64, Response> {
        let mut responses = HashMap::new();
        for _ in 0..count {
            let response = self.recv().await;
            responses.insert(response.request_id, response);
        }
        responses
    }

    /// Send one request and wait for its response; only valid when nothing
    /// else is outstanding
    pub async fn call(&mut self, request_id: u64, request: &Request) -> Response {
        self.send(request_id, request).await;
        let response = self.recv().await;
        assert_eq!(response.request_id, request_id);
        response
    }

    /// Drop the connection and wait for the session to finish
    pub async fn disconnect(self) -> bridgefs::Result<()> {
        drop(self.io);
        let result = self.session.await.unwrap();
        self.shutdown.cancel();
        result
    }
}

/// Unwrap a success response body
pub fn expect_ok(response: Response) -> ResponseBody {
    match response.result {
        Ok(body) => body,
        Err((code, detail)) => panic!("expected success, got {code:?}: {detail}"),
    }
}

/// Unwrap an error response code
pub fn expect_err(response: Response) -> ErrorCode {
    match response.result {
        Ok(body) => panic!("expected error, got {body:?}"),
        Err((code, _)) => code,
    }
}

/// Unwrap a handle id from an open/opendir response
pub fn expect_handle(response: Response) -> u64 {
    match expect_ok(response) {
        ResponseBody::Handle(id) => id,
        other => panic!("expected handle, got {other:?}"),
    }
}
