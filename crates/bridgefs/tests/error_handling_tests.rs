//! Error path tests: malformed frames, payload limits, path confinement,
//! and handle exhaustion

mod common;

use bridgefs::protocol::{ErrorCode, Opcode, OpenFlags, Request, ResponseBody};
use bytes::Bytes;
use common::{expect_err, expect_handle, expect_ok, test_config, BridgeClient};

/// A frame whose body does not decode gets a malformed-frame error, and the
/// connection keeps working.
#[tokio::test]
async fn test_malformed_body_is_recoverable() {
    let (config, temp) = test_config();
    std::fs::write(temp.path().join("ok"), b"x").unwrap();
    let mut client = BridgeClient::start(config);

    // Stat frame with a truncated body: declares a 100-byte string but
    // carries only 3 bytes of payload after the length prefix.
    let mut raw = Vec::new();
    raw.push(Opcode::Stat as u8);
    raw.extend_from_slice(&5u64.to_be_bytes());
    raw.extend_from_slice(&7u32.to_be_bytes()); // payload length
    raw.extend_from_slice(&100u32.to_be_bytes()); // string length
    raw.extend_from_slice(b"abc");
    client.send_raw(&raw).await;

    let response = client.recv().await;
    assert_eq!(response.request_id, 5);
    assert_eq!(expect_err(response), ErrorCode::MalformedFrame);

    // The stream stayed in sync.
    expect_ok(client.call(6, &Request::Stat { path: "/ok".into() }).await);

    client.disconnect().await.unwrap();
}

/// Payload exactly at the limit is served; one byte over is rejected and
/// skipped without killing the connection.
#[tokio::test]
async fn test_payload_limit_boundary() {
    let (mut config, temp) = test_config();
    config.max_payload = 4096;
    let mut client = BridgeClient::start(config.clone());

    let handle = expect_handle(
        client
            .call(
                1,
                &Request::Open {
                    path: "/bounds".into(),
                    flags: OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT),
                    mode: 0o644,
                },
            )
            .await,
    );

    // Write body: handle (8) + offset (8) + length prefix (4) + data.
    let at_limit = config.max_payload - 20;
    let written = expect_ok(
        client
            .call(
                2,
                &Request::Write {
                    handle,
                    offset: 0,
                    data: Bytes::from(vec![3u8; at_limit]),
                },
            )
            .await,
    );
    assert_eq!(written, ResponseBody::Written(at_limit as u64));

    // One byte more and the frame is rejected outright.
    let over = expect_err(
        client
            .call(
                3,
                &Request::Write {
                    handle,
                    offset: 0,
                    data: Bytes::from(vec![3u8; at_limit + 1]),
                },
            )
            .await,
    );
    assert_eq!(over, ErrorCode::MalformedFrame);

    // The oversized payload was skipped; the stream still parses.
    expect_ok(client.call(4, &Request::Flush { handle }).await);
    assert_eq!(
        std::fs::metadata(temp.path().join("bounds")).unwrap().len(),
        at_limit as u64
    );

    client.disconnect().await.unwrap();
}

/// A read request is 20 bytes on the wire no matter what length it asks
/// for; the response it provokes must still fit the payload limit.
#[tokio::test]
async fn test_read_length_is_capped_to_the_payload_limit() {
    let (mut config, temp) = test_config();
    config.max_payload = 4096;
    std::fs::write(temp.path().join("big"), vec![9u8; 6000]).unwrap();
    let mut client = BridgeClient::start(config);

    let handle = expect_handle(
        client
            .call(
                1,
                &Request::Open {
                    path: "/big".into(),
                    flags: OpenFlags(OpenFlags::READ),
                    mode: 0,
                },
            )
            .await,
    );

    let body = expect_ok(
        client
            .call(2, &Request::Read { handle, offset: 0, len: u32::MAX })
            .await,
    );
    let ResponseBody::Data(data) = body else {
        panic!("expected data, got {body:?}");
    };
    assert_eq!(data.len(), 4096);

    // The capped read left the tracked position at the cap; the rest of the
    // file follows, and the stream stayed in sync.
    let body = expect_ok(
        client
            .call(3, &Request::Read { handle, offset: -1, len: u32::MAX })
            .await,
    );
    let ResponseBody::Data(rest) = body else {
        panic!("expected data, got {body:?}");
    };
    assert_eq!(rest.len(), 6000 - 4096);

    client.disconnect().await.unwrap();
}

/// Paths may not climb out of the shared root.
#[tokio::test]
async fn test_path_escape_is_rejected() {
    let (config, _temp) = test_config();
    let mut client = BridgeClient::start(config);

    for (id, path) in [
        (1u64, "/.."),
        (2, "/../etc/passwd"),
        (3, "/a/../../b"),
        (4, ""),
    ] {
        assert_eq!(
            expect_err(client.call(id, &Request::Stat { path: path.into() }).await),
            ErrorCode::PathEscape,
            "path {path:?} must be rejected"
        );
    }

    // Dotdot that stays inside the root is fine.
    assert_eq!(
        expect_err(client.call(5, &Request::Stat { path: "/a/../missing".into() }).await),
        ErrorCode::NotFound
    );

    client.disconnect().await.unwrap();
}

/// Operations against ids that were never issued.
#[tokio::test]
async fn test_unknown_handle_operations() {
    let (config, _temp) = test_config();
    let mut client = BridgeClient::start(config);

    assert_eq!(
        expect_err(
            client
                .call(1, &Request::Read { handle: 42, offset: 0, len: 1 })
                .await
        ),
        ErrorCode::HandleNotFound
    );
    assert_eq!(
        expect_err(
            client
                .call(2, &Request::Readdir { handle: 42, rewind: false })
                .await
        ),
        ErrorCode::HandleNotFound
    );
    assert_eq!(
        expect_err(client.call(3, &Request::Release { handle: 42 }).await),
        ErrorCode::HandleNotFound
    );

    client.disconnect().await.unwrap();
}

/// The session refuses to issue more handles than configured, and frees
/// capacity on release.
#[tokio::test]
async fn test_handle_exhaustion_and_recovery() {
    let (mut config, temp) = test_config();
    config.max_open_handles = 2;
    std::fs::write(temp.path().join("f"), b"x").unwrap();
    let mut client = BridgeClient::start(config);

    let open = Request::Open {
        path: "/f".into(),
        flags: OpenFlags(OpenFlags::READ),
        mode: 0,
    };

    let first = expect_handle(client.call(1, &open).await);
    let _second = expect_handle(client.call(2, &open).await);

    assert_eq!(
        expect_err(client.call(3, &open).await),
        ErrorCode::HandleExhausted
    );

    // Releasing one makes room for another.
    expect_ok(client.call(4, &Request::Release { handle: first }).await);
    let third = expect_handle(client.call(5, &open).await);
    assert_ne!(third, first);

    client.disconnect().await.unwrap();
}

/// Filesystem errors answer the one request and leave the session healthy.
#[tokio::test]
async fn test_filesystem_errors_do_not_end_the_session() {
    let (config, temp) = test_config();
    std::fs::create_dir(temp.path().join("d")).unwrap();
    let mut client = BridgeClient::start(config);

    assert_eq!(
        expect_err(client.call(1, &Request::Stat { path: "/gone".into() }).await),
        ErrorCode::NotFound
    );
    assert_eq!(
        expect_err(client.call(2, &Request::Unlink { path: "/d".into() }).await),
        ErrorCode::WrongType
    );
    assert_eq!(
        expect_err(
            client
                .call(
                    3,
                    &Request::Open {
                        path: "/gone".into(),
                        flags: OpenFlags(OpenFlags::READ),
                        mode: 0,
                    },
                )
                .await
        ),
        ErrorCode::NotFound
    );

    // Dozens of failures later the session still serves successes.
    expect_ok(client.call(4, &Request::Stat { path: "/d".into() }).await);

    client.disconnect().await.unwrap();
}
