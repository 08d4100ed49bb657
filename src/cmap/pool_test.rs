//! Unit tests for [`ConnectionPool`] check-out/check-in behavior (§8's pool-size, generation, and
//! LIFO invariants), exercised against an in-memory fake server rather than a real socket.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    conn::AsyncStream,
    establish::{ConnectionEstablisher, EstablisherOptions},
    ConnectionPool,
    StreamConnector,
};
use crate::{
    bson_util,
    error::{Error, ErrorKind, Result},
    options::{ConnectionPoolOptions, ServerAddress},
};

/// A [`StreamConnector`] that pairs every dialed connection with an in-memory task answering
/// `hello` with a fixed, successful reply, so a pool can be driven end to end without a socket.
struct FakeConnector;

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self, _address: &ServerAddress) -> Result<Box<dyn AsyncStream>> {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_hello(server));
        Ok(Box::new(client))
    }
}

/// Answers every request on `stream` with a minimal successful `hello` reply until the stream
/// closes. Good enough for the handshake every new connection performs; these tests never send
/// an application command over a checked-out connection.
async fn serve_hello<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    loop {
        let length = match stream.read_i32_le().await {
            Ok(length) => length,
            Err(_) => return,
        };
        let request_id = match stream.read_i32_le().await {
            Ok(id) => id,
            Err(_) => return,
        };
        // Remaining header fields (responseTo, opCode) plus the rest of the body.
        let remaining = (length - 8).max(0) as usize;
        let mut rest = vec![0u8; remaining];
        if stream.read_exact(&mut rest).await.is_err() {
            return;
        }

        let reply_doc = bson::doc! {
            "ok": 1.0,
            "isWritablePrimary": true,
            "maxWireVersion": 21,
            "minWireVersion": 0,
        };
        let doc_bytes = bson_util::to_document_bytes(&reply_doc).expect("doc encodes");

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // OP_MSG flags: none set
        body.push(0); // payload type 0: a single BSON document
        body.extend_from_slice(&doc_bytes);

        if stream.write_i32_le((16 + body.len()) as i32).await.is_err() {
            return;
        }
        if stream.write_i32_le(1).await.is_err() {
            return; // requestId, unused by the caller
        }
        if stream.write_i32_le(request_id).await.is_err() {
            return; // responseTo echoes the request
        }
        if stream.write_i32_le(2013).await.is_err() {
            return; // opCode: OP_MSG
        }
        if stream.write_all(&body).await.is_err() {
            return;
        }
    }
}

fn test_pool(options: ConnectionPoolOptions) -> ConnectionPool {
    let establisher = ConnectionEstablisher::new(
        EstablisherOptions {
            app_name: None,
            server_api: None,
            load_balanced: false,
            credential: None,
        },
        None,
    );
    ConnectionPool::new(
        ServerAddress::default(),
        Arc::new(FakeConnector),
        establisher,
        Some(options),
    )
}

#[tokio::test]
async fn checkout_returns_most_recently_checked_in_connection() {
    let pool = test_pool(ConnectionPoolOptions::builder().build());
    pool.mark_as_ready();

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();
    let (a_id, b_id) = (a.id, b.id);
    assert_ne!(a_id, b_id);

    // check_in(a); check_in(b), in that order, via Drop.
    drop(a);
    drop(b);
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    let c = pool.check_out().await.unwrap();
    assert_eq!(
        c.id, b_id,
        "check-out after check-in(a) then check-in(b) should return b (LIFO)"
    );
}

#[tokio::test]
async fn checked_out_and_pending_never_exceed_max_pool_size() {
    let pool = test_pool(
        ConnectionPoolOptions::builder()
            .max_pool_size(2u32)
            .wait_queue_timeout(Duration::from_millis(200))
            .build(),
    );
    pool.mark_as_ready();

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();

    match pool.check_out().await {
        Ok(_) => panic!("check-out should have blocked until wait_queue_timeout elapsed"),
        Err(e) => assert!(matches!(*e.kind, ErrorKind::WaitQueueTimeout { .. })),
    }

    drop(a);
    drop(b);
}

#[tokio::test]
async fn clear_bumps_generation_and_discards_stale_connections() {
    let pool = test_pool(ConnectionPoolOptions::builder().build());
    pool.mark_as_ready();

    let a = pool.check_out().await.unwrap();
    let stale_generation = a.generation.generation;
    drop(a);
    tokio::task::yield_now().await;

    pool.clear(Error::internal("test clear"));
    tokio::task::yield_now().await;
    pool.mark_as_ready();

    let b = pool.check_out().await.unwrap();
    assert_ne!(
        b.generation.generation, stale_generation,
        "a connection established after a clear should carry the bumped generation"
    );
    assert_eq!(pool.generation(), b.generation.generation);
}

#[tokio::test]
async fn checkout_fails_while_pool_is_paused() {
    let pool = test_pool(ConnectionPoolOptions::builder().build());
    pool.mark_as_ready();
    pool.clear(Error::internal("paused for test"));
    tokio::task::yield_now().await;

    match pool.check_out().await {
        Ok(_) => panic!("check-out should fail while the pool is paused"),
        Err(e) => assert!(matches!(*e.kind, ErrorKind::ConnectionPoolCleared { .. })),
    }
}

#[tokio::test]
async fn min_pool_size_is_populated_in_the_background() {
    let pool = test_pool(
        ConnectionPoolOptions::builder()
            .min_pool_size(2u32)
            .max_pool_size(2u32)
            .build(),
    );
    pool.mark_as_ready();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();
    assert_ne!(a.id, b.id);
}
