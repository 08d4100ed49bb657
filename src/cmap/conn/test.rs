//! Unit tests for the `Connection`'s framing discipline (§4.A, §8's framing-integrity property).

use bson::doc;
use tokio::io::duplex;

use super::{
    wire::{Message, MessageFlags, MessageSection},
    Command,
    Connection,
    ConnectionGeneration,
    StreamDescription,
};
use crate::{error::ErrorKind, options::ServerAddress};

#[tokio::test]
async fn mismatched_response_to_closes_the_connection() {
    let (client, mut server) = duplex(4096);
    let mut conn = Connection::new(
        1,
        ServerAddress::default(),
        ConnectionGeneration {
            generation: 0,
            service_id: None,
        },
        Box::new(client),
    );
    // Forces the OP_MSG path rather than the pre-handshake legacy OP_QUERY one.
    conn.stream_description = Some(StreamDescription::default());

    let server_task = tokio::spawn(async move {
        // Drain the request; its contents don't matter for this test.
        Message::read_from(&mut server).await.unwrap();

        let reply = Message {
            request_id: Some(999),
            response_to: -1, // deliberately wrong: does not match the request's requestId
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(doc! { "ok": 1.0 })],
            checksum: None,
        };
        reply.write_to(&mut server).await.unwrap();
    });

    let command = Command::new("ping".to_string(), "admin".to_string(), doc! { "ping": 1 });
    let err = conn.send_command(command).await.unwrap_err();
    assert!(
        matches!(*err.kind, ErrorKind::InvalidResponse { .. }),
        "a response_to mismatch should raise InvalidResponse"
    );
    assert!(
        conn.is_closed(),
        "a connection should be closed after a response_to mismatch, never handed back partially read"
    );

    server_task.await.unwrap();
}

#[tokio::test]
async fn round_trip_carries_the_request_id_and_reply_document_through() {
    let (mut a, mut b) = duplex(4096);

    let request = Message {
        request_id: Some(7),
        response_to: 0,
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(doc! { "hello": 1 })],
        checksum: None,
    };
    request.write_to(&mut a).await.unwrap();

    let received = Message::read_from(&mut b).await.unwrap();
    assert_eq!(received.request_id, Some(7));
    match received.sections.into_iter().next().unwrap() {
        MessageSection::Document(doc) => assert_eq!(doc.get_i32("hello").unwrap(), 1),
        MessageSection::Sequence { .. } => panic!("expected a single-document section"),
    }
}
