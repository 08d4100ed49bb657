use bson::doc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use super::*;
use crate::{cmap::conn::ConnectionGeneration, options::ServerAddress};

fn insert_op(n: usize) -> WriteOperation {
    let documents = (0..n).map(|i| doc! { "_id": i as i32 }).collect();
    WriteOperation::new(WriteOperationKind::Insert, "db", "coll", documents, None, true)
}

#[test]
fn merge_combines_documents_for_matching_namespace_and_kind() {
    let mut a = insert_op(2);
    let b = insert_op(3);
    a.merge(b).unwrap();
    assert_eq!(a.documents.len(), 5);
}

#[test]
fn merge_rejects_mismatched_namespace() {
    let mut a = insert_op(1);
    let b = WriteOperation::new(
        WriteOperationKind::Insert,
        "db",
        "other_coll",
        vec![doc! { "_id": 1 }],
        None,
        true,
    );
    assert!(a.merge(b).is_err());
}

#[test]
fn merge_rejects_mismatched_kind() {
    let mut a = insert_op(1);
    let b = WriteOperation::new(
        WriteOperationKind::Update,
        "db",
        "coll",
        vec![doc! { "q": {}, "u": {} }],
        None,
        true,
    );
    assert!(a.merge(b).is_err());
}

#[test]
fn batch_splits_into_near_equal_partitions() {
    let op = insert_op(10);
    let batches = op.batch(3).unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].documents.len(), 3);
    assert_eq!(batches[1].documents.len(), 3);
    // last partition absorbs the remainder
    assert_eq!(batches[2].documents.len(), 4);
}

#[test]
fn batch_with_one_partition_keeps_everything_together() {
    let op = insert_op(5);
    let batches = op.batch(1).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].documents.len(), 5);
}

#[test]
fn batch_rejects_more_partitions_than_documents() {
    let op = insert_op(2);
    assert!(op.batch(3).is_err());
}

#[test]
fn batch_rejects_zero_partitions() {
    let op = insert_op(2);
    assert!(op.batch(0).is_err());
}

#[test]
fn command_body_uses_kind_specific_field_names() {
    let op = insert_op(2);
    let body = op.command_body(&op.documents).unwrap();
    assert!(body.contains_key("documents"));
    assert_eq!(body.get_str("insert").unwrap(), "coll");
    assert_eq!(body.get_bool("ordered").unwrap(), true);

    let update_op = WriteOperation::new(
        WriteOperationKind::Update,
        "db",
        "coll",
        vec![doc! { "q": {}, "u": {} }],
        None,
        true,
    );
    let body = update_op.command_body(&update_op.documents).unwrap();
    assert!(body.contains_key("updates"));

    let delete_op = WriteOperation::new(
        WriteOperationKind::Delete,
        "db",
        "coll",
        vec![doc! { "q": {}, "limit": 0 }],
        None,
        true,
    );
    let body = delete_op.command_body(&delete_op.documents).unwrap();
    assert!(body.contains_key("deletes"));
}

#[test]
fn command_body_includes_write_concern_when_set() {
    let op = WriteOperation::new(
        WriteOperationKind::Insert,
        "db",
        "coll",
        vec![doc! { "_id": 1 }],
        Some(WriteConcern::unacknowledged()),
        true,
    );
    let body = op.command_body(&op.documents).unwrap();
    assert!(body.contains_key("writeConcern"));
}

#[test]
fn requested_w0_detects_unacknowledged_write_concern() {
    let op = WriteOperation::new(
        WriteOperationKind::Insert,
        "db",
        "coll",
        vec![doc! { "_id": 1 }],
        Some(WriteConcern::unacknowledged()),
        true,
    );
    assert!(op.requested_w0());

    let op = insert_op(1);
    assert!(!op.requested_w0());
}

#[test]
fn check_sizes_rejects_document_over_max_bson_object_size() {
    let op = WriteOperation::new(
        WriteOperationKind::Insert,
        "db",
        "coll",
        vec![doc! { "payload": vec![0u8; 100] }],
        None,
        true,
    );
    let stream_description = StreamDescription {
        max_bson_object_size: 10,
        ..Default::default()
    };
    assert!(op.check_sizes(&stream_description).is_err());
}

#[test]
fn check_sizes_accepts_documents_within_limits() {
    let op = insert_op(3);
    assert!(op.check_sizes(&StreamDescription::default()).is_ok());
}

#[test]
fn result_into_result_succeeds_when_no_errors() {
    let result = WriteOperationResult {
        written_count: 2,
        errors: vec![],
        write_concern_error: None,
    };
    assert!(result.into_result().is_ok());
}

#[test]
fn result_into_result_fails_when_write_errors_present() {
    let result = WriteOperationResult {
        written_count: 1,
        errors: vec![BulkWriteError {
            index: 0,
            code: 11000,
            code_name: Some("DuplicateKey".to_string()),
            message: "duplicate key".to_string(),
        }],
        write_concern_error: None,
    };
    assert!(result.into_result().is_err());
}

#[test]
fn result_merge_offsets_error_indices() {
    let mut first = WriteOperationResult {
        written_count: 2,
        errors: vec![],
        write_concern_error: None,
    };
    let second = WriteOperationResult {
        written_count: 1,
        errors: vec![BulkWriteError {
            index: 0,
            code: 11000,
            code_name: None,
            message: "duplicate key".to_string(),
        }],
        write_concern_error: None,
    };
    first.merge(second, 2);
    assert_eq!(first.errors[0].index, 2);
    assert_eq!(first.written_count, 3);
}

/// Reads one OP_MSG request off `stream` and answers it with `reply_doc` framed as a
/// single-section OP_MSG reply, echoing the request's requestId back as responseTo.
async fn serve_one_command<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    mut stream: S,
    reply_doc: Document,
) {
    let length = stream.read_i32_le().await.unwrap();
    let _request_id = stream.read_i32_le().await.unwrap();
    let remaining = (length - 8).max(0) as usize;
    let mut rest = vec![0u8; remaining];
    stream.read_exact(&mut rest).await.unwrap();
    let request_id = i32::from_le_bytes(rest[0..4].try_into().unwrap());

    let doc_bytes = bson_util::to_document_bytes(&reply_doc).unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // OP_MSG flags: none set
    body.push(0); // payload type 0: a single BSON document
    body.extend_from_slice(&doc_bytes);

    stream.write_i32_le((16 + body.len()) as i32).await.unwrap();
    stream.write_i32_le(1).await.unwrap();
    stream.write_i32_le(request_id).await.unwrap();
    stream.write_i32_le(2013).await.unwrap();
    stream.write_all(&body).await.unwrap();
}

fn writable_stream_description() -> StreamDescription {
    StreamDescription {
        server_type: ServerType::Standalone,
        max_wire_version: Some(21),
        ..Default::default()
    }
}

/// S1: an ordered bulk write whose single write command reports a write error aborts with an
/// `Err`, rather than returning the per-document errors inside an `Ok` result.
#[tokio::test]
async fn ordered_execute_surfaces_the_first_error() {
    let (client, server) = duplex(4096);
    let mut conn = Connection::new(
        1,
        ServerAddress::default(),
        ConnectionGeneration {
            generation: 0,
            service_id: None,
        },
        Box::new(client),
    );
    conn.stream_description = Some(writable_stream_description());

    let server_task = tokio::spawn(serve_one_command(
        server,
        doc! {
            "ok": 1.0,
            "n": 0,
            "writeErrors": [
                { "index": 0, "code": 11000, "errmsg": "duplicate key" },
            ],
        },
    ));

    let op = insert_op(2);
    let err = op.execute(&mut conn).await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::BulkWrite(_)));

    server_task.await.unwrap();
}

/// S2: an unordered bulk write whose single write command reports one failed document still
/// returns `Ok`, with the written count and per-document error both carried in the result.
#[tokio::test]
async fn unordered_execute_returns_aggregated_result() {
    let (client, server) = duplex(4096);
    let mut conn = Connection::new(
        1,
        ServerAddress::default(),
        ConnectionGeneration {
            generation: 0,
            service_id: None,
        },
        Box::new(client),
    );
    conn.stream_description = Some(writable_stream_description());

    let server_task = tokio::spawn(serve_one_command(
        server,
        doc! {
            "ok": 1.0,
            "n": 1,
            "writeErrors": [
                { "index": 0, "code": 11000, "errmsg": "duplicate key" },
            ],
        },
    ));

    let mut op = insert_op(2);
    op.ordered = false;
    let result = op.execute(&mut conn).await.unwrap();
    assert_eq!(result.written_count, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 0);

    server_task.await.unwrap();
}
