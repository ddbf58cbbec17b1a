use chrono::{Duration, Utc};
use lib_live::{ChunkOutcome, ServerMessageType, UploadError, UploadStart};
use project_tests::{TestEngine, encode_chunk};
use serde_json::json;

fn start_frame(upload_id: &str, file_size: usize, chunk_size: usize) -> serde_json::Value {
    json!({
        "type": "FILE_UPLOAD_START",
        "componentId": "live-avatar",
        "uploadId": upload_id,
        "filename": "notes.txt",
        "fileType": "text/plain",
        "fileSize": file_size,
        "chunkSize": chunk_size,
        "requestId": "s1",
    })
}

fn chunk_frame(upload_id: &str, index: usize, total: usize, bytes: &[u8]) -> serde_json::Value {
    let (data, hash) = encode_chunk(bytes);
    json!({
        "type": "FILE_UPLOAD_CHUNK",
        "componentId": "live-avatar",
        "uploadId": upload_id,
        "chunkIndex": index,
        "totalChunks": total,
        "data": data,
        "hash": hash,
    })
}

#[tokio::test]
async fn test_out_of_order_chunks_reassemble() {
    let engine = TestEngine::new();
    let content = b"hello live components, this is a chunked upload!";
    let chunks: Vec<&[u8]> = content.chunks(12).collect();
    assert_eq!(chunks.len(), 4);

    let replies = engine.send("conn-a", start_frame("up-1", content.len(), 12)).await;
    assert_eq!(replies[0].kind, ServerMessageType::FileUploadProgress);
    assert_eq!(replies[0].success, Some(true));
    assert_eq!(replies[0].payload.as_ref().unwrap()["totalChunks"], 4);

    for index in [2, 0, 3] {
        let replies = engine.send("conn-a", chunk_frame("up-1", index, 4, chunks[index])).await;
        assert_eq!(replies[0].kind, ServerMessageType::FileUploadProgress);
        assert_eq!(replies[0].upload_id.as_deref(), Some("up-1"));
    }
    assert_eq!(engine.uploads.progress("up-1").unwrap().received_chunks, 3);

    let replies = engine.send("conn-a", chunk_frame("up-1", 1, 4, chunks[1])).await;
    assert_eq!(replies[0].kind, ServerMessageType::FileUploadComplete);
    let payload = replies[0].payload.clone().unwrap();
    assert_eq!(payload["fileSize"], content.len());
    let url = payload["fileUrl"].as_str().unwrap();
    assert!(url.starts_with("/uploads/"));

    let stored = engine.upload_dir().join(url.trim_start_matches("/uploads/"));
    assert_eq!(std::fs::read(stored).unwrap(), content.to_vec());

    // An explicit completion afterwards returns the same result.
    let replies = engine
        .send("conn-a", json!({"type": "FILE_UPLOAD_COMPLETE", "uploadId": "up-1"}))
        .await;
    assert_eq!(replies[0].success, Some(true));
    assert_eq!(replies[0].payload.as_ref().unwrap()["fileUrl"], url);
    assert_eq!(engine.uploads.stats().active_uploads, 0);
}

#[tokio::test]
async fn test_corrupted_chunk_is_rejected() {
    let engine = TestEngine::new();
    engine.send("conn-a", start_frame("up-2", 8, 4)).await;

    let mut frame = chunk_frame("up-2", 0, 2, b"abcd");
    frame["hash"] = json!("00".repeat(32));
    let replies = engine.send("conn-a", frame).await;
    assert_eq!(replies[0].success, Some(false));
    assert_eq!(replies[0].error_code.as_deref(), Some("UPLOAD_VALIDATION"));
    assert_eq!(engine.uploads.progress("up-2").unwrap().received_chunks, 0);

    let replies = engine
        .send("conn-a", json!({"type": "FILE_UPLOAD_COMPLETE", "uploadId": "up-2"}))
        .await;
    assert_eq!(replies[0].success, Some(false));
    assert!(replies[0].error.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_start_validation() {
    let engine = TestEngine::with_config(|c| c.uploads.max_file_size = 1024);

    let mut frame = start_frame("up-3", 10, 5);
    frame["fileType"] = json!("application/x-msdownload");
    let replies = engine.send("conn-a", frame).await;
    assert_eq!(replies[0].error_code.as_deref(), Some("UPLOAD_VALIDATION"));

    let replies = engine.send("conn-a", start_frame("up-4", 4096, 512)).await;
    assert_eq!(replies[0].success, Some(false));

    engine.send("conn-a", start_frame("up-5", 10, 5)).await;
    let replies = engine.send("conn-a", start_frame("up-5", 10, 5)).await;
    assert_eq!(replies[0].success, Some(false));
}

#[tokio::test]
async fn test_stale_uploads_are_swept() {
    let engine = TestEngine::with_config(|c| c.uploads.chunk_timeout_secs = 30);
    let meta = UploadStart {
        upload_id: "up-6".to_string(),
        component_id: "live-avatar".to_string(),
        filename: "a.txt".to_string(),
        file_type: "text/plain".to_string(),
        file_size: 4,
        chunk_size: 2,
    };
    engine.uploads.start_at(meta, Utc::now() - Duration::seconds(120)).unwrap();

    let purged = engine.uploads.sweep_stale(Utc::now());
    assert_eq!(purged, vec!["up-6".to_string()]);

    let (data, _) = encode_chunk(b"ab");
    let err = engine.uploads.receive_chunk("up-6", 0, 2, &data, None).await.unwrap_err();
    assert!(matches!(err, UploadError::UnknownUpload(_)));
}

#[tokio::test]
async fn test_duplicate_chunk_is_ignored() {
    let engine = TestEngine::new();
    engine.send("conn-a", start_frame("up-7", 4, 2)).await;
    let (data, hash) = encode_chunk(b"ab");

    for _ in 0..2 {
        let outcome = engine
            .uploads
            .receive_chunk("up-7", 0, 2, &data, Some(&hash))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Progress(p) => assert_eq!(p.received_chunks, 1),
            ChunkOutcome::Completed(_) => panic!("upload should still be open"),
        }
    }
}

#[tokio::test]
async fn test_oversized_chunks_and_totals_are_rejected() {
    let engine = TestEngine::new();
    engine.send("conn-a", start_frame("up-8", 6, 4)).await;

    let mut frame = chunk_frame("up-8", 0, 2, b"abcd");
    frame["data"] = json!("A".repeat(64 * 1024));
    frame.as_object_mut().unwrap().remove("hash");
    let replies = engine.send("conn-a", frame).await;
    assert_eq!(replies[0].success, Some(false));
    assert_eq!(replies[0].error_code.as_deref(), Some("UPLOAD_VALIDATION"));

    let replies = engine.send("conn-a", chunk_frame("up-8", 0, 2, b"abcdefg")).await;
    assert_eq!(replies[0].success, Some(false));

    engine.send("conn-a", chunk_frame("up-8", 0, 2, b"abcd")).await;
    let replies = engine.send("conn-a", chunk_frame("up-8", 1, 2, b"efgh")).await;
    assert_eq!(replies[0].success, Some(false));
    assert_eq!(engine.uploads.progress("up-8").unwrap().bytes_received, 4);

    let replies = engine.send("conn-a", chunk_frame("up-8", 1, 2, b"ef")).await;
    assert_eq!(replies[0].kind, ServerMessageType::FileUploadComplete);
    assert_eq!(replies[0].payload.as_ref().unwrap()["fileSize"], 6);
}

#[tokio::test]
async fn test_failed_finalize_can_be_retried() {
    let blocked = tempfile::tempdir().unwrap();
    let blocker = blocked.path().join("blocker");
    std::fs::write(&blocker, b"file in the way").unwrap();
    let upload_dir = blocker.join("uploads");
    let engine = TestEngine::with_config(|c| c.uploads.upload_dir = upload_dir.clone());

    engine.send("conn-a", start_frame("up-9", 8, 4)).await;
    engine.send("conn-a", chunk_frame("up-9", 0, 2, b"abcd")).await;
    let replies = engine.send("conn-a", chunk_frame("up-9", 1, 2, b"efgh")).await;
    assert_eq!(replies[0].success, Some(false));
    assert_eq!(engine.uploads.progress("up-9").unwrap().received_chunks, 2);

    std::fs::remove_file(&blocker).unwrap();
    let replies = engine
        .send("conn-a", json!({"type": "FILE_UPLOAD_COMPLETE", "uploadId": "up-9"}))
        .await;
    assert_eq!(replies[0].success, Some(true));
    let url = replies[0].payload.as_ref().unwrap()["fileUrl"].as_str().unwrap().to_string();
    let stored = upload_dir.join(url.trim_start_matches("/uploads/"));
    assert_eq!(std::fs::read(stored).unwrap(), b"abcdefgh".to_vec());
    assert_eq!(engine.uploads.stats().active_uploads, 0);
}
