//! Upload, download and chunk-session tests.

use bytes::Bytes;

use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, ResponseTemplate};

use davsync_core::domain::{Etag, RelativePath};
use davsync_core::ports::{FinalizeArgs, RemoteClient, RemoteError};

use crate::common::{setup, FILES_BASE, UPLOADS_BASE};

fn rel(p: &str) -> RelativePath {
    RelativePath::new(p).unwrap()
}

#[tokio::test]
async fn test_put_file_sends_if_match_and_maps_outcome() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path(format!("{FILES_BASE}/a.txt")))
        .and(header("If-Match", "\"old-etag\""))
        .and(header_exists("X-OC-Mtime"))
        .respond_with(
            ResponseTemplate::new(204)
                .append_header("OC-ETag", "\"new-etag\"")
                .append_header("OC-FileId", "id-a"),
        )
        .mount(&server)
        .await;

    let outcome = client
        .put_file(
            &rel("a.txt"),
            Bytes::from_static(b"hello"),
            Some(&Etag::new("old-etag").unwrap()),
            Some(chrono::Utc::now()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.etag.as_str(), "new-etag");
    assert_eq!(outcome.file_id.unwrap().as_str(), "id-a");
}

#[tokio::test]
async fn test_put_file_412_becomes_precondition_failed() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let err = client
        .put_file(
            &rel("a.txt"),
            Bytes::from_static(b"hello"),
            Some(&Etag::new("stale").unwrap()),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::PreconditionFailed));
}

#[tokio::test]
async fn test_new_file_uses_if_none_match() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("PUT"))
        .and(header("If-None-Match", "*"))
        .respond_with(ResponseTemplate::new(201).append_header("ETag", "\"e1\""))
        .expect(1)
        .mount(&server)
        .await;

    client
        .put_file(&rel("fresh.txt"), Bytes::from_static(b"x"), None, None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_download_writes_target_file() {
    let (server, _creds, client) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join(".a.txt.~test");

    Mock::given(method("GET"))
        .and(path(format!("{FILES_BASE}/a.txt")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"ten bytes!".to_vec())
                .append_header("ETag", "\"etag-a\"")
                .append_header("OC-FileId", "id-a"),
        )
        .mount(&server)
        .await;

    let outcome = client
        .download(&rel("a.txt"), &target, 0, None, None, None)
        .await
        .unwrap();

    assert_eq!(outcome.size, 10);
    assert_eq!(outcome.etag.as_str(), "etag-a");
    assert_eq!(std::fs::read(&target).unwrap(), b"ten bytes!");
}

#[tokio::test]
async fn test_download_resumes_with_range() {
    let (server, _creds, client) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join(".big.bin.~test");
    std::fs::write(&target, b"12345").unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{FILES_BASE}/big.bin")))
        .and(header("Range", "bytes=5-"))
        .and(header("If-Range", "\"etag-b\""))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(b"67890".to_vec())
                .append_header("ETag", "\"etag-b\""),
        )
        .mount(&server)
        .await;

    let outcome = client
        .download(
            &rel("big.bin"),
            &target,
            5,
            Some(&Etag::new("etag-b").unwrap()),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.size, 10);
    assert_eq!(std::fs::read(&target).unwrap(), b"1234567890");
}

#[tokio::test]
async fn test_move_sends_destination_header() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("MOVE"))
        .and(path(format!("{FILES_BASE}/old.bin")))
        .and(header_exists("Destination"))
        .and(header("Overwrite", "F"))
        .respond_with(
            ResponseTemplate::new(201)
                .append_header("OC-ETag", "\"moved\"")
                .append_header("OC-FileId", "F1"),
        )
        .mount(&server)
        .await;

    let outcome = client
        .move_item(&rel("old.bin"), &rel("new.bin"))
        .await
        .unwrap();
    assert_eq!(outcome.etag.as_str(), "moved");
}

#[tokio::test]
async fn test_mkcol_falls_back_to_stat_for_identity() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("MKCOL"))
        .and(path(format!("{FILES_BASE}/newdir")))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    Mock::given(method("PROPFIND"))
        .and(path(format!("{FILES_BASE}/newdir")))
        .respond_with(ResponseTemplate::new(207).set_body_string(format!(
            r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>{FILES_BASE}/newdir/</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"dir-etag"</d:getetag>
        <d:resourcetype><d:collection/></d:resourcetype>
        <oc:fileid>dir-id</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#
        )))
        .mount(&server)
        .await;

    let outcome = client.mkcol(&rel("newdir")).await.unwrap();
    assert_eq!(outcome.etag.as_str(), "dir-etag");
    assert_eq!(outcome.file_id.unwrap().as_str(), "dir-id");
}

#[tokio::test]
async fn test_token_chunk_session_lifecycle() {
    let (server, _creds, client) = setup().await;

    // capabilities advertise the token dialect
    Mock::given(method("GET"))
        .and(path("/ocs/v1.php/cloud/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ocs": { "data": { "capabilities": {
                "dav": { "resumableUpload": true, "reports": [] },
                "files": {}, "checksums": {}, "core": {}
            }}}
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{UPLOADS_BASE}/")))
        .and(header("Upload-Length", "100"))
        .respond_with(
            ResponseTemplate::new(201)
                .append_header("Location", format!("{UPLOADS_BASE}/tx-1").as_str()),
        )
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path(format!("{UPLOADS_BASE}/tx-1")))
        .respond_with(ResponseTemplate::new(200).append_header("Upload-Offset", "40"))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path(format!("{UPLOADS_BASE}/tx-1")))
        .and(header("Upload-Offset", "40"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{UPLOADS_BASE}/tx-1")))
        .and(header_exists("Destination"))
        .and(header("OC-Total-Length", "100"))
        .respond_with(
            ResponseTemplate::new(201)
                .append_header("OC-ETag", "\"assembled\"")
                .append_header("OC-FileId", "big-id"),
        )
        .mount(&server)
        .await;

    let session = client.create_transfer(&rel("big.bin"), 100).await.unwrap();
    assert_eq!(session.id.as_str(), "tx-1");

    let committed = client.transfer_offset(&session).await.unwrap();
    assert_eq!(committed, 40);

    client
        .upload_chunk(&session, committed, Bytes::from(vec![0u8; 60]), None)
        .await
        .unwrap();

    let outcome = client
        .finalize_transfer(
            &session,
            &rel("big.bin"),
            FinalizeArgs {
                total_size: 100,
                if_match: None,
                mtime: None,
                checksum: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.etag.as_str(), "assembled");
}

#[tokio::test]
async fn test_numbered_chunk_session_uses_collection() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/ocs/v1.php/cloud/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ocs": { "data": { "capabilities": {
                "dav": { "reports": [] },
                "files": { "bigfilechunking": true }, "checksums": {}, "core": {}
            }}}
        })))
        .mount(&server)
        .await;

    Mock::given(method("MKCOL"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("MOVE"))
        .and(header("Overwrite", "T"))
        .respond_with(ResponseTemplate::new(201).append_header("OC-ETag", "\"done\""))
        .mount(&server)
        .await;

    let session = client.create_transfer(&rel("big.bin"), 50).await.unwrap();
    client
        .upload_chunk(&session, 0, Bytes::from(vec![1u8; 50]), None)
        .await
        .unwrap();
    let outcome = client
        .finalize_transfer(
            &session,
            &rel("big.bin"),
            FinalizeArgs {
                total_size: 50,
                if_match: None,
                mtime: None,
                checksum: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.etag.as_str(), "done");
}
