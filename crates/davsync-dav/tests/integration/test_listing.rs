//! Listing, capabilities and error-mapping tests.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use davsync_core::domain::{ItemKind, RelativePath};
use davsync_core::ports::{CredentialProvider, RemoteClient, RemoteError};

use crate::common::{root_multistatus, setup, FILES_BASE};

#[tokio::test]
async fn test_list_directory_maps_entries() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("PROPFIND"))
        .and(path(format!("{FILES_BASE}/")))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_string(root_multistatus()))
        .mount(&server)
        .await;

    let listing = client.list_directory(&RelativePath::root()).await.unwrap();

    assert!(listing.directory.path.is_root());
    assert_eq!(listing.directory.etag.as_str(), "root-etag");
    assert_eq!(listing.entries.len(), 2);

    let file = &listing.entries[0];
    assert_eq!(file.path.as_str(), "a.txt");
    assert_eq!(file.kind, ItemKind::File);
    assert_eq!(file.size, 10);
    assert_eq!(file.etag.as_str(), "etag-a");
    assert_eq!(file.file_id.as_str(), "id-a");
    assert!(file.mtime.is_some());

    let dir = &listing.entries[1];
    assert_eq!(dir.path.as_str(), "docs");
    assert_eq!(dir.kind, ItemKind::Directory);
    // directories report their recursive size
    assert_eq!(dir.size, 2048);
}

#[tokio::test]
async fn test_root_etag_uses_depth_zero() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("PROPFIND"))
        .and(path(format!("{FILES_BASE}/")))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(root_multistatus()))
        .mount(&server)
        .await;

    let etag = client.root_etag().await.unwrap();
    assert_eq!(etag.as_str(), "root-etag");
}

#[tokio::test]
async fn test_capabilities_fetch_and_cache() {
    let (server, _creds, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/ocs/v1.php/cloud/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ocs": { "data": { "capabilities": {
                "core": { "pollinterval": 30000 },
                "dav": { "chunking": "1.0", "resumableUpload": false, "reports": [] },
                "files": { "bigfilechunking": true, "privateLinks": false },
                "checksums": { "supportedTypes": ["SHA256"] }
            }}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let first = client.capabilities().await.unwrap();
    assert!(first.chunking_ng.enabled);
    assert!(first.big_file_chunking);

    // second call must come from the session cache (expect(1) above)
    let second = client.capabilities().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_401_invalidates_credentials() {
    let (server, creds, client) = setup().await;

    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client.root_etag().await.unwrap_err();
    assert!(matches!(err, RemoteError::Unauthorized));
    assert!(!creds.is_valid());
}

#[tokio::test]
async fn test_status_mapping() {
    let (server, _creds, client) = setup().await;

    for (status, check) in [
        (404, RemoteError::NotFound(String::new())),
        (423, RemoteError::Locked { retry_after: None }),
        (507, RemoteError::InsufficientStorage),
    ] {
        server.reset().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let err = client
            .delete(&RelativePath::new("x.txt").unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            std::mem::discriminant(&err),
            std::mem::discriminant(&check),
            "status {status} mapped to {err:?}"
        );
    }
}
