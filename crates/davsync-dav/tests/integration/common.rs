//! Shared wiremock helpers for the DAV integration tests.

use std::sync::Arc;
use std::time::Duration;

use url::Url;
use wiremock::MockServer;

use davsync_core::ports::credentials::StaticCredentials;
use davsync_dav::DavClient;

/// Base path of alice's files collection on the mock server.
pub const FILES_BASE: &str = "/remote.php/dav/files/alice";

/// Base path of alice's upload sessions on the mock server.
pub const UPLOADS_BASE: &str = "/remote.php/dav/uploads/alice";

/// Starts a mock server and a client pointed at it.
pub async fn setup() -> (MockServer, Arc<StaticCredentials>, DavClient) {
    let server = MockServer::start().await;
    let credentials = Arc::new(StaticCredentials::basic("alice", "secret"));
    let client = DavClient::new(
        Url::parse(&server.uri()).unwrap(),
        "alice",
        credentials.clone(),
    )
    .unwrap()
    .with_timeouts(Duration::from_secs(5), Duration::from_secs(5));
    (server, credentials, client)
}

/// A depth-1 multistatus body for the root with one file and one folder.
pub fn root_multistatus() -> String {
    format!(
        r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>{base}/</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"root-etag"</d:getetag>
        <d:resourcetype><d:collection/></d:resourcetype>
        <oc:fileid>root-id</oc:fileid>
        <oc:permissions>RDNVCK</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>{base}/a.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"etag-a"</d:getetag>
        <d:getlastmodified>Mon, 15 Jun 2026 10:30:00 GMT</d:getlastmodified>
        <d:getcontentlength>10</d:getcontentlength>
        <d:resourcetype/>
        <oc:fileid>id-a</oc:fileid>
        <oc:permissions>RDNVW</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>{base}/docs/</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"etag-docs"</d:getetag>
        <d:resourcetype><d:collection/></d:resourcetype>
        <oc:fileid>id-docs</oc:fileid>
        <oc:permissions>RDNVCK</oc:permissions>
        <oc:size>2048</oc:size>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#,
        base = FILES_BASE
    )
}
