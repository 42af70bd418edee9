//! Tests for the remote cache client against a mock server.

use httpmock::prelude::*;
use httpmock::Method::HEAD;
use morph_cache::{CacheError, RemoteArtifactCache};
use morph_core::{ArtifactKind, CacheKey};

fn filename() -> String {
    morph_cache::artifact_filename(
        &CacheKey::compute(b"remote"),
        ArtifactKind::Chunk,
        "hello-runtime",
    )
}

#[tokio::test]
async fn head_reports_existing_artifact() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path("/1.0/artifacts")
                .query_param("filename", filename());
            then.status(200);
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    assert!(client.head(&filename()).await.unwrap());
    mock.assert_async().await;
}

#[tokio::test]
async fn head_maps_404_to_false_and_409_to_busy() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path("/1.0/artifacts")
                .query_param("filename", "absent");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path("/1.0/artifacts")
                .query_param("filename", "inflight");
            then.status(409);
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    assert!(!client.head("absent").await.unwrap());
    assert!(matches!(
        client.head("inflight").await.unwrap_err(),
        CacheError::Busy(_)
    ));
}

#[tokio::test]
async fn get_streams_artifact_bytes_into_a_writer() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/1.0/artifacts")
                .query_param("filename", filename());
            then.status(200).body("tar bytes");
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    let mut sink = std::io::Cursor::new(Vec::new());
    let written = client.get(&filename(), &mut sink).await.unwrap();
    assert_eq!(written, 9);
    assert_eq!(sink.get_ref().as_slice(), b"tar bytes");
}

#[tokio::test]
async fn get_missing_artifact_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/1.0/artifacts");
            then.status(404);
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    let mut sink = std::io::Cursor::new(Vec::new());
    assert!(matches!(
        client.get(&filename(), &mut sink).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
    assert!(sink.get_ref().is_empty());
}

#[tokio::test]
async fn upload_posts_multipart_and_maps_403() {
    let server = MockServer::start_async().await;
    let created = server
        .mock_async(|when, then| {
            when.method(POST).path("/1.0/artifacts");
            then.status(201);
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    client
        .upload(vec![(filename(), b"tar bytes".to_vec())])
        .await
        .unwrap();
    created.assert_async().await;

    let readonly = MockServer::start_async().await;
    readonly
        .mock_async(|when, then| {
            when.method(POST).path("/1.0/artifacts");
            then.status(403);
        })
        .await;
    let client = RemoteArtifactCache::new(&readonly.base_url()).unwrap();
    assert!(matches!(
        client
            .upload(vec![(filename(), b"tar bytes".to_vec())])
            .await
            .unwrap_err(),
        CacheError::WritesDisabled
    ));
}

#[tokio::test]
async fn fetch_from_composes_caches() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/1.0/fetch")
                .query_param("url", "http://shared/1.0/artifacts?filename=x");
            then.status(200);
        })
        .await;

    let client = RemoteArtifactCache::new(&server.base_url()).unwrap();
    client
        .fetch_from("http://shared/1.0/artifacts?filename=x")
        .await
        .unwrap();
    mock.assert_async().await;
}
