//! End to end cache lifecycle against a local HTTP server

use llama_loader::{
    human_readable_size, DownloadOptions, Downloader, ModelCache, ModelError, ModelResolver,
    ModelSource,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BODY: &[u8] = b"GGUF fake weights for the cache lifecycle test";

async fn serve_model() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    BODY.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(BODY).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}/repo/resolve/main/tiny-q4.gguf?download=true", addr)
}

fn resolver(dir: &TempDir) -> ModelResolver {
    let downloader = Downloader::new(DownloadOptions {
        show_progress: false,
        ..Default::default()
    })
    .unwrap();
    ModelResolver::new(ModelCache::new(dir.path().join("models")), downloader)
}

#[tokio::test]
async fn test_pull_then_resolve_then_delete() {
    let url = serve_model().await;
    let dir = TempDir::new().unwrap();
    let resolver = resolver(&dir);

    let pulled = resolver.pull(&url).await.unwrap();
    assert!(!pulled.cache_hit);
    assert_eq!(pulled.file_name(), "tiny-q4.gguf");
    assert_eq!(std::fs::read(&pulled.path).unwrap(), BODY);

    let again = resolver.resolve(&url).await.unwrap();
    assert!(again.cache_hit);
    assert!(matches!(again.source, ModelSource::Remote { alias: None, .. }));

    let by_name = resolver.resolve("tiny-q4.gguf").await.unwrap();
    assert_eq!(by_name.path, pulled.path);

    let listed = resolver.cache().list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(human_readable_size(listed[0].size_bytes), format!("{}B", BODY.len()));

    resolver.cache().remove("tiny-q4.gguf").await.unwrap();
    assert!(matches!(
        resolver.resolve("tiny-q4.gguf").await,
        Err(ModelError::NotFound(_))
    ));
}
