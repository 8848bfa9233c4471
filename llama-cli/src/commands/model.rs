//! `avllm model ls|pull|del`

use crate::cli::ModelAction;
use crate::runtime::resolver;
use crate::table::new_table;
use anyhow::Result;
use comfy_table::Table;
use llama_loader::{human_readable_size, ModelCache, ModelResolver};

pub async fn run(action: ModelAction) -> Result<()> {
    match action {
        ModelAction::Ls => {
            let cache = ModelCache::from_env()?;
            println!("{}", list_table(&cache).await?);
        }
        ModelAction::Pull { reference } => {
            let resolver = resolver()?;
            pull(&resolver, &reference).await?;
        }
        ModelAction::Del { name } => {
            let cache = ModelCache::from_env()?;
            let path = cache.remove(&name).await?;
            println!("Deleted {}", path.display());
        }
    }
    Ok(())
}

/// Table of every model in `cache`
pub async fn list_table(cache: &ModelCache) -> Result<Table> {
    let mut table = new_table();
    table.set_header(vec!["Model path", "Size"]);
    for model in cache.list().await? {
        table.add_row(vec![
            model.path.display().to_string(),
            human_readable_size(model.size_bytes),
        ]);
    }
    Ok(table)
}

async fn pull(resolver: &ModelResolver, reference: &str) -> Result<()> {
    let resolved = resolver.pull(reference).await?;
    if resolved.cache_hit {
        println!("{} is already downloaded", resolved.path.display());
    } else {
        println!("Downloaded {}", resolved.path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_loader::{DownloadOptions, Downloader};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_table_shows_path_and_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), vec![0u8; 512]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a model").unwrap();

        let rendered = list_table(&ModelCache::new(dir.path())).await.unwrap().to_string();
        assert!(rendered.contains("Model path"));
        assert!(rendered.contains("tiny.gguf"));
        assert!(rendered.contains("512B"));
        assert!(!rendered.contains("notes.txt"));
    }

    #[tokio::test]
    async fn test_list_table_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path().join("absent"));
        let table = list_table(&cache).await.unwrap();
        assert_eq!(table.row_iter().count(), 0);
    }

    #[tokio::test]
    async fn test_pull_of_cached_url_skips_download() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("m.gguf"), b"gguf").unwrap();
        let downloader = Downloader::new(DownloadOptions {
            show_progress: false,
            ..DownloadOptions::default()
        })
        .unwrap();
        let resolver = ModelResolver::new(ModelCache::new(dir.path()), downloader);

        pull(&resolver, "https://example.invalid/models/m.gguf")
            .await
            .unwrap();
        assert!(pull(&resolver, "not-an-alias").await.is_err());
    }
}
