//! Maps model references to local files, downloading on cache miss

use crate::cache::ModelCache;
use crate::download::Downloader;
use crate::error::ModelError;
use crate::registry::{filename_from_url, is_remote_url, lookup_alias};
use crate::types::{ModelSource, ResolvedModel};
use std::path::Path;
use tracing::info;

pub struct ModelResolver {
    cache: ModelCache,
    downloader: Downloader,
}

impl ModelResolver {
    pub fn new(cache: ModelCache, downloader: Downloader) -> Self {
        Self { cache, downloader }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Decide what `reference` points at without touching the network
    ///
    /// A reference ending in `.gguf` is a path when that file exists and a
    /// cache entry otherwise. Aliases win over URLs.
    pub fn classify(&self, reference: &str) -> Result<ModelSource, ModelError> {
        if reference.ends_with(".gguf") && !is_remote_url(reference) {
            let path = Path::new(reference);
            if path.is_file() {
                return Ok(ModelSource::LocalFile(path.to_path_buf()));
            }
            if reference.contains('/') || reference.contains('\\') {
                return Err(ModelError::not_found(format!(
                    "{} does not exist",
                    reference
                )));
            }
            return Ok(ModelSource::Cached {
                name: reference.to_string(),
            });
        }
        if let Some(alias) = lookup_alias(reference) {
            return Ok(ModelSource::Remote {
                url: alias.url.to_string(),
                alias: Some(alias.name.to_string()),
            });
        }
        if is_remote_url(reference) {
            return Ok(ModelSource::Remote {
                url: reference.to_string(),
                alias: None,
            });
        }
        Err(ModelError::not_found(format!(
            "'{}' is not a .gguf file, known alias or URL",
            reference
        )))
    }

    /// Resolve `reference` to a file on disk
    pub async fn resolve(&self, reference: &str) -> Result<ResolvedModel, ModelError> {
        match self.classify(reference)? {
            ModelSource::LocalFile(path) => Ok(ResolvedModel {
                path: path.clone(),
                source: ModelSource::LocalFile(path),
                cache_hit: true,
            }),
            ModelSource::Cached { name } => {
                let path = self.cache.path_for(&name)?;
                if !path.is_file() {
                    return Err(ModelError::not_found(format!(
                        "{} is not in {}",
                        name,
                        self.cache.root().display()
                    )));
                }
                Ok(ResolvedModel {
                    path,
                    source: ModelSource::Cached { name },
                    cache_hit: true,
                })
            }
            ModelSource::Remote { url, alias } => self.fetch(url, alias).await,
        }
    }

    /// Download an alias or URL into the cache, reusing an existing copy
    pub async fn pull(&self, reference: &str) -> Result<ResolvedModel, ModelError> {
        match self.classify(reference)? {
            ModelSource::Remote { url, alias } => self.fetch(url, alias).await,
            _ => Err(ModelError::not_found(format!(
                "'{}' is not a known alias or URL",
                reference
            ))),
        }
    }

    async fn fetch(&self, url: String, alias: Option<String>) -> Result<ResolvedModel, ModelError> {
        let name = filename_from_url(&url)?;
        let path = self.cache.path_for(&name)?;
        let cache_hit = path.is_file();

        if cache_hit {
            info!("using cached {}", path.display());
        } else {
            self.cache.ensure_dir().await?;
            info!("{} not cached, downloading {}", name, url);
            self.downloader.download(&url, &path).await?;
        }

        Ok(ResolvedModel {
            path,
            source: ModelSource::Remote { url, alias },
            cache_hit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadOptions;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn resolver(root: &Path) -> ModelResolver {
        let options = DownloadOptions {
            show_progress: false,
            ..Default::default()
        };
        ModelResolver::new(ModelCache::new(root), Downloader::new(options).unwrap())
    }

    #[tokio::test]
    async fn test_existing_path_is_used_directly() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("local.gguf");
        std::fs::write(&file, b"x").unwrap();

        let resolved = resolver(&dir.path().join("cache"))
            .resolve(file.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(resolved.path, file);
        assert!(matches!(resolved.source, ModelSource::LocalFile(_)));
    }

    #[tokio::test]
    async fn test_bare_name_reads_from_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cached-model.gguf"), b"x").unwrap();
        let r = resolver(dir.path());

        let resolved = r.resolve("cached-model.gguf").await.unwrap();
        assert_eq!(resolved.path, dir.path().join("cached-model.gguf"));
        assert!(resolved.cache_hit);

        assert!(matches!(
            r.resolve("absent-model.gguf").await,
            Err(ModelError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_alias_cache_hit_skips_download() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Phi-3-mini-4k-instruct-q4.gguf"), b"x").unwrap();

        let resolved = resolver(dir.path()).resolve("phi-3-mini-4k").await.unwrap();
        assert!(resolved.cache_hit);
        assert_eq!(
            resolved.source,
            ModelSource::Remote {
                url: lookup_alias("phi-3-mini-4k").unwrap().url.to_string(),
                alias: Some("phi-3-mini-4k".to_string()),
            }
        );
        assert!(logs_contain("using cached"));
    }

    #[test]
    fn test_unknown_reference() {
        let dir = TempDir::new().unwrap();
        let r = resolver(dir.path());
        assert!(matches!(r.classify("mystery"), Err(ModelError::NotFound(_))));
        assert!(matches!(
            r.classify("/no/such/dir/model.gguf"),
            Err(ModelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_requires_remote() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();
        assert!(matches!(
            resolver(dir.path()).pull("a.gguf").await,
            Err(ModelError::NotFound(_))
        ));
    }

    #[test]
    fn test_url_classification() {
        let dir = TempDir::new().unwrap();
        let source = resolver(dir.path())
            .classify("https://example.com/files/model.gguf")
            .unwrap();
        assert_eq!(
            source,
            ModelSource::Remote {
                url: "https://example.com/files/model.gguf".to_string(),
                alias: None
            }
        );
    }
}
