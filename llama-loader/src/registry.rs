//! Built-in model aliases and URL helpers

use crate::error::ModelError;

/// Short name for a well-known downloadable GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAlias {
    pub name: &'static str,
    pub url: &'static str,
}

pub const BUILTIN_ALIASES: &[ModelAlias] = &[
    ModelAlias {
        name: "qween3-1.7b",
        url: "https://huggingface.co/Qwen/Qwen3-1.7B-GGUF/resolve/main/Qwen3-1.7B-Q8_0.gguf",
    },
    ModelAlias {
        name: "phi-3-mini-4k",
        url: "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf/resolve/main/Phi-3-mini-4k-instruct-q4.gguf",
    },
];

pub fn lookup_alias(name: &str) -> Option<&'static ModelAlias> {
    BUILTIN_ALIASES.iter().find(|alias| alias.name == name)
}

pub fn is_remote_url(reference: &str) -> bool {
    reference.starts_with("https://") || reference.starts_with("http://")
}

/// Local file name for a download URL: the last path segment without query or fragment
pub fn filename_from_url(url: &str) -> Result<String, ModelError> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let path = without_fragment.split('?').next().unwrap_or(without_fragment);
    let name = path.rsplit('/').next().unwrap_or(path);

    if name.is_empty() || name.contains("://") || name == ".." || name == "." {
        return Err(ModelError::not_found(format!(
            "cannot derive a file name from URL {}",
            url
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_aliases_resolve() {
        let alias = lookup_alias("phi-3-mini-4k").unwrap();
        assert!(alias.url.ends_with("Phi-3-mini-4k-instruct-q4.gguf"));
        assert!(lookup_alias("nope").is_none());
    }

    #[test]
    fn test_alias_urls_have_file_names() {
        for alias in BUILTIN_ALIASES {
            let name = filename_from_url(alias.url).unwrap();
            assert!(name.ends_with(".gguf"), "{}", name);
        }
    }

    #[rstest]
    #[case("https://host/a/b/model.gguf", "model.gguf")]
    #[case("https://host/model.gguf?download=true", "model.gguf")]
    #[case("https://host/dir/model.gguf#frag", "model.gguf")]
    #[case("model.gguf", "model.gguf")]
    fn test_filename_from_url(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(filename_from_url(url).unwrap(), expected);
    }

    #[rstest]
    #[case("https://host/dir/")]
    #[case("https://")]
    fn test_filename_from_url_rejects(#[case] url: &str) {
        assert!(filename_from_url(url).is_err());
    }

    #[test]
    fn test_is_remote_url() {
        assert!(is_remote_url("https://a/b.gguf"));
        assert!(is_remote_url("http://a/b.gguf"));
        assert!(!is_remote_url("b.gguf"));
    }
}
