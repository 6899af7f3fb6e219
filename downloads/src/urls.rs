//! URL helpers shared by the download manager and the engine coordinator.

use std::path::{Path, PathBuf};

const DEFAULT_FILENAME: &str = "downloaded_model.gguf";

/// Whether a string is an HTTP or HTTPS URL.
pub fn is_valid_url(candidate: &str) -> bool {
    match reqwest::Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Extract the filename component of a URL, ignoring query and fragment.
pub fn extract_filename_from_url(url: &str) -> String {
    let name = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
                .map(str::to_string)
        })
        .unwrap_or_default();

    if name.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        name
    }
}

/// Deterministic local path for a URL inside the models directory.
pub fn generate_download_path(models_dir: &Path, url: &str) -> PathBuf {
    models_dir.join(extract_filename_from_url(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation_accepts_http_and_https_only() {
        assert!(is_valid_url("https://example.test/models/m.gguf"));
        assert!(is_valid_url("http://example.test/m.gguf"));
        assert!(!is_valid_url("ftp://example.test/m.gguf"));
        assert!(!is_valid_url("/local/path/m.gguf"));
        assert!(!is_valid_url("not a url"));
    }

    #[test]
    fn filename_extraction_strips_query_and_fragment() {
        assert_eq!(
            extract_filename_from_url("https://example.test/a/b/model.gguf?download=1#top"),
            "model.gguf"
        );
        assert_eq!(
            extract_filename_from_url("https://example.test/model.gguf"),
            "model.gguf"
        );
    }

    #[test]
    fn filename_extraction_falls_back_for_bare_hosts() {
        assert_eq!(extract_filename_from_url("https://example.test/"), DEFAULT_FILENAME);
        assert_eq!(extract_filename_from_url("https://example.test"), DEFAULT_FILENAME);
    }

    #[test]
    fn download_path_lands_in_models_dir() {
        let path = generate_download_path(Path::new("/data/models"), "https://h.test/q/m.gguf");
        assert_eq!(path, PathBuf::from("/data/models/m.gguf"));
    }
}
