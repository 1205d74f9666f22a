//! Release archive download.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use url::Url;

use crate::error::{ConvergeError, IoContext, Result};

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Something that can stream the bytes behind a URL.
pub trait Fetcher {
    /// Write the body of `url` into `sink`, returning the byte count.
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64>;
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TOTAL_TIMEOUT)
            .user_agent(concat!("promtail-converge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConvergeError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ConvergeError::Transport(format!("GET {} failed: {}", url, e)))?;

        response
            .copy_to(sink)
            .map_err(|e| ConvergeError::Transport(format!("reading {} failed: {}", url, e)))
    }
}

/// Download `url` into `dest`, removing the partial file on failure.
pub(crate) fn download_to(fetcher: &dyn Fetcher, url: &Url, dest: &Path) -> Result<u64> {
    let mut file = fs::File::create(dest).at(dest)?;
    let result = fetcher.fetch(url, &mut file).and_then(|n| {
        file.sync_all().at(dest)?;
        Ok(n)
    });
    if result.is_err() {
        drop(file);
        let _ = fs::remove_file(dest);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Fetcher for Failing {
        fn fetch(&self, _url: &Url, sink: &mut dyn Write) -> Result<u64> {
            sink.write_all(b"partial").map_err(|e| ConvergeError::Transport(e.to_string()))?;
            Err(ConvergeError::Transport("connection reset".into()))
        }
    }

    #[test]
    fn failed_download_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("promtail.zip");
        let url = Url::parse("https://example.com/v1/promtail.zip").unwrap();

        let err = download_to(&Failing, &url, &dest).unwrap_err();
        assert!(matches!(err, ConvergeError::Transport(_)));
        assert!(!dest.exists());
    }
}
