//! Certificates read from PEM files on disk.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::tls::provider::{CertProvider, CertSource, Polled, ProviderError};
use crate::tls::PemBundle;

pub type FileProvider = CertProvider<FileSource>;

/// A certificate and key file, plus an optional CA bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
}

impl FileSource {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
        }
    }

    pub fn with_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    async fn stamps(&self) -> Result<Stamps, ProviderError> {
        let ca = match &self.ca_path {
            Some(path) => Some(modified(path).await?),
            None => None,
        };
        Ok(Stamps {
            cert: modified(&self.cert_path).await?,
            key: modified(&self.key_path).await?,
            ca,
        })
    }

    async fn read(&self) -> Result<PemBundle, ProviderError> {
        let mut pem = PemBundle::new(read(&self.cert_path).await?, read(&self.key_path).await?);
        if let Some(path) = &self.ca_path {
            pem = pem.with_ca(read(path).await?);
        }
        Ok(pem)
    }
}

/// Modification times of each file, compared independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamps {
    cert: SystemTime,
    key: SystemTime,
    ca: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct FileMark {
    stamps: Stamps,
    pem: PemBundle,
}

#[async_trait]
impl CertSource for FileSource {
    type Mark = FileMark;

    fn describe(&self) -> String {
        format!("file:{}", self.cert_path.display())
    }

    async fn poll(&self, last: Option<&FileMark>) -> Result<Polled<FileMark>, ProviderError> {
        let stamps = self.stamps().await?;
        if last.is_some_and(|last| last.stamps == stamps) {
            return Ok(Polled::Unchanged);
        }

        let pem = self.read().await?;
        let unchanged = last.is_some_and(|last| last.pem == pem);
        let mark = FileMark { stamps, pem };
        if unchanged {
            Ok(Polled::Touched(mark))
        } else {
            Ok(Polled::Changed(mark.pem.clone(), mark))
        }
    }
}

async fn modified(path: &Path) -> Result<SystemTime, ProviderError> {
    let read_error = |source: std::io::Error| ProviderError::Read {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map_err(read_error)
}

async fn read(path: &Path) -> Result<Vec<u8>, ProviderError> {
    tokio::fs::read(path).await.map_err(|source| ProviderError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::self_signed;
    use crate::tls::updater::tests::RecordingUpdater;
    use crate::tls::CertManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn write_pair(dir: &Path, names: &[&str]) -> FileSource {
        let (cert, key) = self_signed(names);
        let source = FileSource::new(dir.join("tls.crt"), dir.join("tls.key"));
        std::fs::write(&source.cert_path, cert).unwrap();
        std::fs::write(&source.key_path, key).unwrap();
        source
    }

    fn touch(path: &Path, at: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(at).unwrap();
    }

    #[tokio::test]
    async fn detects_content_changes_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pair(dir.path(), &["one.test"]);

        let first = source.poll(None).await.unwrap();
        let Polled::Changed(pem, mark) = first else {
            panic!("first poll must read the files");
        };
        assert!(pem.key.is_some());
        assert!(matches!(source.poll(Some(&mark)).await.unwrap(), Polled::Unchanged));

        // same bytes, newer timestamp
        let later = SystemTime::now() + Duration::from_secs(60);
        touch(&source.cert_path, later);
        let Polled::Touched(mark) = source.poll(Some(&mark)).await.unwrap() else {
            panic!("touched file with identical content");
        };

        let (cert, key) = self_signed(&["two.test"]);
        std::fs::write(&source.cert_path, cert).unwrap();
        std::fs::write(&source.key_path, key).unwrap();
        let even_later = later + Duration::from_secs(60);
        touch(&source.cert_path, even_later);
        touch(&source.key_path, even_later);
        assert!(matches!(
            source.poll(Some(&mark)).await.unwrap(),
            Polled::Changed(_, _)
        ));
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pair(dir.path(), &["ca.test"]).with_ca(dir.path().join("missing.pem"));
        let err = source.poll(None).await.unwrap_err();
        assert!(matches!(err, ProviderError::Read { ref path, .. } if path.ends_with("missing.pem")));
    }

    #[tokio::test]
    async fn provider_pushes_into_manager() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_pair(dir.path(), &["site.test"]);
        let manager = Arc::new(CertManager::new());
        let recorder = Arc::new(RecordingUpdater::default());
        manager.add_updater("recorder", recorder.clone()).unwrap();

        let provider = FileProvider::new("file", manager.clone(), Duration::from_secs(10));
        provider.track("site", source).unwrap();
        provider.refresh().await;
        provider.refresh().await;

        assert_eq!(recorder.events(), vec!["+site"]);
        assert!(manager.get("site").unwrap().matches_name("site.test"));
    }
}
