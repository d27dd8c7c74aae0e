//! Package inspector: reads identity and version metadata from an archive.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::virt::package::PackageMetadata;

/// Parses package archives. Returns `None` for archives it cannot read.
pub trait PackageInspector: Send + Sync {
    fn parse_archive(&self, path: &Path) -> Option<PackageMetadata>;
}

/// Inspector that reads a JSON manifest stored next to the archive.
///
/// For `app.pkg` the manifest is `app.pkg.json`; for a stored
/// `base-archive` it is `base-archive.json`. Required field: `package_id`.
///
/// ```json
/// {"package_id": "com.demo.app", "display_name": "Demo", "version_name": "1.0", "version_code": 1}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestInspector;

impl ManifestInspector {
    pub fn manifest_path(archive: &Path) -> PathBuf {
        let mut name = archive.as_os_str().to_os_string();
        name.push(".json");
        PathBuf::from(name)
    }

    fn read(&self, archive: &Path) -> Result<PackageMetadata> {
        if !archive.is_file() {
            anyhow::bail!("Archive not found: {}", archive.display());
        }
        let manifest = Self::manifest_path(archive);
        let content = std::fs::read_to_string(&manifest)
            .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;
        let metadata: PackageMetadata = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", manifest.display()))?;
        if metadata.package_id.trim().is_empty() {
            anyhow::bail!("Manifest {} has an empty package_id", manifest.display());
        }
        Ok(metadata)
    }
}

impl PackageInspector for ManifestInspector {
    fn parse_archive(&self, path: &Path) -> Option<PackageMetadata> {
        match self.read(path) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::debug!("Archive {} is not parseable: {:#}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_sidecar_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.pkg");
        std::fs::write(&archive, "payload").unwrap();
        std::fs::write(
            dir.path().join("demo.pkg.json"),
            r#"{"package_id": "com.demo.app", "display_name": "Demo", "version_name": "1.0", "version_code": 1}"#,
        )
        .unwrap();

        let metadata = ManifestInspector.parse_archive(&archive).unwrap();
        assert_eq!(metadata.package_id, "com.demo.app");
        assert_eq!(metadata.version_code, 1);
    }

    #[test]
    fn test_optional_fields_default() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.pkg");
        std::fs::write(&archive, "payload").unwrap();
        std::fs::write(dir.path().join("demo.pkg.json"), r#"{"package_id": "com.demo.app"}"#).unwrap();

        let metadata = ManifestInspector.parse_archive(&archive).unwrap();
        assert_eq!(metadata.version_code, 0);
        assert!(metadata.display_name.is_empty());
    }

    #[test]
    fn test_unparsable_archives() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("demo.pkg");
        assert!(ManifestInspector.parse_archive(&archive).is_none());

        std::fs::write(&archive, "payload").unwrap();
        assert!(ManifestInspector.parse_archive(&archive).is_none());

        std::fs::write(dir.path().join("demo.pkg.json"), "{ not json").unwrap();
        assert!(ManifestInspector.parse_archive(&archive).is_none());

        std::fs::write(dir.path().join("demo.pkg.json"), r#"{"package_id": " "}"#).unwrap();
        assert!(ManifestInspector.parse_archive(&archive).is_none());
    }
}
