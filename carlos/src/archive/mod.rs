//! Packs a recording's output directory into `<id>.tar.gz`.
//!
//! The directory listing is authoritative: whatever files exist when the
//! archiver runs are packed, flat, under their original names. The archive is
//! written next to its destination as `<name>.part` and renamed into place, so
//! a reader never sees a half-written artifact.

use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::Builder as TarBuilder;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Result of one archive run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Names packed, in archive order.
    pub files: Vec<String>,
    /// Names listed but not readable.
    pub skipped: Vec<String>,
    /// The output directory did not exist; the archive is empty.
    pub missing_directory: bool,
    pub input_bytes: u64,
    pub archive_bytes: u64,
}

impl ArchiveSummary {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && !self.missing_directory
    }
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_output_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!("Skipping non UTF-8 file name {:?}", raw),
        }
    }
    names.sort();
    Ok(names)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn write_archive(
    dir: &Path,
    part: &Path,
    names: &[String],
    summary: &mut ArchiveSummary,
) -> Result<()> {
    let file = File::create(part)
        .map_err(|e| Error::Archive(format!("failed to create {}: {}", part.display(), e)))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut tar = TarBuilder::new(encoder);

    for name in names {
        let path = dir.join(name);
        let mut input = match File::open(&path) {
            Ok(input) => input,
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", path.display(), e);
                summary.skipped.push(name.clone());
                continue;
            }
        };
        summary.input_bytes += input.metadata().map(|m| m.len()).unwrap_or(0);

        debug!("Adding to tar.gz: {}", name);
        tar.append_file(name, &mut input)
            .map_err(|e| Error::Archive(format!("failed to add {}: {}", name, e)))?;
        summary.files.push(name.clone());
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| Error::Archive(format!("failed to finalize tar: {}", e)))?;
    let writer = encoder
        .finish()
        .map_err(|e| Error::Archive(format!("failed to finalize gzip: {}", e)))?;
    writer
        .into_inner()
        .map_err(|e| Error::Archive(format!("failed to flush archive: {}", e.error())))?
        .sync_all()?;
    Ok(())
}

/// Pack `names` (relative to `dir`) into `dest`.
///
/// Unreadable files are skipped and reported in the summary. Any write error
/// removes the partial file and fails the whole archive.
pub fn create_archive(dir: &Path, dest: &Path, names: &[String]) -> Result<ArchiveSummary> {
    let mut summary = ArchiveSummary {
        path: dest.to_path_buf(),
        ..Default::default()
    };

    let part = part_path(dest);
    if let Err(e) = write_archive(dir, &part, names, &mut summary) {
        let _ = std::fs::remove_file(&part);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&part, dest) {
        let _ = std::fs::remove_file(&part);
        return Err(Error::Archive(format!(
            "failed to move archive into place at {}: {}",
            dest.display(),
            e
        )));
    }

    summary.archive_bytes = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    Ok(summary)
}

/// List `dir` and archive it to `dest` on the blocking pool.
///
/// A missing directory yields an empty archive flagged in the summary.
pub async fn archive_directory(dir: PathBuf, dest: PathBuf) -> Result<ArchiveSummary> {
    tokio::task::spawn_blocking(move || {
        let (names, missing_directory) = match list_output_files(&dir) {
            Ok(names) => (names, false),
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!("Output directory {} does not exist", dir.display());
                (Vec::new(), true)
            }
            Err(e) => return Err(e),
        };

        let mut summary = create_archive(&dir, &dest, &names)?;
        summary.missing_directory = missing_directory;
        info!(
            "Archived {} file(s) from {} into {} ({} -> {} bytes)",
            summary.files.len(),
            dir.display(),
            dest.display(),
            summary.input_bytes,
            summary.archive_bytes
        );
        Ok(summary)
    })
    .await
    .map_err(|e| Error::Archive(format!("archive task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn read_back(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_listing_is_sorted_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.iq"), b"b").unwrap();
        std::fs::write(dir.path().join("a.iq"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(list_output_files(dir.path()).unwrap(), vec!["a.iq", "b.iq"]);
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("7");
        std::fs::create_dir(&out).unwrap();

        let mut expected = BTreeMap::new();
        for (i, name) in ["7-179.0-44.0.iq", "7-179.0-45.0.iq", "7-181.0-44.0.iq"]
            .into_iter()
            .enumerate()
        {
            let data: Vec<u8> = (0..4096u32).map(|b| (b * 31 + i as u32) as u8).collect();
            std::fs::write(out.join(name), &data).unwrap();
            expected.insert(name.to_string(), data);
        }

        let dest = dir.path().join("7.tar.gz");
        let names = list_output_files(&out).unwrap();
        let summary = create_archive(&out, &dest, &names).unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.files.len(), 3);
        assert_eq!(summary.input_bytes, 3 * 4096);
        assert!(summary.archive_bytes > 0);
        assert_eq!(read_back(&dest), expected);
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_missing_listed_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.iq"), b"data").unwrap();
        let dest = dir.path().join("out.tar.gz");

        let names = vec!["gone.iq".to_string(), "present.iq".to_string()];
        let summary = create_archive(dir.path(), &dest, &names).unwrap();

        assert_eq!(summary.skipped, vec!["gone.iq"]);
        assert!(!summary.is_complete());
        assert_eq!(read_back(&dest).keys().collect::<Vec<_>>(), vec!["present.iq"]);
    }

    #[test]
    fn test_unwritable_destination_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("no-such-dir").join("1.tar.gz");
        assert!(matches!(
            create_archive(dir.path(), &dest, &[]),
            Err(Error::Archive(_))
        ));
        assert!(!dest.exists());
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/rec/12.tar.gz")),
            PathBuf::from("/rec/12.tar.gz.part")
        );
    }

    #[tokio::test]
    async fn test_missing_directory_gives_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("9.tar.gz");

        let summary = archive_directory(dir.path().join("9"), dest.clone())
            .await
            .unwrap();

        assert!(summary.missing_directory);
        assert!(summary.files.is_empty());
        assert!(read_back(&dest).is_empty());
    }

    #[tokio::test]
    async fn test_archive_directory_packs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("3");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("3-0.0-0.0.iq"), vec![1u8; 10]).unwrap();

        let summary = archive_directory(out, dir.path().join("3.tar.gz"))
            .await
            .unwrap();
        assert_eq!(summary.files, vec!["3-0.0-0.0.iq"]);
        assert!(summary.is_complete());
    }
}
