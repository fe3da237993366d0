use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_to(path: &Path, data: &[u8], gzip: bool) -> std::io::Result<()> {
    if gzip {
        let file = File::create(path)?;
        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        gz.write_all(data)?;
        gz.finish()?.flush()
    } else {
        fs::write(path, data)
    }
}

/// Writes a model artifact, gzip-compressed when `path` ends in `.gz`. The
/// blob lands in a sibling file first and is renamed into place.
pub fn save(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp = temp_path(path);
    // compression follows the destination name, not the temp sibling
    if let Err(e) = write_to(&tmp, data, is_gzip(path)) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

pub fn load(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    if !is_gzip(path) {
        return fs::read(path).map_err(|e| Error::io(path, e));
    }
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut gz = GzDecoder::new(BufReader::new(file));
    let mut bytes = Vec::new();
    gz.read_to_end(&mut bytes).map_err(|e| Error::io(path, e))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        save(&path, b"weights")?;
        assert_eq!(load(&path)?, b"weights");
        assert_eq!(fs::read(&path).unwrap(), b"weights");
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn gz_paths_are_compressed() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin.gz");
        let blob = vec![7u8; 4096];
        save(&path, &blob)?;
        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert!(raw.len() < blob.len());
        assert_eq!(load(&path)?, blob);
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn small_gz_artifact_is_readable() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin.gz");
        save(&path, b"weights")?;
        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert_eq!(load(&path)?, b"weights");
        Ok(())
    }

    #[test]
    fn overwrite_replaces_previous_artifact() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        save(&path, b"old")?;
        save(&path, b"new")?;
        assert_eq!(load(&path)?, b"new");
        Ok(())
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path().join("absent.gz")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
