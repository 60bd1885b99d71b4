//! On-disk state of transfers: partial files on the receiving side, offset markers for
//!  interrupted uploads on the client, and the server's storage directory.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use anyhow::Context;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use crate::error::TransferError;
use crate::transfer::align_down;

/// The receiver writes into `<final name><suffix>` and renames the file to its final name only
///  after the whole transfer succeeded, so a failed transfer never touches a completed file of
///  the same name.
pub struct PartialFile {
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

impl PartialFile {
    pub fn partial_path_for(final_path: &Path, suffix: &str) -> PathBuf {
        let mut name = final_path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Opens the partial file for `final_path` to continue writing at `offset`. Offset 0 starts
    ///  from scratch. A positive offset must not exceed what is stored in the partial file, and
    ///  anything after it is discarded.
    pub async fn open_at(final_path: &Path, suffix: &str, offset: u64) -> anyhow::Result<PartialFile> {
        let partial_path = Self::partial_path_for(final_path, suffix);

        if offset > 0 {
            let durable_len = Self::stored_len(&partial_path).await?;
            if offset > durable_len {
                return Err(TransferError::InvalidOffset {
                    offset,
                    reason: format!("only {} bytes were stored before", durable_len),
                }.into());
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&partial_path).await
            .map_err(|e| TransferError::io(&partial_path, e))?;
        file.set_len(offset).await
            .map_err(|e| TransferError::io(&partial_path, e))?;
        file.seek(SeekFrom::Start(offset)).await
            .map_err(|e| TransferError::io(&partial_path, e))?;

        debug!("opened partial file {:?} at offset {}", partial_path, offset);
        Ok(PartialFile {
            final_path: final_path.to_path_buf(),
            partial_path,
            writer: BufWriter::new(file),
            len: offset,
        })
    }

    /// The offset at which a download into `final_path` can be resumed: the partial file's
    ///  length, rounded down to a chunk boundary
    pub async fn resume_offset(final_path: &Path, suffix: &str, chunk_size: usize) -> anyhow::Result<u64> {
        let partial_path = Self::partial_path_for(final_path, suffix);
        Ok(align_down(Self::stored_len(&partial_path).await?, chunk_size))
    }

    pub async fn remove(final_path: &Path, suffix: &str) -> anyhow::Result<()> {
        let partial_path = Self::partial_path_for(final_path, suffix);
        remove_if_exists(&partial_path).await
    }

    async fn stored_len(partial_path: &Path) -> anyhow::Result<u64> {
        match fs::metadata(partial_path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(TransferError::io(partial_path, e).into()),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub async fn write_chunk(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(payload).await
            .map_err(|e| TransferError::io(&self.partial_path, e))?;
        self.len += payload.len() as u64;
        Ok(())
    }

    /// Hands everything written so far to the OS, so it is on disk if this process dies. Called
    ///  before acknowledging chunks: the peer resumes from the acknowledged length, which must
    ///  never exceed the partial file's length.
    pub async fn flush_buffered(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await
            .map_err(|e| TransferError::io(&self.partial_path, e))?;
        Ok(())
    }

    /// Makes everything written so far durable, including against power loss
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await
            .map_err(|e| TransferError::io(&self.partial_path, e))?;
        self.writer.get_ref().sync_data().await
            .map_err(|e| TransferError::io(&self.partial_path, e))?;
        Ok(())
    }

    /// Renames the partial file to its final name, replacing an existing file. Returns the
    ///  file's size.
    pub async fn promote(mut self) -> anyhow::Result<u64> {
        self.flush().await?;
        let PartialFile { final_path, partial_path, writer, len } = self;
        drop(writer);

        fs::rename(&partial_path, &final_path).await
            .with_context(|| format!("renaming {:?} to {:?}", partial_path, final_path))?;
        debug!("promoted {:?} to {:?}", partial_path, final_path);
        Ok(len)
    }
}

/// Offset record of an interrupted upload, stored next to the local file as decimal text. It
///  holds the number of bytes the server acknowledged.
pub struct UploadMarker {
    path: PathBuf,
}

impl UploadMarker {
    pub fn for_file(local_file: &Path, suffix: &str) -> UploadMarker {
        UploadMarker {
            path: PartialFile::partial_path_for(local_file, suffix),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns 0 if there is no marker or it can not be parsed
    pub async fn read(&self) -> anyhow::Result<u64> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(TransferError::io(&self.path, e).into()),
        };

        match content.trim().parse::<u64>() {
            Ok(offset) => Ok(offset),
            Err(_) => {
                warn!("upload marker {:?} is corrupt, starting from scratch", self.path);
                Ok(0)
            }
        }
    }

    pub async fn write(&self, offset: u64) -> anyhow::Result<()> {
        fs::write(&self.path, offset.to_string()).await
            .map_err(|e| TransferError::io(&self.path, e))?;
        debug!("recorded upload offset {} in {:?}", offset, self.path);
        Ok(())
    }

    pub async fn remove(&self) -> anyhow::Result<()> {
        remove_if_exists(&self.path).await
    }
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::io(path, e).into()),
    }
}

/// Resolves a filename received from a peer inside the server's storage directory. Only plain
///  file names are accepted.
pub fn resolve_in_storage(storage_dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let is_plain = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0'])
        && !Path::new(filename).is_absolute();

    if !is_plain {
        return Err(TransferError::InvalidFilename(filename.to_string()));
    }
    Ok(storage_dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("a.txt", true)]
    #[case::spaces("my file.txt", true)]
    #[case::dots_inside("a..b", true)]
    #[case::empty("", false)]
    #[case::dot(".", false)]
    #[case::parent("..", false)]
    #[case::traversal("../etc/passwd", false)]
    #[case::absolute("/etc/passwd", false)]
    #[case::subdir("dir/a.txt", false)]
    #[case::backslash("dir\\a.txt", false)]
    fn test_resolve_in_storage(#[case] filename: &str, #[case] valid: bool) {
        let resolved = resolve_in_storage(Path::new("/storage"), filename);
        assert_eq!(resolved.is_ok(), valid);
        if let Ok(path) = resolved {
            assert_eq!(path, Path::new("/storage").join(filename));
        }
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(PartialFile::partial_path_for(Path::new("/x/a.bin"), ".part"), Path::new("/x/a.bin.part"));
    }

    #[tokio::test]
    async fn test_write_and_promote() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("a.bin");
        fs::write(&final_path, b"old content").await.unwrap();

        let mut partial = PartialFile::open_at(&final_path, ".part", 0).await.unwrap();
        partial.write_chunk(b"abc").await.unwrap();
        partial.write_chunk(b"de").await.unwrap();
        assert_eq!(partial.len(), 5);

        // the completed file is untouched until promotion
        assert_eq!(fs::read(&final_path).await.unwrap(), b"old content");

        assert_eq!(partial.promote().await.unwrap(), 5);
        assert_eq!(fs::read(&final_path).await.unwrap(), b"abcde");
        assert!(!dir.path().join("a.bin.part").exists());
    }

    #[rstest]
    #[case::truncates(10, 4, Some(b"0123".to_vec()))]
    #[case::whole(10, 10, Some(b"0123456789".to_vec()))]
    #[case::restart(10, 0, Some(vec![]))]
    #[case::beyond_stored(10, 11, None)]
    #[tokio::test]
    async fn test_open_at(#[case] stored: usize, #[case] offset: u64, #[case] expected: Option<Vec<u8>>) {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("b.bin");
        let partial_path = dir.path().join("b.bin.part");
        fs::write(&partial_path, &b"0123456789"[..stored]).await.unwrap();

        match PartialFile::open_at(&final_path, ".part", offset).await {
            Ok(mut partial) => {
                assert_eq!(partial.len(), offset);
                partial.flush().await.unwrap();
                assert_eq!(Some(fs::read(&partial_path).await.unwrap()), expected);
            }
            Err(e) => {
                assert!(expected.is_none());
                assert!(matches!(e.downcast_ref::<TransferError>(), Some(TransferError::InvalidOffset { .. })));
            }
        }
    }

    #[tokio::test]
    async fn test_open_at_missing_partial_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let result = PartialFile::open_at(&dir.path().join("c.bin"), ".part", 1400).await;
        assert!(result.is_err());
    }

    #[rstest]
    #[case::missing(None, 0)]
    #[case::short(Some(1000), 0)]
    #[case::aligned(Some(2800), 2800)]
    #[case::unaligned(Some(3000), 2800)]
    #[tokio::test]
    async fn test_resume_offset(#[case] stored: Option<usize>, #[case] expected: u64) {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("d.bin");
        if let Some(stored) = stored {
            fs::write(dir.path().join("d.bin.part"), vec![7u8; stored]).await.unwrap();
        }
        assert_eq!(PartialFile::resume_offset(&final_path, ".part", 1400).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_upload_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = UploadMarker::for_file(&dir.path().join("e.bin"), ".upload-offset");
        assert_eq!(marker.path(), dir.path().join("e.bin.upload-offset"));

        assert_eq!(marker.read().await.unwrap(), 0);
        marker.write(4200).await.unwrap();
        assert_eq!(marker.read().await.unwrap(), 4200);

        fs::write(marker.path(), "garbage").await.unwrap();
        assert_eq!(marker.read().await.unwrap(), 0);

        marker.remove().await.unwrap();
        assert!(!marker.path().exists());
        marker.remove().await.unwrap();
    }
}
