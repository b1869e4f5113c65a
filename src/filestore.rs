//! File system access of the engine.
//!
//! The engine reads source files, writes working files of inbound transactions and executes
//! filestore requests only through the [VirtualFilestore] trait, so it can run on top of
//! something other than the native file system.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use derive_new::new;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::tlv::FilestoreActionCode;
use spacepackets::cfdp::ChecksumType;

use crate::checksum::ChecksumAccumulator;

/// Status code reported for every filestore request following a failed one.
pub const STATUS_NOT_PERFORMED: u8 = 0b1111;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission denied")]
    Permission,
    #[error("is not a file")]
    IsNotFile,
    #[error("is not a directory")]
    IsNotDirectory,
    #[error("file ended after {found} of {expected} requested bytes")]
    ShortRead { expected: u64, found: u64 },
    #[error("IO error: {0}")]
    Io(io::Error),
    #[error("unsupported checksum type {0:?}")]
    UnsupportedChecksum(ChecksumType),
    #[error("checksum of out-of-order data can not be derived")]
    ChecksumUnavailable,
}

impl From<io::Error> for FilestoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FilestoreError::FileDoesNotExist,
            ErrorKind::AlreadyExists => FilestoreError::FileAlreadyExists,
            ErrorKind::PermissionDenied => FilestoreError::Permission,
            _ => FilestoreError::Io(e),
        }
    }
}

/// File system operations used by the engine. Paths are already resolved against the working
/// directory when they are passed in.
pub trait VirtualFilestore {
    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Create an empty file. Fails if the file exists.
    fn create_file(&self, path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, path: &str) -> Result<(), FilestoreError>;

    /// Drop all data of a file but keep the file.
    fn truncate_file(&self, path: &str) -> Result<(), FilestoreError>;

    fn create_dir(&self, path: &str) -> Result<(), FilestoreError>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &str) -> Result<(), FilestoreError>;

    /// Move a file. Fails if the target already exists.
    fn rename_file(&self, from: &str, to: &str) -> Result<(), FilestoreError>;

    /// Append the full content of `source` to `target`.
    fn append_file(&self, target: &str, source: &str) -> Result<(), FilestoreError>;

    /// Fill `buf` with the file content starting at `offset`.
    fn read_data(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<(), FilestoreError>;

    /// Write `data` at `offset`. Writing past the end extends the file.
    fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError>;

    /// Checksum over the first `len` bytes of a file.
    ///
    /// `buf` is used to read the file in chunks, its length is the chunk size.
    fn calculate_checksum(
        &self,
        path: &str,
        checksum_type: ChecksumType,
        len: u64,
        buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct NativeFilestore {}

impl NativeFilestore {
    fn regular_file(path: &str) -> Result<fs::Metadata, FilestoreError> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(metadata)
    }

    fn directory(path: &str) -> Result<(), FilestoreError> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(FilestoreError::IsNotDirectory),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FilestoreError::DirDoesNotExist),
            Err(e) => Err(e.into()),
        }
    }
}

impl VirtualFilestore for NativeFilestore {
    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(Path::new(path).try_exists()?)
    }

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError> {
        Ok(Self::regular_file(path)?.len())
    }

    fn create_file(&self, path: &str) -> Result<(), FilestoreError> {
        OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<(), FilestoreError> {
        Self::regular_file(path)?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn truncate_file(&self, path: &str) -> Result<(), FilestoreError> {
        Self::regular_file(path)?;
        OpenOptions::new().write(true).truncate(true).open(path)?;
        Ok(())
    }

    fn create_dir(&self, path: &str) -> Result<(), FilestoreError> {
        fs::create_dir(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &str) -> Result<(), FilestoreError> {
        Self::directory(path)?;
        fs::remove_dir(path)?;
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<(), FilestoreError> {
        Self::regular_file(from)?;
        if self.exists(to)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        if fs::rename(from, to).is_err() {
            // Working directory and destination may be on different file systems.
            fs::copy(from, to)?;
            fs::remove_file(from)?;
        }
        Ok(())
    }

    fn append_file(&self, target: &str, source: &str) -> Result<(), FilestoreError> {
        Self::regular_file(target)?;
        let mut reader = BufReader::new(File::open(source)?);
        let mut file = OpenOptions::new().append(true).open(target)?;
        io::copy(&mut reader, &mut file)?;
        Ok(())
    }

    fn read_data(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<(), FilestoreError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let read = file.read(&mut buf[filled..])?;
            if read == 0 {
                return Err(FilestoreError::ShortRead {
                    expected: buf.len() as u64,
                    found: filled as u64,
                });
            }
            filled += read;
        }
        Ok(())
    }

    fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn calculate_checksum(
        &self,
        path: &str,
        checksum_type: ChecksumType,
        len: u64,
        buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        let mut accumulator = ChecksumAccumulator::new(checksum_type)
            .ok_or(FilestoreError::UnsupportedChecksum(checksum_type))?;
        if checksum_type != ChecksumType::NullChecksum && len > 0 && !buf.is_empty() {
            let mut reader = BufReader::new(File::open(path)?).take(len);
            let mut offset = 0;
            loop {
                let read = reader.read(buf)?;
                if read == 0 {
                    break;
                }
                accumulator.add(offset, &buf[..read]);
                offset += read as u64;
            }
        }
        accumulator.value().ok_or(FilestoreError::ChecksumUnavailable)
    }
}

/// Join relative names with the base directory. Absolute names are used as they are.
pub fn resolve_path(base: &Path, name: &str) -> String {
    let path = Path::new(name);
    if path.is_absolute() {
        return name.to_string();
    }
    base.join(path).to_string_lossy().into_owned()
}

/// Whether the action requires a second file name.
pub fn has_second_name(action: FilestoreActionCode) -> bool {
    matches!(
        action,
        FilestoreActionCode::RenameFile
            | FilestoreActionCode::AppendFile
            | FilestoreActionCode::ReplaceFile
    )
}

#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreRequest {
    pub action: FilestoreActionCode,
    pub first_name: String,
    pub second_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreResponse {
    pub action: FilestoreActionCode,
    /// 0 means success. Other values depend on the action, see [execute_requests].
    pub status: u8,
    pub first_name: String,
    pub second_name: Option<String>,
    pub message: Option<String>,
}

impl FilestoreResponse {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Execute filestore requests in order.
///
/// Relative names are resolved against `base`. The status codes are:
///
/// - create file, delete file, create directory, remove directory: 1 on failure
/// - rename: 1 if the old file is missing, 2 if the new file exists, 3 otherwise
/// - append and replace: 1 if the first file is missing, 2 if the second file is missing,
///   3 otherwise
/// - deny file and deny directory: 2 if the entry exists and can not be removed
///
/// Once a request fails, all remaining requests are reported as not performed.
pub fn execute_requests<Vfs: VirtualFilestore + ?Sized>(
    vfs: &Vfs,
    requests: &[FilestoreRequest],
    base: &Path,
) -> Vec<FilestoreResponse> {
    let mut responses = Vec::with_capacity(requests.len());
    let mut failed = false;
    for request in requests {
        let (status, message) = if failed {
            (STATUS_NOT_PERFORMED, None)
        } else {
            match execute_request(vfs, request, base) {
                Ok(()) => (0, None),
                Err((status, message)) => (status, Some(message)),
            }
        };
        if status != 0 {
            failed = true;
        }
        responses.push(FilestoreResponse::new(
            request.action,
            status,
            request.first_name.clone(),
            request.second_name.clone(),
            message,
        ));
    }
    responses
}

fn execute_request<Vfs: VirtualFilestore + ?Sized>(
    vfs: &Vfs,
    request: &FilestoreRequest,
    base: &Path,
) -> Result<(), (u8, String)> {
    let first = resolve_path(base, &request.first_name);
    let second = request
        .second_name
        .as_deref()
        .map(|name| resolve_path(base, name));
    let exists = |path: &str| vfs.exists(path).unwrap_or(false);
    let fail = |status: u8| move |e: FilestoreError| (status, e.to_string());
    match request.action {
        FilestoreActionCode::CreateFile => vfs.create_file(&first).map_err(fail(1)),
        FilestoreActionCode::DeleteFile => vfs.remove_file(&first).map_err(fail(1)),
        FilestoreActionCode::RenameFile => {
            let second = second.ok_or((3, "no new file name".to_string()))?;
            if !exists(&first) {
                return Err((1, "old file does not exist".to_string()));
            }
            if exists(&second) {
                return Err((2, "new file already exists".to_string()));
            }
            vfs.rename_file(&first, &second).map_err(fail(3))
        }
        FilestoreActionCode::AppendFile | FilestoreActionCode::ReplaceFile => {
            let second = second.ok_or((2, "no second file name".to_string()))?;
            if !exists(&first) {
                return Err((1, "first file does not exist".to_string()));
            }
            if !exists(&second) {
                return Err((2, "second file does not exist".to_string()));
            }
            if request.action == FilestoreActionCode::ReplaceFile {
                vfs.truncate_file(&first).map_err(fail(3))?;
            }
            vfs.append_file(&first, &second).map_err(fail(3))
        }
        FilestoreActionCode::CreateDirectory => vfs.create_dir(&first).map_err(fail(1)),
        FilestoreActionCode::RemoveDirectory => vfs.remove_dir(&first).map_err(fail(1)),
        FilestoreActionCode::DenyFile => {
            if !exists(&first) {
                return Ok(());
            }
            vfs.remove_file(&first).map_err(fail(2))
        }
        FilestoreActionCode::DenyDirectory => {
            if !exists(&first) {
                return Ok(());
            }
            vfs.remove_dir(&first).map_err(fail(2))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use crate::CRC_32C;

    use super::*;

    const EXAMPLE_DATA_CFDP: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    const NATIVE_FS: NativeFilestore = NativeFilestore {};

    #[test]
    fn test_basic_native_filestore_create() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS
            .create_file(file_path.to_str().unwrap())
            .expect("creating file failed");
        assert!(file_path.is_file());
        assert!(NATIVE_FS.exists(file_path.to_str().unwrap()).unwrap());
        let result = NATIVE_FS.create_file(file_path.to_str().unwrap());
        assert!(matches!(result, Err(FilestoreError::FileAlreadyExists)));
    }

    #[test]
    fn test_write_read_at_offset() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = file_path.to_str().unwrap();
        NATIVE_FS.create_file(path).unwrap();
        NATIVE_FS.write_data(path, 0, &[1, 2, 3, 4]).unwrap();
        NATIVE_FS.write_data(path, 4, &[5, 6, 7, 8]).unwrap();
        let read_buf: &mut [u8] = &mut [0; 4];
        NATIVE_FS.read_data(path, 2, read_buf).unwrap();
        assert_eq!([3, 4, 5, 6], read_buf);
        assert_eq!(NATIVE_FS.file_size(path).unwrap(), 8);
    }

    #[test]
    fn test_read_past_end_of_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        fs::write(&file_path, [1, 2, 3, 4]).unwrap();
        let result = NATIVE_FS.read_data(file_path.to_str().unwrap(), 2, &mut [0; 4]);
        assert!(matches!(
            result,
            Err(FilestoreError::ShortRead {
                expected: 4,
                found: 2
            })
        ));
    }

    #[test]
    fn test_read_which_does_not_exist() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let result = NATIVE_FS.read_data(file_path.to_str().unwrap(), 0, &mut [0; 4]);
        let error = result.unwrap_err();
        assert!(matches!(error, FilestoreError::FileDoesNotExist));
        assert_eq!(error.to_string(), "file does not exist");
    }

    #[test]
    fn test_rename_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let from = tmpdir.path().join("from.txt");
        let to = tmpdir.path().join("to.txt");
        fs::write(&from, b"content").unwrap();
        NATIVE_FS
            .rename_file(from.to_str().unwrap(), to.to_str().unwrap())
            .unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"content");
        fs::write(&from, b"other").unwrap();
        let result = NATIVE_FS.rename_file(from.to_str().unwrap(), to.to_str().unwrap());
        assert!(matches!(result, Err(FilestoreError::FileAlreadyExists)));
    }

    #[test]
    fn test_append_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let first = tmpdir.path().join("first.txt");
        let second = tmpdir.path().join("second.txt");
        fs::write(&first, b"hello ").unwrap();
        fs::write(&second, b"world").unwrap();
        NATIVE_FS
            .append_file(first.to_str().unwrap(), second.to_str().unwrap())
            .unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"hello world");
    }

    #[test]
    fn test_remove_dir_with_file_api() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let dir_path = tmpdir.path().join("test");
        NATIVE_FS.create_dir(dir_path.to_str().unwrap()).unwrap();
        let result = NATIVE_FS.remove_file(dir_path.to_str().unwrap());
        assert!(matches!(result, Err(FilestoreError::IsNotFile)));
        NATIVE_FS.remove_dir(dir_path.to_str().unwrap()).unwrap();
        assert!(!dir_path.exists());
        assert!(matches!(
            NATIVE_FS.remove_dir(dir_path.to_str().unwrap()),
            Err(FilestoreError::DirDoesNotExist)
        ));
    }

    #[test]
    fn test_checksum_modular() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.bin");
        fs::write(&file_path, EXAMPLE_DATA_CFDP).unwrap();
        let mut buf = [0; 4];
        let checksum = NATIVE_FS
            .calculate_checksum(
                file_path.to_str().unwrap(),
                ChecksumType::Modular,
                EXAMPLE_DATA_CFDP.len() as u64,
                &mut buf,
            )
            .unwrap();
        let expected = 0x0001_0203u32
            .wrapping_add(0x0405_0607)
            .wrapping_add(0x0809_0a0b)
            .wrapping_add(0x0c0d_0e00);
        assert_eq!(checksum, expected);
    }

    #[test]
    fn test_checksum_crc32c_small_buffer() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.bin");
        fs::write(&file_path, EXAMPLE_DATA_CFDP).unwrap();
        let mut buf = [0; 3];
        let checksum = NATIVE_FS
            .calculate_checksum(
                file_path.to_str().unwrap(),
                ChecksumType::Crc32C,
                EXAMPLE_DATA_CFDP.len() as u64,
                &mut buf,
            )
            .unwrap();
        assert_eq!(checksum, CRC_32C.checksum(&EXAMPLE_DATA_CFDP));
        // Only the requested prefix is covered.
        let prefix = NATIVE_FS
            .calculate_checksum(file_path.to_str().unwrap(), ChecksumType::Crc32C, 5, &mut buf)
            .unwrap();
        assert_eq!(prefix, CRC_32C.checksum(&EXAMPLE_DATA_CFDP[..5]));
    }

    #[test]
    fn test_checksum_null_and_unsupported() {
        let mut buf = [0; 8];
        assert_eq!(
            NATIVE_FS
                .calculate_checksum("does-not-matter", ChecksumType::NullChecksum, 10, &mut buf)
                .unwrap(),
            0
        );
        let result = NATIVE_FS.calculate_checksum("x", ChecksumType::Crc32, 10, &mut buf);
        assert!(matches!(
            result,
            Err(FilestoreError::UnsupportedChecksum(ChecksumType::Crc32))
        ));
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/tmp/base");
        assert_eq!(resolve_path(base, "/abs/file"), "/abs/file");
        assert_eq!(resolve_path(base, "rel.txt"), "/tmp/base/rel.txt");
    }

    #[test]
    fn test_filestore_requests_success() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        fs::write(tmpdir.path().join("a.txt"), b"a").unwrap();
        fs::write(tmpdir.path().join("b.txt"), b"b").unwrap();
        let requests = [
            FilestoreRequest::new(FilestoreActionCode::CreateDirectory, "dir".into(), None),
            FilestoreRequest::new(FilestoreActionCode::CreateFile, "dir/new.txt".into(), None),
            FilestoreRequest::new(
                FilestoreActionCode::AppendFile,
                "a.txt".into(),
                Some("b.txt".into()),
            ),
            FilestoreRequest::new(
                FilestoreActionCode::RenameFile,
                "b.txt".into(),
                Some("c.txt".into()),
            ),
            FilestoreRequest::new(FilestoreActionCode::DenyFile, "missing.txt".into(), None),
        ];
        let responses = execute_requests(&NATIVE_FS, &requests, tmpdir.path());
        assert_eq!(responses.len(), requests.len());
        assert!(responses.iter().all(|response| response.is_success()));
        assert_eq!(fs::read(tmpdir.path().join("a.txt")).unwrap(), b"ab");
        assert!(tmpdir.path().join("c.txt").exists());
        assert!(tmpdir.path().join("dir/new.txt").exists());
    }

    #[test]
    fn test_filestore_requests_failure_stops_processing() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        fs::write(tmpdir.path().join("exists.txt"), b"x").unwrap();
        let requests = [
            FilestoreRequest::new(
                FilestoreActionCode::RenameFile,
                "missing.txt".into(),
                Some("new.txt".into()),
            ),
            FilestoreRequest::new(FilestoreActionCode::DeleteFile, "exists.txt".into(), None),
        ];
        let responses = execute_requests(&NATIVE_FS, &requests, tmpdir.path());
        assert_eq!(responses[0].status, 1);
        assert!(responses[0].message.is_some());
        assert_eq!(responses[1].status, STATUS_NOT_PERFORMED);
        assert!(tmpdir.path().join("exists.txt").exists());
    }

    #[test]
    fn test_rename_target_exists_and_replace() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        fs::write(tmpdir.path().join("a.txt"), b"old").unwrap();
        fs::write(tmpdir.path().join("b.txt"), b"new").unwrap();
        let rename = [FilestoreRequest::new(
            FilestoreActionCode::RenameFile,
            "a.txt".into(),
            Some("b.txt".into()),
        )];
        assert_eq!(
            execute_requests(&NATIVE_FS, &rename, tmpdir.path())[0].status,
            2
        );
        let replace = [FilestoreRequest::new(
            FilestoreActionCode::ReplaceFile,
            "a.txt".into(),
            Some("b.txt".into()),
        )];
        assert!(execute_requests(&NATIVE_FS, &replace, tmpdir.path())[0].is_success());
        assert_eq!(fs::read(tmpdir.path().join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_second_name() {
        assert!(has_second_name(FilestoreActionCode::RenameFile));
        assert!(has_second_name(FilestoreActionCode::ReplaceFile));
        assert!(!has_second_name(FilestoreActionCode::DenyFile));
        assert!(!has_second_name(FilestoreActionCode::CreateDirectory));
    }
}
