// kernel/src/fs.rs
//
// ファイルストアとの境界。
// - ローダが必要とするのは open / stat / read / close だけなので、それだけを trait にする。
// - StaticFileStore は起動イメージに埋め込んだバイト列を名前で引くだけの読み出し専用実装。

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u32,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    Io,
    InvalidArgument,
}

pub trait FileStore {
    type Handle: Copy;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::Handle, FileError>;

    fn stat(&mut self, handle: Self::Handle) -> Result<FileStat, FileError>;

    /// size バイトの要素を最大 count 個読む。戻り値は読めた要素数。
    fn read(
        &mut self,
        handle: Self::Handle,
        out: &mut [u8],
        size: usize,
        count: usize,
    ) -> Result<usize, FileError>;

    fn close(&mut self, handle: Self::Handle) -> Result<(), FileError>;
}

pub const MAX_OPEN_FILES: usize = 16;

/// 読み出し専用フラグ（FileStat::flags）
pub const FILE_STAT_READ_ONLY: u32 = 0b1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(pub usize);

#[derive(Clone, Copy)]
struct OpenFile {
    file: usize,
    pos: usize,
}

pub struct StaticFileStore<'a> {
    files: &'a [(&'a str, &'a [u8])],
    open: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl<'a> StaticFileStore<'a> {
    pub const fn new(files: &'a [(&'a str, &'a [u8])]) -> Self {
        StaticFileStore {
            files,
            open: [None; MAX_OPEN_FILES],
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.iter().filter(|f| f.is_some()).count()
    }

    fn slot(&self, handle: FileHandle) -> Result<OpenFile, FileError> {
        self.open
            .get(handle.0)
            .copied()
            .flatten()
            .ok_or(FileError::InvalidArgument)
    }
}

impl FileStore for StaticFileStore<'_> {
    type Handle = FileHandle;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FileError> {
        if path.is_empty() {
            return Err(FileError::InvalidArgument);
        }
        if mode != OpenMode::Read {
            return Err(FileError::InvalidArgument);
        }

        let file = self
            .files
            .iter()
            .position(|(name, _)| *name == path)
            .ok_or(FileError::NotFound)?;

        let idx = self
            .open
            .iter()
            .position(|f| f.is_none())
            .ok_or(FileError::Io)?;
        self.open[idx] = Some(OpenFile { file, pos: 0 });
        Ok(FileHandle(idx))
    }

    fn stat(&mut self, handle: FileHandle) -> Result<FileStat, FileError> {
        let of = self.slot(handle)?;
        Ok(FileStat {
            size: self.files[of.file].1.len() as u32,
            flags: FILE_STAT_READ_ONLY,
        })
    }

    fn read(
        &mut self,
        handle: FileHandle,
        out: &mut [u8],
        size: usize,
        count: usize,
    ) -> Result<usize, FileError> {
        let mut of = self.slot(handle)?;
        let wanted = size.checked_mul(count).ok_or(FileError::InvalidArgument)?;
        if size == 0 || wanted > out.len() {
            return Err(FileError::InvalidArgument);
        }

        let data = self.files[of.file].1;
        let remaining = data.len().saturating_sub(of.pos);
        let items = count.min(remaining / size);
        let n = items * size;

        out[..n].copy_from_slice(&data[of.pos..of.pos + n]);
        of.pos += n;
        self.open[handle.0] = Some(of);
        Ok(items)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), FileError> {
        self.slot(handle)?;
        self.open[handle.0] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILES: &[(&str, &[u8])] = &[("0:/a.bin", b"abcdef"), ("0:/empty", b"")];

    #[test]
    fn open_unknown_path_is_not_found() {
        let mut fs = StaticFileStore::new(FILES);
        assert_eq!(fs.open("0:/nope", OpenMode::Read), Err(FileError::NotFound));
        assert_eq!(fs.open("0:/a.bin", OpenMode::Write), Err(FileError::InvalidArgument));
    }

    #[test]
    fn reads_whole_items_and_advances() {
        let mut fs = StaticFileStore::new(FILES);
        let h = fs.open("0:/a.bin", OpenMode::Read).unwrap();
        assert_eq!(fs.stat(h).unwrap().size, 6);

        let mut buf = [0u8; 8];
        assert_eq!(fs.read(h, &mut buf, 4, 1), Ok(1));
        assert_eq!(&buf[..4], b"abcd");
        // 残り 2 バイトでは 4 バイトの要素は読めない
        assert_eq!(fs.read(h, &mut buf, 4, 1), Ok(0));
        assert_eq!(fs.read(h, &mut buf, 1, 2), Ok(2));
        assert_eq!(&buf[..2], b"ef");

        fs.close(h).unwrap();
        assert_eq!(fs.open_count(), 0);
        assert_eq!(fs.close(h), Err(FileError::InvalidArgument));
    }
}
