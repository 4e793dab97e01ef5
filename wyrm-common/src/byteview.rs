//! Shared, read-only images of object files.
//!
//! The index reads every registered ELF file exactly once: the container is parsed and the
//! debug sections are copied out into relocatable images, after which the raw file bytes are no
//! longer needed. [`ByteView`] holds those raw bytes for the duration of that load — as a
//! memory mapping when the index opened the file itself, or as an in-memory buffer when a
//! collaborator already owns the bytes.
//!
//! [`ByteView`]: struct.ByteView.html

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

/// How the bytes of an image are held.
#[derive(Debug)]
enum ImageBacking {
    /// A read-only mapping of a file on disk.
    Mapped(Mmap),
    /// A buffer handed over by the caller.
    Owned(Vec<u8>),
}

/// A shared, read-only image of an object file.
///
/// Cloning is cheap: clones share the same backing storage. A debugger embedding the index can
/// therefore register a module it already has in memory without copying it, and several
/// registration sites can hold the same image at once.
///
/// # Example
///
/// ```
/// use wyrm_common::ByteView;
///
/// let view = ByteView::from_buffer(b"\x7fELF".to_vec());
/// assert_eq!(&view[..4], b"\x7fELF");
/// ```
#[derive(Clone, Debug)]
pub struct ByteView {
    backing: Arc<ImageBacking>,
}

impl ByteView {
    /// Maps the file at `path` into memory.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use wyrm_common::ByteView;
    ///
    /// fn main() -> Result<(), std::io::Error> {
    ///     let image = ByteView::open("/lib/modules/vmlinux")?;
    ///     Ok(())
    /// }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ByteView, io::Error> {
        ByteView::map_file(&File::open(path)?)
    }

    /// Maps an already opened file into memory.
    ///
    /// Zero-length files cannot be mapped; they come back as an empty buffer instead of an
    /// error, so that a truncated module is reported by the ELF parser rather than the mapping.
    pub fn map_file(file: &File) -> Result<ByteView, io::Error> {
        let backing = match unsafe { Mmap::map(file) } {
            Ok(mapping) => ImageBacking::Mapped(mapping),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                ImageBacking::Owned(Vec::new())
            }
            Err(err) => return Err(err),
        };

        Ok(ByteView {
            backing: Arc::new(backing),
        })
    }

    /// Wraps an image whose bytes the caller already owns.
    ///
    /// This is how a collaborator that has loaded a module itself hands it to the index.
    pub fn from_buffer(buffer: Vec<u8>) -> ByteView {
        ByteView {
            backing: Arc::new(ImageBacking::Owned(buffer)),
        }
    }

    /// Returns the image bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match *self.backing {
            ImageBacking::Mapped(ref mapping) => mapping,
            ImageBacking::Owned(ref buffer) => buffer,
        }
    }
}

impl AsRef<[u8]> for ByteView {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Deref for ByteView {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_empty_file() -> Result<(), std::io::Error> {
        let tmp = NamedTempFile::new()?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&*view, b"");

        Ok(())
    }

    #[test]
    fn test_open_file() -> Result<(), std::io::Error> {
        let mut tmp = NamedTempFile::new()?;

        tmp.write_all(b"\x7fELF junk")?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&*view, b"\x7fELF junk");

        Ok(())
    }

    #[test]
    fn test_from_buffer() {
        let view = ByteView::from_buffer(b"\x7fELF".to_vec());
        assert_eq!(view.as_slice(), b"\x7fELF");
    }

    #[test]
    fn test_clone_shares_backing() {
        let view = ByteView::from_buffer(b"\x7fELF".to_vec());
        let clone = view.clone();
        assert_eq!(view.as_slice().as_ptr(), clone.as_slice().as_ptr());
    }
}
