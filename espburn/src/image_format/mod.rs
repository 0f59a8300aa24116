//! Raw firmware images
//!
//! A [FirmwareImage] is a flat binary, written to flash byte for byte. It is
//! consumed as a forward-only sequence of [Block]s of [FLASH_WRITE_SIZE]
//! bytes; reopen the file to write it again.

use std::{
    fs::File,
    io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use log::debug;

pub use self::header::{patch, HeaderVariant, ESP_MAGIC};
use crate::Error;

mod header;

/// Number of image bytes carried by one FLASH_DATA request
pub const FLASH_WRITE_SIZE: usize = 0x1000;

/// Container formats which have to be converted before they can be flashed
const UNSUPPORTED_EXTENSIONS: &[&str] = &["elf", "axf", "out", "hex", "ihex", "uf2"];

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// A flat binary image and its size
#[derive(Debug)]
pub struct FirmwareImage<R = File> {
    reader: R,
    size: u32,
}

impl FirmwareImage<File> {
    /// Open an image, rejecting container formats before anything is sent
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if UNSUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                return Err(Error::UnsupportedImageFormat(format!(
                    "{} (.{ext} files are not raw binaries)",
                    path.display()
                )));
            }
        }

        let mut file =
            File::open(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?
            .len();
        let size = u32::try_from(size).map_err(|_| Error::ImageTooBig(size))?;

        if has_elf_magic(&mut file)? {
            return Err(Error::UnsupportedImageFormat(format!(
                "{} is an ELF file",
                path.display()
            )));
        }

        debug!("Opened image {} ({} bytes)", path.display(), size);

        Ok(FirmwareImage { reader: file, size })
    }
}

impl<R: Read> FirmwareImage<R> {
    /// Wrap a reader which yields exactly `size` bytes
    pub fn from_reader(reader: R, size: u32) -> Self {
        FirmwareImage { reader, size }
    }

    /// Total size of the image in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of blocks [FirmwareImage::blocks] will produce
    pub fn block_count(&self) -> u32 {
        self.size.div_ceil(FLASH_WRITE_SIZE as u32)
    }

    /// Consume the image, producing its blocks in order
    pub fn blocks(self) -> Blocks<R> {
        Blocks {
            reader: self.reader,
            size: self.size,
            consumed: 0,
            sequence: 0,
            failed: false,
        }
    }
}

fn has_elf_magic(file: &mut File) -> Result<bool, Error> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::ImageRead(e)),
        }
    }
    file.seek(SeekFrom::Start(0)).map_err(Error::ImageRead)?;

    Ok(filled == magic.len() && magic == ELF_MAGIC)
}

/// One chunk of the image, tagged with its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    sequence: u32,
    data: Vec<u8>,
}

impl Block {
    pub fn new(sequence: u32, data: Vec<u8>) -> Self {
        Block { sequence, data }
    }

    /// Zero-based position of the block within the image
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_first(&self) -> bool {
        self.sequence == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over the blocks of a [FirmwareImage]
///
/// Blocks are cut by counting against the size measured when the image was
/// opened, so an image whose size is a multiple of [FLASH_WRITE_SIZE] ends
/// without an empty trailing block. The iterator stops after the first error.
#[derive(Debug)]
pub struct Blocks<R> {
    reader: R,
    size: u32,
    consumed: u32,
    sequence: u32,
    failed: bool,
}

impl<R: Read> Blocks<R> {
    fn read_block(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => {
                    return Err(Error::TruncatedImage {
                        expected: self.size,
                        read: self.consumed + filled as u32,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ImageRead(e)),
            }
        }

        Ok(data)
    }
}

impl<R: Read> Iterator for Blocks<R> {
    type Item = Result<Block, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.size - self.consumed;
        if self.failed || remaining == 0 {
            return None;
        }

        let len = remaining.min(FLASH_WRITE_SIZE as u32);
        match self.read_block(len as usize) {
            Ok(data) => {
                let block = Block::new(self.sequence, data);
                self.consumed += len;
                self.sequence += 1;
                Some(Ok(block))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let remaining = (self.size - self.consumed).div_ceil(FLASH_WRITE_SIZE as u32) as usize;
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use pretty_assertions::assert_eq;
    use tempfile::Builder;

    use super::*;
    use crate::error::ErrorKind;

    fn lengths(size: usize) -> Vec<(u32, usize)> {
        FirmwareImage::from_reader(Cursor::new(vec![0x5Au8; size]), size as u32)
            .blocks()
            .map(|block| {
                let block = block.unwrap();
                (block.sequence(), block.len())
            })
            .collect()
    }

    #[test]
    fn last_block_is_short() {
        assert_eq!(lengths(10_000), vec![(0, 4096), (1, 4096), (2, 1808)]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_block() {
        assert_eq!(lengths(8192), vec![(0, 4096), (1, 4096)]);
        assert_eq!(lengths(4096), vec![(0, 4096)]);
    }

    #[test]
    fn empty_image_has_no_blocks() {
        assert_eq!(lengths(0), vec![]);
        let image = FirmwareImage::from_reader(Cursor::new(Vec::new()), 0);
        assert_eq!(image.block_count(), 0);
    }

    #[test]
    fn block_count_matches_blocks() {
        for size in [1usize, 4095, 4097, 12_288, 12_289] {
            let image = FirmwareImage::from_reader(Cursor::new(vec![0u8; size]), size as u32);
            let expected = image.block_count() as usize;
            let blocks: Vec<_> = image.blocks().collect::<Result<_, _>>().unwrap();

            assert_eq!(blocks.len(), expected);
            assert_eq!(blocks.iter().map(Block::len).sum::<usize>(), size);
        }
    }

    #[test]
    fn truncated_source_is_an_io_error() {
        let mut blocks = FirmwareImage::from_reader(Cursor::new(vec![0u8; 5000]), 9000).blocks();

        assert!(blocks.next().unwrap().is_ok());
        let err = blocks.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(matches!(
            err,
            Error::TruncatedImage {
                expected: 9000,
                read: 5000
            }
        ));
        assert!(blocks.next().is_none());
    }

    #[test]
    fn open_reports_file_size() {
        let mut file = Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&[0xE9; 5000]).unwrap();

        let image = FirmwareImage::open(file.path()).unwrap();
        assert_eq!(image.size(), 5000);
        assert_eq!(image.block_count(), 2);

        // the ELF sniff must not swallow the first bytes
        let first = image.blocks().next().unwrap().unwrap();
        assert_eq!(&first.data()[..4], &[0xE9; 4]);
    }

    #[test]
    fn container_formats_are_rejected() {
        for suffix in [".elf", ".ELF", ".hex", ".uf2"] {
            let file = Builder::new().suffix(suffix).tempfile().unwrap();
            let err = FirmwareImage::open(file.path()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{suffix}");
        }

        let mut file = Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(b"\x7fELF\x01\x01\x01").unwrap();
        assert!(matches!(
            FirmwareImage::open(file.path()),
            Err(Error::UnsupportedImageFormat(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FirmwareImage::open(dir.path().join("missing.bin")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
