#![allow(clippy::wrong_self_convention)]
#![macro_use]

use crate::result::{ZipResult, invalid_archive};
use memchr::memmem::FinderRev;
use std::io;
use std::io::prelude::*;
use std::mem;

pub(crate) type Magic = u32;

pub(crate) const LOCAL_FILE_HEADER_SIGNATURE: Magic = 0x04034b50;
pub(crate) const CENTRAL_DIRECTORY_HEADER_SIGNATURE: Magic = 0x02014b50;
pub(crate) const CENTRAL_DIRECTORY_END_SIGNATURE: Magic = 0x06054b50;

/// Field values at or above these need the zip64 format, which this crate
/// does not write.
pub(crate) const ZIP64_BYTES_THR: u64 = u32::MAX as u64;
pub(crate) const ZIP64_ENTRY_THR: usize = u16::MAX as usize;

pub(crate) trait Block: Sized + Copy {
    fn interpret(bytes: Box<[u8]>) -> ZipResult<Self>;

    fn deserialize(block: &[u8]) -> Self {
        assert_eq!(block.len(), mem::size_of::<Self>());
        let block_ptr: *const Self = block.as_ptr().cast();
        unsafe { block_ptr.read() }
    }

    fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let mut block = vec![0u8; mem::size_of::<Self>()];
        reader.read_exact(&mut block)?;
        Self::interpret(block.into_boxed_slice())
    }

    fn encode(self) -> Box<[u8]>;

    fn serialize(self) -> Box<[u8]> {
        let mut out_block = vec![0u8; mem::size_of::<Self>()];
        let out_view: &mut [u8] = out_block.as_mut();
        let out_ptr: *mut Self = out_view.as_mut_ptr().cast();
        unsafe {
            out_ptr.write(self);
        }
        out_block.into_boxed_slice()
    }

    fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        let block = self.encode();
        writer.write_all(&block)?;
        Ok(())
    }
}

/// Convert all the fields of a struct *from* little-endian representations.
macro_rules! from_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::from_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        from_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        from_le![$obj, $field, $type];
        from_le!($obj, [$($rest),+]);
    };
}

/// Convert all the fields of a struct *into* little-endian representations.
macro_rules! to_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::to_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        to_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        to_le![$obj, $field, $type];
        to_le!($obj, [$($rest),+]);
    };
}

#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub(crate) struct CDEBlock {
    pub magic: Magic,
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment_length: u16,
}

impl CDEBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, Magic),
                (disk_number, u16),
                (disk_with_central_directory, u16),
                (number_of_files_on_this_disk, u16),
                (number_of_files, u16),
                (central_directory_size, u32),
                (central_directory_offset, u32),
                (zip_file_comment_length, u16)
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, Magic),
                (disk_number, u16),
                (disk_with_central_directory, u16),
                (number_of_files_on_this_disk, u16),
                (number_of_files, u16),
                (central_directory_size, u32),
                (central_directory_offset, u32),
                (zip_file_comment_length, u16)
            ]
        ];
        self
    }
}

impl Block for CDEBlock {
    fn interpret(bytes: Box<[u8]>) -> ZipResult<Self> {
        let block = Self::deserialize(&bytes).from_le();

        if block.magic != CENTRAL_DIRECTORY_END_SIGNATURE {
            return invalid_archive("Invalid digital signature header");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

#[derive(Debug)]
pub(crate) struct CentralDirectoryEnd {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment: Vec<u8>,
}

impl CentralDirectoryEnd {
    fn block_and_comment(self) -> (CDEBlock, Vec<u8>) {
        let Self {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment,
        } = self;
        let block = CDEBlock {
            magic: CENTRAL_DIRECTORY_END_SIGNATURE,

            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment_length: zip_file_comment.len().try_into().unwrap_or(u16::MAX),
        };
        (block, zip_file_comment)
    }

    pub fn parse<T: Read>(reader: &mut T) -> ZipResult<CentralDirectoryEnd> {
        let CDEBlock {
            // magic,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment_length,
            ..
        } = CDEBlock::parse(reader)?;

        let mut zip_file_comment = vec![0u8; zip_file_comment_length as usize];
        reader.read_exact(&mut zip_file_comment)?;

        Ok(CentralDirectoryEnd {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment,
        })
    }

    /// Scans backwards from the end of the stream for the end-of-central-directory
    /// record, returning it along with its position.
    pub fn find_and_parse<T: Read + Seek>(reader: &mut T) -> ZipResult<(CentralDirectoryEnd, u64)> {
        let file_length = reader.seek(io::SeekFrom::End(0))?;

        if file_length < mem::size_of::<CDEBlock>() as u64 {
            return invalid_archive("Invalid zip header");
        }

        const END_WINDOW_SIZE: usize = 512;

        let sig_bytes = CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes();
        let finder = FinderRev::new(&sig_bytes);

        let mut window_start: u64 = file_length.saturating_sub(END_WINDOW_SIZE as u64);
        let mut window = [0u8; END_WINDOW_SIZE];
        loop {
            /* Go to the start of the window in the file. */
            reader.seek(io::SeekFrom::Start(window_start))?;

            /* Identify how many bytes to read (this may be less than the window size for files
             * smaller than END_WINDOW_SIZE). */
            let end = (window_start + END_WINDOW_SIZE as u64).min(file_length);
            let cur_len = (end - window_start) as usize;
            debug_assert!(cur_len <= END_WINDOW_SIZE);
            let cur_window: &mut [u8] = &mut window[..cur_len];
            /* Read the window into the bytes! */
            reader.read_exact(cur_window)?;

            /* Find instances of the magic signature. */
            for offset in finder.rfind_iter(cur_window) {
                let cde_start_pos = window_start + offset as u64;
                reader.seek(io::SeekFrom::Start(cde_start_pos))?;
                if let Ok(cde) = Self::parse(reader) {
                    return Ok((cde, cde_start_pos));
                }
            }
            if window_start == 0 {
                break;
            }
            debug_assert!(END_WINDOW_SIZE > mem::size_of_val(&CENTRAL_DIRECTORY_END_SIGNATURE));
            window_start = window_start.saturating_sub(
                END_WINDOW_SIZE as u64 - mem::size_of_val(&CENTRAL_DIRECTORY_END_SIGNATURE) as u64,
            );
        }

        invalid_archive("Could not find central directory end")
    }

    pub fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        let (block, comment) = self.block_and_comment();
        block.write(writer)?;
        writer.write_all(&comment)?;
        Ok(())
    }
}

/// Little-endian integer writes for the CRC/size patch-back after a streamed
/// entry body.
pub(crate) trait LittleEndianWriteExt: Write {
    fn write_u32_le(&mut self, x: u32) -> io::Result<()> {
        self.write_all(&x.to_le_bytes())
    }
}

impl<W: Write + ?Sized> LittleEndianWriteExt for W {}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    #[repr(packed)]
    pub struct TestBlock {
        pub magic: Magic,
        pub file_name_length: u16,
    }

    impl TestBlock {
        fn from_le(mut self) -> Self {
            from_le![self, [(magic, Magic), (file_name_length, u16)]];
            self
        }
        fn to_le(mut self) -> Self {
            to_le![self, [(magic, Magic), (file_name_length, u16)]];
            self
        }
    }

    impl Block for TestBlock {
        fn interpret(bytes: Box<[u8]>) -> ZipResult<Self> {
            Ok(Self::deserialize(&bytes).from_le())
        }
        fn encode(self) -> Box<[u8]> {
            self.to_le().serialize()
        }
    }

    /// Demonstrate that a block object can be safely written to memory and deserialized back out.
    #[test]
    fn block_serde() {
        let block = TestBlock {
            magic: 0x01111,
            file_name_length: 3,
        };
        let mut c = Cursor::new(Vec::new());
        block.write(&mut c).unwrap();
        c.set_position(0);
        let block2 = TestBlock::parse(&mut c).unwrap();
        assert_eq!(block, block2);
    }

    #[test]
    fn eocd_round_trip() {
        let end = CentralDirectoryEnd {
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: 2,
            number_of_files: 2,
            central_directory_size: 92,
            central_directory_offset: 317,
            zip_file_comment: Vec::new(),
        };
        let mut c = Cursor::new(Vec::new());
        end.write(&mut c).unwrap();
        let (parsed, pos) = CentralDirectoryEnd::find_and_parse(&mut c).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(parsed.number_of_files, 2);
        assert_eq!(parsed.central_directory_offset, 317);
    }

    #[test]
    fn eocd_found_after_prepended_garbage() {
        let end = CentralDirectoryEnd {
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: 1,
            number_of_files: 1,
            central_directory_size: 46,
            central_directory_offset: 64,
            zip_file_comment: b"with comment".to_vec(),
        };
        let mut c = Cursor::new(vec![0u8; 100]);
        c.set_position(100);
        end.write(&mut c).unwrap();
        let (parsed, pos) = CentralDirectoryEnd::find_and_parse(&mut c).unwrap();
        assert_eq!(pos, 100);
        assert_eq!(parsed.zip_file_comment, b"with comment");
    }
}
