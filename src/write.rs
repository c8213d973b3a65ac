//! Writing side of the ZIP container: streamed entry bodies with CRC
//! patch-back, plus the central directory and end record on finalize.

use crate::compression::CompressionMethod;
use crate::result::{ZipError, ZipResult};
use crate::spec::{self, Block, LittleEndianWriteExt};
use crate::types::{DateTime, EntryData, ZipLocalEntryBlock};

use crc32fast::Hasher;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;

/// Byte offset of the crc32 field inside a local file header, for the
/// patch-back once a streamed body's checksum and sizes are known.
const CRC32_OFFSET: u64 = 14;

/// Appends entries to a seekable container.
///
/// The writer picks up at whatever position `inner` is at when it is
/// constructed: byte 0 for a fresh container, or the old central directory
/// offset when continuing an existing one (the prior entries stay in place
/// and the directory is rewritten behind the new data on [`finalize`]).
///
/// [`finalize`]: ZipWriter::finalize
pub(crate) struct ZipWriter<W: Write + Seek> {
    inner: W,
    /// End of the entry data written so far. Entry reads may move a shared
    /// file cursor between adds, so every operation reseeks here first.
    cursor: u64,
}

impl<W: Write + Seek> ZipWriter<W> {
    pub(crate) fn new(mut inner: W) -> ZipResult<Self> {
        let cursor = inner.stream_position()?;
        Ok(ZipWriter { inner, cursor })
    }

    /// Shared access to the underlying stream, for reading entries that were
    /// already finished.
    pub(crate) fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Write one complete entry: local header, body (deflated unless `level`
    /// is 0), then the header patch-back with the final crc32 and sizes.
    pub(crate) fn add_entry<R: Read + ?Sized>(
        &mut self,
        name: Box<str>,
        last_modified_time: DateTime,
        level: u32,
        body: &mut R,
    ) -> ZipResult<EntryData> {
        let method = if level == 0 {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };

        self.inner.seek(SeekFrom::Start(self.cursor))?;
        let header_start = self.cursor;

        let mut data = EntryData::for_write(name, method, last_modified_time, header_start);
        data.local_block()?.write(&mut self.inner)?;
        self.inner.write_all(data.file_name.as_bytes())?;

        let data_start = header_start
            + mem::size_of::<ZipLocalEntryBlock>() as u64
            + data.file_name.len() as u64;
        let _ = data.data_start.set(data_start);

        let mut hasher = Hasher::new();
        let mut uncompressed = 0u64;
        match method {
            CompressionMethod::Stored => {
                copy_body(body, &mut self.inner, &mut hasher, &mut uncompressed)?;
            }
            _ => {
                let mut encoder = DeflateEncoder::new(&mut self.inner, Compression::new(level));
                copy_body(body, &mut encoder, &mut hasher, &mut uncompressed)?;
                encoder.finish()?;
            }
        }

        let file_end = self.inner.stream_position()?;
        data.crc32 = hasher.finalize();
        data.uncompressed_size = uncompressed;
        data.compressed_size = file_end - data_start;
        if data.compressed_size > spec::ZIP64_BYTES_THR
            || data.uncompressed_size > spec::ZIP64_BYTES_THR
        {
            return Err(ZipError::UnsupportedArchive(
                "Files larger than the zip32 limit are not supported".into(),
            ));
        }

        self.update_local_file_header(&data)?;
        self.inner.seek(SeekFrom::Start(file_end))?;
        self.cursor = file_end;

        Ok(data)
    }

    fn update_local_file_header(&mut self, data: &EntryData) -> ZipResult<()> {
        self.inner
            .seek(SeekFrom::Start(data.header_start + CRC32_OFFSET))?;
        self.inner.write_u32_le(data.crc32)?;
        self.inner.write_u32_le(data.compressed_size as u32)?;
        self.inner.write_u32_le(data.uncompressed_size as u32)?;
        Ok(())
    }

    /// Write the central directory covering `files` (prior entries and new
    /// ones alike) followed by the end record, and flush.
    pub(crate) fn finalize(&mut self, files: &mut [EntryData]) -> ZipResult<()> {
        self.inner.seek(SeekFrom::Start(self.cursor))?;
        let central_start = self.cursor;

        for file in files.iter_mut() {
            file.central_header_start = self.inner.stream_position()?;
            file.block()?.write(&mut self.inner)?;
            self.inner.write_all(file.file_name.as_bytes())?;
        }

        let central_size = self.inner.stream_position()? - central_start;
        if files.len() > spec::ZIP64_ENTRY_THR
            || central_start > spec::ZIP64_BYTES_THR
            || central_size > spec::ZIP64_BYTES_THR
        {
            return Err(ZipError::UnsupportedArchive(
                "Archives larger than the zip32 limits are not supported".into(),
            ));
        }

        let footer = spec::CentralDirectoryEnd {
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: files.len() as u16,
            number_of_files: files.len() as u16,
            central_directory_size: central_size as u32,
            central_directory_offset: central_start as u32,
            zip_file_comment: Vec::new(),
        };
        footer.write(&mut self.inner)?;
        self.inner.flush()?;
        Ok(())
    }
}

fn copy_body<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
    hasher: &mut Hasher,
    total: &mut u64,
) -> ZipResult<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let count = reader.read(&mut buf)?;
        if count == 0 {
            return Ok(());
        }
        hasher.update(&buf[..count]);
        writer.write_all(&buf[..count])?;
        *total += count as u64;
    }
}
