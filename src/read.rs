//! Reading side of the ZIP container: central directory enumeration and
//! per-entry decompression.

use crate::compression::CompressionMethod;
use crate::crc32::Crc32Reader;
use crate::result::{ZipError, ZipResult, invalid_archive};
use crate::spec::{self, Block};
use crate::types::{DateTime, EntryData, ZipEntryBlock, ZipLocalEntryBlock};

use flate2::read::DeflateDecoder;
use indexmap::IndexMap;
use std::io::{self, Read, Seek, SeekFrom, Take};
use std::mem;
use std::sync::OnceLock;

/// Everything the end-of-central-directory record and the central directory
/// itself tell us about an archive.
pub(crate) struct CentralDirectory {
    /// All records, in central-directory order. Duplicate names all appear.
    pub files: Vec<EntryData>,
    /// Name lookup; for duplicate names the last record wins.
    pub index: IndexMap<Box<str>, usize>,
    /// Offset where the central directory starts, which is also where an
    /// appending session continues writing.
    pub dir_start: u64,
}

impl CentralDirectory {
    pub(crate) fn insert(&mut self, data: EntryData) {
        let i = self.files.len();
        self.index.insert(data.file_name.clone(), i);
        self.files.push(data);
    }
}

/// Locate and walk the central directory of a seekable container.
///
/// A missing or unparseable end record is an error; a record that fails to
/// parse midway through the directory is not, so that a truncated archive
/// still exposes the entries in front of the damage.
pub(crate) fn read_central_directory<R: Read + Seek>(
    reader: &mut R,
) -> ZipResult<CentralDirectory> {
    let (footer, cde_start_pos) = spec::CentralDirectoryEnd::find_and_parse(reader)?;

    if footer.disk_number != footer.disk_with_central_directory {
        return Err(ZipError::UnsupportedArchive(
            "Support for multi-disk files is not implemented".into(),
        ));
    }

    let directory_size = footer.central_directory_size as u64;
    let nominal_offset = footer.central_directory_offset as u64;

    /* Containers prepended with foreign data (self-extractors and the like)
     * record offsets relative to the start of the zip data, not the file. */
    let archive_offset = cde_start_pos
        .checked_sub(directory_size)
        .and_then(|x| x.checked_sub(nominal_offset))
        .ok_or(ZipError::InvalidArchive(
            "Invalid central directory size or offset".into(),
        ))?;
    let dir_start = nominal_offset + archive_offset;

    let mut dir = CentralDirectory {
        files: Vec::with_capacity(footer.number_of_files as usize),
        index: IndexMap::with_capacity(footer.number_of_files as usize),
        dir_start,
    };

    reader.seek(SeekFrom::Start(dir_start))?;
    for _ in 0..footer.number_of_files {
        match central_header_to_entry(reader, archive_offset) {
            Ok(data) => dir.insert(data),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    parsed = dir.files.len(),
                    expected = footer.number_of_files,
                    "central directory entry failed to parse, keeping earlier entries"
                );
                break;
            }
        }
    }

    Ok(dir)
}

/// Parse a single central-directory record at the reader's position.
fn central_header_to_entry<R: Read + Seek>(
    reader: &mut R,
    archive_offset: u64,
) -> ZipResult<EntryData> {
    let central_header_start = reader.stream_position()?;

    let block = ZipEntryBlock::parse(reader)?;

    let mut file_name_raw = vec![0u8; block.file_name_length as usize];
    reader.read_exact(&mut file_name_raw)?;
    let file_name: Box<str> = String::from_utf8_lossy(&file_name_raw).into();

    // Skip fields we don't interpret (extended timestamps etc. live here).
    reader.seek(SeekFrom::Current(
        block.extra_field_length as i64 + block.file_comment_length as i64,
    ))?;

    Ok(EntryData {
        compression_method: CompressionMethod::from_u16(block.compression_method),
        last_modified_time: DateTime::from_msdos(block.last_mod_date, block.last_mod_time),
        crc32: block.crc32,
        compressed_size: block.compressed_size as u64,
        uncompressed_size: block.uncompressed_size as u64,
        file_name,
        external_attributes: block.external_file_attributes,
        header_start: block.offset as u64 + archive_offset,
        central_header_start,
        data_start: OnceLock::new(),
    })
}

/// Parse the local header of an entry to resolve where its compressed bytes
/// begin. Cached in the entry after the first call.
pub(crate) fn find_data_start<R: Read + Seek>(data: &EntryData, reader: &mut R) -> ZipResult<u64> {
    if let Some(data_start) = data.data_start.get() {
        return Ok(*data_start);
    }

    reader.seek(SeekFrom::Start(data.header_start))?;
    let block = ZipLocalEntryBlock::parse(reader)?;

    let data_start = data.header_start
        + mem::size_of::<ZipLocalEntryBlock>() as u64
        + block.file_name_length as u64
        + block.extra_field_length as u64;

    Ok(*data.data_start.get_or_init(|| data_start))
}

/// Checksummed decompressing reader over one entry's compressed bytes.
pub(crate) enum EntryReader<R: Read> {
    Stored(Crc32Reader<R>),
    Deflated(Crc32Reader<DeflateDecoder<R>>),
}

impl<R: Read> EntryReader<R> {
    pub(crate) fn new(
        method: CompressionMethod,
        crc32: u32,
        reader: R,
    ) -> ZipResult<EntryReader<R>> {
        match method {
            CompressionMethod::Stored => Ok(EntryReader::Stored(Crc32Reader::new(reader, crc32))),
            CompressionMethod::Deflated => Ok(EntryReader::Deflated(Crc32Reader::new(
                DeflateDecoder::new(reader),
                crc32,
            ))),
            CompressionMethod::Unsupported(v) => Err(ZipError::UnsupportedArchive(
                format!("Compression method not supported: {v}").into(),
            )),
        }
    }
}

impl<R: Read> Read for EntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryReader::Stored(r) => r.read(buf),
            EntryReader::Deflated(r) => r.read(buf),
        }
    }
}

/// Position a shared reader on one entry's body and wrap it for decompression.
pub(crate) fn make_entry_reader<'a, R: Read + Seek>(
    data: &EntryData,
    reader: &'a mut R,
) -> ZipResult<EntryReader<Take<&'a mut R>>> {
    let data_start = find_data_start(data, reader)?;
    reader.seek(SeekFrom::Start(data_start))?;
    let limited = reader.take(data.compressed_size);
    EntryReader::new(data.compression_method, data.crc32, limited)
}

/// Read an entry's body into memory, verifying the CRC on the way out.
pub(crate) fn read_entry_bytes<R: Read + Seek>(
    data: &EntryData,
    reader: &mut R,
) -> ZipResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.uncompressed_size as usize);
    let mut entry = make_entry_reader(data, reader)?;
    entry.read_to_end(&mut out)?;
    if out.len() as u64 != data.uncompressed_size {
        return invalid_archive("Entry was shorter than its recorded size");
    }
    Ok(out)
}
