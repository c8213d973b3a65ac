//! Single-member gzip file framing (RFC 1952).
//!
//! The envelope is built by hand: a 10-byte header carrying the source mtime
//! and original file name, a raw deflate payload, and a crc32 + size trailer.
//! Only whole files are handled; multi-member streams are out of scope.

use crate::result::{ZipError, ZipResult, invalid_archive};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 0x08;

// Flag bits in header byte 3
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

/// XFL value advertising maximum compression.
const XFL_BEST: u8 = 0x02;
/// OS field; 0 is the FAT convention the envelope has always carried.
const OS_FAT: u8 = 0x00;

/// Compress the file at `path` into `<path>.gz` and return the new path.
///
/// The member records the source's basename and mtime, so
/// [`decode`] can restore the timestamp.
pub fn encode(path: impl AsRef<Path>) -> ZipResult<PathBuf> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(ZipError::InvalidArchive(
            "Source path has no usable file name".into(),
        ))?;

    let mut file = File::open(path)?;
    let mtime = file
        .metadata()?
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let crc = crc32fast::hash(&data);
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    let payload = encoder.finish()?;

    let mut out = Vec::with_capacity(10 + name.len() + 1 + payload.len() + 8);
    out.extend_from_slice(&GZIP_MAGIC);
    out.push(METHOD_DEFLATE);
    out.push(FNAME);
    out.extend_from_slice(&mtime.to_le_bytes());
    out.push(XFL_BEST);
    out.push(OS_FAT);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());

    let mut out_path = path.as_os_str().to_os_string();
    out_path.push(".gz");
    let out_path = PathBuf::from(out_path);
    std::fs::write(&out_path, &out)?;
    Ok(out_path)
}

/// Decompress the gzip member at `path` into the same path with its `.gz`
/// suffix stripped, restoring the recorded mtime, and return the output path.
///
/// The trailer is verified: a crc32 or size mismatch fails the decode.
pub fn decode(path: impl AsRef<Path>) -> ZipResult<PathBuf> {
    let path = path.as_ref();
    let out_path = output_path(path)?;

    let data = std::fs::read(path)?;
    // Minimum: 10 byte header + 8 byte trailer.
    if data.len() < 18 {
        return invalid_archive("File too short to be a gzip member");
    }
    if !is_gzip(&data) {
        return invalid_archive("Missing gzip magic");
    }
    if data[2] != METHOD_DEFLATE {
        return Err(ZipError::UnsupportedArchive(
            "Only deflate gzip members are supported".into(),
        ));
    }

    let flags = data[3];
    let mtime = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let mut pos = 10usize;

    if flags & FEXTRA != 0 {
        if pos + 2 > data.len() {
            return invalid_archive("Truncated gzip extra field");
        }
        let xlen = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    if flags & FNAME != 0 {
        pos = skip_cstr(&data, pos)?;
    }
    if flags & FCOMMENT != 0 {
        pos = skip_cstr(&data, pos)?;
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    if pos + 8 > data.len() {
        return invalid_archive("Truncated gzip member");
    }

    let trailer_start = data.len() - 8;
    let expected_crc = u32::from_le_bytes([
        data[trailer_start],
        data[trailer_start + 1],
        data[trailer_start + 2],
        data[trailer_start + 3],
    ]);
    let expected_len = u32::from_le_bytes([
        data[trailer_start + 4],
        data[trailer_start + 5],
        data[trailer_start + 6],
        data[trailer_start + 7],
    ]);

    let mut decompressed = Vec::new();
    DeflateDecoder::new(&data[pos..trailer_start]).read_to_end(&mut decompressed)?;

    if crc32fast::hash(&decompressed) != expected_crc {
        return invalid_archive("Gzip checksum mismatch");
    }
    if decompressed.len() as u32 != expected_len {
        return invalid_archive("Gzip size mismatch");
    }

    let mut out = File::create(&out_path)?;
    out.write_all(&decompressed)?;
    if mtime != 0 {
        out.set_modified(UNIX_EPOCH + Duration::from_secs(mtime as u64))?;
    }
    Ok(out_path)
}

fn output_path(path: &Path) -> ZipResult<PathBuf> {
    let name = path.file_name().and_then(|n| n.to_str());
    match name.and_then(|n| n.strip_suffix(".gz")) {
        Some(stem) if !stem.is_empty() => Ok(path.with_file_name(stem)),
        _ => invalid_archive("Input file name does not end in .gz"),
    }
}

fn skip_cstr(data: &[u8], mut pos: usize) -> ZipResult<usize> {
    while pos < data.len() && data[pos] != 0 {
        pos += 1;
    }
    if pos >= data.len() {
        return invalid_archive("Unterminated gzip header string");
    }
    Ok(pos + 1)
}

/// Whether `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}
