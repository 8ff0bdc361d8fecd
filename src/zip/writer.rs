//! Streaming ZIP writer.
//!
//! Entries are written front to back in a single pass: each file's local
//! header carries the data descriptor flag, and the CRC-32 and sizes follow
//! the data once they are known. The central directory and end records are
//! emitted by [`ZipWriter::finish`].
//!
//! ## Prefixed archives
//!
//! Every offset the writer records is measured from the start of the
//! *file*, not from the first archive byte. When the archive is appended
//! after unrelated bytes (an executable stub, for instance), call
//! [`ZipWriter::set_offset`] with the prefix length before adding entries
//! so readers that locate the central directory from the end of the file
//! land on the right bytes.

use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::time::SystemTime;

use anyhow::{Result, bail};

use super::structures::*;
use crate::error::SfxError;

/// Metadata for an entry about to be written.
#[derive(Debug, Clone, Copy)]
pub struct EntryOptions {
    pub method: CompressionMethod,
    /// Permission bits; the file type bits are derived from the entry kind
    pub permissions: u32,
    pub modified: SystemTime,
}

impl EntryOptions {
    pub fn new(permissions: u32, modified: SystemTime) -> Self {
        Self {
            method: CompressionMethod::Deflate,
            permissions,
            modified,
        }
    }

    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }
}

/// Writer adapter that tracks the absolute file position.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Everything the central directory needs to know about a written entry.
struct CentralRecord {
    name: String,
    flags: u16,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    lfh_offset: u64,
    external_attrs: u32,
    mtime: u32,
}

/// ZIP archive writer
pub struct ZipWriter<W: Write> {
    out: CountingWriter<W>,
    records: Vec<CentralRecord>,
    names: HashSet<String>,
}

impl<W: Write> ZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: CountingWriter { inner, count: 0 },
            records: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Declare how many bytes precede the archive in the underlying file.
    ///
    /// Must be called before the first entry is added.
    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if !self.records.is_empty() {
            bail!("archive offset must be set before the first entry");
        }
        self.out.count = offset;
        Ok(())
    }

    /// Absolute position of the next byte to be written
    pub fn position(&self) -> u64 {
        self.out.count
    }

    /// Add a directory marker. A trailing `/` is appended if missing.
    pub fn add_directory(&mut self, name: &str, options: &EntryOptions) -> Result<()> {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{}/", name)
        };
        self.claim_name(&name)?;

        let mtime = unix_from_system_time(options.modified);
        let (dos_time, dos_date) = dos_datetime_from_unix(mtime);
        let record = CentralRecord {
            flags: utf8_flag(&name),
            method: CompressionMethod::Stored.as_u16(),
            dos_time,
            dos_date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            lfh_offset: self.out.count,
            external_attrs: ((S_IFDIR | (options.permissions & 0o7777)) << 16)
                | DOS_DIRECTORY_ATTR,
            mtime: clamp_mtime(mtime),
            name,
        };

        self.write_local_header(&record)?;
        self.records.push(record);
        Ok(())
    }

    /// Add a file entry, streaming its content from `reader`.
    ///
    /// Returns the number of uncompressed bytes written.
    pub fn add_file<R: Read + ?Sized>(
        &mut self,
        name: &str,
        options: &EntryOptions,
        reader: &mut R,
    ) -> Result<u64> {
        if let CompressionMethod::Unknown(method) = options.method {
            bail!(SfxError::UnsupportedCompression(method));
        }
        if name.ends_with('/') {
            bail!(SfxError::InvalidEntryName(name.to_string()));
        }
        self.claim_name(name)?;

        let mtime = unix_from_system_time(options.modified);
        let (dos_time, dos_date) = dos_datetime_from_unix(mtime);
        let mut record = CentralRecord {
            name: name.to_string(),
            flags: FLAG_DATA_DESCRIPTOR | utf8_flag(name),
            method: options.method.as_u16(),
            dos_time,
            dos_date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            lfh_offset: self.out.count,
            external_attrs: (S_IFREG | (options.permissions & 0o7777)) << 16,
            mtime: clamp_mtime(mtime),
        };
        self.write_local_header(&record)?;

        let data_start = self.out.count;
        let mut hasher = Hasher::new();
        let uncompressed_size = match options.method {
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
                let n = copy_hashing(reader, &mut encoder, &mut hasher)?;
                encoder.finish()?;
                n
            }
            _ => copy_hashing(reader, &mut self.out, &mut hasher)?,
        };

        record.crc32 = hasher.finalize();
        record.uncompressed_size = uncompressed_size;
        record.compressed_size = self.out.count - data_start;

        // Data descriptor
        let zip64 = record.compressed_size >= ZIP64_LIMIT || record.uncompressed_size >= ZIP64_LIMIT;
        self.out.write_all(DATA_DESCRIPTOR_SIGNATURE)?;
        self.out.write_u32::<LittleEndian>(record.crc32)?;
        if zip64 {
            self.out.write_u64::<LittleEndian>(record.compressed_size)?;
            self.out.write_u64::<LittleEndian>(record.uncompressed_size)?;
        } else {
            self.out.write_u32::<LittleEndian>(record.compressed_size as u32)?;
            self.out.write_u32::<LittleEndian>(record.uncompressed_size as u32)?;
        }

        self.records.push(record);
        Ok(uncompressed_size)
    }

    /// Write the central directory and end records, returning the inner writer.
    pub fn finish(mut self) -> Result<W> {
        let cd_offset = self.out.count;
        for record in &self.records {
            write_central_record(&mut self.out, record)?;
        }
        let cd_size = self.out.count - cd_offset;
        let total_entries = self.records.len() as u64;

        if total_entries >= ZIP64_ENTRY_LIMIT || cd_size >= ZIP64_LIMIT || cd_offset >= ZIP64_LIMIT {
            let eocd64_offset = self.out.count;
            Zip64EOCD {
                eocd64_size: (Zip64EOCD::MIN_SIZE - 12) as u64,
                version_made_by: HOST_UNIX << 8 | VERSION_ZIP64,
                version_needed: VERSION_ZIP64,
                disk_number: 0,
                disk_with_cd: 0,
                disk_entries: total_entries,
                total_entries,
                cd_size,
                cd_offset,
            }
            .write_to(&mut self.out)?;
            Zip64EOCDLocator {
                disk_with_eocd64: 0,
                eocd64_offset,
                total_disks: 1,
            }
            .write_to(&mut self.out)?;
        }

        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: total_entries.min(ZIP64_ENTRY_LIMIT) as u16,
            total_entries: total_entries.min(ZIP64_ENTRY_LIMIT) as u16,
            cd_size: cd_size.min(ZIP64_LIMIT) as u32,
            cd_offset: cd_offset.min(ZIP64_LIMIT) as u32,
            comment_len: 0,
        }
        .write_to(&mut self.out)?;

        self.out.flush()?;
        Ok(self.out.inner)
    }

    fn claim_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name == "/" || name.starts_with('/') || name.len() > u16::MAX as usize {
            bail!(SfxError::InvalidEntryName(name.to_string()));
        }
        if !self.names.insert(name.to_string()) {
            bail!(SfxError::DuplicateEntry(name.to_string()));
        }
        Ok(())
    }

    fn write_local_header(&mut self, record: &CentralRecord) -> io::Result<()> {
        let extra = extended_timestamp(record.mtime);
        let out = &mut self.out;
        out.write_all(LFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(VERSION_DEFAULT)?;
        out.write_u16::<LittleEndian>(record.flags)?;
        out.write_u16::<LittleEndian>(record.method)?;
        out.write_u16::<LittleEndian>(record.dos_time)?;
        out.write_u16::<LittleEndian>(record.dos_date)?;
        // CRC and sizes are zero here; directories have none and files carry
        // them in the data descriptor.
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(record.name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra.len() as u16)?;
        out.write_all(record.name.as_bytes())?;
        out.write_all(&extra)
    }
}

fn write_central_record<W: Write>(out: &mut W, record: &CentralRecord) -> io::Result<()> {
    // ZIP64 extended information: only the saturated fields, in this order
    let mut zip64 = Vec::new();
    if record.uncompressed_size >= ZIP64_LIMIT {
        zip64.write_u64::<LittleEndian>(record.uncompressed_size)?;
    }
    if record.compressed_size >= ZIP64_LIMIT {
        zip64.write_u64::<LittleEndian>(record.compressed_size)?;
    }
    if record.lfh_offset >= ZIP64_LIMIT {
        zip64.write_u64::<LittleEndian>(record.lfh_offset)?;
    }

    let mut extra = Vec::new();
    if !zip64.is_empty() {
        extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
        extra.write_u16::<LittleEndian>(zip64.len() as u16)?;
        extra.extend_from_slice(&zip64);
    }
    extra.extend_from_slice(&extended_timestamp(record.mtime));

    let version_needed = if zip64.is_empty() {
        VERSION_DEFAULT
    } else {
        VERSION_ZIP64
    };

    out.write_all(CDFH_SIGNATURE)?;
    out.write_u16::<LittleEndian>(HOST_UNIX << 8 | version_needed)?;
    out.write_u16::<LittleEndian>(version_needed)?;
    out.write_u16::<LittleEndian>(record.flags)?;
    out.write_u16::<LittleEndian>(record.method)?;
    out.write_u16::<LittleEndian>(record.dos_time)?;
    out.write_u16::<LittleEndian>(record.dos_date)?;
    out.write_u32::<LittleEndian>(record.crc32)?;
    out.write_u32::<LittleEndian>(record.compressed_size.min(ZIP64_LIMIT) as u32)?;
    out.write_u32::<LittleEndian>(record.uncompressed_size.min(ZIP64_LIMIT) as u32)?;
    out.write_u16::<LittleEndian>(record.name.len() as u16)?;
    out.write_u16::<LittleEndian>(extra.len() as u16)?;
    out.write_u16::<LittleEndian>(0)?; // comment length
    out.write_u16::<LittleEndian>(0)?; // disk number start
    out.write_u16::<LittleEndian>(0)?; // internal attributes
    out.write_u32::<LittleEndian>(record.external_attrs)?;
    out.write_u32::<LittleEndian>(record.lfh_offset.min(ZIP64_LIMIT) as u32)?;
    out.write_all(record.name.as_bytes())?;
    out.write_all(&extra)
}

/// Extended timestamp extra field carrying only the modification time
fn extended_timestamp(mtime: u32) -> Vec<u8> {
    let mut field = Vec::with_capacity(9);
    field.extend_from_slice(&EXTENDED_TIMESTAMP_ID.to_le_bytes());
    field.extend_from_slice(&5u16.to_le_bytes());
    field.push(1); // mtime present
    field.extend_from_slice(&mtime.to_le_bytes());
    field
}

fn clamp_mtime(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

fn utf8_flag(name: &str) -> u16 {
    if name.is_ascii() { 0 } else { FLAG_UTF8 }
}

fn copy_hashing<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
    hasher: &mut Hasher,
) -> io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}
