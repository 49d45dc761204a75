use crc32fast::Hasher as Crc32;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path};
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the archive adapter.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    /// The buffer is not a valid ZIP container.
    MalformedArchive(String),
    /// A required entry is missing.
    NotFound(String),
    InvalidInput(String),
}

impl std::fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::MalformedArchive(msg) => write!(f, "Malformed archive: {msg}"),
            ApkZipError::NotFound(name) => write!(f, "Entry not found: {name}"),
            ApkZipError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApkZipError {}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkZipError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkZipError::MalformedArchive(value.to_string())
    }
}

/// A single entry stored in [`ApkFile`].
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub data: Vec<u8>,
    pub is_directory: bool,
}

impl ApkEntry {
    pub fn file(data: Vec<u8>) -> Self {
        ApkEntry {
            data,
            is_directory: false,
        }
    }

    pub fn directory() -> Self {
        ApkEntry {
            data: Vec::new(),
            is_directory: true,
        }
    }
}

/// An in-memory representation of an APK (ZIP) archive.
///
/// Entries are stored in a `BTreeMap`, so enumeration and serialization are
/// deterministic regardless of the order the input archive presented them.
pub struct ApkFile {
    entries: BTreeMap<String, ApkEntry>,
}

impl Default for ApkFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ApkFile {
    pub fn new() -> Self {
        ApkFile {
            entries: BTreeMap::new(),
        }
    }

    /// Load an archive from a byte buffer into memory.
    pub fn from_bytes(bytes: &[u8]) -> ApkZipResult<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = BTreeMap::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx)?;
            let raw_name = entry.name().to_string();
            if entry.is_dir() {
                let name = raw_name.trim_end_matches('/');
                let normalized = normalize_entry_name(name)?;
                entries.insert(format!("{normalized}/"), ApkEntry::directory());
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            let name = normalize_entry_name(&raw_name)?;
            entries.insert(name, ApkEntry::file(data));
        }
        Ok(ApkFile { entries })
    }

    /// Iterate over `(name, is_directory)` pairs in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.is_directory))
    }

    /// Iterate over file entry names (directories excluded) in sorted order.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_directory)
            .map(|(name, _)| name.as_str())
    }

    /// Borrow an entry by name.
    pub fn entry(&self, name: &str) -> Option<&ApkEntry> {
        self.entries.get(name)
    }

    /// Borrow the bytes of a required file entry.
    pub fn read_entry(&self, name: &str) -> ApkZipResult<&[u8]> {
        match self.entries.get(name) {
            Some(entry) if !entry.is_directory => Ok(&entry.data),
            _ => Err(ApkZipError::NotFound(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Add or overwrite a file entry.
    pub fn put_entry(&mut self, name: impl AsRef<str>, data: Vec<u8>) -> ApkZipResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        self.entries.insert(normalized, ApkEntry::file(data));
        Ok(())
    }

    /// Remove an entry by name.
    pub fn remove_entry(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the archive to a byte buffer.
    ///
    /// Every file entry is DEFLATE-compressed at the highest level; entries
    /// are written in sorted name order, so equal inputs produce equal
    /// buffers.
    pub fn to_bytes(&self) -> ApkZipResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut central_records = Vec::new();

        for (name, entry) in &self.entries {
            let record = if entry.is_directory {
                write_directory_entry(&mut buffer, name)
            } else {
                write_local_entry(&mut buffer, name, &entry.data)?
            };
            central_records.push(record);
        }

        let central_start = buffer.len() as u32;
        for record in &central_records {
            write_central_directory_entry(&mut buffer, record);
        }
        let central_size = buffer.len() as u32 - central_start;
        write_end_of_central_directory(
            &mut buffer,
            central_records.len(),
            central_size,
            central_start,
        );
        Ok(buffer)
    }
}

struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    is_directory: bool,
}

fn write_local_entry(
    buf: &mut Vec<u8>,
    name: &str,
    data: &[u8],
) -> ApkZipResult<CentralDirectoryRecord> {
    let offset = buf.len() as u32;
    let compressed = deflate_bytes(data)?;

    let mut crc = Crc32::new();
    crc.update(data);
    let crc32 = crc.finalize();

    write_u32(buf, 0x04034b50);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, 8); // DEFLATE
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, crc32);
    write_u32(buf, compressed.len() as u32);
    write_u32(buf, data.len() as u32);
    write_u16(buf, name.len() as u16);
    write_u16(buf, 0);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&compressed);

    Ok(CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        crc32,
        compressed_size: compressed.len() as u32,
        uncompressed_size: data.len() as u32,
        local_header_offset: offset,
        is_directory: false,
    })
}

fn write_directory_entry(buf: &mut Vec<u8>, name: &str) -> CentralDirectoryRecord {
    let offset = buf.len() as u32;
    write_u32(buf, 0x04034b50);
    write_u16(buf, 10);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, 0);
    write_u32(buf, 0);
    write_u32(buf, 0);
    write_u16(buf, name.len() as u16);
    write_u16(buf, 0);
    buf.extend_from_slice(name.as_bytes());

    CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        crc32: 0,
        compressed_size: 0,
        uncompressed_size: 0,
        local_header_offset: offset,
        is_directory: true,
    }
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, if record.is_directory { 10 } else { 20 });
    write_u16(buf, 0);
    write_u16(buf, if record.is_directory { 0 } else { 8 });
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    let external_attrs = if record.is_directory {
        (0o755u32 << 16) | 0x10
    } else {
        0o644u32 << 16
    };
    write_u32(buf, external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn normalize_entry_name(name: &str) -> ApkZipResult<String> {
    let mut components = Vec::new();
    for comp in Path::new(name).components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {name}"
                )));
            }
            Component::ParentDir => {
                return Err(ApkZipError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ));
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApkFile {
        let mut apk = ApkFile::new();
        apk.put_entry("classes.dex", vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        apk.put_entry("res/values/strings.xml", b"strings".to_vec()).unwrap();
        apk.put_entry("assets/a.txt", b"hello".to_vec()).unwrap();
        apk
    }

    #[test]
    fn round_trips_through_bytes() {
        let apk = sample();
        let bytes = apk.to_bytes().expect("serialize");
        let reloaded = ApkFile::from_bytes(&bytes).expect("reload");
        assert_eq!(
            reloaded.read_entry("classes.dex").unwrap(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(reloaded.read_entry("assets/a.txt").unwrap(), b"hello");
        let names: Vec<_> = reloaded.file_names().collect();
        assert_eq!(
            names,
            vec!["assets/a.txt", "classes.dex", "res/values/strings.xml"]
        );
    }

    #[test]
    fn serialization_is_deterministic() {
        let apk = sample();
        assert_eq!(apk.to_bytes().unwrap(), apk.to_bytes().unwrap());
    }

    #[test]
    fn missing_entry_is_not_found() {
        let apk = sample();
        match apk.read_entry("missing.bin") {
            Err(ApkZipError::NotFound(name)) => assert_eq!(name, "missing.bin"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn garbage_buffer_is_malformed() {
        match ApkFile::from_bytes(b"this is not a zip archive") {
            Err(ApkZipError::MalformedArchive(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_parent_components() {
        let mut apk = ApkFile::new();
        assert!(apk.put_entry("../evil", Vec::new()).is_err());
    }

    #[test]
    fn preserves_directory_entries() {
        let mut apk = ApkFile::new();
        apk.entries.insert("META-INF/".to_string(), ApkEntry::directory());
        apk.put_entry("META-INF/foo", vec![1]).unwrap();
        let bytes = apk.to_bytes().unwrap();
        let reloaded = ApkFile::from_bytes(&bytes).unwrap();
        let dirs: Vec<_> = reloaded
            .entries()
            .filter(|(_, is_dir)| *is_dir)
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(dirs, vec!["META-INF/"]);
    }
}
