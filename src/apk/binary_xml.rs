//! Reader, fact extractor and rewriter for the Android compiled-XML format.
//!
//! The document is kept as the original byte buffer plus a parsed view: the
//! string pool, the attribute resource-id table, and the linear stream of
//! element chunks with their source offsets. Keeping offsets lets the
//! debuggable patch rewrite a single data word in place when the attribute
//! already exists; otherwise the whole buffer is regenerated.

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";
const PERMISSION_PREFIX: &str = "android.permission.";

pub(crate) const TYPE_STRING: u8 = 0x03;
pub(crate) const TYPE_INT_BOOLEAN: u8 = 0x12;

/// Resource identifier of `android:debuggable`.
pub const DEBUGGABLE_RESOURCE_ID: u32 = 0x0101_000f;

const DEBUGGABLE_ATTR: &str = "debuggable";

/// Size of one attribute record inside a start-element chunk.
const ATTRIBUTE_RECORD_SIZE: usize = 20;

/// Result alias for compiled-XML operations.
pub type AxmlResult<T> = Result<T, AxmlError>;

/// Errors surfaced by the compiled-XML codec.
#[derive(Debug)]
pub enum AxmlError {
    /// The buffer does not start with the compiled-XML chunk tag.
    InvalidMagic(u16),
    /// A chunk header or payload extends past the available bytes.
    TruncatedChunk(String),
    /// An element-stream reference points outside the string pool.
    StringIndexOutOfRange(u32),
    /// A structural rewrite cannot keep the resource-id table aligned.
    RewriteInfeasible(String),
    /// The document violates the expected structure.
    MalformedDocument(String),
}

impl std::fmt::Display for AxmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxmlError::InvalidMagic(found) => {
                write!(f, "Not compiled XML: leading chunk type 0x{found:04x}")
            }
            AxmlError::TruncatedChunk(msg) => write!(f, "Truncated chunk: {msg}"),
            AxmlError::StringIndexOutOfRange(idx) => {
                write!(f, "String index {idx} is out of range")
            }
            AxmlError::RewriteInfeasible(msg) => write!(f, "Rewrite infeasible: {msg}"),
            AxmlError::MalformedDocument(msg) => write!(f, "Malformed document: {msg}"),
        }
    }
}

impl std::error::Error for AxmlError {}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> AxmlResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(AxmlError::TruncatedChunk(
                "unexpected end of document".to_string(),
            ));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> AxmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(AxmlError::TruncatedChunk(
                "unexpected end of document".to_string(),
            ));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> AxmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(AxmlError::TruncatedChunk(
                "unexpected end of document".to_string(),
            ));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> AxmlResult<()> {
        if offset > self.data.len() {
            return Err(AxmlError::TruncatedChunk(
                "seek past end of document".to_string(),
            ));
        }
        self.pos = offset;
        Ok(())
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> AxmlResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(AxmlError::TruncatedChunk("chunk header".to_string()));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 || chunk_size < 8 {
        return Err(AxmlError::TruncatedChunk(format!(
            "chunk 0x{chunk_type:04x} declares size {chunk_size}"
        )));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| AxmlError::TruncatedChunk("chunk size overflow".to_string()))?;
    if end > reader.data.len() {
        return Err(AxmlError::TruncatedChunk(format!(
            "chunk 0x{chunk_type:04x} extends past end of document"
        )));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> AxmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let _styles_start = reader.read_u32()?;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }
        for _ in 0..style_count {
            reader.read_u32()?; // skip style offsets
        }

        let strings_base = header.start + strings_start;
        let chunk_end = header.end();

        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }
        Ok(StringPool { strings })
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> AxmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(AxmlError::TruncatedChunk(
            "string offset exceeds pool bounds".to_string(),
        ));
    }
    let (_char_len, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(AxmlError::TruncatedChunk(
            "UTF-8 string exceeds pool bounds".to_string(),
        ));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text = std::str::from_utf8(slice)
        .map_err(|err| AxmlError::MalformedDocument(err.to_string()))?;
    if cursor + byte_len >= limit {
        return Err(AxmlError::TruncatedChunk(
            "missing UTF-8 terminator".to_string(),
        ));
    }
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> AxmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len + 2 > limit {
        return Err(AxmlError::TruncatedChunk(
            "UTF-16 string exceeds pool bounds".to_string(),
        ));
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    String::from_utf16(&units).map_err(|err| AxmlError::MalformedDocument(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> AxmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(AxmlError::TruncatedChunk("UTF-8 length".to_string()));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(AxmlError::TruncatedChunk("UTF-8 length".to_string()));
        }
        let second = data[offset + 1];
        Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> AxmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(AxmlError::TruncatedChunk("UTF-16 length".to_string()));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(AxmlError::TruncatedChunk("UTF-16 length".to_string()));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

#[derive(Clone, Debug)]
struct NamespaceChunk {
    line: u32,
    comment: u32,
    prefix: u32,
    uri: u32,
}

#[derive(Clone, Debug)]
struct AttributeRecord {
    /// Byte offset of this record in the source buffer.
    offset: usize,
    ns: u32,
    name: u32,
    raw_value: u32,
    type_tag: u8,
    data: u32,
}

#[derive(Clone, Debug)]
struct StartElementChunk {
    line: u32,
    comment: u32,
    ns: u32,
    name: u32,
    id_index: u16,
    class_index: u16,
    style_index: u16,
    attributes: Vec<AttributeRecord>,
}

#[derive(Clone, Debug)]
struct EndElementChunk {
    line: u32,
    comment: u32,
    ns: u32,
    name: u32,
}

#[derive(Clone, Debug)]
struct CdataChunk {
    line: u32,
    comment: u32,
    data_index: u32,
    type_tag: u8,
    data: u32,
}

#[derive(Clone, Debug)]
enum XmlChunk {
    StartNamespace(NamespaceChunk),
    EndNamespace(NamespaceChunk),
    Start(StartElementChunk),
    End(EndElementChunk),
    Cdata(CdataChunk),
    /// Unrecognized chunk, kept as a raw byte range of the source buffer.
    Unknown { start: usize, size: usize },
}

/// Facts read from a parsed manifest document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestFacts {
    pub package: String,
    pub version_code: u32,
    pub version_name: String,
    pub min_sdk: u32,
    pub target_sdk: u32,
    pub is_debuggable: bool,
    pub application_name: Option<String>,
    pub permissions: Vec<String>,
}

impl Default for ManifestFacts {
    fn default() -> Self {
        ManifestFacts {
            package: "unknown".to_string(),
            version_code: 0,
            version_name: String::new(),
            min_sdk: 0,
            target_sdk: 0,
            is_debuggable: false,
            application_name: None,
            permissions: Vec::new(),
        }
    }
}

/// Outcome of a debuggable rewrite.
#[derive(Clone, Debug)]
pub enum DebugPatch {
    /// The attribute existed; exactly its 4-byte data word was overwritten.
    InPlace(Vec<u8>),
    /// The buffer was regenerated with the attribute inserted.
    Rebuilt(Vec<u8>),
}

impl DebugPatch {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            DebugPatch::InPlace(bytes) | DebugPatch::Rebuilt(bytes) => bytes,
        }
    }

    pub fn was_in_place(&self) -> bool {
        matches!(self, DebugPatch::InPlace(_))
    }
}

/// A parsed compiled-XML document.
pub struct AxmlDocument {
    source: Vec<u8>,
    strings: Vec<String>,
    resource_ids: Vec<u32>,
    chunks: Vec<XmlChunk>,
}

impl AxmlDocument {
    pub fn parse(bytes: &[u8]) -> AxmlResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let file_header = read_chunk_header(&mut reader)?;
        if file_header.chunk_type != RES_XML_TYPE {
            return Err(AxmlError::InvalidMagic(file_header.chunk_type));
        }
        let file_end = file_header.end();
        reader.seek(file_header.start + file_header.header_size as usize)?;

        let mut strings: Option<StringPool> = None;
        let mut resource_ids = Vec::new();
        let mut chunks = Vec::new();
        let mut depth = 0usize;
        let mut seen_root = false;

        while reader.position() < file_end {
            let header = read_chunk_header(&mut reader)?;
            let chunk_end = header.end();
            match header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    strings = Some(StringPool::parse(&mut reader, &header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    let mut ids = Vec::new();
                    while reader.position() < chunk_end {
                        ids.push(reader.read_u32()?);
                    }
                    resource_ids = ids;
                }
                RES_XML_START_NAMESPACE_TYPE | RES_XML_END_NAMESPACE_TYPE => {
                    let line = reader.read_u32()?;
                    let comment = reader.read_u32()?;
                    let prefix = reader.read_u32()?;
                    let uri = reader.read_u32()?;
                    let ns = NamespaceChunk {
                        line,
                        comment,
                        prefix,
                        uri,
                    };
                    if header.chunk_type == RES_XML_START_NAMESPACE_TYPE {
                        chunks.push(XmlChunk::StartNamespace(ns));
                    } else {
                        chunks.push(XmlChunk::EndNamespace(ns));
                    }
                }
                RES_XML_START_ELEMENT_TYPE => {
                    let element = parse_start_element(&mut reader, &header)?;
                    depth += 1;
                    seen_root = true;
                    chunks.push(XmlChunk::Start(element));
                }
                RES_XML_END_ELEMENT_TYPE => {
                    let line = reader.read_u32()?;
                    let comment = reader.read_u32()?;
                    let ns = reader.read_u32()?;
                    let name = reader.read_u32()?;
                    if depth == 0 {
                        return Err(AxmlError::MalformedDocument(
                            "end element without matching start".to_string(),
                        ));
                    }
                    depth -= 1;
                    chunks.push(XmlChunk::End(EndElementChunk {
                        line,
                        comment,
                        ns,
                        name,
                    }));
                }
                RES_XML_CDATA_TYPE => {
                    let line = reader.read_u32()?;
                    let comment = reader.read_u32()?;
                    let data_index = reader.read_u32()?;
                    reader.read_u16()?; // value size
                    reader.read_u8()?; // res0
                    let type_tag = reader.read_u8()?;
                    let data = reader.read_u32()?;
                    chunks.push(XmlChunk::Cdata(CdataChunk {
                        line,
                        comment,
                        data_index,
                        type_tag,
                        data,
                    }));
                }
                _ => {
                    chunks.push(XmlChunk::Unknown {
                        start: header.start,
                        size: header.chunk_size as usize,
                    });
                }
            }
            reader.seek(chunk_end)?;
        }

        if depth != 0 {
            return Err(AxmlError::MalformedDocument(
                "unclosed elements at end of document".to_string(),
            ));
        }
        if !seen_root {
            return Err(AxmlError::MalformedDocument(
                "document has no elements".to_string(),
            ));
        }

        let strings = strings
            .ok_or_else(|| AxmlError::MalformedDocument("document has no string pool".to_string()))?
            .strings;

        let document = AxmlDocument {
            source: bytes.to_vec(),
            strings,
            resource_ids,
            chunks,
        };
        document.validate_references()?;
        if document.root_tag() != Some("manifest") {
            return Err(AxmlError::MalformedDocument(
                "root element is not <manifest>".to_string(),
            ));
        }
        Ok(document)
    }

    /// The original buffer; a parse/serialize round trip on the read path is
    /// byte-identical by construction.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.source.clone()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn resource_ids(&self) -> &[u32] {
        &self.resource_ids
    }

    fn validate_references(&self) -> AxmlResult<()> {
        let limit = self.strings.len() as u32;
        let check = |idx: u32| -> AxmlResult<()> {
            if idx != NO_ENTRY_INDEX && idx >= limit {
                return Err(AxmlError::StringIndexOutOfRange(idx));
            }
            Ok(())
        };
        for chunk in &self.chunks {
            match chunk {
                XmlChunk::StartNamespace(ns) | XmlChunk::EndNamespace(ns) => {
                    check(ns.prefix)?;
                    check(ns.uri)?;
                }
                XmlChunk::Start(element) => {
                    check(element.ns)?;
                    if element.name >= limit {
                        return Err(AxmlError::StringIndexOutOfRange(element.name));
                    }
                    for attr in &element.attributes {
                        check(attr.ns)?;
                        if attr.name >= limit {
                            return Err(AxmlError::StringIndexOutOfRange(attr.name));
                        }
                        check(attr.raw_value)?;
                        if attr.type_tag == TYPE_STRING {
                            check(attr.data)?;
                        }
                    }
                }
                XmlChunk::End(end) => {
                    check(end.ns)?;
                    if end.name >= limit {
                        return Err(AxmlError::StringIndexOutOfRange(end.name));
                    }
                }
                XmlChunk::Cdata(cdata) => {
                    check(cdata.data_index)?;
                    if cdata.type_tag == TYPE_STRING {
                        check(cdata.data)?;
                    }
                }
                XmlChunk::Unknown { .. } => {}
            }
        }
        Ok(())
    }

    fn root_tag(&self) -> Option<&str> {
        self.chunks.iter().find_map(|chunk| match chunk {
            XmlChunk::Start(element) => self.strings.get(element.name as usize).map(|s| s.as_str()),
            _ => None,
        })
    }

    fn string_at(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    fn start_elements(&self) -> impl Iterator<Item = &StartElementChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            XmlChunk::Start(element) => Some(element),
            _ => None,
        })
    }

    fn find_attribute<'a>(
        &'a self,
        element: &'a StartElementChunk,
        name: &str,
    ) -> Option<&'a AttributeRecord> {
        element
            .attributes
            .iter()
            .find(|attr| self.string_at(attr.name) == Some(name))
    }

    /// The string value of an attribute, resolved through the raw-value
    /// index first and the typed data word second.
    fn attribute_string(&self, attr: &AttributeRecord) -> Option<&str> {
        if let Some(raw) = self.string_at(attr.raw_value) {
            return Some(raw);
        }
        if attr.type_tag == TYPE_STRING {
            return self.string_at(attr.data);
        }
        None
    }

    /// Extract the read-only fact set from the parsed document.
    pub fn facts(&self) -> ManifestFacts {
        let mut facts = ManifestFacts::default();
        for element in self.start_elements() {
            match self.string_at(element.name) {
                Some("manifest") => {
                    if let Some(attr) = self.find_attribute(element, "package") {
                        if let Some(value) = self.attribute_string(attr) {
                            facts.package = value.to_string();
                        }
                    }
                    if let Some(attr) = self.find_attribute(element, "versionCode") {
                        facts.version_code = attr.data;
                    }
                    if let Some(attr) = self.find_attribute(element, "versionName") {
                        if let Some(value) = self.attribute_string(attr) {
                            facts.version_name = value.to_string();
                        }
                    }
                }
                Some("uses-sdk") => {
                    if let Some(attr) = self.find_attribute(element, "minSdkVersion") {
                        facts.min_sdk = attr.data;
                    }
                    if let Some(attr) = self.find_attribute(element, "targetSdkVersion") {
                        facts.target_sdk = attr.data;
                    }
                }
                Some("application") => {
                    if let Some(attr) = self.find_attribute(element, DEBUGGABLE_ATTR) {
                        facts.is_debuggable = attr.data != 0;
                    }
                    if let Some(attr) = self.find_attribute(element, "name") {
                        if let Some(value) = self.attribute_string(attr) {
                            facts.application_name = Some(value.to_string());
                        }
                    }
                }
                Some("uses-permission") => {
                    if let Some(attr) = self.find_attribute(element, "name") {
                        if let Some(value) = self.attribute_string(attr) {
                            let short = value
                                .strip_prefix(PERMISSION_PREFIX)
                                .unwrap_or(value);
                            facts.permissions.push(short.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        facts
    }

    fn is_debuggable_attribute(&self, attr: &AttributeRecord) -> bool {
        if self.resource_ids.get(attr.name as usize) == Some(&DEBUGGABLE_RESOURCE_ID) {
            return true;
        }
        self.string_at(attr.name) == Some(DEBUGGABLE_ATTR)
            && self.string_at(attr.ns) == Some(ANDROID_NAMESPACE_URI)
    }

    /// Produce a buffer equal to the source except that `application`
    /// carries `android:debuggable=true`.
    pub fn make_debuggable(&self) -> AxmlResult<DebugPatch> {
        let application = self
            .start_elements()
            .find(|element| self.string_at(element.name) == Some("application"))
            .ok_or_else(|| {
                AxmlError::MalformedDocument("manifest has no application element".to_string())
            })?;

        if let Some(attr) = application
            .attributes
            .iter()
            .find(|attr| self.is_debuggable_attribute(attr))
        {
            // Data word lives at the tail of the 20-byte record.
            let mut patched = self.source.clone();
            let data_offset = attr.offset + 16;
            patched[data_offset..data_offset + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            return Ok(DebugPatch::InPlace(patched));
        }

        self.rebuild_with_debuggable().map(DebugPatch::Rebuilt)
    }

    /// Regenerate the whole buffer with a `debuggable=true` attribute
    /// appended to `application`, keeping the resource-id table aligned
    /// with the attribute-name prefix of the string pool.
    fn rebuild_with_debuggable(&self) -> AxmlResult<Vec<u8>> {
        let prefix_len = self.resource_ids.len();
        if prefix_len > self.strings.len() {
            return Err(AxmlError::RewriteInfeasible(
                "resource-id table is longer than the string pool".to_string(),
            ));
        }

        // Reuse an existing aligned name when possible; otherwise insert the
        // name right after the attribute-name prefix and shift everything
        // behind it by one.
        let existing = self.strings[..prefix_len]
            .iter()
            .position(|s| s == DEBUGGABLE_ATTR);
        let (strings, resource_ids, name_index, shift_from) = match existing {
            Some(idx) => {
                if self.resource_ids[idx] != DEBUGGABLE_RESOURCE_ID {
                    return Err(AxmlError::RewriteInfeasible(format!(
                        "attribute name '{DEBUGGABLE_ATTR}' is bound to resource id 0x{:08x}",
                        self.resource_ids[idx]
                    )));
                }
                (self.strings.clone(), self.resource_ids.clone(), idx as u32, None)
            }
            None => {
                let mut strings = self.strings.clone();
                strings.insert(prefix_len, DEBUGGABLE_ATTR.to_string());
                let mut ids = self.resource_ids.clone();
                ids.push(DEBUGGABLE_RESOURCE_ID);
                (strings, ids, prefix_len as u32, Some(prefix_len as u32))
            }
        };

        let remap = |idx: u32| -> u32 {
            match shift_from {
                Some(from) if idx != NO_ENTRY_INDEX && idx >= from => idx + 1,
                _ => idx,
            }
        };

        let android_ns = strings
            .iter()
            .position(|s| s == ANDROID_NAMESPACE_URI)
            .map(|idx| idx as u32)
            .ok_or_else(|| {
                AxmlError::RewriteInfeasible(
                    "manifest does not declare the android namespace".to_string(),
                )
            })?;

        let mut application_seen = false;
        let mut out = Vec::with_capacity(self.source.len() + 64);
        let file_start = begin_chunk(&mut out, RES_XML_TYPE, 8);
        write_string_pool(&mut out, &strings);
        if !resource_ids.is_empty() {
            write_resource_map(&mut out, &resource_ids);
        }

        for chunk in &self.chunks {
            match chunk {
                XmlChunk::StartNamespace(ns) => write_namespace_chunk(
                    &mut out,
                    RES_XML_START_NAMESPACE_TYPE,
                    ns.line,
                    ns.comment,
                    remap(ns.prefix),
                    remap(ns.uri),
                ),
                XmlChunk::EndNamespace(ns) => write_namespace_chunk(
                    &mut out,
                    RES_XML_END_NAMESPACE_TYPE,
                    ns.line,
                    ns.comment,
                    remap(ns.prefix),
                    remap(ns.uri),
                ),
                XmlChunk::Start(element) => {
                    let mut attrs: Vec<RawAttribute> = element
                        .attributes
                        .iter()
                        .map(|attr| RawAttribute {
                            ns: remap(attr.ns),
                            name: remap(attr.name),
                            raw_value: remap(attr.raw_value),
                            type_tag: attr.type_tag,
                            data: if attr.type_tag == TYPE_STRING {
                                remap(attr.data)
                            } else {
                                attr.data
                            },
                        })
                        .collect();
                    let is_application = !application_seen
                        && self.string_at(element.name) == Some("application");
                    if is_application {
                        application_seen = true;
                        attrs.push(RawAttribute {
                            ns: android_ns,
                            name: name_index,
                            raw_value: NO_ENTRY_INDEX,
                            type_tag: TYPE_INT_BOOLEAN,
                            data: 0xFFFF_FFFF,
                        });
                    }
                    write_start_element_chunk(
                        &mut out,
                        element.line,
                        element.comment,
                        remap(element.ns),
                        remap(element.name),
                        element.id_index,
                        element.class_index,
                        element.style_index,
                        &attrs,
                    );
                }
                XmlChunk::End(end) => write_end_element_chunk(
                    &mut out,
                    end.line,
                    end.comment,
                    remap(end.ns),
                    remap(end.name),
                ),
                XmlChunk::Cdata(cdata) => write_cdata_chunk(
                    &mut out,
                    cdata.line,
                    cdata.comment,
                    remap(cdata.data_index),
                    cdata.type_tag,
                    if cdata.type_tag == TYPE_STRING {
                        remap(cdata.data)
                    } else {
                        cdata.data
                    },
                ),
                XmlChunk::Unknown { start, size } => {
                    out.extend_from_slice(&self.source[*start..*start + *size]);
                }
            }
        }
        finalize_chunk(&mut out, file_start);
        Ok(out)
    }
}

fn parse_start_element(
    reader: &mut BinaryReader<'_>,
    header: &ChunkHeader,
) -> AxmlResult<StartElementChunk> {
    let line = reader.read_u32()?;
    let comment = reader.read_u32()?;
    let ns = reader.read_u32()?;
    let name = reader.read_u32()?;
    let attribute_start = reader.read_u16()? as usize;
    let attribute_size = reader.read_u16()? as usize;
    let attr_count = reader.read_u16()? as usize;
    let id_index = reader.read_u16()?;
    let class_index = reader.read_u16()?;
    let style_index = reader.read_u16()?;

    if attribute_size < ATTRIBUTE_RECORD_SIZE {
        return Err(AxmlError::MalformedDocument(format!(
            "attribute record size {attribute_size} is too small"
        )));
    }

    // attributeStart is relative to the end of the 16-byte node header.
    let attrs_base = header.start + 16 + attribute_start;
    let mut attributes = Vec::with_capacity(attr_count);
    for idx in 0..attr_count {
        let offset = attrs_base + idx * attribute_size;
        reader.seek(offset)?;
        let ns = reader.read_u32()?;
        let name = reader.read_u32()?;
        let raw_value = reader.read_u32()?;
        let value_size = reader.read_u16()?;
        reader.read_u8()?; // res0
        let type_tag = reader.read_u8()?;
        let data = reader.read_u32()?;
        if value_size != 8 {
            return Err(AxmlError::MalformedDocument(format!(
                "attribute value size {value_size} is not 8"
            )));
        }
        attributes.push(AttributeRecord {
            offset,
            ns,
            name,
            raw_value,
            type_tag,
            data,
        });
    }
    Ok(StartElementChunk {
        line,
        comment,
        ns,
        name,
        id_index,
        class_index,
        style_index,
        attributes,
    })
}

/// Attribute values passed to the chunk serializers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawAttribute {
    pub ns: u32,
    pub name: u32,
    pub raw_value: u32,
    pub type_tag: u8,
    pub data: u32,
}

fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // size placeholder
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        write_u8(buf, len as u8);
    } else {
        write_u8(buf, 0x80 | ((len >> 8) as u8 & 0x7F));
        write_u8(buf, (len & 0xFF) as u8);
    }
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    write_utf8_length(buf, text.encode_utf16().count());
    write_utf8_length(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    write_u8(buf, 0);
}

/// Serialize a UTF-8 string pool; string data starts at the offset declared
/// in the pool header and the chunk is padded to a 4-byte boundary.
pub(crate) fn write_string_pool(buf: &mut Vec<u8>, strings: &[String]) {
    let string_count = strings.len() as u32;
    let header_size = 28u16;
    let strings_start = header_size as u32 + string_count * 4;

    let mut string_data = Vec::new();
    let mut offsets = Vec::with_capacity(strings.len());
    for s in strings {
        offsets.push(string_data.len() as u32);
        write_utf8_string(&mut string_data, s);
    }
    align_to_four(&mut string_data);

    let chunk_start = begin_chunk(buf, RES_STRING_POOL_TYPE, header_size);
    write_u32(buf, string_count);
    write_u32(buf, 0); // style count
    write_u32(buf, STRING_FLAG_UTF8);
    write_u32(buf, strings_start);
    write_u32(buf, 0); // stylesStart
    for offset in offsets {
        write_u32(buf, offset);
    }
    buf.extend_from_slice(&string_data);
    finalize_chunk(buf, chunk_start);
}

pub(crate) fn write_resource_map(buf: &mut Vec<u8>, ids: &[u32]) {
    let chunk_start = begin_chunk(buf, RES_XML_RESOURCE_MAP_TYPE, 8);
    for id in ids {
        write_u32(buf, *id);
    }
    finalize_chunk(buf, chunk_start);
}

pub(crate) fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    chunk_type: u16,
    line: u32,
    comment: u32,
    prefix: u32,
    uri: u32,
) {
    let chunk_start = begin_chunk(buf, chunk_type, 16);
    write_u32(buf, line);
    write_u32(buf, comment);
    write_u32(buf, prefix);
    write_u32(buf, uri);
    finalize_chunk(buf, chunk_start);
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn write_start_element_chunk(
    buf: &mut Vec<u8>,
    line: u32,
    comment: u32,
    ns: u32,
    name: u32,
    id_index: u16,
    class_index: u16,
    style_index: u16,
    attrs: &[RawAttribute],
) {
    let chunk_start = begin_chunk(buf, RES_XML_START_ELEMENT_TYPE, 16);
    write_u32(buf, line);
    write_u32(buf, comment);
    write_u32(buf, ns);
    write_u32(buf, name);
    write_u16(buf, ATTRIBUTE_RECORD_SIZE as u16); // attributeStart
    write_u16(buf, ATTRIBUTE_RECORD_SIZE as u16); // attributeSize
    write_u16(buf, attrs.len() as u16);
    write_u16(buf, id_index);
    write_u16(buf, class_index);
    write_u16(buf, style_index);
    for attr in attrs {
        write_u32(buf, attr.ns);
        write_u32(buf, attr.name);
        write_u32(buf, attr.raw_value);
        write_u16(buf, 8); // value size
        write_u8(buf, 0); // res0
        write_u8(buf, attr.type_tag);
        write_u32(buf, attr.data);
    }
    finalize_chunk(buf, chunk_start);
}

pub(crate) fn write_end_element_chunk(
    buf: &mut Vec<u8>,
    line: u32,
    comment: u32,
    ns: u32,
    name: u32,
) {
    let chunk_start = begin_chunk(buf, RES_XML_END_ELEMENT_TYPE, 16);
    write_u32(buf, line);
    write_u32(buf, comment);
    write_u32(buf, ns);
    write_u32(buf, name);
    finalize_chunk(buf, chunk_start);
}

pub(crate) fn write_cdata_chunk(
    buf: &mut Vec<u8>,
    line: u32,
    comment: u32,
    data_index: u32,
    type_tag: u8,
    data: u32,
) {
    let chunk_start = begin_chunk(buf, RES_XML_CDATA_TYPE, 16);
    write_u32(buf, line);
    write_u32(buf, comment);
    write_u32(buf, data_index);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, type_tag);
    write_u32(buf, data);
    finalize_chunk(buf, chunk_start);
}

/// Heuristic last-resort patch used when the document cannot be parsed.
///
/// Locates the resource-map chunk without a full parse, finds the table
/// index of the debuggable resource id, then overwrites the data word of
/// the first attribute record that references that index with a boolean
/// type marker. Returns `None` when nothing safe to patch was found.
pub fn force_debuggable_bytes(data: &[u8]) -> Option<Vec<u8>> {
    let name_index = find_resource_map_index(data, DEBUGGABLE_RESOURCE_ID)?;
    let marker = [0x08u8, 0x00, 0x00, TYPE_INT_BOOLEAN];
    let mut offset = 0usize;
    while offset + ATTRIBUTE_RECORD_SIZE <= data.len() {
        let candidate_name = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        if candidate_name == name_index && data[offset + 12..offset + 16] == marker {
            let mut patched = data.to_vec();
            patched[offset + 16..offset + 20].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            return Some(patched);
        }
        offset += 4;
    }
    None
}

fn find_resource_map_index(data: &[u8], resource_id: u32) -> Option<u32> {
    let mut offset = 8usize;
    while offset + 8 <= data.len() {
        let chunk_type = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let header_size = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let chunk_size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        if chunk_type == RES_XML_RESOURCE_MAP_TYPE
            && header_size == 8
            && chunk_size >= 8
            && chunk_size % 4 == 0
            && offset + chunk_size <= data.len()
        {
            let ids = &data[offset + 8..offset + chunk_size];
            return ids
                .chunks_exact(4)
                .position(|id| u32::from_le_bytes([id[0], id[1], id[2], id[3]]) == resource_id)
                .map(|idx| idx as u32);
        }
        offset += 4;
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;

    fn diff_positions(a: &[u8], b: &[u8]) -> Vec<usize> {
        assert_eq!(a.len(), b.len(), "buffers differ in length");
        a.iter()
            .zip(b.iter())
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(idx, _)| idx)
            .collect()
    }

    #[test]
    fn parses_fixture_and_extracts_facts() {
        let bytes = fixtures::manifest_bytes(Some(false));
        let document = AxmlDocument::parse(&bytes).expect("parse fixture");
        let facts = document.facts();
        assert_eq!(facts.package, "com.example.app");
        assert_eq!(facts.version_code, 7);
        assert_eq!(facts.version_name, "1.2.3");
        assert_eq!(facts.min_sdk, 21);
        assert_eq!(facts.target_sdk, 34);
        assert!(!facts.is_debuggable);
        assert_eq!(facts.application_name.as_deref(), Some("com.example.app.App"));
        assert_eq!(facts.permissions, vec!["INTERNET".to_string()]);
    }

    #[test]
    fn read_path_round_trip_is_byte_identical() {
        let bytes = fixtures::manifest_bytes(None);
        let document = AxmlDocument::parse(&bytes).expect("parse fixture");
        assert_eq!(document.to_bytes(), bytes);
    }

    #[test]
    fn in_place_patch_changes_exactly_the_data_word() {
        let bytes = fixtures::manifest_bytes(Some(false));
        let document = AxmlDocument::parse(&bytes).expect("parse fixture");
        let patch = document.make_debuggable().expect("patch");
        assert!(patch.was_in_place());
        let patched = patch.into_bytes();
        assert_eq!(patched.len(), bytes.len());
        let diff = diff_positions(&bytes, &patched);
        assert_eq!(diff.len(), 4, "expected a single data-word change");
        assert_eq!(diff[0] + 3, diff[3]);
        assert_eq!(&patched[diff[0]..diff[0] + 4], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let reparsed = AxmlDocument::parse(&patched).expect("patched parses");
        assert!(reparsed.facts().is_debuggable);
    }

    #[test]
    fn in_place_patch_keeps_true_true() {
        let bytes = fixtures::manifest_bytes(Some(true));
        let document = AxmlDocument::parse(&bytes).expect("parse fixture");
        let patched = document.make_debuggable().expect("patch").into_bytes();
        assert_eq!(patched, bytes);
    }

    #[test]
    fn structural_rewrite_inserts_aligned_attribute() {
        let bytes = fixtures::manifest_bytes(None);
        let document = AxmlDocument::parse(&bytes).expect("parse fixture");
        let original_app_attrs = document
            .start_elements()
            .find(|e| document.string_at(e.name) == Some("application"))
            .map(|e| e.attributes.len())
            .unwrap();

        let patch = document.make_debuggable().expect("patch");
        assert!(!patch.was_in_place());
        let rebuilt = patch.into_bytes();
        let reparsed = AxmlDocument::parse(&rebuilt).expect("rebuilt parses");

        let name_index = reparsed
            .strings()
            .iter()
            .position(|s| s == "debuggable")
            .expect("debuggable in pool");
        assert_eq!(
            reparsed.resource_ids().get(name_index),
            Some(&DEBUGGABLE_RESOURCE_ID)
        );

        let application = reparsed
            .start_elements()
            .find(|e| reparsed.string_at(e.name) == Some("application"))
            .expect("application element");
        assert_eq!(application.attributes.len(), original_app_attrs + 1);
        let added = application.attributes.last().unwrap();
        assert_eq!(added.type_tag, TYPE_INT_BOOLEAN);
        assert_eq!(added.data, 0xFFFF_FFFF);
        assert!(reparsed.facts().is_debuggable);

        // Untouched facts survive the index remap.
        let facts = reparsed.facts();
        assert_eq!(facts.package, "com.example.app");
        assert_eq!(facts.version_name, "1.2.3");
        assert_eq!(facts.permissions, vec!["INTERNET".to_string()]);
    }

    #[test]
    fn parses_utf16_string_pool() {
        // Minimal document with a UTF-16 pool holding only "manifest".
        let mut pool_data = Vec::new();
        write_u16(&mut pool_data, 8); // length in code units
        for unit in "manifest".encode_utf16() {
            write_u16(&mut pool_data, unit);
        }
        write_u16(&mut pool_data, 0);

        let mut document = Vec::new();
        let file_start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        let pool_start = begin_chunk(&mut document, RES_STRING_POOL_TYPE, 28);
        write_u32(&mut document, 1); // string count
        write_u32(&mut document, 0); // style count
        write_u32(&mut document, 0); // flags: UTF-16
        write_u32(&mut document, 32); // stringsStart: 28 header + 1 offset
        write_u32(&mut document, 0); // stylesStart
        write_u32(&mut document, 0); // offset of string 0
        document.extend_from_slice(&pool_data);
        align_to_four(&mut document);
        finalize_chunk(&mut document, pool_start);
        write_start_element_chunk(&mut document, 1, NO_ENTRY_INDEX, NO_ENTRY_INDEX, 0, 0, 0, 0, &[]);
        write_end_element_chunk(&mut document, 1, NO_ENTRY_INDEX, NO_ENTRY_INDEX, 0);
        finalize_chunk(&mut document, file_start);

        let parsed = AxmlDocument::parse(&document).expect("parse utf16 document");
        assert_eq!(parsed.strings(), &["manifest".to_string()]);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = fixtures::manifest_bytes(None);
        bytes[0] = 0x77;
        bytes[1] = 0x77;
        match AxmlDocument::parse(&bytes) {
            Err(AxmlError::InvalidMagic(found)) => assert_eq!(found, 0x7777),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn rejects_truncated_document() {
        let bytes = fixtures::manifest_bytes(None);
        match AxmlDocument::parse(&bytes[..bytes.len() - 6]) {
            Err(AxmlError::TruncatedChunk(_)) => {}
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn byte_scan_flips_existing_attribute() {
        let bytes = fixtures::manifest_bytes(Some(false));
        let patched = force_debuggable_bytes(&bytes).expect("byte-scan patch");
        let reparsed = AxmlDocument::parse(&patched).expect("patched parses");
        assert!(reparsed.facts().is_debuggable);
    }

    #[test]
    fn byte_scan_gives_up_without_resource_map() {
        assert!(force_debuggable_bytes(&[0u8; 64]).is_none());
        let bytes = fixtures::manifest_bytes(None);
        // Attribute absent: nothing safe to flip.
        assert!(force_debuggable_bytes(&bytes).is_none());
    }
}
