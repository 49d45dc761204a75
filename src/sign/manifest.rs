//! The two text artifacts of JAR v1 signing: `MANIFEST.MF` and the
//! signature file that hashes it.
//!
//! Both use CRLF line endings and the 70-byte physical line limit with
//! single-space continuation lines. The signature file is a hash tree: its
//! per-entry digests are computed over the exact bytes of the matching
//! manifest section, trailing blank line included.

use crate::apk::zip::ApkFile;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

/// Fixed identifier the producer writes into `Created-By`.
pub const EMITTER_NAME: &str = "apkdebug";

/// Uppercase key name used for the signature entries.
pub const SIGNATURE_KEY: &str = "CERT";

pub const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

pub fn signature_file_entry() -> String {
    format!("META-INF/{SIGNATURE_KEY}.SF")
}

pub fn signature_block_entry() -> String {
    format!("META-INF/{SIGNATURE_KEY}.RSA")
}

const MAX_LINE_BYTES: usize = 70;
const CRLF: &[u8] = b"\r\n";

/// Sorted `entry name -> Base64(SHA-256(bytes))` map over the signable
/// entries of an archive. Directories and anything under `META-INF/` are
/// excluded. Created once per signing pass and immutable afterwards.
pub struct EntryDigests {
    ordered: Vec<(String, String)>,
}

impl EntryDigests {
    /// Digest every eligible entry. Hashing is pure per entry, so the work
    /// is fanned out and order is re-imposed by the sorted source iterator.
    pub fn digest_archive(archive: &ApkFile) -> Self {
        let eligible: Vec<&str> = archive
            .file_names()
            .filter(|name| !name.starts_with("META-INF/"))
            .collect();
        let ordered = eligible
            .par_iter()
            .map(|name| {
                let data = archive
                    .entry(name)
                    .map(|entry| entry.data.as_slice())
                    .unwrap_or_default();
                (name.to_string(), BASE64.encode(Sha256::digest(data)))
            })
            .collect();
        EntryDigests { ordered }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// `MANIFEST.MF` plus the byte range of each entry section, kept so the
/// signature file can hash the exact section bytes.
pub struct SignatureManifest {
    bytes: Vec<u8>,
    sections: Vec<(String, Vec<u8>)>,
}

impl SignatureManifest {
    pub fn build(digests: &EntryDigests) -> Self {
        let mut bytes = Vec::new();
        write_attribute(&mut bytes, "Manifest-Version", "1.0");
        write_attribute(&mut bytes, "Created-By", &format!("1.0 ({EMITTER_NAME})"));
        bytes.extend_from_slice(CRLF);

        let mut sections = Vec::with_capacity(digests.ordered.len());
        for (name, digest) in &digests.ordered {
            let mut section = Vec::new();
            write_attribute(&mut section, "Name", name);
            write_attribute(&mut section, "SHA-256-Digest", digest);
            section.extend_from_slice(CRLF);
            bytes.extend_from_slice(&section);
            sections.push((name.clone(), section));
        }
        SignatureManifest { bytes, sections }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Render the matching `.SF` contents.
    pub fn signature_file(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_attribute(&mut bytes, "Signature-Version", "1.0");
        write_attribute(
            &mut bytes,
            "SHA-256-Digest-Manifest",
            &BASE64.encode(Sha256::digest(&self.bytes)),
        );
        write_attribute(&mut bytes, "Created-By", &format!("1.0 ({EMITTER_NAME})"));
        bytes.extend_from_slice(CRLF);

        for (name, section) in &self.sections {
            write_attribute(&mut bytes, "Name", name);
            write_attribute(
                &mut bytes,
                "SHA-256-Digest",
                &BASE64.encode(Sha256::digest(section)),
            );
            bytes.extend_from_slice(CRLF);
        }
        bytes
    }
}

/// Write `key: value` wrapped to the 70-byte physical line limit.
/// Continuation lines start with one space and carry up to 69 bytes.
fn write_attribute(out: &mut Vec<u8>, key: &str, value: &str) {
    let logical = format!("{key}: {value}");
    let bytes = logical.as_bytes();
    if bytes.len() <= MAX_LINE_BYTES {
        out.extend_from_slice(bytes);
        out.extend_from_slice(CRLF);
        return;
    }
    out.extend_from_slice(&bytes[..MAX_LINE_BYTES]);
    out.extend_from_slice(CRLF);
    let mut rest = &bytes[MAX_LINE_BYTES..];
    while !rest.is_empty() {
        let take = rest.len().min(MAX_LINE_BYTES - 1);
        out.push(b' ');
        out.extend_from_slice(&rest[..take]);
        out.extend_from_slice(CRLF);
        rest = &rest[take..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> ApkFile {
        let mut apk = ApkFile::new();
        apk.put_entry("a/x", vec![0x00]).unwrap();
        apk.put_entry("a/y", vec![0x01]).unwrap();
        apk.put_entry("META-INF/OLD.SF", b"stale".to_vec()).unwrap();
        apk
    }

    fn manifest_text(digests: &EntryDigests) -> String {
        String::from_utf8(SignatureManifest::build(digests).into_bytes()).unwrap()
    }

    #[test]
    fn digests_eligible_entries_in_sorted_order() {
        let digests = EntryDigests::digest_archive(&archive());
        let names: Vec<_> = digests.names().collect();
        assert_eq!(names, vec!["a/x", "a/y"]);
        assert_eq!(
            digests.ordered[0].1,
            BASE64.encode(Sha256::digest([0x00u8]))
        );
        assert_eq!(
            digests.ordered[1].1,
            BASE64.encode(Sha256::digest([0x01u8]))
        );
    }

    #[test]
    fn manifest_lists_only_eligible_entries() {
        let digests = EntryDigests::digest_archive(&archive());
        let text = manifest_text(&digests);
        assert!(text.starts_with("Manifest-Version: 1.0\r\n"));
        assert!(text.contains("Created-By: 1.0 (apkdebug)\r\n"));
        assert!(text.contains("Name: a/x\r\n"));
        assert!(text.contains("Name: a/y\r\n"));
        assert!(!text.contains("OLD.SF"));
        let x_pos = text.find("Name: a/x").unwrap();
        let y_pos = text.find("Name: a/y").unwrap();
        assert!(x_pos < y_pos);
    }

    #[test]
    fn signature_file_hashes_manifest_and_sections() {
        let digests = EntryDigests::digest_archive(&archive());
        let manifest = SignatureManifest::build(&digests);
        let sf = manifest.signature_file();
        let text = String::from_utf8(sf).unwrap();

        assert!(text.starts_with("Signature-Version: 1.0\r\n"));
        let manifest_digest = BASE64.encode(Sha256::digest(manifest.bytes()));
        assert!(text.contains(&format!("SHA-256-Digest-Manifest: {manifest_digest}\r\n")));

        for (_, section) in &manifest.sections {
            let section_digest = BASE64.encode(Sha256::digest(section));
            assert!(text.contains(&format!("SHA-256-Digest: {section_digest}\r\n")));
        }
    }

    #[test]
    fn sections_end_with_blank_line() {
        let digests = EntryDigests::digest_archive(&archive());
        let manifest = SignatureManifest::build(&digests);
        for (_, section) in &manifest.sections {
            assert!(section.ends_with(b"\r\n\r\n"));
        }
        // Manifest bytes are the header plus the concatenated sections.
        let concatenated: usize = manifest.sections.iter().map(|(_, s)| s.len()).sum();
        assert!(manifest.bytes().len() > concatenated);
        assert!(manifest.bytes().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn long_lines_wrap_at_seventy_bytes() {
        let mut apk = ApkFile::new();
        let long_name = format!("assets/{}.bin", "n".repeat(120));
        apk.put_entry(long_name.as_str(), vec![0x02]).unwrap();
        let digests = EntryDigests::digest_archive(&apk);
        let manifest = SignatureManifest::build(&digests);

        let text = String::from_utf8(manifest.bytes().to_vec()).unwrap();
        for line in text.split("\r\n") {
            assert!(line.len() <= MAX_LINE_BYTES, "line too long: {line:?}");
        }
        let continuations: Vec<_> = text
            .split("\r\n")
            .filter(|line| line.starts_with(' '))
            .collect();
        assert!(!continuations.is_empty());

        // The wrapped name reassembles to the original.
        let mut reassembled = String::new();
        let mut in_name = false;
        for line in text.split("\r\n") {
            if let Some(rest) = line.strip_prefix("Name: ") {
                reassembled.push_str(rest);
                in_name = true;
            } else if in_name && line.starts_with(' ') {
                reassembled.push_str(&line[1..]);
            } else {
                in_name = false;
            }
        }
        assert_eq!(reassembled, long_name);
    }
}
