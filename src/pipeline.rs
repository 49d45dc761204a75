//! The patching pipeline: load, merge, patch, strip, sign, emit.
//!
//! Stages run in order on an exclusively owned working archive. Every state
//! transition emits a structured log event; no error escapes [`DebugPatcher::run`].

use crate::apk::binary_xml::{force_debuggable_bytes, AxmlDocument, ManifestFacts};
use crate::apk::bundle::{looks_like_bundle, merge_bundle, BundleError};
use crate::apk::zip::{ApkFile, ApkZipError};
use crate::sign::manifest::{
    signature_block_entry, signature_file_entry, EntryDigests, SignatureManifest, MANIFEST_ENTRY,
};
use crate::sign::{pkcs7, SignError, SigningIdentity};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Entry name of the compiled manifest inside an application archive.
pub const MANIFEST_XML_ENTRY: &str = "AndroidManifest.xml";

const BUNDLE_SUFFIX: &str = ".apks";

/// Severity of a pipeline log event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Success,
    Warning,
    Error,
}

/// One consumer-facing pipeline event.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub kind: LogKind,
    pub message: String,
    pub timestamp: SystemTime,
}

/// Cloneable cancellation flag checked at stage boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result alias for pipeline operations.
pub type PatchResult<T> = Result<T, PatchError>;

/// Errors of the patching pipeline.
#[derive(Debug)]
pub enum PatchError {
    /// The input archive cannot be opened or lacks a required entry.
    InputInvalid(String),
    /// The compiled manifest failed to parse and the byte-scan fallback
    /// found nothing to patch.
    ManifestParseFailed(String),
    /// A structural rewrite was infeasible and the byte-scan fallback
    /// found nothing to patch.
    ManifestRewriteInfeasible(String),
    /// Key generation, certificate construction or CMS signing failed.
    SignFailed(String),
    /// The caller aborted the pipeline.
    Cancelled,
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::InputInvalid(msg) => write!(f, "Invalid input: {msg}"),
            PatchError::ManifestParseFailed(msg) => {
                write!(f, "Manifest could not be patched: {msg}")
            }
            PatchError::ManifestRewriteInfeasible(msg) => {
                write!(f, "Manifest rewrite infeasible: {msg}")
            }
            PatchError::SignFailed(msg) => write!(f, "Signing failed: {msg}"),
            PatchError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<ApkZipError> for PatchError {
    fn from(value: ApkZipError) -> Self {
        PatchError::InputInvalid(value.to_string())
    }
}

impl From<BundleError> for PatchError {
    fn from(value: BundleError) -> Self {
        PatchError::InputInvalid(value.to_string())
    }
}

impl From<SignError> for PatchError {
    fn from(value: SignError) -> Self {
        PatchError::SignFailed(value.to_string())
    }
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct PatchOutcome {
    pub success: bool,
    /// The signed archive; `None` on failure or cancellation.
    pub output: Option<Vec<u8>>,
    /// Facts read from the manifest (placeholders on a degraded parse).
    pub facts: Option<ManifestFacts>,
    pub logs: Vec<LogEvent>,
}

/// One-shot pipeline turning an application archive or bundle into a
/// debuggable, freshly signed archive.
pub struct DebugPatcher {
    cancel: CancelFlag,
    logs: Vec<LogEvent>,
}

impl Default for DebugPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugPatcher {
    pub fn new() -> Self {
        DebugPatcher {
            cancel: CancelFlag::default(),
            logs: Vec::new(),
        }
    }

    /// Flag shared with the caller; cancelling takes effect at the next
    /// stage boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the pipeline. Never panics or returns an error: failures are
    /// reported through the outcome and its log events.
    pub fn run(mut self, input: &[u8], file_name: &str) -> PatchOutcome {
        match self.execute(input, file_name) {
            Ok((output, facts)) => {
                self.push(LogKind::Success, "Archive patched and signed".to_string());
                PatchOutcome {
                    success: true,
                    output: Some(output),
                    facts: Some(facts),
                    logs: self.logs,
                }
            }
            Err(err) => {
                self.push(LogKind::Error, err.to_string());
                PatchOutcome {
                    success: false,
                    output: None,
                    facts: None,
                    logs: self.logs,
                }
            }
        }
    }

    fn execute(
        &mut self,
        input: &[u8],
        file_name: &str,
    ) -> PatchResult<(Vec<u8>, ManifestFacts)> {
        self.ensure_live()?;
        self.push(
            LogKind::Info,
            format!("Loading {file_name} ({} bytes)", input.len()),
        );
        let mut archive = ApkFile::from_bytes(input)?;

        let hinted_bundle = file_name.to_ascii_lowercase().ends_with(BUNDLE_SUFFIX);
        if hinted_bundle || looks_like_bundle(&archive) {
            self.ensure_live()?;
            self.push(LogKind::Info, "Input is a bundle, merging splits".to_string());
            archive = merge_bundle(&archive)?;
            self.push(
                LogKind::Success,
                format!("Merged bundle into {} entries", archive.len()),
            );
        }

        self.ensure_live()?;
        let manifest_bytes = archive
            .read_entry(MANIFEST_XML_ENTRY)
            .map_err(|_| {
                PatchError::InputInvalid(format!("archive has no {MANIFEST_XML_ENTRY}"))
            })?
            .to_vec();
        let (patched_manifest, facts) = self.patch_manifest(&manifest_bytes)?;

        self.ensure_live()?;
        let stale: Vec<String> = archive
            .file_names()
            .filter(|name| is_stale_signature_entry(name))
            .map(|name| name.to_string())
            .collect();
        for name in &stale {
            archive.remove_entry(name);
        }
        if !stale.is_empty() {
            self.push(
                LogKind::Info,
                format!("Removed {} previous signature entries", stale.len()),
            );
        }
        archive.put_entry(MANIFEST_XML_ENTRY, patched_manifest)?;

        self.ensure_live()?;
        self.push(LogKind::Info, "Generating debug signing identity".to_string());
        let identity = SigningIdentity::generate()?;

        // The digest map is frozen here; nothing below may change the set
        // of signable entries.
        let digests = EntryDigests::digest_archive(&archive);
        let manifest = SignatureManifest::build(&digests);
        let signature_file = manifest.signature_file();
        let signature_block = pkcs7::sign_detached(&signature_file, &identity)?;

        let eligible_now = archive
            .file_names()
            .filter(|name| !name.starts_with("META-INF/"));
        if !digests.names().eq(eligible_now) {
            return Err(PatchError::SignFailed(
                "entry set changed between digesting and signing".to_string(),
            ));
        }

        archive.put_entry(MANIFEST_ENTRY, manifest.into_bytes())?;
        archive.put_entry(signature_file_entry(), signature_file)?;
        archive.put_entry(signature_block_entry(), signature_block)?;
        self.push(
            LogKind::Info,
            format!("Signed {} entries as {}", digests.len(), signature_block_entry()),
        );

        self.ensure_live()?;
        let output = archive.to_bytes()?;
        Ok((output, facts))
    }

    /// Parse and patch the compiled manifest, downgrading to the byte-scan
    /// patch when the structured paths fail.
    fn patch_manifest(&mut self, bytes: &[u8]) -> PatchResult<(Vec<u8>, ManifestFacts)> {
        match AxmlDocument::parse(bytes) {
            Ok(document) => {
                let facts = document.facts();
                self.push(
                    LogKind::Info,
                    format!(
                        "Manifest: {} v{} (code {}), sdk {}..{}",
                        facts.package,
                        facts.version_name,
                        facts.version_code,
                        facts.min_sdk,
                        facts.target_sdk
                    ),
                );
                match document.make_debuggable() {
                    Ok(patch) => {
                        let message = if patch.was_in_place() {
                            "Enabled debuggable flag in place"
                        } else {
                            "Inserted debuggable attribute and rebuilt manifest"
                        };
                        self.push(LogKind::Info, message.to_string());
                        Ok((patch.into_bytes(), facts))
                    }
                    Err(err) => {
                        self.push(
                            LogKind::Warning,
                            format!("Structural rewrite failed ({err}), trying byte scan"),
                        );
                        match force_debuggable_bytes(bytes) {
                            Some(patched) => Ok((patched, facts)),
                            None => Err(PatchError::ManifestRewriteInfeasible(err.to_string())),
                        }
                    }
                }
            }
            Err(err) => {
                self.push(
                    LogKind::Warning,
                    format!("Manifest parse failed ({err}), trying byte scan"),
                );
                match force_debuggable_bytes(bytes) {
                    Some(patched) => Ok((patched, ManifestFacts::default())),
                    None => Err(PatchError::ManifestParseFailed(err.to_string())),
                }
            }
        }
    }

    fn ensure_live(&self) -> PatchResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        Ok(())
    }

    fn push(&mut self, kind: LogKind, message: String) {
        match kind {
            LogKind::Info | LogKind::Success => info!("{message}"),
            LogKind::Warning => warn!("{message}"),
            LogKind::Error => error!("{message}"),
        }
        self.logs.push(LogEvent {
            kind,
            message,
            timestamp: SystemTime::now(),
        });
    }
}

/// Signature-adjacent entries are matched case-insensitively; the
/// `META-INF/` prefix itself is case-sensitive.
fn is_stale_signature_entry(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("META-INF/") else {
        return false;
    };
    let upper = rest.to_ascii_uppercase();
    upper.ends_with(".SF")
        || upper.ends_with(".RSA")
        || upper.ends_with(".DSA")
        || upper.ends_with(".EC")
        || upper == "MANIFEST.MF"
        || upper.contains("CERT")
        || upper.contains("SIGN")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::binary_xml::fixtures;

    fn build_apk(manifest: Vec<u8>) -> Vec<u8> {
        let mut apk = ApkFile::new();
        apk.put_entry(MANIFEST_XML_ENTRY, manifest).unwrap();
        apk.put_entry("classes.dex", vec![0x64, 0x65, 0x78]).unwrap();
        apk.put_entry("res/layout/main.xml", vec![0x01, 0x02]).unwrap();
        apk.put_entry("META-INF/MANIFEST.MF", b"old manifest".to_vec()).unwrap();
        apk.put_entry("META-INF/OLD.RSA", b"old sig".to_vec()).unwrap();
        apk.put_entry("META-INF/services/foo", b"service".to_vec()).unwrap();
        apk.to_bytes().unwrap()
    }

    #[test]
    fn end_to_end_patch_and_sign() {
        let input = build_apk(fixtures::manifest_bytes(Some(false)));
        let outcome = DebugPatcher::new().run(&input, "app.apk");
        assert!(outcome.success, "logs: {:?}", outcome.logs);

        let facts = outcome.facts.expect("facts");
        assert_eq!(facts.package, "com.example.app");
        assert!(!facts.is_debuggable); // input state

        let signed = ApkFile::from_bytes(&outcome.output.expect("output")).unwrap();
        assert!(signed.contains("META-INF/MANIFEST.MF"));
        assert!(signed.contains("META-INF/CERT.SF"));
        assert!(signed.contains("META-INF/CERT.RSA"));
        assert!(signed.contains("META-INF/services/foo"));
        assert!(!signed.contains("META-INF/OLD.RSA"));

        let manifest = AxmlDocument::parse(signed.read_entry(MANIFEST_XML_ENTRY).unwrap())
            .expect("patched manifest parses");
        assert!(manifest.facts().is_debuggable);

        let mf = String::from_utf8(signed.read_entry("META-INF/MANIFEST.MF").unwrap().to_vec())
            .unwrap();
        assert!(mf.contains("Name: classes.dex\r\n"));
        assert!(!mf.contains("Name: META-INF/services/foo\r\n"));

        assert_eq!(outcome.logs.last().unwrap().kind, LogKind::Success);
    }

    #[test]
    fn end_to_end_bundle_merge() {
        let mut base = ApkFile::new();
        base.put_entry(MANIFEST_XML_ENTRY, fixtures::manifest_bytes(None)).unwrap();
        base.put_entry("res/x", b"A".to_vec()).unwrap();
        let mut split = ApkFile::new();
        split.put_entry("res/x", b"B".to_vec()).unwrap();
        split.put_entry("res/y", b"C".to_vec()).unwrap();

        let mut container = ApkFile::new();
        container.put_entry("base.apk", base.to_bytes().unwrap()).unwrap();
        container.put_entry("split-arm64.apk", split.to_bytes().unwrap()).unwrap();
        let input = container.to_bytes().unwrap();

        let outcome = DebugPatcher::new().run(&input, "app.apks");
        assert!(outcome.success, "logs: {:?}", outcome.logs);

        let signed = ApkFile::from_bytes(&outcome.output.unwrap()).unwrap();
        assert_eq!(signed.read_entry("res/x").unwrap(), b"A");
        assert_eq!(signed.read_entry("res/y").unwrap(), b"C");
        let manifest =
            AxmlDocument::parse(signed.read_entry(MANIFEST_XML_ENTRY).unwrap()).unwrap();
        assert!(manifest.facts().is_debuggable);
    }

    #[test]
    fn parse_failure_downgrades_to_byte_scan() {
        let mut manifest = fixtures::manifest_bytes(Some(false));
        // Break the leading chunk tag; the resource map and attribute
        // records stay intact for the fallback.
        manifest[0] = 0x55;
        manifest[1] = 0x55;
        let input = build_apk(manifest);

        let outcome = DebugPatcher::new().run(&input, "app.apk");
        assert!(outcome.success, "logs: {:?}", outcome.logs);
        assert!(outcome
            .logs
            .iter()
            .any(|event| event.kind == LogKind::Warning));
        let facts = outcome.facts.unwrap();
        assert_eq!(facts.package, "unknown");

        let signed = ApkFile::from_bytes(&outcome.output.unwrap()).unwrap();
        let mut patched = signed.read_entry(MANIFEST_XML_ENTRY).unwrap().to_vec();
        // Restore the chunk tag: the rest of the buffer must now parse as a
        // debuggable manifest.
        patched[0] = 0x03;
        patched[1] = 0x00;
        let reparsed = AxmlDocument::parse(&patched).expect("byte-scan patched manifest");
        assert!(reparsed.facts().is_debuggable);
    }

    #[test]
    fn unparseable_manifest_without_fallback_fails() {
        let input = build_apk(b"not compiled xml at all".to_vec());
        let outcome = DebugPatcher::new().run(&input, "app.apk");
        assert!(!outcome.success);
        assert!(outcome.output.is_none());
        assert_eq!(outcome.logs.last().unwrap().kind, LogKind::Error);
    }

    #[test]
    fn cancelled_pipeline_emits_no_output() {
        let input = build_apk(fixtures::manifest_bytes(Some(false)));
        let patcher = DebugPatcher::new();
        patcher.cancel_flag().cancel();
        let outcome = patcher.run(&input, "app.apk");
        assert!(!outcome.success);
        assert!(outcome.output.is_none());
        let last = outcome.logs.last().unwrap();
        assert_eq!(last.kind, LogKind::Error);
        assert!(last.message.contains("Cancelled"));
    }

    #[test]
    fn missing_manifest_is_input_invalid() {
        let mut apk = ApkFile::new();
        apk.put_entry("classes.dex", vec![0u8]).unwrap();
        let input = apk.to_bytes().unwrap();
        let outcome = DebugPatcher::new().run(&input, "app.apk");
        assert!(!outcome.success);
        assert!(outcome
            .logs
            .iter()
            .any(|event| event.message.contains(MANIFEST_XML_ENTRY)));
    }
}
