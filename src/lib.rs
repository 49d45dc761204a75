//! # apkdebug
//!
//! A library for making Android application packages debuggable.
//!
//! Takes a single `.apk` or an `.apks` bundle of splits, forces
//! `android:debuggable="true"` inside the compiled binary manifest, strips
//! the previous signature and re-signs the archive (JAR v1) with a freshly
//! generated debug identity.
//!
//! # Examples
//!
//! ```no_run
//! use apkdebug::make_debuggable;
//!
//! let input = std::fs::read("app.apk").unwrap();
//! let outcome = make_debuggable(&input, "app.apk");
//! if outcome.success {
//!     std::fs::write("app-debug.apk", outcome.output.unwrap()).unwrap();
//! }
//! for event in &outcome.logs {
//!     println!("{:?}: {}", event.kind, event.message);
//! }
//! ```

pub mod apk;
pub mod pipeline;
pub mod sign;

pub use apk::binary_xml::{AxmlDocument, AxmlError, DebugPatch, ManifestFacts};
pub use apk::bundle::{merge_bundle, BundleError};
pub use apk::zip::{ApkFile, ApkZipError};
pub use pipeline::{CancelFlag, DebugPatcher, LogEvent, LogKind, PatchError, PatchOutcome};
pub use sign::SigningIdentity;

/// Run the whole pipeline with default settings.
///
/// `file_name` is an advisory hint: a `.apks` suffix marks the input as a
/// bundle of splits, but nested archives are detected either way.
pub fn make_debuggable(input: &[u8], file_name: &str) -> PatchOutcome {
    DebugPatcher::new().run(input, file_name)
}
