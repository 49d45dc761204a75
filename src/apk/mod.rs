//! Android container formats: the ZIP archive adapter, the bundle merger
//! and the compiled-XML codec.

pub mod binary_xml;
pub mod bundle;
pub mod zip;

pub use binary_xml::{AxmlDocument, ManifestFacts};
pub use zip::ApkFile;
