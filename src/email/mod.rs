//! Email input: message records, MIME-to-text extraction, and `.eml` loading.
//!
//! Fetching mail from a provider is out of scope; callers hand the pipeline
//! `EmailMessage` records, and `source` builds them from files on disk.

pub mod extract;
pub mod source;
pub mod types;

pub use extract::{ExtractionWarning, extract, strip_html};
pub use source::{collect_eml_paths, load_eml_file};
pub use types::{EmailMessage, PlainText};
