//! Header hygiene around the forwarding boundary.

pub mod propagator;
mod sanitizer;

pub use propagator::{PIPELINE_COMPLETE, propagate};
pub use sanitizer::{HeaderSanitizer, HeadersCommitted, SanitizeReport, SanitizerConfig, mask_value};
