//! Admission pipeline.
//!
//! Every inbound message flows through:
//! 1. `SeenWindow::first_sighting()` — drop redeliveries
//! 2. `PatternMatcher::check()` — required link present, no excluded keyword
//! 3. `ContentSanitizer::sanitize()` — strip media refs, normalize whitespace
//! 4. `Formatter::format()` — optional outbound template
//!
//! `AdmissionFilter::evaluate()` runs steps 2-4 and never touches the network.

pub mod dedup;
pub mod filter;
pub mod format;
pub mod matcher;
pub mod sanitizer;
pub mod types;
