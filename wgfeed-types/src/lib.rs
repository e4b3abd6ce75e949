//! Wire model and validation for the wg-feed protocol (draft-00).
//!
//! A wg-feed server publishes a versioned document describing a set of
//! tunnel configurations. Clients fetch the document over HTTPS (polling
//! or SSE) inside a protocol envelope:
//!
//! - a **success envelope** carries a revision token, a TTL, and either a
//!   plaintext [`FeedDocument`] or an age-encrypted payload
//! - an **error envelope** carries a message and a retriability flag
//!
//! This crate owns the serde wire types and the structural/semantic
//! validation rules. It performs no I/O; fetching, decryption and
//! reconciliation live in `wgfeed-sync` and `wgfeed-crypto`.

mod document;
mod error;
pub mod validation;

pub use document::{DisplayInfo, ErrorEnvelope, FeedDocument, FeedTunnel, SuccessEnvelope};
pub use error::{ValidationError, ValidationResult};
pub use validation::PROTOCOL_VERSION;
