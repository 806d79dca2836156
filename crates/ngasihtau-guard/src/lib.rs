//! NgasihTau security perimeter: HMAC request signatures, replay protection,
//! input sanitation, sliding-window rate limits, and device failure blocking.

pub mod blocklist;
pub mod gate;
pub mod rate_limit;
pub mod replay;
pub mod sanitize;
pub mod signature;

pub use blocklist::FailureTracker;
pub use gate::{SecurityGate, VerifiedRequest};
pub use rate_limit::{DownloadCheck, DownloadRateLimiter};
pub use replay::ReplayGuard;
pub use sanitize::sanitize_input;
pub use signature::{parse_signature_header, SignatureParts, SignatureVerifier};
