//! Cross-subsystem integration scenarios for the NgasihTau content
//! protection core: full encrypt-and-download flows, license lifecycle
//! sequences, and security-perimeter behavior over the wired-up stack.

pub mod encryption_e2e;
pub mod harness;
pub mod license_lifecycle;
pub mod security_e2e;
