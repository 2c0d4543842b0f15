//! Ledger signing keys and signature verification.

pub mod signing;

pub use signing::{verify_with_public_key_pem, PublicKeyInfo, SigningService};
