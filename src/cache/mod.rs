pub mod fingerprint;

pub use fingerprint::{read_sync_roots, FingerprintCache, SyncRoot};
