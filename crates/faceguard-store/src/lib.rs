//! faceguard-store — local credential persistence.
//!
//! Holds the sealed reference descriptor, the fallback password digest and
//! the registration flag in a SQLite file.

pub mod crypto;
pub mod password;
pub mod store;

pub use crypto::StoreKey;
pub use password::{check_new_password, PasswordPolicyError, MIN_PASSWORD_LEN};
pub use store::{CredentialStore, StoreError, DEFAULT_USER_NAME};
