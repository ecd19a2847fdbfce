/**
 * Authentication
 *
 * Token codec, credential store, the three-tier auth cache, password
 * hashing, and the session-lifecycle HTTP handlers.
 */

pub mod cache;
pub mod handlers;
pub mod password;
pub mod store;
pub mod token;

pub use cache::{AuthCache, CheckedToken, RequestCache};
pub use password::PasswordHasher;
pub use store::CredentialRow;
pub use token::{decode_token, encode_token, DecodedToken};
