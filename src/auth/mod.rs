//! Credentials for upstreams that need them: an OAuth bearer-token cache and
//! a SigV4 request signer.
pub mod sigv4;
pub mod token_cache;

pub use sigv4::{SigV4Signer, SignableRequest};
pub use token_cache::{CachedToken, ClientCredentials, TokenCache};
