//! Authentication for the discussion service.
//!
//! - [`token_codec`]: signed invitation tokens
//! - [`session`]: platform session JWTs
//! - [`authenticator`]: resolves the caller of a discussion operation

pub mod authenticator;
pub mod session;
pub mod token_codec;

pub use authenticator::{CallerIdentity, Credentials, ParticipantAuthenticator};
pub use session::{SessionClaims, SessionCodec};
pub use token_codec::{IssuedToken, TokenClaims, TokenCodec, TokenPeek, TtlPolicy};
