//! Authentication: JWT middleware and upstream credential validation.

pub mod jwt;
pub mod ovm;

pub use jwt::{authenticate, issue_token, validate_token, JwtClaims};
pub use ovm::OvmClient;
