//! Identity handling.
//!
//! - [`session`]: bootstrapping the identity under a safety timeout and
//!   following auth state changes
//! - [`middleware`]: explicitly registered interceptors for remote failures,
//!   including expired-session recovery

pub mod middleware;
pub mod session;

pub use middleware::{
    ExpiredSessionInterceptor, Interceptor, MiddlewareChain, MiddlewareError, Registration,
};
pub use session::{BootstrapOutcome, IdentitySession};
