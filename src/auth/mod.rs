//! Mutual TLS material and per-call peer identity.
mod interceptor;
mod tls;

pub use interceptor::AuthContext;
pub use interceptor::AuthInterceptor;
pub use interceptor::AuthPolicy;
pub use tls::TlsConfig;
pub use tls::TlsError;
pub use tls::TlsPaths;
