use std::net::SocketAddr;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// AuthContext is the identity of the peer on the other end of one call. Handlers find it in the
/// request extensions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthContext {
    pub remote_addr: Option<SocketAddr>,
    /// Subject common name of the peer's leaf certificate.
    pub common_name: Option<String>,
}

impl AuthContext {
    /// The context attached to `request`, or an empty one if none was attached.
    pub fn of<T>(request: &Request<T>) -> AuthContext {
        request.extensions().get::<AuthContext>().cloned().unwrap_or_default()
    }
}

/// What to do with a call whose peer presented no verifiable identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthPolicy {
    /// Let it through with an empty identity.
    Permissive,
    /// Fail it with `UNAUTHENTICATED`.
    RequireIdentity,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        AuthPolicy::Permissive
    }
}

/// AuthInterceptor runs before every unary and streaming call. It derives an `AuthContext` from
/// the TLS handshake and attaches it to the call.
#[derive(Clone)]
pub struct AuthInterceptor {
    logger: slog::Logger,
    policy: AuthPolicy,
}

impl AuthInterceptor {
    pub fn new(logger: slog::Logger, policy: AuthPolicy) -> Self {
        AuthInterceptor { logger, policy }
    }

    fn authenticate<T>(&self, request: &Request<T>) -> AuthContext {
        let common_name = request.peer_certs().and_then(|certs| {
            certs.first().and_then(|leaf| {
                let der: &[u8] = leaf.as_ref();
                common_name(der)
            })
        });

        AuthContext {
            remote_addr: request.remote_addr(),
            common_name,
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let auth_context = self.authenticate(&request);

        match (&auth_context.common_name, self.policy) {
            (Some(common_name), _) => {
                slog::info!(self.logger, "auth: {:?}: {}", auth_context.remote_addr, common_name);
            }
            (None, AuthPolicy::Permissive) => {
                slog::debug!(self.logger, "auth: {:?}: no peer identity", auth_context.remote_addr);
            }
            (None, AuthPolicy::RequireIdentity) => {
                slog::warn!(
                    self.logger,
                    "auth: rejecting {:?}, no peer identity",
                    auth_context.remote_addr
                );
                return Err(Status::unauthenticated("peer presented no verifiable identity"));
            }
        }

        request.extensions_mut().insert(auth_context);
        Ok(request)
    }
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?.as_str().ok()?;

    Some(cn.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn permissive_policy_attaches_empty_identity() {
        let mut interceptor = AuthInterceptor::new(logger(), AuthPolicy::Permissive);

        let request = interceptor.call(Request::new(())).expect("Permissive policy rejected call");

        let auth_context = AuthContext::of(&request);
        assert_eq!(auth_context, AuthContext::default());
        assert_eq!(auth_context.common_name, None);
    }

    #[test]
    fn strict_policy_rejects_missing_identity() {
        let mut interceptor = AuthInterceptor::new(logger(), AuthPolicy::RequireIdentity);

        let status = interceptor.call(Request::new(())).expect_err("Expected rejection");
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn common_name_is_read_from_certificate_subject() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, "node-a");
        let cert = params.self_signed(&key).unwrap();

        assert_eq!(common_name(cert.der()), Some("node-a".to_string()));
        assert_eq!(common_name(b"not a certificate"), None);
    }
}
