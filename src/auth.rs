//! Bearer-token authentication.
//!
//! [`Authenticator`] is the verification seam the router calls; [`Authenticate`]
//! is the interceptor the router wraps around every `authRequired` handler.
//! [`JwtAuthenticator`] is the stock HS256 implementation, which also issues
//! tokens for login handlers.

use std::sync::Arc;

use http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;
use tracing::debug;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

/// Decoded credential attached to an authenticated request.
pub type Identity = Value;

/// Verifies a bearer credential and returns the identity it carries.
pub trait Authenticator: Send + Sync + 'static {
    fn verify(&self, credential: &str) -> Result<Identity, Error>;
}

/// HS256 JSON Web Tokens.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl JwtAuthenticator {
    /// Tokens without an `exp` claim are accepted; an `exp` that is present
    /// is enforced.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: 3600,
        }
    }

    /// Lifetime of issued tokens. Default one hour.
    pub fn with_ttl(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// Signs `claims` (a JSON object) with `iat` and `exp` stamped in.
    pub fn issue(&self, claims: Value) -> Result<String, Error> {
        let Value::Object(mut claims) = claims else {
            return Err(Error::authentication("token claims must be a JSON object"));
        };
        let now = jsonwebtoken::get_current_timestamp();
        claims.insert("iat".into(), now.into());
        claims.insert("exp".into(), (now + self.ttl_secs).into());
        jsonwebtoken::encode(&Header::default(), &Value::Object(claims), &self.encoding)
            .map_err(|e| Error::authentication(e.to_string()))
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, credential: &str) -> Result<Identity, Error> {
        jsonwebtoken::decode::<Value>(credential, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::authentication(e.to_string()))
    }
}

/// Extracts the bearer credential from an `Authorization` header value.
///
/// The error message is the 401 body.
fn bearer(header: Option<&str>) -> Result<&str, &'static str> {
    let header = header.ok_or("No token provided")?;
    let mut parts = header.split(' ');
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("Token error");
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err("Token malformatted");
    }
    Ok(token)
}

/// Authenticate-then-delegate.
///
/// Failure answers 401 and the wrapped handler never runs; success attaches
/// the identity to the request and advances.
pub struct Authenticate {
    authenticator: Arc<dyn Authenticator>,
}

impl Authenticate {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for Authenticate {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let verified = bearer(req.header("authorization")).and_then(|token| {
            self.authenticator.verify(token).map_err(|e| {
                debug!(error = %e, "credential rejected");
                "Invalid token"
            })
        });

        match verified {
            Ok(identity) => {
                req.set_identity(identity);
                next.run(req, res)
            }
            Err(reason) => {
                debug!(path = req.path(), reason, "authentication failed");
                res.send(Response::builder().status(StatusCode::UNAUTHORIZED).text(reason));
                Box::pin(async { Ok(()) })
            }
        }
    }

    fn name(&self) -> &'static str {
        "authenticate"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn issued_tokens_verify_and_carry_claims() {
        let auth = JwtAuthenticator::new(b"test-secret");
        let token = auth.issue(json!({ "username": "alice" })).unwrap();
        let identity = auth.verify(&token).unwrap();
        assert_eq!(identity["username"], "alice");
        assert!(identity["exp"].as_u64().unwrap() > identity["iat"].as_u64().unwrap());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = JwtAuthenticator::new(b"one").issue(json!({ "sub": "x" })).unwrap();
        let err = JwtAuthenticator::new(b"two").verify(&token).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn tokens_without_expiry_verify_but_expired_ones_do_not() {
        let key = EncodingKey::from_secret(b"test-secret");
        let auth = JwtAuthenticator::new(b"test-secret");

        let forever = jsonwebtoken::encode(&Header::default(), &json!({ "username": "bob" }), &key).unwrap();
        assert_eq!(auth.verify(&forever).unwrap()["username"], "bob");

        let stale = jsonwebtoken::encode(&Header::default(), &json!({ "username": "bob", "exp": 1 }), &key).unwrap();
        assert!(matches!(auth.verify(&stale), Err(Error::Authentication(_))));
    }

    #[test]
    fn non_object_claims_are_refused() {
        assert!(JwtAuthenticator::new(b"s").issue(json!("alice")).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer(Some("Bearer abc")), Ok("abc"));
        assert_eq!(bearer(Some("bearer abc")), Ok("abc"));
        assert_eq!(bearer(None), Err("No token provided"));
        assert_eq!(bearer(Some("Bearer")), Err("Token error"));
        assert_eq!(bearer(Some("Bearer a b")), Err("Token error"));
        assert_eq!(bearer(Some("Basic abc")), Err("Token malformatted"));
    }
}
