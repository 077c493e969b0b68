//! Auth simulation.
//!
//! Only the presence and shape of credentials is checked; tokens are never
//! verified. A failed check yields a 401 with a `WWW-Authenticate` header.

use crate::error::ApiError;
use crate::exchange::MockRequest;
use serde::{Deserialize, Serialize};

/// Where an API key is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLocation {
    Header,
    Query,
    Cookie,
}

/// Credentials a route expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRequirement {
    /// Explicitly open, overriding a global requirement
    None,
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: Basic <credentials>`
    Basic,
    /// Any `Authorization` header
    Oauth2,
    /// A named key in a header, query parameter or cookie
    ApiKey {
        #[serde(rename = "in")]
        location: KeyLocation,
        name: String,
    },
}

impl AuthRequirement {
    /// Check the request's credentials.
    pub fn check(&self, request: &MockRequest) -> Result<(), ApiError> {
        let authorization = request.header("authorization").unwrap_or("").trim();
        let present = match self {
            AuthRequirement::None => true,
            AuthRequirement::Bearer => has_scheme(authorization, "bearer"),
            AuthRequirement::Basic => has_scheme(authorization, "basic"),
            AuthRequirement::Oauth2 => !authorization.is_empty(),
            AuthRequirement::ApiKey { location, name } => {
                let value = match location {
                    KeyLocation::Header => request.header(name).map(str::to_string),
                    KeyLocation::Query => request.query_param(name),
                    KeyLocation::Cookie => request.cookie(name),
                };
                value.is_some_and(|v| !v.is_empty())
            }
        };

        if present {
            Ok(())
        } else {
            Err(ApiError::unauthorized(self.challenge()))
        }
    }

    /// Value for the `WWW-Authenticate` header.
    pub fn challenge(&self) -> &str {
        match self {
            AuthRequirement::None => "",
            AuthRequirement::Bearer | AuthRequirement::Oauth2 => "Bearer",
            AuthRequirement::Basic => "Basic",
            AuthRequirement::ApiKey { .. } => "ApiKey",
        }
    }
}

/// `Authorization` carries the scheme followed by a non-empty credential.
fn has_scheme(authorization: &str, scheme: &str) -> bool {
    match authorization.split_once(' ') {
        Some((given, credential)) => {
            given.eq_ignore_ascii_case(scheme) && !credential.trim().is_empty()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, StatusCode};

    #[test]
    fn test_bearer() {
        let auth = AuthRequirement::Bearer;
        let missing = MockRequest::new(Method::GET, "/users");
        let err = auth.check(&missing).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.headers,
            vec![("WWW-Authenticate".to_string(), "Bearer".to_string())]
        );

        let wrong_scheme =
            MockRequest::new(Method::GET, "/users").with_header("Authorization", "Basic abc");
        assert!(auth.check(&wrong_scheme).is_err());

        let empty_token =
            MockRequest::new(Method::GET, "/users").with_header("Authorization", "Bearer ");
        assert!(auth.check(&empty_token).is_err());

        let ok = MockRequest::new(Method::GET, "/users").with_header("Authorization", "bearer t0k");
        assert!(auth.check(&ok).is_ok());
    }

    #[test]
    fn test_api_key_locations() {
        let header: AuthRequirement =
            serde_yaml::from_str("{type: api_key, in: header, name: X-Api-Key}").unwrap();
        let query: AuthRequirement =
            serde_yaml::from_str("{type: api_key, in: query, name: key}").unwrap();
        let cookie: AuthRequirement =
            serde_yaml::from_str("{type: api_key, in: cookie, name: session}").unwrap();

        let request = MockRequest::new(Method::GET, "/items?key=abc")
            .with_header("x-api-key", "secret")
            .with_header("Cookie", "theme=dark; session=s1");
        assert!(header.check(&request).is_ok());
        assert!(query.check(&request).is_ok());
        assert!(cookie.check(&request).is_ok());

        let bare = MockRequest::new(Method::GET, "/items");
        assert!(header.check(&bare).is_err());
        assert!(query.check(&bare).is_err());
        assert!(cookie.check(&bare).is_err());
    }

    #[test]
    fn test_none_always_passes() {
        assert!(AuthRequirement::None
            .check(&MockRequest::new(Method::GET, "/"))
            .is_ok());
    }
}
