//! Request classification.
//!
//! Maps an HTTP method and URL onto one of the three smart HTTP routes. This
//! is a pure function of its inputs so every routing rule can be tested
//! from literal method/URL pairs.

use axum::extract::Query;
use axum::http::{Method, Uri};
use gitgate_protocol::Service;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Which of the smart HTTP endpoints a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `GET /{repo}/info/refs?service=...`
    Info,
    /// `GET /{repo}/HEAD`
    Head,
    /// `POST /{repo}/git-{service}`
    Service,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Route::Info => "info",
            Route::Head => "head",
            Route::Service => "service",
        })
    }
}

/// A classified git request.
///
/// `repo` is the path as it appears in the URL (minus the leading slash)
/// and is what the repository store resolves on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedGitRequest {
    /// Ref advertisement.
    Info { repo: String, service: Service },
    /// HEAD file probe.
    Head { repo: String },
    /// Stateless-rpc pack exchange.
    Service { repo: String, service: Service },
}

impl ParsedGitRequest {
    /// The route this request was classified as.
    pub fn route(&self) -> Route {
        match self {
            Self::Info { .. } => Route::Info,
            Self::Head { .. } => Route::Head,
            Self::Service { .. } => Route::Service,
        }
    }

    /// Repository path used for disk resolution.
    pub fn repo(&self) -> &str {
        match self {
            Self::Info { repo, .. } | Self::Head { repo } | Self::Service { repo, .. } => repo,
        }
    }

    /// Repository name shown to listeners, without a trailing `.git`.
    pub fn name(&self) -> &str {
        let repo = self.repo();
        repo.strip_suffix(".git").unwrap_or(repo)
    }

    /// Requested service, if the route carries one.
    pub fn service(&self) -> Option<Service> {
        match self {
            Self::Info { service, .. } | Self::Service { service, .. } => Some(*service),
            Self::Head { .. } => None,
        }
    }
}

/// Why a request could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No route matches, or the repo path tries to escape the store.
    #[error("not found")]
    NotFound,

    /// The request is missing something the route requires.
    #[error("{0}")]
    BadRequest(&'static str),

    /// Wrong method for the route, or an unknown service.
    #[error("method not allowed")]
    MethodNotAllowed,
}

/// Query string of an `info/refs` request.
#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

enum Shape<'a> {
    Info,
    Head,
    Service(&'a str),
}

/// Classifies a request.
///
/// Routes are tried in order: `info/refs`, `HEAD`, then `git-{service}`.
/// A repository path containing `..` is reported as [`RouteError::NotFound`]
/// whatever the method, so probing for files outside the store reveals
/// nothing.
pub fn parse_request(method: &Method, uri: &Uri) -> Result<ParsedGitRequest, RouteError> {
    let path = uri.path();

    let (raw_repo, shape) = if let Some(repo) = path.strip_suffix("/info/refs") {
        (repo, Shape::Info)
    } else if let Some(repo) = path.strip_suffix("/HEAD") {
        (repo, Shape::Head)
    } else {
        match path.rsplit_once('/') {
            Some((repo, last)) if last.starts_with("git-") => (repo, Shape::Service(last)),
            _ => return Err(RouteError::NotFound),
        }
    };

    let repo = percent_decode_str(raw_repo.trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();
    if repo.is_empty() || repo.contains("..") {
        return Err(RouteError::NotFound);
    }

    if method != Method::GET && method != Method::POST {
        return Err(RouteError::MethodNotAllowed);
    }

    match shape {
        Shape::Info => {
            if method != Method::GET {
                return Err(RouteError::MethodNotAllowed);
            }
            let service = Query::<ServiceQuery>::try_from_uri(uri)
                .ok()
                .and_then(|Query(query)| query.service)
                .filter(|service| !service.is_empty())
                .ok_or(RouteError::BadRequest("service parameter required"))?;
            let service = service
                .parse()
                .map_err(|_| RouteError::MethodNotAllowed)?;
            Ok(ParsedGitRequest::Info { repo, service })
        }
        Shape::Head => {
            if method != Method::GET {
                return Err(RouteError::MethodNotAllowed);
            }
            Ok(ParsedGitRequest::Head { repo })
        }
        Shape::Service(name) => {
            if method != Method::POST {
                return Err(RouteError::MethodNotAllowed);
            }
            let service = name.parse().map_err(|_| RouteError::MethodNotAllowed)?;
            Ok(ParsedGitRequest::Service { repo, service })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(method: Method, uri: &str) -> Result<ParsedGitRequest, RouteError> {
        parse_request(&method, &uri.parse().unwrap())
    }

    #[test]
    fn test_info_refs() {
        assert_eq!(
            parse(Method::GET, "/project.git/info/refs?service=git-upload-pack").unwrap(),
            ParsedGitRequest::Info {
                repo: "project.git".to_string(),
                service: Service::UploadPack,
            }
        );
    }

    #[test]
    fn test_nested_repo_path() {
        let parsed = parse(Method::POST, "/org/team/app.git/git-receive-pack").unwrap();
        assert_eq!(parsed.repo(), "org/team/app.git");
        assert_eq!(parsed.name(), "org/team/app");
        assert_eq!(parsed.service(), Some(Service::ReceivePack));
        assert_eq!(parsed.route(), Route::Service);
    }

    #[test]
    fn test_head() {
        let parsed = parse(Method::GET, "/project/HEAD").unwrap();
        assert_eq!(parsed, ParsedGitRequest::Head { repo: "project".to_string() });
        assert_eq!(parsed.service(), None);
    }

    #[test]
    fn test_missing_service_is_bad_request() {
        let err = parse(Method::GET, "/project/info/refs").unwrap_err();
        assert_eq!(err, RouteError::BadRequest("service parameter required"));
        assert_eq!(err.to_string(), "service parameter required");

        assert!(matches!(
            parse(Method::GET, "/project/info/refs?service="),
            Err(RouteError::BadRequest(_))
        ));
    }

    #[test]
    fn test_unknown_service_is_method_not_allowed() {
        assert_eq!(
            parse(Method::GET, "/project/info/refs?service=git-upload-archive"),
            Err(RouteError::MethodNotAllowed)
        );
        assert_eq!(
            parse(Method::POST, "/project/git-upload-archive"),
            Err(RouteError::MethodNotAllowed)
        );
    }

    #[test]
    fn test_wrong_method() {
        assert_eq!(
            parse(Method::PUT, "/project/info/refs?service=git-upload-pack"),
            Err(RouteError::MethodNotAllowed)
        );
        assert_eq!(
            parse(Method::GET, "/project/git-upload-pack"),
            Err(RouteError::MethodNotAllowed)
        );
        assert_eq!(
            parse(Method::POST, "/project/HEAD"),
            Err(RouteError::MethodNotAllowed)
        );
    }

    #[test]
    fn test_traversal_is_not_found() {
        for method in [Method::GET, Method::POST, Method::DELETE] {
            assert_eq!(
                parse(method.clone(), "/../etc/info/refs?service=git-upload-pack"),
                Err(RouteError::NotFound)
            );
            assert_eq!(
                parse(method.clone(), "/a/%2e%2e/b/git-receive-pack"),
                Err(RouteError::NotFound)
            );
            assert_eq!(parse(method, "/x..y/HEAD"), Err(RouteError::NotFound));
        }
    }

    #[test]
    fn test_unmatched_paths() {
        assert_eq!(parse(Method::GET, "/"), Err(RouteError::NotFound));
        assert_eq!(parse(Method::GET, "/project/objects/info/packs"), Err(RouteError::NotFound));
        assert_eq!(parse(Method::GET, "/info/refs?service=git-upload-pack"), Err(RouteError::NotFound));
    }

    #[test]
    fn test_query_decoding() {
        assert_eq!(
            parse(Method::GET, "/p/info/refs?a=1&service=git%2Dupload-pack").unwrap(),
            ParsedGitRequest::Info {
                repo: "p".to_string(),
                service: Service::UploadPack,
            }
        );
        assert!(matches!(
            parse(Method::GET, "/p/info/refs?service"),
            Err(RouteError::BadRequest(_))
        ));
        assert_eq!(
            parse(Method::GET, "/p/info/refs?service=git+upload-pack"),
            Err(RouteError::MethodNotAllowed)
        );
    }

    #[test]
    fn test_repo_path_is_percent_decoded() {
        let parsed = parse(Method::GET, "/my%20repo.git/HEAD").unwrap();
        assert_eq!(parsed.repo(), "my repo.git");
        assert_eq!(parsed.name(), "my repo");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn repo_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,12}(/[a-zA-Z0-9_-]{1,12}){0,2}(\\.git)?"
    }

    proptest! {
        /// Property: any traversal-free repo routes to info with upload-pack
        #[test]
        fn prop_info_refs_classified(repo in repo_strategy()) {
            let uri: Uri = format!("/{repo}/info/refs?service=git-upload-pack").parse().unwrap();
            let parsed = parse_request(&Method::GET, &uri).unwrap();
            prop_assert_eq!(parsed.route(), Route::Info);
            prop_assert_eq!(parsed.service(), Some(Service::UploadPack));
            prop_assert_eq!(parsed.repo(), repo.as_str());
        }

        /// Property: a `..` anywhere in the repo path is not found on every route
        #[test]
        fn prop_traversal_not_found(
            prefix in "[a-z]{0,6}",
            suffix in "[a-z]{0,6}",
            tail in prop::sample::select(vec![
                "info/refs?service=git-upload-pack",
                "HEAD",
                "git-receive-pack",
                "git-upload-pack",
            ]),
            method in prop::sample::select(vec![Method::GET, Method::POST, Method::PUT]),
        ) {
            let uri: Uri = format!("/{prefix}..{suffix}/{tail}").parse().unwrap();
            prop_assert_eq!(parse_request(&method, &uri), Err(RouteError::NotFound));
        }
    }
}
