//! Request path and query-string parsing.
//!
//! Project-scoped requests follow `/project/{project_id}` or
//! `/project/{project_id}/<rest>`. The console endpoint takes the project as a
//! `projectId` query parameter. Both parsers are strict about malformed input:
//!
//! - an empty project segment (`/project/` or `/project//x`) is not a project
//!   path at all;
//! - a query parameter that is missing, empty, or repeated with different
//!   values is rejected rather than guessed at.

use std::fmt;

/// Path prefix shared by every project-scoped route.
pub const PROJECT_PREFIX: &str = "/project/";

/// Query parameter naming the project on the console endpoint.
pub const PROJECT_ID_PARAM: &str = "projectId";

/// A request path split into its project id and the remainder that is
/// forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectPath<'a> {
    pub project_id: &'a str,
    /// Everything after `/project/{project_id}`, always starting with `/`.
    pub rest: &'a str,
}

/// Parse `/project/{project_id}[/<rest>]`. Returns `None` for any path that
/// does not follow the convention.
pub fn parse_project_path(path: &str) -> Option<ProjectPath<'_>> {
    let tail = path.strip_prefix(PROJECT_PREFIX)?;
    let (project_id, rest) = match tail.find('/') {
        Some(idx) => (&tail[..idx], &tail[idx..]),
        None => (tail, "/"),
    };
    if project_id.is_empty() {
        return None;
    }
    Some(ProjectPath { project_id, rest })
}

/// Whether `id` can name a project (non-empty, one path segment, no control
/// characters).
pub fn is_valid_project_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.chars().any(char::is_control)
}

/// Why a query parameter could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The parameter is absent.
    Missing(&'static str),
    /// The parameter is present with an empty value.
    Empty(&'static str),
    /// The parameter appears more than once with different values.
    Conflicting(&'static str),
    /// The value is not a usable project id.
    Invalid(&'static str),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "missing query parameter `{name}`"),
            Self::Empty(name) => write!(f, "query parameter `{name}` is empty"),
            Self::Conflicting(name) => {
                write!(f, "query parameter `{name}` given with conflicting values")
            }
            Self::Invalid(name) => write!(f, "query parameter `{name}` is not a valid project id"),
        }
    }
}

impl std::error::Error for QueryError {}

/// Extract a single percent-decoded parameter from a raw query string.
///
/// Repeating a parameter with the same value is tolerated; different values
/// are a [`QueryError::Conflicting`].
pub fn query_param(query: Option<&str>, name: &'static str) -> Result<String, QueryError> {
    let query = query.unwrap_or("");
    let mut found: Option<String> = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != name {
            continue;
        }
        if value.is_empty() {
            return Err(QueryError::Empty(name));
        }
        match found {
            Some(ref existing) if *existing != value => {
                return Err(QueryError::Conflicting(name));
            }
            Some(_) => {}
            None => found = Some(value.into_owned()),
        }
    }
    found.ok_or(QueryError::Missing(name))
}

/// Extract and validate the console endpoint's `projectId` parameter.
pub fn console_project_id(query: Option<&str>) -> Result<String, QueryError> {
    let id = query_param(query, PROJECT_ID_PARAM)?;
    if is_valid_project_id(&id) {
        Ok(id)
    } else {
        Err(QueryError::Invalid(PROJECT_ID_PARAM))
    }
}
