use std::fmt::{self, Display, Formatter};

use crate::error::{invalid_request, Result};

/// Resource identifier of the form `name` or `name?query`.
///
/// The name is dot-separated; the query is opaque to the gateway except that
/// the owning service may return a normalised form of it with the initial
/// resource response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    name: String,
    query: Option<String>,
}

impl Rid {
    /// Parses and validates a resource identifier. An empty query part
    /// (`name?`) is treated as no query.
    pub fn parse(rid: &str) -> Result<Self> {
        let (name, query) = match rid.split_once('?') {
            Some((name, "")) => (name, None),
            Some((name, query)) => (name, Some(query.to_string())),
            None => (rid, None),
        };

        if name.is_empty() {
            return Err(invalid_request("Resource name must not be empty"));
        }
        for segment in name.split('.') {
            if segment.is_empty() {
                return Err(invalid_request(format!(
                    "Invalid resource name: {}",
                    name
                )));
            }
            if segment
                .chars()
                .any(|c| c.is_whitespace() || c == '?' || c == '*' || c == '>')
            {
                return Err(invalid_request(format!(
                    "Invalid resource name: {}",
                    name
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            query,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }
}

impl Display for Rid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.query {
            Some(query) => write!(f, "{}?{}", self.name, query),
            None => write!(f, "{}", self.name),
        }
    }
}
