use reqwest::Url;

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DATABASE: &str = "story_sessions";

/// Where the CouchDB backend keeps its documents and how it authenticates.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server root, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database holding sessions, ballots and claims.
    pub database: String,
    /// Basic auth user, if any.
    pub username: Option<String>,
    /// Basic auth password, if any.
    pub password: Option<String>,
}

impl CouchConfig {
    /// Configuration without credentials.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            username: None,
            password: None,
        }
    }

    /// Attach basic-auth credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Read `COUCH_BASE_URL`, `COUCH_DB`, `COUCH_USERNAME` and `COUCH_PASSWORD`.
    ///
    /// `COUCH_DB` defaults to `story_sessions`. Credentials are used only when both are set.
    pub fn from_env() -> CouchResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CouchResult<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let base_url = var("COUCH_BASE_URL").ok_or(CouchDaoError::MissingEnvVar {
            var: "COUCH_BASE_URL",
        })?;
        let database = var("COUCH_DB").unwrap_or_else(|| DEFAULT_DATABASE.into());

        let config = Self::new(base_url, database);
        Ok(match (var("COUCH_USERNAME"), var("COUCH_PASSWORD")) {
            (Some(username), Some(password)) => config.with_credentials(username, password),
            _ => config,
        })
    }

    /// The server root as a URL that document paths can be appended to.
    pub(super) fn parsed_base_url(&self) -> CouchResult<Url> {
        Url::parse(self.base_url.trim_end_matches('/'))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| CouchDaoError::InvalidBaseUrl {
                url: self.base_url.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn base_url_is_required_and_the_database_defaults() {
        assert!(matches!(
            CouchConfig::from_lookup(lookup(&[("COUCH_DB", "stories")])),
            Err(CouchDaoError::MissingEnvVar {
                var: "COUCH_BASE_URL"
            })
        ));

        let config =
            CouchConfig::from_lookup(lookup(&[("COUCH_BASE_URL", "http://couch:5984")])).unwrap();
        assert_eq!(config.database, "story_sessions");
        assert!(config.username.is_none());
    }

    #[test]
    fn credentials_need_both_halves() {
        let half = CouchConfig::from_lookup(lookup(&[
            ("COUCH_BASE_URL", "http://couch:5984"),
            ("COUCH_USERNAME", "admin"),
        ]))
        .unwrap();
        assert!(half.username.is_none() && half.password.is_none());

        let full = CouchConfig::from_lookup(lookup(&[
            ("COUCH_BASE_URL", "http://couch:5984"),
            ("COUCH_USERNAME", "admin"),
            ("COUCH_PASSWORD", "secret"),
            ("COUCH_DB", " "),
        ]))
        .unwrap();
        assert_eq!(full.username.as_deref(), Some("admin"));
        assert_eq!(full.password.as_deref(), Some("secret"));
        assert_eq!(full.database, "story_sessions");
    }

    #[test]
    fn base_urls_must_accept_paths() {
        let url = CouchConfig::new("http://couch:5984/", "stories")
            .parsed_base_url()
            .unwrap();
        assert_eq!(url.as_str(), "http://couch:5984/");

        assert!(matches!(
            CouchConfig::new("mailto:ops@example.com", "stories").parsed_base_url(),
            Err(CouchDaoError::InvalidBaseUrl { .. })
        ));
        assert!(CouchConfig::new("not a url", "stories").parsed_base_url().is_err());
    }
}
