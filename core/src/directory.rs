/// User directory lookup (read-only collaborator)
///
/// Only used to put a name on a conversation shell for a peer that has no
/// messages yet. Searching for users is the host application's job.
use crate::config::Config;
use crate::error::Result;
use crate::store::HttpClient;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserProfile {
    /// Best human-readable name, if the profile has one
    pub fn label(&self) -> Option<String> {
        [&self.display_name, &self.username]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(None)` when the user does not exist
    async fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// `GET {store_url}/api/users/{id}`
#[derive(Clone)]
pub struct HttpUserDirectory {
    http: HttpClient,
}

impl HttpUserDirectory {
    pub fn new(config: &Config) -> Self {
        Self {
            http: HttpClient::new(config),
        }
    }
}

#[async_trait::async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let url = self
            .http
            .url(&format!("/api/users/{}", urlencoding::encode(user_id)));
        self.http.get_json_opt(&url).await
    }
}
