//! Process configuration, loaded once at startup from the environment.
//!
//! Field names map to the environment variables documented in the
//! design's §6 (`envy` upper-cases each field name to find its match,
//! same convention the sibling web backend in this family uses).

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// External origin used when composing outbound tracking links.
    pub tracking_url: String,

    /// Current HMAC key for the signed URL codec.
    pub tracking_secret: String,

    /// Previous HMAC key, accepted during rotation.
    pub tracking_secret_prev: Option<String>,

    #[serde(default)]
    pub dev_mode: bool,

    #[serde(default = "default_environment")]
    pub environment: String,

    pub default_org_id: Option<Uuid>,

    pub database_url: String,

    #[serde(default = "default_change_bus_url")]
    pub change_bus_url: String,

    #[serde(default = "default_robotic_user_agents")]
    pub robotic_user_agents: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_change_bus_url() -> String {
    "memory://events".to_string()
}

fn default_robotic_user_agents() -> Vec<String> {
    vec![
        "applemailpromp".to_string(),
        "googleimageproxy".to_string(),
        "outlook-safelinks".to_string(),
        "barracuda".to_string(),
        "symantec-mailtester".to_string(),
    ]
}

impl AppConfig {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        envy::from_env::<AppConfig>()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))
    }

    pub fn is_development(&self) -> bool {
        self.dev_mode || self.environment == "development"
    }

    /// Resolve the org context a request should use when no header is
    /// present, if dev mode permits a default tenant.
    pub fn default_org(&self) -> Option<Uuid> {
        if self.is_development() {
            self.default_org_id
        } else {
            None
        }
    }
}
