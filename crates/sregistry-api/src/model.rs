//! Common API models and constants
//!
//! Shared constants, parameter keys and the auth login model used by
//! every naming endpoint.

use serde::{Deserialize, Serialize};

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
pub const DEFAULT_CLUSTER: &str = "DEFAULT";
pub const DEFAULT_NAMESPACE: &str = "public";
pub const DEFAULT_CONTEXT_PATH: &str = "/nacos";

/// Separator between group and service in a grouped service name
pub const SERVICE_INFO_SPLITER: &str = "@@";

// Parameter keys
pub const NAMESPACE_ID: &str = "namespaceId";
pub const GROUP_NAME: &str = "groupName";
pub const SERVICE_NAME: &str = "serviceName";
pub const CLUSTER_NAME: &str = "clusterName";
pub const CLUSTERS: &str = "clusters";
pub const ACCESS_TOKEN: &str = "accessToken";

// Signing headers
pub const ACCESS_KEY_HEADER: &str = "Spas-AccessKey";
pub const SIGNATURE_HEADER: &str = "Spas-Signature";
pub const TIMESTAMP_HEADER: &str = "Timestamp";

// API paths, relative to the context path
pub const LOGIN_PATH: &str = "/v1/auth/login";

/// Default token lifetime when the server does not report one (seconds)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 18000;

/// Response body of `POST /v1/auth/login`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_ttl: i64,
    pub global_admin: bool,
}

impl LoginResponse {
    /// Token lifetime in seconds, falling back to the server default
    pub fn ttl_secs(&self) -> i64 {
        if self.token_ttl > 0 {
            self.token_ttl
        } else {
            DEFAULT_TOKEN_TTL_SECS
        }
    }
}
