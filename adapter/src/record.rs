use common_auth::AuthContext;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RECORD_TYPE: &str = "APIAnalytics";
pub const GATEWAY_SOURCE: &str = "istio";

/// One completed API call, shaped for the analytics ingestion service.
/// All timestamps are unix milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub client_received_start_timestamp: i64,
    #[serde(default)]
    pub client_received_end_timestamp: i64,
    #[serde(default)]
    pub client_sent_start_timestamp: i64,
    #[serde(default)]
    pub client_sent_end_timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_received_start_timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_received_end_timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_sent_start_timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_sent_end_timestamp: i64,
    #[serde(default, rename = "recordType")]
    pub record_type: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub apiproxy: String,
    #[serde(default)]
    pub request_uri: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(default)]
    pub request_verb: String,
    #[serde(default)]
    pub response_status_code: i64,
    #[serde(default)]
    pub useragent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub developer_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub developer_app: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(default)]
    pub gateway_source: String,
    #[serde(default)]
    pub gateway_flow_id: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl Record {
    /// Stamps fields owned by the pipeline: tenant identity from the
    /// context, a fresh flow id, and the record-type constants.
    pub fn stamp(&mut self, ctx: &AuthContext) {
        self.organization = ctx.env().org().to_string();
        self.environment = ctx.env().env().to_string();
        self.record_type = RECORD_TYPE.to_string();
        self.gateway_source = GATEWAY_SOURCE.to_string();
        self.gateway_flow_id = Uuid::new_v4().to_string();
        if self.developer_email.is_empty() {
            if let Some(email) = &ctx.developer_email {
                self.developer_email = email.clone();
            }
        }
        if self.developer_app.is_empty() {
            self.developer_app = ctx.application_name.clone();
        }
        if self.client_id.is_empty() {
            self.client_id = ctx.client_id.clone();
        }
        if self.access_token.is_empty() {
            if let Some(token) = &ctx.access_token {
                self.access_token = token.clone();
            }
        }
    }

    /// A usable record starts with a positive client-received start and does
    /// not end before it starts.
    pub fn has_valid_timestamps(&self) -> bool {
        self.client_received_start_timestamp > 0
            && self.client_received_end_timestamp >= self.client_received_start_timestamp
    }
}
