// ABOUTME: Data structures for remote SQL proxy requests and responses
// ABOUTME: These are serialized to JSON for API communication

use serde::{Deserialize, Serialize};

/// Target database coordinates. Passed through to the proxy, never persisted.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

fn default_port() -> u16 {
    5432
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// `user@host:port/database`, safe for logs.
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    pub stop_on_error: bool,
    pub use_transaction: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    Test,
    Execute,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyRequest<'a> {
    pub action: ProxyAction,
    pub connection: &'a ConnectionDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statements: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ExecuteOptions>,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub connection: ConnectionDescriptor,
    pub statements: Vec<String>,
    pub options: ExecuteOptions,
}

impl ExecuteRequest {
    pub fn as_proxy_request(&self) -> ProxyRequest<'_> {
        ProxyRequest {
            action: ProxyAction::Execute,
            connection: &self.connection,
            statements: Some(&self.statements),
            options: Some(self.options),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatementFailure {
    pub index: usize,
    #[serde(default)]
    pub statement: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteDetails {
    #[serde(default)]
    pub executed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<StatementFailure>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub details: Option<ExecuteDetails>,
}

impl ExecuteResponse {
    /// A rejected call without per-statement details means the proxy never reached the statements.
    pub fn is_infra_failure(&self) -> bool {
        !self.success && self.details.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub code: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "db.internal".to_string(),
            port: 5432,
            database: "crm".to_string(),
            user: "importer".to_string(),
            password: "hunter2".to_string(),
            ssl: true,
        }
    }

    #[test]
    fn test_execute_request_wire_shape() {
        let request = ExecuteRequest {
            connection: connection(),
            statements: vec!["SELECT 1;".to_string()],
            options: ExecuteOptions {
                stop_on_error: false,
                use_transaction: true,
                timeout_ms: 60_000,
            },
        };

        let json = serde_json::to_value(request.as_proxy_request()).unwrap();
        assert_eq!(json["action"], "execute");
        assert_eq!(json["statements"][0], "SELECT 1;");
        assert_eq!(json["options"]["stopOnError"], false);
        assert_eq!(json["options"]["useTransaction"], true);
        assert_eq!(json["options"]["timeoutMs"], 60_000);
        assert_eq!(json["connection"]["host"], "db.internal");
    }

    #[test]
    fn test_response_without_details_is_infra_failure() {
        let response: ExecuteResponse =
            serde_json::from_str(r#"{"success": false, "message": "pool exhausted"}"#).unwrap();
        assert!(response.is_infra_failure());

        let response: ExecuteResponse = serde_json::from_str(
            r#"{"success": false, "message": "1 failed",
                "details": {"executed": 1, "failed": 1,
                            "errors": [{"index": 1, "statement": "x", "error": "boom"}]}}"#,
        )
        .unwrap();
        assert!(!response.is_infra_failure());
        assert_eq!(response.details.unwrap().errors[0].index, 1);
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", connection());
        assert!(!rendered.contains("hunter2"));
        assert_eq!(connection().display_target(), "importer@db.internal:5432/crm");
    }
}
