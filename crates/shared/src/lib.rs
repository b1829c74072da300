pub mod events;
pub mod types;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    fn default_http_base() -> String {
        "http://127.0.0.1:8000".to_string()
    }

    fn default_ws_url() -> String {
        "ws://127.0.0.1:8000/ws".to_string()
    }

    fn default_request_timeout_secs() -> u64 {
        120
    }

    fn default_reconnect_attempts() -> u32 {
        5
    }

    fn default_history_window() -> usize {
        20
    }

    /// Endpoint and protocol configuration for the backend connection.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Settings {
        /// Base URL for chunked HTTP requests (chat, plugin listing).
        #[serde(default = "default_http_base")]
        pub http_base: String,
        /// URL of the persistent push channel.
        #[serde(default = "default_ws_url")]
        pub ws_url: String,
        /// Overall timeout for one streaming chat request, in seconds.
        #[serde(default = "default_request_timeout_secs")]
        pub request_timeout_secs: u64,
        /// Reconnect attempt ceiling for the push channel.
        #[serde(default = "default_reconnect_attempts")]
        pub reconnect_attempts: u32,
        /// How many trailing messages to send as backend context.
        #[serde(default = "default_history_window")]
        pub history_window: usize,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                http_base: default_http_base(),
                ws_url: default_ws_url(),
                request_timeout_secs: default_request_timeout_secs(),
                reconnect_attempts: default_reconnect_attempts(),
                history_window: default_history_window(),
            }
        }
    }

    impl Settings {
        pub fn request_timeout(&self) -> Duration {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults_fill_missing_fields() {
            let settings: Settings = serde_json::from_str("{}").unwrap();
            assert_eq!(settings.http_base, "http://127.0.0.1:8000");
            assert_eq!(settings.reconnect_attempts, 5);
            assert_eq!(settings.history_window, 20);
        }
    }
}
