//! HTTP client factory for provider calls.
//!
//! Every client carries the Relay User-Agent, `tcp_nodelay`, and a bounded
//! idle pool so DNS is re-resolved periodically.

use std::time::Duration;

use reqwest::Client;

/// User-Agent string for all HTTP requests.
pub const USER_AGENT: &str = concat!("relay-cli/", env!("CARGO_PKG_VERSION"));

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle pooled connections are closed after this long.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn create_default_client() -> Result<Client, String> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Creates an HTTP client with a custom overall timeout.
///
/// The read timeout is capped at the overall timeout so a truncated body
/// cannot hang a worker.
pub fn create_client_with_timeout(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .read_timeout(timeout.min(DEFAULT_TIMEOUT))
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build() {
        assert!(create_default_client().is_ok());
        assert!(create_client_with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_user_agent_names_relay() {
        assert!(USER_AGENT.starts_with("relay-cli/"));
    }
}
