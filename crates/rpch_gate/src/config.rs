// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Gateway configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// All recognized directives. Anything absent takes its documented default;
/// the gateway keeps no state across restarts so this is the whole picture.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Size of the HTTP context pool.
    pub context_num: usize,
    /// Threads driving the cooperative step function.
    pub worker_num: usize,
    /// Per-I/O idle bound, seconds.
    pub http_session_timeout: u64,
    /// Consecutive auth failures before the user is temporarily blocked.
    pub max_auth_times: u32,
    /// Hold duration for the temporary block, seconds.
    pub block_auth_fail: u64,
    pub http_support_tls: bool,
    pub tls_certificate_path: Option<PathBuf>,
    pub tls_private_key_path: Option<PathBuf>,
    pub tls_certificate_passwd: Option<String>,
    /// Minimum TLS protocol by name ("tls1.2", "tls1.3", ...).
    pub tls_min_proto: Option<String>,
    /// 0 = off, 1 = summaries, 2 = wire dumps.
    pub http_debug: u8,
    pub request_logging: u8,
    pub response_logging: u8,
    /// CSV of dispatch instrumentation knobs: `sequential`, `rate_limit=<N>`.
    pub ews_debug: Option<String>,
    /// Fallback language when the auth backend returns none.
    pub user_default_lang: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 80)),
            context_num: 200,
            worker_num: 4,
            http_session_timeout: 60,
            max_auth_times: 10,
            block_auth_fail: 60,
            http_support_tls: false,
            tls_certificate_path: None,
            tls_private_key_path: None,
            tls_certificate_passwd: None,
            tls_min_proto: None,
            http_debug: 0,
            request_logging: 0,
            response_logging: 0,
            ews_debug: None,
            user_default_lang: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_session_timeout)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_auth_fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.http_session_timeout, 60);
        assert_eq!(cfg.context_num, 200);
        assert!(!cfg.http_support_tls);
        assert_eq!(cfg.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn deserialize_partial() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"listen": "127.0.0.1:8080", "context_num": 16, "ews_debug": "sequential,rate_limit=5"}"#,
        )
        .unwrap();
        assert_eq!(cfg.listen.port(), 8080);
        assert_eq!(cfg.context_num, 16);
        assert_eq!(cfg.http_session_timeout, 60);
        assert_eq!(cfg.ews_debug.as_deref(), Some("sequential,rate_limit=5"));
    }
}
