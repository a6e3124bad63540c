// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! TLS acceptor construction. The handshake itself is a context state; see
//! the INITSSL step.

use std::fs;

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslFiletype, SslMethod, SslOptions, SslVersion};

use crate::config::GatewayConfig;
use crate::error::GatewayError;

fn min_proto_by_name(name: &str) -> Option<SslVersion> {
    match name.to_ascii_lowercase().as_str() {
        "tls1" | "tls1.0" | "tlsv1" => Some(SslVersion::TLS1),
        "tls1.1" | "tlsv1.1" => Some(SslVersion::TLS1_1),
        "tls1.2" | "tlsv1.2" => Some(SslVersion::TLS1_2),
        "tls1.3" | "tlsv1.3" => Some(SslVersion::TLS1_3),
        _ => None,
    }
}

/// Builds the server TLS context per the listener configuration. Any failure
/// here aborts startup before service begins.
pub fn build_tls_context(cfg: &GatewayConfig) -> Result<SslContext, GatewayError> {
    let cert = cfg
        .tls_certificate_path
        .as_ref()
        .ok_or_else(|| GatewayError::Config("http_support_tls without a certificate".into()))?;
    let key = cfg
        .tls_private_key_path
        .as_ref()
        .ok_or_else(|| GatewayError::Config("http_support_tls without a private key".into()))?;

    let mut builder = SslContext::builder(SslMethod::tls_server())?;
    builder.set_certificate_chain_file(cert)?;
    match &cfg.tls_certificate_passwd {
        Some(passwd) => {
            let pem = fs::read(key)?;
            let pkey = PKey::private_key_from_pem_passphrase(&pem, passwd.as_bytes())?;
            builder.set_private_key(&pkey)?;
        }
        None => builder.set_private_key_file(key, SslFiletype::PEM)?,
    }
    builder.check_private_key()?;
    if let Some(name) = &cfg.tls_min_proto {
        let version = min_proto_by_name(name)
            .ok_or_else(|| GatewayError::Config(format!("tls_min_proto value {name:?} rejected")))?;
        builder.set_min_proto_version(Some(version))?;
    }
    builder.set_options(SslOptions::NO_RENEGOTIATION);
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_names() {
        assert_eq!(min_proto_by_name("tls1.2"), Some(SslVersion::TLS1_2));
        assert_eq!(min_proto_by_name("TLSv1.3"), Some(SslVersion::TLS1_3));
        assert_eq!(min_proto_by_name("ssl3"), None);
    }

    #[test]
    fn tls_without_cert_is_a_config_error() {
        let cfg = GatewayConfig {
            http_support_tls: true,
            ..Default::default()
        };
        assert!(matches!(
            build_tls_context(&cfg),
            Err(GatewayError::Config(_))
        ));
    }
}
