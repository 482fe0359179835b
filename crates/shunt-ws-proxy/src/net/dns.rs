//! Caching DNS resolution for upstream hostnames.
//!
//! Plain pass-through uses the operating system's resolver via the standard
//! connect path. Supplying `lookupOptions` on a rule switches the handler to
//! a hickory caching resolver so TTL clamping and explicit nameservers can be
//! controlled per rule.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// DNS behavior overrides for a pass-through handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOptions {
    /// Upper bound, in seconds, on how long a successful lookup is cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<u64>,
    /// How long, in seconds, a failed lookup is cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ttl: Option<u64>,
    /// Explicit nameservers to query instead of the system configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<IpAddr>>,
}

/// Build the caching resolver described by `options`.
pub fn build_resolver(options: &LookupOptions) -> Result<TokioResolver, anyhow::Error> {
    let mut builder = match options.servers.as_deref() {
        Some(servers) if !servers.is_empty() => {
            debug!("Building DNS resolver with {} explicit servers", servers.len());
            let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
            TokioResolver::builder_with_config(
                ResolverConfig::from_parts(None, vec![], group),
                TokioConnectionProvider::default(),
            )
        }
        _ => TokioResolver::builder_tokio()
            .map_err(|e| anyhow::anyhow!("Failed to read system DNS configuration: {e}"))?,
    };

    let opts = builder.options_mut();
    opts.positive_max_ttl = options.max_ttl.map(Duration::from_secs);
    opts.negative_max_ttl = options.error_ttl.map(Duration::from_secs);

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_resolver_with_explicit_servers() {
        let options = LookupOptions {
            max_ttl: Some(30),
            error_ttl: Some(5),
            servers: Some(vec!["127.0.0.53".parse().unwrap()]),
        };
        // Construction must not touch the network.
        build_resolver(&options).unwrap();
    }

    #[test]
    fn test_lookup_options_wire_format() {
        let options: LookupOptions =
            serde_json::from_str(r#"{"maxTtl": 60, "servers": ["1.1.1.1"]}"#).unwrap();
        assert_eq!(options.max_ttl, Some(60));
        assert_eq!(options.error_ttl, None);
        assert_eq!(options.servers.as_ref().map(Vec::len), Some(1));
    }
}
