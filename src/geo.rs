//! Geolocation and reputation lookups for inbound source addresses.
//!
//! Lookups are strictly best-effort: any transport, decode, or timeout
//! failure degrades to the sentinel record and never fails the caller. The
//! Tor exit-node list is fetched once at startup; if the fetch fails the
//! proxy keeps operating with the flag pinned to `false`.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

const PROVIDER_URL: &str = "http://api.ipstack.com/";
const TOR_EXIT_URL: &str = "https://check.torproject.org/torbulkexitlist";

/// Sentinel used when a geo field cannot be resolved.
const UNKNOWN: &str = "unk";

/// Geolocation and reputation data for one source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRecord {
    pub continent_code: String,
    pub country_code: String,
    pub city: String,
    pub tor_exit: bool,
}

impl Default for GeoRecord {
    fn default() -> Self {
        Self {
            continent_code: UNKNOWN.to_string(),
            country_code: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            tor_exit: false,
        }
    }
}

/// Shape of the provider's JSON response. Missing fields decay per-field.
#[derive(Debug, Deserialize)]
struct ProviderRecord {
    #[serde(default)]
    continent_code: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

pub struct GeoResolver {
    client: reqwest::Client,
    api_key: String,
    tor_exits: HashSet<String>,
}

impl GeoResolver {
    /// Creates a resolver. An empty `api_key` disables provider lookups;
    /// the resolver then only answers the Tor flag.
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            tor_exits: HashSet::new(),
        }
    }

    /// One-shot startup fetch of the Tor bulk exit list.
    ///
    /// On failure the exit set stays empty and every lookup reports
    /// `tor_exit = false`.
    pub async fn load_tor_exits(&mut self) {
        match self.fetch_tor_exit_list().await {
            Ok(body) => {
                self.tor_exits = parse_exit_list(&body);
                info!("loaded {} Tor exit addresses", self.tor_exits.len());
            }
            Err(e) => {
                warn!("Tor exit list fetch failed, flag disabled: {}", e);
            }
        }
    }

    async fn fetch_tor_exit_list(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(TOR_EXIT_URL)
            .send()
            .await?
            .text()
            .await
    }

    /// O(1) membership test against the startup exit-node set.
    pub fn is_tor_exit(&self, host: &str) -> bool {
        self.tor_exits.contains(host)
    }

    /// Resolves `host` to a best-effort geo record. Never fails.
    pub async fn lookup(&self, host: &str) -> GeoRecord {
        let mut record = GeoRecord {
            tor_exit: self.is_tor_exit(host),
            ..GeoRecord::default()
        };

        if self.api_key.is_empty() {
            return record;
        }

        let url = format!("{}{}", PROVIDER_URL, host);
        let response = self
            .client
            .get(&url)
            .query(&[("access_key", self.api_key.as_str())])
            .header("Accept", "application/json")
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!("geo request for {} failed: {}", host, e);
                return record;
            }
        };

        match response.json::<ProviderRecord>().await {
            Ok(provider) => {
                if let Some(v) = provider.continent_code {
                    record.continent_code = v;
                }
                if let Some(v) = provider.country_code {
                    record.country_code = v;
                }
                if let Some(v) = provider.city {
                    record.city = v;
                }
            }
            Err(e) => {
                debug!("geo response for {} did not decode: {}", host, e);
            }
        }

        record
    }
}

/// Parses the provider's plaintext exit list: one address per line, trimmed.
fn parse_exit_list(body: &str) -> HashSet<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_list_membership() {
        let set = parse_exit_list("192.0.2.1\n192.0.2.2\n");
        assert!(set.contains("192.0.2.1"));
        assert!(set.contains("192.0.2.2"));
        assert!(!set.contains("192.0.2.9"));
    }

    #[test]
    fn exit_list_trims_and_skips_blank_lines() {
        let set = parse_exit_list("  192.0.2.1 \n\n\t198.51.100.7\n \n");
        assert_eq!(set.len(), 2);
        assert!(set.contains("192.0.2.1"));
        assert!(set.contains("198.51.100.7"));
    }

    #[test]
    fn partial_provider_json_decays_per_field() {
        let provider: ProviderRecord =
            serde_json::from_str(r#"{"country_code": "DE"}"#).unwrap();
        assert_eq!(provider.country_code.as_deref(), Some("DE"));
        assert!(provider.continent_code.is_none());
        assert!(provider.city.is_none());
    }

    #[tokio::test]
    async fn empty_api_key_skips_provider_and_keeps_tor_flag() {
        let mut resolver = GeoResolver::new(String::new());
        resolver.tor_exits = parse_exit_list("192.0.2.1\n");

        let hit = resolver.lookup("192.0.2.1").await;
        assert!(hit.tor_exit);
        assert_eq!(hit.country_code, "unk");

        let miss = resolver.lookup("192.0.2.9").await;
        assert!(!miss.tor_exit);
        assert_eq!(miss, GeoRecord::default());
    }
}
