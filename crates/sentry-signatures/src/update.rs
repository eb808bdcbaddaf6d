//! Feed updates: fetch each provider's source list over HTTP and apply its
//! regex, line by line, inserting named captures into the matching table.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detector::SignatureDetector;

/// Which table a provider's matches are inserted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// `signature_ip` table; expects a named `ip` capture group.
    Ip,
    /// `signature_botnet` table; expects `ip` and `port` capture groups.
    Botnet,
    /// `signature_tracker` table; expects a `url` capture group.
    Tracker,
    /// `signature_cert` table; expects `sha1` (and optionally `name`).
    Cert,
}

/// One feed source: where to fetch it, what kind of signature it produces,
/// and the regex used to pull fields out of each line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Provider id, recorded against every signature it produces.
    pub id: i64,
    /// Human-readable provider name.
    pub name: String,
    /// Table this provider feeds.
    pub provider_type: ProviderType,
    /// HTTP(S) URL to fetch the raw feed from.
    pub source: String,
    /// Regex with named capture groups matching `provider_type`'s fields.
    pub pattern: String,
}

/// Fetches provider feeds and applies them to a [`SignatureDetector`].
pub struct FeedUpdater {
    client: reqwest::Client,
    detector: Arc<SignatureDetector>,
}

impl FeedUpdater {
    /// Build an updater against a shared detector.
    pub fn new(detector: Arc<SignatureDetector>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { client, detector }
    }

    /// Fetch and apply every provider's feed. A single provider's failure
    /// (bad regex, unreachable source) is logged and skipped; it does not
    /// abort the remaining providers.
    pub async fn update_all(&self, providers: &[Provider]) {
        for provider in providers {
            if let Err(err) = self.update_one(provider).await {
                tracing::warn!(provider = %provider.name, error = %err, "feed update failed");
            }
        }
    }

    async fn update_one(&self, provider: &Provider) -> Result<(), UpdateError> {
        let regex = Regex::new(&provider.pattern)?;
        let body = self.client.get(&provider.source).send().await?.text().await?;

        for line in body.lines() {
            let Some(captures) = regex.captures(line) else { continue };
            apply_capture(&self.detector, provider, &regex, &captures);
        }

        Ok(())
    }
}

fn apply_capture(
    detector: &SignatureDetector,
    provider: &Provider,
    regex: &Regex,
    captures: &regex::Captures,
) {
    let field = |name: &str| -> Option<String> { captures.name(name).map(|m| m.as_str().to_string()) };
    let _ = regex;

    match provider.provider_type {
        ProviderType::Ip => {
            if let Some(ip) = field("ip") {
                detector.insert_ip(ip, provider.name.clone(), provider.id);
            }
        }
        ProviderType::Botnet => {
            if let (Some(ip), Some(port)) = (field("ip"), field("port").and_then(|p| p.parse().ok())) {
                detector.insert_botnet(ip, port, provider.name.clone(), provider.id);
            }
        }
        ProviderType::Tracker => {
            if let Some(url) = field("url") {
                detector.insert_tracker(url, provider.name.clone(), provider.id);
            }
        }
        ProviderType::Cert => {
            if let Some(sha1) = field("sha1") {
                detector.insert_cert(sha1, provider.name.clone(), provider.id);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum UpdateError {
    #[error("bad pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_pattern_extracts_named_group() {
        let regex = Regex::new(r"^(?P<ip>\d+\.\d+\.\d+\.\d+)\s*#.*$").unwrap();
        let captures = regex.captures("1.2.3.4 # feodo tracker").unwrap();
        assert_eq!(captures.name("ip").unwrap().as_str(), "1.2.3.4");
    }

    #[test]
    fn non_matching_line_is_skipped() {
        let regex = Regex::new(r"^(?P<ip>\d+\.\d+\.\d+\.\d+)$").unwrap();
        assert!(regex.captures("not an ip").is_none());
    }
}
