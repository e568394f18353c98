//! Download coordinate files from an online airfoil database.

use reqwest::Client;
use std::time::Duration;
use tracing::info;

use crate::profile::{Profile, ProfileError};

/// UIUC Airfoil Coordinates Database.
pub const DEFAULT_DATABASE_URL: &str = "https://m-selig.ae.illinois.edu/ads/coord";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid airfoil name '{0}'")]
    InvalidName(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("downloaded coordinates are invalid: {0}")]
    Profile(#[from] ProfileError),
}

pub struct AirfoilDatabase {
    client: Client,
    base_url: String,
}

impl AirfoilDatabase {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("airfoil-cfd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Database file URL; names are limited to `[A-Za-z0-9_-]`.
    pub fn url_for(&self, name: &str) -> Result<String, FetchError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(FetchError::InvalidName(name.to_string()));
        }
        Ok(format!("{}/{}.dat", self.base_url, name.to_ascii_lowercase()))
    }

    /// Fetch and parse a profile.
    pub async fn fetch(&self, name: &str) -> Result<Profile, FetchError> {
        let url = self.url_for(name)?;
        info!(url = %url, "downloading coordinates");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        let text = resp.text().await?;
        let profile = Profile::parse(&text, name)?;
        info!(name = %profile.name, points = profile.points.len(), "coordinates downloaded");
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for() {
        let db = AirfoilDatabase::new("https://example.org/coord/").unwrap();
        assert_eq!(
            db.url_for("NACA2412").unwrap(),
            "https://example.org/coord/naca2412.dat"
        );
        assert_eq!(
            db.url_for("fx63-137").unwrap(),
            "https://example.org/coord/fx63-137.dat"
        );
    }

    #[test]
    fn test_rejects_path_tricks() {
        let db = AirfoilDatabase::new(DEFAULT_DATABASE_URL).unwrap();
        for bad in ["", "../etc/passwd", "a b", "naca?x=1"] {
            assert!(matches!(db.url_for(bad), Err(FetchError::InvalidName(_))));
        }
    }

    #[tokio::test]
    async fn test_fetch_invalid_name_does_not_hit_network() {
        let db = AirfoilDatabase::new("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            db.fetch("bad/name").await,
            Err(FetchError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let db = AirfoilDatabase::new("http://127.0.0.1:9").unwrap();
        assert!(matches!(db.fetch("naca0012").await, Err(FetchError::Http(_))));
    }
}
