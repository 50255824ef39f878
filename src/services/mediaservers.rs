//! Media server rescan adapters
//!
//! Two kinds of servers are supported. Jellyfin-style servers take the
//! token in a request header and answer refreshes with 204; Plex-style
//! servers take the token as a query parameter and answer refreshes with
//! 200. Both adapters expose `validate` (check connectivity and library
//! ids) and `update` (request a rescan of every configured library).

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::Value;
use tracing::{debug, info};

use crate::db::MediaServerRecord;

const USER_AGENT: &str = concat!("chansync/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(10);

/// A remote library known to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLibrary {
    pub id: String,
    pub name: String,
}

/// Protocol adapter for one kind of media server
#[async_trait]
pub trait MediaServerAdapter: Send + Sync {
    /// List the libraries the server knows about
    async fn libraries(&self) -> Result<Vec<RemoteLibrary>>;

    /// Ask the server to rescan one library
    async fn refresh(&self, library_id: &str) -> Result<()>;

    fn record(&self) -> &MediaServerRecord;

    /// Check the server is reachable and every configured library id
    /// exists on it. Returns the server's library listing.
    async fn validate(&self) -> Result<Vec<RemoteLibrary>> {
        if self.record().library_ids().is_empty() {
            bail!("media server has no libraries configured");
        }
        let remote = self.libraries().await?;
        for library_id in self.record().library_ids() {
            if !remote.iter().any(|lib| lib.id == library_id) {
                let known = remote
                    .iter()
                    .map(|lib| format!("\"{}\" with ID \"{}\"", lib.name, lib.id))
                    .collect::<Vec<_>>()
                    .join(", ");
                bail!(
                    "library ID {library_id} does not exist on the server; valid libraries are: {known}"
                );
            }
        }
        Ok(remote)
    }

    /// Ask the server to rescan every configured library
    async fn update(&self) -> Result<()> {
        for library_id in self.record().library_ids() {
            self.refresh(&library_id).await?;
            info!(
                server = %self.record().base_url(),
                library_id = %library_id,
                "Requested library rescan"
            );
        }
        Ok(())
    }
}

/// Build the adapter matching a server record's type
pub fn media_server_client(record: MediaServerRecord) -> Result<Box<dyn MediaServerAdapter>> {
    // Catch malformed host/port combinations before any request goes out
    url::Url::parse(&record.base_url()).context("media server address is not a valid URL")?;
    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(TIMEOUT)
        .danger_accept_invalid_certs(!record.verify_https)
        .build()
        .context("Failed to build media server HTTP client")?;

    if record.server_type.eq_ignore_ascii_case("plex") {
        Ok(Box::new(PlexMediaServer { record, http }))
    } else {
        Ok(Box::new(JellyfinMediaServer { record, http }))
    }
}

/// Header-token adapter: refresh answers 204, listing is JSON
pub struct JellyfinMediaServer {
    record: MediaServerRecord,
    http: reqwest::Client,
}

#[async_trait]
impl MediaServerAdapter for JellyfinMediaServer {
    fn record(&self) -> &MediaServerRecord {
        &self.record
    }

    async fn libraries(&self) -> Result<Vec<RemoteLibrary>> {
        let url = format!("{}/Library/MediaFolders", self.record.base_url());
        let response = self
            .http
            .get(&url)
            .header("X-Emby-Token", &self.record.token)
            .query(&[("Recursive", "true"), ("IncludeItemTypes", "CollectionFolder")])
            .send()
            .await
            .context("Failed to connect to media server")?;
        if response.status().as_u16() != 200 {
            bail!(
                "media server returned status {} for the library listing",
                response.status()
            );
        }
        let body: Value = response
            .json()
            .await
            .context("media server returned unparseable JSON")?;
        let items = body
            .get("Items")
            .and_then(|v| v.as_array())
            .context("media server returned unexpected data")?;
        Ok(items
            .iter()
            .filter_map(|item| {
                Some(RemoteLibrary {
                    id: item.get("Id")?.as_str()?.to_string(),
                    name: item.get("Name")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn refresh(&self, library_id: &str) -> Result<()> {
        let url = format!("{}/Items/{}/Refresh", self.record.base_url(), library_id);
        let response = self
            .http
            .post(&url)
            .header("X-Emby-Token", &self.record.token)
            .send()
            .await
            .context("Failed to connect to media server")?;
        // 204 No Content is the expected answer for a successful refresh
        if response.status().as_u16() != 204 {
            bail!(
                "failed to refresh library \"{library_id}\", status code: {}",
                response.status()
            );
        }
        Ok(())
    }
}

/// Query-token adapter: refresh answers 200, listing is XML
pub struct PlexMediaServer {
    record: MediaServerRecord,
    http: reqwest::Client,
}

#[async_trait]
impl MediaServerAdapter for PlexMediaServer {
    fn record(&self) -> &MediaServerRecord {
        &self.record
    }

    async fn libraries(&self) -> Result<Vec<RemoteLibrary>> {
        let url = format!("{}/library/sections", self.record.base_url());
        let response = self
            .http
            .get(&url)
            .query(&[("X-Plex-Token", self.record.token.as_str())])
            .send()
            .await
            .context("Failed to connect to media server")?;
        let status = response.status().as_u16();
        if status != 200 {
            let hint = if (400..500).contains(&status) {
                " Check the token is valid."
            } else {
                ""
            };
            bail!("media server returned status {status} for the library listing.{hint}");
        }
        let body = response
            .text()
            .await
            .context("Failed to read media server response")?;
        parse_media_container(&body)
    }

    async fn refresh(&self, library_id: &str) -> Result<()> {
        let url = format!(
            "{}/library/sections/{}/refresh",
            self.record.base_url(),
            library_id
        );
        let response = self
            .http
            .get(&url)
            .query(&[("X-Plex-Token", self.record.token.as_str())])
            .send()
            .await
            .context("Failed to connect to media server")?;
        if response.status().as_u16() != 200 {
            bail!(
                "failed to refresh library \"{library_id}\", status code: {}",
                response.status()
            );
        }
        Ok(())
    }
}

/// Parse a `<MediaContainer>` library listing into (key, title) pairs
fn parse_media_container(xml: &str) -> Result<Vec<RemoteLibrary>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut libraries = Vec::new();
    let mut saw_container = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                if name == "MediaContainer" {
                    saw_container = true;
                } else if name == "Directory" {
                    let mut key = None;
                    let mut title = None;
                    for attr in e.attributes().flatten() {
                        let attr_name = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = String::from_utf8_lossy(&attr.value).to_string();
                        match attr_name.as_str() {
                            "key" => key = Some(value),
                            "title" => title = Some(value),
                            _ => {}
                        }
                    }
                    if let (Some(key), Some(title)) = (key, title) {
                        libraries.push(RemoteLibrary { id: key, name: title });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("media server returned unparseable XML: {e}"),
        }
    }
    if !saw_container {
        bail!("media server response did not contain a MediaContainer");
    }
    debug!(count = libraries.len(), "Parsed media server library listing");
    Ok(libraries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(server_type: &str) -> MediaServerRecord {
        MediaServerRecord {
            id: Uuid::new_v4(),
            server_type: server_type.into(),
            host: "media.local".into(),
            port: 32400,
            use_https: false,
            verify_https: true,
            token: "tok".into(),
            libraries: "1,5".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_media_container() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <MediaContainer size="2" allowSync="0" title1="Plex Library">
              <Directory key="1" type="show" title="TV Shows" />
              <Directory key="5" type="movie" title="Movies" />
            </MediaContainer>"#;

        let libraries = parse_media_container(xml).unwrap();
        assert_eq!(
            libraries,
            vec![
                RemoteLibrary { id: "1".into(), name: "TV Shows".into() },
                RemoteLibrary { id: "5".into(), name: "Movies".into() },
            ]
        );
    }

    #[test]
    fn test_parse_media_container_rejects_other_xml() {
        assert!(parse_media_container("<html><body>nope</body></html>").is_err());
        assert!(parse_media_container("not xml at all").is_err());
    }

    #[test]
    fn test_adapter_selection() {
        let plex = media_server_client(record("plex")).unwrap();
        assert_eq!(plex.record().server_type, "plex");

        let jellyfin = media_server_client(record("jellyfin")).unwrap();
        assert_eq!(jellyfin.record().server_type, "jellyfin");
    }
}
