//! Client for the platform's cloud controller, which owns the application
//! inventory.

use crate::{uaa::UaaClient, upstream};
use ahash::{AHashMap, AHashSet};
use netpol_policy_server_core::{Inventory, UpstreamError};
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

const SERVICE: &str = "cloud-controller";

/// Bounds how many pages a single lookup may follow.
const MAX_PAGES: usize = 1000;

#[derive(Clone, Debug)]
pub struct CloudController {
    http: reqwest::Client,
    base: Url,
    uaa: UaaClient,
    page_size: usize,
}

#[derive(Debug, Default, Deserialize)]
struct AppsPage {
    #[serde(default)]
    pagination: Pagination,
    #[serde(default)]
    resources: Vec<App>,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct App {
    guid: String,
    #[serde(default)]
    links: AppLinks,
}

#[derive(Debug, Default, Deserialize)]
struct AppLinks {
    #[serde(default)]
    space: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct SpacesPage {
    #[serde(default)]
    next_url: Option<String>,
    #[serde(default)]
    resources: Vec<Space>,
}

#[derive(Debug, Deserialize)]
struct Space {
    metadata: SpaceMetadata,
}

#[derive(Debug, Deserialize)]
struct SpaceMetadata {
    guid: String,
}

// === impl CloudController ===

impl CloudController {
    pub fn new(http: reqwest::Client, base: Url, uaa: UaaClient, page_size: usize) -> Self {
        Self {
            http,
            base,
            uaa,
            page_size: page_size.max(1),
        }
    }

    async fn apps(&self, keys: &[String]) -> Result<Vec<App>, UpstreamError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let token = self.uaa.service_token().await?;

        // Each request names at most a page of guids to bound the URL length.
        let mut apps = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.page_size) {
            let mut url = upstream::endpoint(SERVICE, &self.base, "v3/apps")?;
            url.query_pairs_mut()
                .append_pair("guids", &chunk.join(","))
                .append_pair("per_page", &self.page_size.to_string());

            let mut next = Some(url);
            let mut pages = 0;
            while let Some(url) = next.take() {
                pages += 1;
                if pages > MAX_PAGES {
                    return Err(UpstreamError::fatal(SERVICE, "too many result pages"));
                }
                let page = self.get::<AppsPage>(&token, url).await?;
                apps.extend(page.resources);
                next = page
                    .pagination
                    .next
                    .map(|link| self.resolve(&link.href))
                    .transpose()?;
            }
        }
        Ok(apps)
    }

    async fn get<T: DeserializeOwned>(&self, token: &str, url: Url) -> Result<T, UpstreamError> {
        tracing::debug!(%url, "GET");
        let rsp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| upstream::request_failed(SERVICE, e))?;
        upstream::json(SERVICE, rsp).await
    }

    /// Resolves a pagination link, which may be absolute or relative to the
    /// controller's base URL.
    fn resolve(&self, href: &str) -> Result<Url, UpstreamError> {
        self.base
            .join(href)
            .map_err(|error| UpstreamError::fatal(SERVICE, format!("invalid link {href}: {error}")))
    }
}

#[async_trait::async_trait]
impl Inventory for CloudController {
    async fn live_apps(&self, keys: &[String]) -> Result<AHashSet<String>, UpstreamError> {
        Ok(self.apps(keys).await?.into_iter().map(|a| a.guid).collect())
    }

    async fn app_spaces(&self, keys: &[String]) -> Result<AHashMap<String, String>, UpstreamError> {
        Ok(self
            .apps(keys)
            .await?
            .into_iter()
            .filter_map(|app| {
                let href = app.links.space?.href;
                let space = href.trim_end_matches('/').rsplit('/').next()?.to_string();
                Some((app.guid, space))
            })
            .collect())
    }

    async fn developer_spaces(&self, user_id: &str) -> Result<AHashSet<String>, UpstreamError> {
        let token = self.uaa.service_token().await?;

        let mut url = upstream::endpoint(SERVICE, &self.base, "v2/users")?;
        url.path_segments_mut()
            .map_err(|()| UpstreamError::fatal(SERVICE, "base url cannot carry a path"))?
            .pop_if_empty()
            .push(user_id)
            .push("spaces");

        let mut spaces = AHashSet::new();
        let mut next = Some(url);
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(UpstreamError::fatal(SERVICE, "too many result pages"));
            }
            let page = self.get::<SpacesPage>(&token, url).await?;
            spaces.extend(page.resources.into_iter().map(|s| s.metadata.guid));
            next = page
                .next_url
                .filter(|href| !href.is_empty())
                .map(|href| self.resolve(&href))
                .transpose()?;
        }
        Ok(spaces)
    }
}
