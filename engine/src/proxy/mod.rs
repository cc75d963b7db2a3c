//! Proxy adapter: reads and writes the Caddy admin API.
//!
//! Config objects are addressed by stable `@id` strings so every PUT,
//! PATCH and DELETE is idempotent. A 404 from the admin API is a cue
//! ("this config does not exist yet"), never an error.

pub mod routes;

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use zane_common::service::{PortConfig, ServiceSnapshot, UrlConfig};
use zane_common::DeploymentSlot;

use crate::args::EngineConfig;
use crate::error::Result;

const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The engine-owned anchor all domain configs are installed under.
const ROOT_ROUTES_PATH: &str = "id/zane-url-root/routes/0";

#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    admin_host: String,
    suffix: String,
    internal_domain: String,
    api_internal_domain: String,
}

impl ProxyClient {
    pub fn new(config: &EngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ADMIN_REQUEST_TIMEOUT)
            .build()
            .expect("default reqwest client to build");
        Self {
            http,
            admin_host: config.caddy_admin_host.trim_end_matches('/').to_string(),
            suffix: config.route_id_suffix.clone(),
            internal_domain: config.internal_domain.clone(),
            api_internal_domain: config.api_internal_domain.clone(),
        }
    }

    fn id_url(&self, id: &str) -> String {
        format!("{}/id/{}", self.admin_host, id)
    }

    /// Install the route for a deployment-only URL, if it is not already
    /// present. A PUT on the known root anchor creates it.
    pub async fn expose_deployment_url(
        &self,
        deployment_url: &str,
        service_name: &str,
        forwarded_http_port: u16,
    ) -> Result<()> {
        let id = routes::deployment_url_id(deployment_url, &self.suffix);
        let response = self.http.get(self.id_url(&id)).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            debug!(%deployment_url, "deployment url is already exposed");
            return Ok(());
        }

        let payload = routes::deployment_url_route(
            deployment_url,
            service_name,
            forwarded_http_port,
            &self.suffix,
            &self.api_internal_domain,
        );
        self.http
            .put(format!("{}/{}", self.admin_host, ROOT_ROUTES_PATH))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Upsert the route for every URL of a service: make sure the domain
    /// config exists, drop any stale entry with the same `@id`, append the
    /// fresh route, and PATCH the re-sorted list back.
    ///
    /// Writes are best-effort last-writer-wins: the per-service workflow
    /// serializes a service's own URLs, and cross-service contention on a
    /// shared domain is accepted.
    pub async fn expose_service_urls(
        &self,
        service: &ServiceSnapshot,
        http_port: &PortConfig,
        current: (&str, DeploymentSlot),
        previous: Option<(&str, DeploymentSlot)>,
    ) -> Result<()> {
        for url in &service.urls {
            self.ensure_domain_config(&url.domain).await?;

            let route = if url.redirect_to.is_some() {
                routes::redirect_route(url, &self.suffix)
            } else {
                routes::service_url_route(
                    url,
                    service,
                    http_port,
                    current,
                    previous,
                    &self.suffix,
                    &self.internal_domain,
                )
            };

            let domain_id = routes::domain_config_id(&url.domain, &self.suffix);
            let url_id = routes::url_route_id(url, &self.suffix);
            let mut current_routes = self.domain_routes(&domain_id).await?.unwrap_or_default();
            current_routes.retain(|existing| existing["@id"] != url_id.as_str());
            current_routes.push(route);
            routes::sort_routes(&mut current_routes);

            self.patch_domain_routes(&domain_id, &current_routes).await?;
            debug!(domain = %url.domain, route = %url_id, "installed proxy route");
        }
        Ok(())
    }

    /// Remove the route for one URL; when the domain's route list becomes
    /// empty the whole domain config goes with it.
    pub async fn unexpose_url(&self, url: &UrlConfig) -> Result<()> {
        let domain_id = routes::domain_config_id(&url.domain, &self.suffix);
        let url_id = routes::url_route_id(url, &self.suffix);

        let Some(current_routes) = self.domain_routes(&domain_id).await? else {
            // Nothing to do, the domain is already gone.
            return Ok(());
        };

        let remaining: Vec<&Value> = current_routes
            .iter()
            .filter(|route| route["@id"] != url_id.as_str())
            .collect();

        if remaining.is_empty() {
            self.delete_config(&domain_id).await?;
        } else if remaining.len() < current_routes.len() {
            self.delete_config(&url_id).await?;
        }
        Ok(())
    }

    pub async fn unexpose_urls(&self, urls: &[UrlConfig]) -> Result<()> {
        for url in urls {
            self.unexpose_url(url).await?;
        }
        Ok(())
    }

    pub async fn remove_deployment_urls(&self, deployment_urls: &[String]) -> Result<()> {
        for deployment_url in deployment_urls {
            self.delete_config(&routes::deployment_url_id(deployment_url, &self.suffix))
                .await?;
        }
        Ok(())
    }

    async fn ensure_domain_config(&self, domain: &str) -> Result<()> {
        let domain_id = routes::domain_config_id(domain, &self.suffix);
        let response = self.http.get(self.id_url(&domain_id)).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            return Ok(());
        }

        warn!(%domain, "domain config missing, installing a fresh one");
        self.http
            .put(format!("{}/{}", self.admin_host, ROOT_ROUTES_PATH))
            .json(&routes::domain_config(domain, &self.suffix))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// The subroute list of a domain config; `None` when the config does
    /// not exist.
    async fn domain_routes(&self, domain_id: &str) -> Result<Option<Vec<Value>>> {
        let response = self
            .http
            .get(format!("{}/handle/0/routes", self.id_url(domain_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let routes = response.error_for_status()?.json().await?;
        Ok(Some(routes))
    }

    async fn patch_domain_routes(&self, domain_id: &str, routes: &[Value]) -> Result<()> {
        self.http
            .patch(format!("{}/handle/0/routes", self.id_url(domain_id)))
            .json(&routes)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Delete a config by ID; already-absent configs are a no-op.
    async fn delete_config(&self, id: &str) -> Result<()> {
        let response = self.http.delete(self.id_url(id)).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        Ok(())
    }
}
