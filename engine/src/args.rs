use clap::Parser;

use zane_common::{DEFAULT_HEALTHCHECK_TIMEOUT, DEFAULT_HEALTHCHECK_WAIT_INTERVAL};

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Path to the `.sqlite` file used to store engine state
    #[clap(long, default_value = "./zane-engine.sqlite")]
    pub state: String,

    /// Docker daemon socket the orchestrator adapter connects to
    #[clap(long, default_value = "/var/run/docker.sock")]
    pub docker_host: String,

    /// Base URL of the Caddy admin API
    #[clap(long, default_value = "http://127.0.0.1:2019")]
    pub caddy_admin_host: String,

    /// Suffix appended to every proxy config ID the engine owns
    #[clap(long, default_value = "-zane")]
    pub route_id_suffix: String,

    /// Private DNS zone that blue/green slot aliases resolve in
    #[clap(long, default_value = "zaneops.internal")]
    pub internal_domain: String,

    /// Upstream `host:port` of the ZaneOps API used to auth-gate
    /// deployment URLs
    #[clap(long, default_value = "api.zaneops.internal:8000")]
    pub api_internal_domain: String,

    /// Address of the fluentd log collector container logs are forwarded to
    #[clap(long, default_value = "tcp://127.0.0.1:24224")]
    pub fluentd_host: String,

    /// Default overall healthcheck budget, in seconds
    #[clap(long, default_value_t = DEFAULT_HEALTHCHECK_TIMEOUT)]
    pub healthcheck_timeout: u64,

    /// Poll interval between healthcheck attempts, in seconds
    #[clap(long, default_value_t = DEFAULT_HEALTHCHECK_WAIT_INTERVAL)]
    pub healthcheck_wait_interval: u64,

    /// Interval between monitor schedule passes, in seconds
    #[clap(long, default_value_t = 30)]
    pub monitor_interval: u64,

    /// Probe deployment URLs over https instead of http
    #[clap(long, default_value_t = false)]
    pub probe_https: bool,
}

/// Settings shared by activities, adapters and workflows. Built from
/// [`Args`] at startup; tests construct it directly.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub caddy_admin_host: String,
    pub route_id_suffix: String,
    pub internal_domain: String,
    pub api_internal_domain: String,
    pub fluentd_host: String,
    pub healthcheck_timeout: u64,
    pub healthcheck_wait_interval: u64,
    pub monitor_interval: u64,
    pub probe_https: bool,
}

impl EngineConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            caddy_admin_host: args.caddy_admin_host.clone(),
            route_id_suffix: args.route_id_suffix.clone(),
            internal_domain: args.internal_domain.clone(),
            api_internal_domain: args.api_internal_domain.clone(),
            fluentd_host: args.fluentd_host.clone(),
            healthcheck_timeout: args.healthcheck_timeout,
            healthcheck_wait_interval: args.healthcheck_wait_interval,
            monitor_interval: args.monitor_interval,
            probe_https: args.probe_https,
        }
    }

    pub fn probe_scheme(&self) -> &'static str {
        if self.probe_https {
            "https"
        } else {
            "http"
        }
    }
}

#[cfg(test)]
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            caddy_admin_host: "http://127.0.0.1:2019".into(),
            route_id_suffix: "-zane".into(),
            internal_domain: "zaneops.internal".into(),
            api_internal_domain: "api.zaneops.internal:8000".into(),
            fluentd_host: "tcp://127.0.0.1:24224".into(),
            healthcheck_timeout: DEFAULT_HEALTHCHECK_TIMEOUT,
            healthcheck_wait_interval: DEFAULT_HEALTHCHECK_WAIT_INTERVAL,
            monitor_interval: 30,
            probe_https: false,
        }
    }
}
