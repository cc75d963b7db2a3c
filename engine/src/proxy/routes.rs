//! Proxy route payloads, stable IDs and route ordering.
//!
//! Everything here is pure construction: the JSON shapes the Caddy admin
//! API expects, the deterministic `@id` strings used to address them, and
//! the same path-specificity ordering Caddy itself applies, so wildcard
//! routes never shadow more specific ones.

use serde_json::{json, Value};

use zane_common::service::{PortConfig, ServiceSnapshot, UrlConfig};
use zane_common::DeploymentSlot;

const PASSIVE_FAIL_DURATION_NS: u64 = 30_000_000_000;

/// Strip leading and/or trailing slashes.
pub fn strip_slashes(path: &str, strip_start: bool, strip_end: bool) -> &str {
    let mut path = path;
    if strip_start {
        path = path.trim_start_matches('/');
    }
    if strip_end {
        path = path.trim_end_matches('/');
    }
    path
}

/// `@id` of a domain's config: `{domain}{suffix}`.
pub fn domain_config_id(domain: &str, suffix: &str) -> String {
    format!("{domain}{suffix}")
}

/// `@id` of a service URL's route: the domain plus the base path with
/// outer slashes removed and inner slashes flattened to `-`, or `*` for
/// the bare root.
pub fn url_route_id(url: &UrlConfig, suffix: &str) -> String {
    let mut normalized_path = strip_slashes(&url.base_path, true, true).replace('/', "-");
    if normalized_path.is_empty() {
        normalized_path = "*".to_string();
    }
    format!("{}-{}{}", url.domain, normalized_path, suffix)
}

/// `@id` of a deployment-only URL: `{url}{suffix}`.
pub fn deployment_url_id(deployment_url: &str, suffix: &str) -> String {
    format!("{deployment_url}{suffix}")
}

/// A bare domain config with an empty subroute list, installed under the
/// engine-owned root when a domain is seen for the first time.
pub fn domain_config(domain: &str, suffix: &str) -> Value {
    json!({
        "@id": domain_config_id(domain, suffix),
        "match": [{"host": [domain]}],
        "handle": [
            {
                "handler": "subroute",
                "routes": [],
            }
        ],
    })
}

/// The path matcher for a URL: `/*` at the root, `{base_path}*` otherwise.
fn path_matcher(url: &UrlConfig) -> String {
    if url.base_path == "/" {
        "/*".to_string()
    } else {
        format!("{}*", strip_slashes(&url.base_path, false, true))
    }
}

/// The route installed for one service URL.
///
/// The terminal reverse proxy always dials both slot aliases; the slot
/// that has no live deployment simply has no healthy backend, so the
/// proxy never needs to know which color is current. The `log_append`
/// prologue stamps service and slot hashes onto access logs so log
/// ingestion can attribute requests to a deployment.
pub fn service_url_route(
    url: &UrlConfig,
    service: &ServiceSnapshot,
    http_port: &PortConfig,
    current: (&str, DeploymentSlot),
    previous: Option<(&str, DeploymentSlot)>,
    suffix: &str,
    internal_domain: &str,
) -> Value {
    let mut blue_hash: Option<&str> = None;
    let mut green_hash: Option<&str> = None;
    match current.1 {
        DeploymentSlot::Blue => blue_hash = Some(current.0),
        DeploymentSlot::Green => green_hash = Some(current.0),
    }
    if let Some((hash, slot)) = previous {
        match slot {
            DeploymentSlot::Blue => blue_hash = Some(hash),
            DeploymentSlot::Green => green_hash = Some(hash),
        }
    }

    let mut handlers = vec![
        json!({
            "handler": "log_append",
            "key": "zane_service_id",
            "value": service.id,
        }),
        json!({
            "handler": "log_append",
            "key": "zane_deployment_blue_hash",
            "value": blue_hash,
        }),
        json!({
            "handler": "log_append",
            "key": "zane_deployment_green_hash",
            "value": green_hash,
        }),
        json!({
            "handler": "log_append",
            "key": "zane_deployment_upstream",
            "value": "{http.reverse_proxy.upstream.hostport}",
        }),
    ];

    if url.strip_prefix {
        handlers.push(json!({
            "handler": "rewrite",
            "strip_path_prefix": strip_slashes(&url.base_path, false, true),
        }));
    }

    handlers.push(json!({
        "flush_interval": -1,
        "handler": "reverse_proxy",
        "health_checks": {
            "passive": {"fail_duration": PASSIVE_FAIL_DURATION_NS},
        },
        "load_balancing": {
            "retries": 3,
            "selection_policy": {"policy": "first"},
        },
        "upstreams": [
            {"dial": format!(
                "{}.blue.{}:{}", service.network_alias, internal_domain, http_port.forwarded
            )},
            {"dial": format!(
                "{}.green.{}:{}", service.network_alias, internal_domain, http_port.forwarded
            )},
        ],
    }));

    json!({
        "@id": url_route_id(url, suffix),
        "handle": [
            {
                "handler": "subroute",
                "routes": [{"handle": handlers}],
            }
        ],
        "match": [
            {"path": [path_matcher(url)]},
        ],
    })
}

/// A redirect URL installs a static response instead of reverse-proxy
/// upstreams; it shares the ID and ordering rules with proxied routes.
pub fn redirect_route(url: &UrlConfig, suffix: &str) -> Value {
    let redirect = url
        .redirect_to
        .as_ref()
        .expect("redirect_route requires a redirect target");
    let status_code = if redirect.permanent { 308 } else { 307 };

    json!({
        "@id": url_route_id(url, suffix),
        "handle": [
            {
                "handler": "subroute",
                "routes": [
                    {
                        "handle": [
                            {
                                "handler": "static_response",
                                "status_code": status_code.to_string(),
                                "headers": {
                                    "Location": [format!("{}{{http.request.uri}}", redirect.url)],
                                },
                            }
                        ],
                    }
                ],
            }
        ],
        "match": [
            {"path": [path_matcher(url)]},
        ],
    })
}

/// The auth-gated route for a deployment-only URL: the first hop asks the
/// API to validate the caller's token, and only a 2xx lets the request
/// through to the deployment's swarm service.
pub fn deployment_url_route(
    deployment_url: &str,
    service_name: &str,
    forwarded_http_port: u16,
    suffix: &str,
    api_internal_domain: &str,
) -> Value {
    json!({
        "@id": deployment_url_id(deployment_url, suffix),
        "match": [{"host": [deployment_url]}],
        "handle": [
            {
                "handler": "subroute",
                "routes": [
                    {
                        "handle": [
                            {
                                "handle_response": [
                                    {
                                        "match": {"status_code": [2]},
                                        "routes": [
                                            {
                                                "handle": [
                                                    {
                                                        "handler": "headers",
                                                        "request": {},
                                                    }
                                                ],
                                            }
                                        ],
                                    }
                                ],
                                "handler": "reverse_proxy",
                                "headers": {
                                    "request": {
                                        "set": {
                                            "X-Forwarded-Method": ["{http.request.method}"],
                                            "X-Forwarded-Uri": ["{http.request.uri}"],
                                        },
                                    },
                                },
                                "rewrite": {
                                    "method": "GET",
                                    "uri": "/api/auth/me/with-token",
                                },
                                "upstreams": [{"dial": api_internal_domain}],
                            },
                            {
                                "flush_interval": -1,
                                "handler": "reverse_proxy",
                                "upstreams": [
                                    {"dial": format!("{service_name}:{forwarded_http_port}")},
                                ],
                            },
                        ],
                    }
                ],
            }
        ],
    })
}

fn route_path(route: &Value) -> &str {
    route["match"][0]["path"][0].as_str().unwrap_or_default()
}

/// Order routes within a domain by path specificity, the way Caddy sorts
/// directives: longest path first (ignoring a trailing `*`), a
/// non-wildcard path before its wildcard twin, and the longer original
/// path breaking remaining ties.
pub fn sort_routes(routes: &mut [Value]) {
    routes.sort_by(|left, right| {
        let left_path = route_path(left);
        let right_path = route_path(right);

        let left_key = (
            std::cmp::Reverse(left_path.trim_end_matches('*').len()),
            left_path.ends_with('*'),
            std::cmp::Reverse(left_path.len()),
        );
        let right_key = (
            std::cmp::Reverse(right_path.trim_end_matches('*').len()),
            right_path.ends_with('*'),
            std::cmp::Reverse(right_path.len()),
        );
        left_key.cmp(&right_key)
    });
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use zane_common::service::RedirectConfig;

    use super::*;

    fn url(domain: &str, base_path: &str) -> UrlConfig {
        UrlConfig {
            domain: domain.to_string(),
            base_path: base_path.to_string(),
            strip_prefix: false,
            redirect_to: None,
            associated_port: None,
        }
    }

    fn snapshot() -> ServiceSnapshot {
        ServiceSnapshot {
            id: "app".into(),
            slug: "app".into(),
            project_id: "p1".into(),
            environment_id: Some("production".into()),
            image: "nginx:alpine".into(),
            command: None,
            credentials: None,
            env_variables: vec![],
            volumes: vec![],
            ports: vec![PortConfig { host: None, forwarded: 80 }],
            urls: vec![],
            healthcheck: None,
            resource_limits: None,
            network_alias: "app".into(),
            network_aliases: vec!["app".into()],
        }
    }

    #[test]
    fn route_ids_normalize_the_base_path() {
        assert_eq!(url_route_id(&url("app.example.com", "/"), "-zane"), "app.example.com-*-zane");
        assert_eq!(
            url_route_id(&url("app.example.com", "/api/v1/"), "-zane"),
            "app.example.com-api-v1-zane"
        );
        assert_eq!(deployment_url_id("h1.zaneops.dev", "-zane"), "h1.zaneops.dev-zane");
        assert_eq!(domain_config_id("app.example.com", "-zane"), "app.example.com-zane");
    }

    #[test]
    fn routes_sort_by_caddy_specificity() {
        let mut routes: Vec<Value> = ["/*", "/api/*", "/api/v1", "/api/v1/*"]
            .iter()
            .map(|path| json!({"match": [{"path": [path]}]}))
            .collect();

        sort_routes(&mut routes);

        let order: Vec<&str> = routes.iter().map(route_path).collect();
        assert_eq!(order, vec!["/api/v1", "/api/v1/*", "/api/*", "/*"]);
    }

    #[test]
    fn root_paths_match_everything() {
        let route = service_url_route(
            &url("app.example.com", "/"),
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h1", DeploymentSlot::Blue),
            None,
            "-zane",
            "zaneops.internal",
        );
        assert_eq!(route["match"][0]["path"][0], "/*");

        let nested = service_url_route(
            &url("app.example.com", "/api/"),
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h1", DeploymentSlot::Blue),
            None,
            "-zane",
            "zaneops.internal",
        );
        assert_eq!(nested["match"][0]["path"][0], "/api*");
    }

    #[test]
    fn both_slot_upstreams_are_always_dialed() {
        let route = service_url_route(
            &url("app.example.com", "/"),
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h2", DeploymentSlot::Green),
            Some(("dpl_dkr_h1", DeploymentSlot::Blue)),
            "-zane",
            "zaneops.internal",
        );

        let handlers = route["handle"][0]["routes"][0]["handle"].as_array().unwrap();
        let reverse_proxy = handlers.last().unwrap();
        assert_eq!(reverse_proxy["handler"], "reverse_proxy");
        assert_eq!(reverse_proxy["upstreams"][0]["dial"], "app.blue.zaneops.internal:80");
        assert_eq!(reverse_proxy["upstreams"][1]["dial"], "app.green.zaneops.internal:80");
        assert_eq!(reverse_proxy["load_balancing"]["retries"], 3);
        assert_eq!(reverse_proxy["load_balancing"]["selection_policy"]["policy"], "first");
        assert_eq!(
            reverse_proxy["health_checks"]["passive"]["fail_duration"],
            30_000_000_000_u64
        );
    }

    #[test]
    fn log_append_hashes_cover_both_colors_during_overlap() {
        let route = service_url_route(
            &url("app.example.com", "/"),
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h2", DeploymentSlot::Green),
            Some(("dpl_dkr_h1", DeploymentSlot::Blue)),
            "-zane",
            "zaneops.internal",
        );

        let handlers = route["handle"][0]["routes"][0]["handle"].as_array().unwrap();
        assert_eq!(handlers[0]["key"], "zane_service_id");
        assert_eq!(handlers[0]["value"], "app");
        assert_eq!(handlers[1]["key"], "zane_deployment_blue_hash");
        assert_eq!(handlers[1]["value"], "dpl_dkr_h1");
        assert_eq!(handlers[2]["key"], "zane_deployment_green_hash");
        assert_eq!(handlers[2]["value"], "dpl_dkr_h2");
        assert_eq!(handlers[3]["key"], "zane_deployment_upstream");
    }

    #[test]
    fn first_deploy_leaves_the_other_color_null() {
        let route = service_url_route(
            &url("app.example.com", "/"),
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h1", DeploymentSlot::Blue),
            None,
            "-zane",
            "zaneops.internal",
        );

        let handlers = route["handle"][0]["routes"][0]["handle"].as_array().unwrap();
        assert_eq!(handlers[1]["value"], "dpl_dkr_h1");
        assert_eq!(handlers[2]["value"], Value::Null);
    }

    #[test]
    fn strip_prefix_inserts_a_rewrite_before_the_proxy() {
        let mut with_prefix = url("app.example.com", "/api/");
        with_prefix.strip_prefix = true;

        let route = service_url_route(
            &with_prefix,
            &snapshot(),
            &PortConfig { host: None, forwarded: 80 },
            ("dpl_dkr_h1", DeploymentSlot::Blue),
            None,
            "-zane",
            "zaneops.internal",
        );

        let handlers = route["handle"][0]["routes"][0]["handle"].as_array().unwrap();
        let rewrite = &handlers[4];
        assert_eq!(rewrite["handler"], "rewrite");
        assert_eq!(rewrite["strip_path_prefix"], "/api");
        assert_eq!(handlers[5]["handler"], "reverse_proxy");
    }

    #[test]
    fn redirects_become_static_responses() {
        let mut redirect = url("old.example.com", "/");
        redirect.redirect_to =
            Some(RedirectConfig { url: "https://new.example.com".into(), permanent: true });

        let route = redirect_route(&redirect, "-zane");
        let handler = &route["handle"][0]["routes"][0]["handle"][0];
        assert_eq!(handler["handler"], "static_response");
        assert_eq!(handler["status_code"], "308");
        assert_eq!(
            handler["headers"]["Location"][0],
            "https://new.example.com{http.request.uri}"
        );

        redirect.redirect_to.as_mut().unwrap().permanent = false;
        let route = redirect_route(&redirect, "-zane");
        assert_eq!(route["handle"][0]["routes"][0]["handle"][0]["status_code"], "307");
    }

    #[test]
    fn deployment_urls_are_gated_behind_the_auth_hop() {
        let route = deployment_url_route(
            "h1.zaneops.dev",
            "srv-p1-app-dpl_dkr_h1",
            80,
            "-zane",
            "api.zaneops.internal:8000",
        );

        assert_eq!(route["@id"], "h1.zaneops.dev-zane");
        assert_eq!(route["match"][0]["host"][0], "h1.zaneops.dev");

        let hops = route["handle"][0]["routes"][0]["handle"].as_array().unwrap();
        assert_eq!(hops.len(), 2);

        let auth = &hops[0];
        assert_eq!(auth["handler"], "reverse_proxy");
        assert_eq!(auth["rewrite"]["uri"], "/api/auth/me/with-token");
        assert_eq!(auth["upstreams"][0]["dial"], "api.zaneops.internal:8000");
        assert_eq!(auth["handle_response"][0]["match"]["status_code"][0], 2);
        assert_eq!(
            auth["headers"]["request"]["set"]["X-Forwarded-Method"][0],
            "{http.request.method}"
        );

        let app = &hops[1];
        assert_eq!(app["upstreams"][0]["dial"], "srv-p1-app-dpl_dkr_h1:80");
    }
}
