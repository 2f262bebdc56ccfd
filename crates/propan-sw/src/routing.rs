//! Request classification.

use propan_net::{Destination, Request};
use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;

/// Policy bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingClass {
    /// Top-level navigation, always network first.
    Navigation,
    /// Precached path or style/script/image destination, cache first.
    StaticAsset,
    /// Backend call under the API prefix, network first.
    Api,
    /// Anything else, network first.
    Default,
}

/// Classify a request. Navigation mode wins over any path-based rule.
pub fn classify(request: &Request, config: &WorkerConfig) -> RoutingClass {
    if request.is_navigation() {
        return RoutingClass::Navigation;
    }

    let path = request.url.path();
    let static_destination = matches!(
        request.destination,
        Destination::Style | Destination::Script | Destination::Image
    );

    if config.is_precached_path(path) || static_destination {
        RoutingClass::StaticAsset
    } else if path.starts_with(&config.api_prefix) {
        RoutingClass::Api
    } else {
        RoutingClass::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propan_net::RequestMode;
    use url::Url;

    fn url(path: &str) -> Url {
        Url::parse("https://propan.test").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_navigation_wins_over_api_path() {
        let config = WorkerConfig::default();
        let request = Request::navigate(url("/api/orders"));
        assert_eq!(classify(&request, &config), RoutingClass::Navigation);
    }

    #[test]
    fn test_mode_decides_navigation() {
        let config = WorkerConfig::default();
        let navigating = Request::get(url("/pedidos")).mode(RequestMode::Navigate);
        assert_eq!(classify(&navigating, &config), RoutingClass::Navigation);

        let cors = Request::get(url("/api/orders")).mode(RequestMode::Cors);
        assert_eq!(classify(&cors, &config), RoutingClass::Api);
    }

    #[test]
    fn test_precached_path_is_static() {
        let config = WorkerConfig::default();
        assert_eq!(
            classify(&Request::get(url("/manifest.json")), &config),
            RoutingClass::StaticAsset
        );
    }

    #[test]
    fn test_static_destinations() {
        let config = WorkerConfig::default();
        for destination in [Destination::Style, Destination::Script, Destination::Image] {
            let request = Request::get(url("/cdn/thing")).destination(destination);
            assert_eq!(classify(&request, &config), RoutingClass::StaticAsset);
        }
        let font = Request::get(url("/fonts/a.woff2")).destination(Destination::Font);
        assert_eq!(classify(&font, &config), RoutingClass::Default);
    }

    #[test]
    fn test_api_and_default() {
        let config = WorkerConfig::default();
        assert_eq!(
            classify(&Request::get(url("/api/orders?page=1")), &config),
            RoutingClass::Api
        );
        assert_eq!(
            classify(&Request::get(url("/apix")), &config),
            RoutingClass::Default
        );
    }

    #[test]
    fn test_image_under_api_is_static() {
        let config = WorkerConfig::default();
        let request = Request::get(url("/api/avatar.png")).destination(Destination::Image);
        assert_eq!(classify(&request, &config), RoutingClass::StaticAsset);
    }
}
