use url::Url;

/// Current address of a frame. `location.*` reads are computed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationState {
    url: Url,
}

impl LocationState {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set(&mut self, url: Url) {
        self.url = url;
    }

    /// Resolve `target` against the current address.
    pub fn resolve(&self, target: &str) -> Result<Url, url::ParseError> {
        self.url.join(target)
    }

    pub fn part(&self, name: &str) -> Option<String> {
        let url = &self.url;
        let value = match name {
            "href" => url.to_string(),
            "origin" => url.origin().ascii_serialization(),
            "protocol" => format!("{}:", url.scheme()),
            "host" => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => String::new(),
            },
            "hostname" => url.host_str().unwrap_or_default().to_string(),
            "port" => url.port().map(|port| port.to_string()).unwrap_or_default(),
            "pathname" => url.path().to_string(),
            "search" => match url.query() {
                Some(query) if !query.is_empty() => format!("?{query}"),
                _ => String::new(),
            },
            "hash" => match url.fragment() {
                Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
                _ => String::new(),
            },
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_follow_browser_formatting() {
        let location = LocationState::new(
            Url::parse("https://console.example:8443/app/list?page=2#top").unwrap(),
        );
        assert_eq!(location.part("protocol").as_deref(), Some("https:"));
        assert_eq!(location.part("host").as_deref(), Some("console.example:8443"));
        assert_eq!(location.part("hostname").as_deref(), Some("console.example"));
        assert_eq!(location.part("port").as_deref(), Some("8443"));
        assert_eq!(location.part("pathname").as_deref(), Some("/app/list"));
        assert_eq!(location.part("search").as_deref(), Some("?page=2"));
        assert_eq!(location.part("hash").as_deref(), Some("#top"));
        assert_eq!(
            location.part("origin").as_deref(),
            Some("https://console.example:8443")
        );
        assert_eq!(location.part("bogus"), None);
    }

    #[test]
    fn about_blank_has_opaque_origin() {
        let location = LocationState::new(Url::parse("about:blank").unwrap());
        assert_eq!(location.part("origin").as_deref(), Some("null"));
        assert_eq!(location.part("host").as_deref(), Some(""));
    }
}
