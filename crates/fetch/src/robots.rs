//! Minimal robots.txt support: fetch once per host, parse `Disallow`
//! rules under the `User-agent: *` group, and check paths against them.

use reqwest::Client;
use url::Url;

#[derive(Debug, Default, Clone)]
pub struct RobotsRules {
    disallow: Vec<String>,
}

impl RobotsRules {
    pub fn parse(body: &str) -> Self {
        let mut disallow = Vec::new();
        let mut in_wildcard_group = false;

        for raw_line in body.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    in_wildcard_group = value == "*";
                }
                "disallow" if in_wildcard_group && !value.is_empty() => {
                    disallow.push(value.to_string());
                }
                _ => {}
            }
        }

        Self { disallow }
    }

    pub fn allows(&self, path: &str) -> bool {
        !self.disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Fetches and parses `https://{host}/robots.txt`. Any fetch error is
/// treated as "no restrictions" — robots.txt absence is not an error
/// condition for crawling.
pub async fn fetch(client: &Client, base: &Url) -> RobotsRules {
    let Ok(robots_url) = base.join("/robots.txt") else {
        return RobotsRules::default();
    };
    match client.get(robots_url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => RobotsRules::parse(&body),
            Err(_) => RobotsRules::default(),
        },
        _ => RobotsRules::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_disallow() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /admin\nDisallow: /private\n");
        assert!(!rules.allows("/admin/panel"));
        assert!(!rules.allows("/private"));
        assert!(rules.allows("/docs"));
    }

    #[test]
    fn ignores_rules_outside_wildcard_group() {
        let rules = RobotsRules::parse("User-agent: Googlebot\nDisallow: /only-google\n");
        assert!(rules.allows("/only-google"));
    }

    #[test]
    fn empty_body_allows_everything() {
        let rules = RobotsRules::parse("");
        assert!(rules.allows("/anything"));
    }
}
