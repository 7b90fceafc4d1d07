use crate::core::geo::CanonicalTileId;

/// Builds tile URLs from a `{z}/{x}/{y}` style template.
///
/// Supported placeholders: `{z}`, `{x}`, `{y}`, `{s}` (subdomain, rotated by
/// tile position) and `{token}`.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlTemplateSource {
    template: String,
    subdomains: Vec<String>,
    token: Option<String>,
}

impl UrlTemplateSource {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            subdomains: Vec::new(),
            token: None,
        }
    }

    pub fn with_subdomains<S: Into<String>>(mut self, subdomains: impl IntoIterator<Item = S>) -> Self {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// OpenStreetMap standard raster tiles
    pub fn openstreetmap() -> Self {
        Self::new("https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png").with_subdomains(["a", "b", "c"])
    }

    /// Mapbox terrain-RGB elevation tiles
    pub fn mapbox_terrain_rgb(token: impl Into<String>) -> Self {
        Self::new("https://api.mapbox.com/v4/mapbox.terrain-rgb/{z}/{x}/{y}.pngraw?access_token={token}")
            .with_token(token)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Build the URL for `id`.
    pub fn url(&self, id: CanonicalTileId) -> String {
        let mut url = self
            .template
            .replace("{z}", &id.z.to_string())
            .replace("{x}", &id.x.to_string())
            .replace("{y}", &id.y.to_string());

        if !self.subdomains.is_empty() {
            let idx = ((id.x as u64 + id.y as u64) % self.subdomains.len() as u64) as usize;
            url = url.replace("{s}", &self.subdomains[idx]);
        }
        if let Some(token) = &self.token {
            url = url.replace("{token}", token);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_substitution() {
        let source = UrlTemplateSource::new("https://tiles.example.com/{z}/{x}/{y}.pngraw?access_token={token}")
            .with_token("abc");
        assert_eq!(
            source.url(CanonicalTileId::new(15, 9647, 12320)),
            "https://tiles.example.com/15/9647/12320.pngraw?access_token=abc"
        );
    }

    #[test]
    fn test_subdomain_rotation() {
        let source = UrlTemplateSource::openstreetmap();
        assert_eq!(
            source.url(CanonicalTileId::new(1, 0, 0)),
            "https://a.tile.openstreetmap.org/1/0/0.png"
        );
        assert_eq!(
            source.url(CanonicalTileId::new(1, 1, 1)),
            "https://c.tile.openstreetmap.org/1/1/1.png"
        );
    }
}
