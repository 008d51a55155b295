//! Image labels following the OCI annotation keys.

use std::collections::BTreeMap;

use crate::params::BuildParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageLabel {
    Created,
    Authors,
    Url,
    Documentation,
    Source,
    Version,
    Revision,
    Vendor,
    Licenses,
    Title,
    Description,
}

impl ImageLabel {
    pub const ALL: [ImageLabel; 11] = [
        ImageLabel::Created,
        ImageLabel::Authors,
        ImageLabel::Url,
        ImageLabel::Documentation,
        ImageLabel::Source,
        ImageLabel::Version,
        ImageLabel::Revision,
        ImageLabel::Vendor,
        ImageLabel::Licenses,
        ImageLabel::Title,
        ImageLabel::Description,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ImageLabel::Created => "org.opencontainers.image.created",
            ImageLabel::Authors => "org.opencontainers.image.authors",
            ImageLabel::Url => "org.opencontainers.image.url",
            ImageLabel::Documentation => "org.opencontainers.image.documentation",
            ImageLabel::Source => "org.opencontainers.image.source",
            ImageLabel::Version => "org.opencontainers.image.version",
            ImageLabel::Revision => "org.opencontainers.image.revision",
            ImageLabel::Vendor => "org.opencontainers.image.vendor",
            ImageLabel::Licenses => "org.opencontainers.image.licenses",
            ImageLabel::Title => "org.opencontainers.image.title",
            ImageLabel::Description => "org.opencontainers.image.description",
        }
    }

    /// Build parameter the label value is taken from.
    pub fn param(self) -> &'static str {
        match self {
            ImageLabel::Created => "IMAGE_CREATED",
            ImageLabel::Authors => "IMAGE_AUTHORS",
            ImageLabel::Url => "IMAGE_URL",
            ImageLabel::Documentation => "IMAGE_DOCUMENTATION",
            ImageLabel::Source => "IMAGE_SOURCE",
            ImageLabel::Version => "IMAGE_VERSION",
            ImageLabel::Revision => "IMAGE_REVISION",
            ImageLabel::Vendor => "IMAGE_VENDOR",
            ImageLabel::Licenses => "IMAGE_LICENSES",
            ImageLabel::Title => "IMAGE_TITLE",
            ImageLabel::Description => "IMAGE_DESCRIPTION",
        }
    }
}

/// Every label key mapped to its parameter value. Unset parameters yield
/// empty values; a label is never omitted.
pub fn image_labels(params: &BuildParams) -> BTreeMap<String, String> {
    ImageLabel::ALL
        .iter()
        .map(|label| (label.key().to_string(), params.get(label.param()).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_label_is_present_even_when_unset() {
        let mut params = BuildParams::new();
        params.set("IMAGE_VERSION", "1.4.0");
        params.set("IMAGE_REVISION", "9f2c1e7");

        let labels = image_labels(&params);

        assert_eq!(labels.len(), 11);
        assert_eq!(labels["org.opencontainers.image.version"], "1.4.0");
        assert_eq!(labels["org.opencontainers.image.revision"], "9f2c1e7");
        assert_eq!(labels["org.opencontainers.image.title"], "");
    }

    #[test]
    fn keys_and_params_are_unique() {
        let keys: std::collections::HashSet<_> = ImageLabel::ALL.iter().map(|l| l.key()).collect();
        let params: std::collections::HashSet<_> = ImageLabel::ALL.iter().map(|l| l.param()).collect();
        assert_eq!(keys.len(), ImageLabel::ALL.len());
        assert_eq!(params.len(), ImageLabel::ALL.len());
    }
}
