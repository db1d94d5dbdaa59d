//! Cloud service provider identity.

use serde::{Deserialize, Serialize};

use crate::error::PublishError;

/// Cloud service provider an image is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    OpenStack,
    Stackit,
    Qemu,
}

impl Provider {
    /// All known providers.
    pub const ALL: [Provider; 6] = [
        Provider::Aws,
        Provider::Azure,
        Provider::Gcp,
        Provider::OpenStack,
        Provider::Stackit,
        Provider::Qemu,
    ];

    /// Lowercase tag used in image info entries (`csp` field).
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::OpenStack => "openstack",
            Provider::Stackit => "stackit",
            Provider::Qemu => "qemu",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Aws => "AWS",
            Provider::Azure => "Azure",
            Provider::Gcp => "GCP",
            Provider::OpenStack => "OpenStack",
            Provider::Stackit => "STACKIT",
            Provider::Qemu => "QEMU",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Provider {
    type Err = PublishError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.tag() == lower)
            .ok_or_else(|| PublishError::UnknownProvider(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("AWS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("azure".parse::<Provider>().unwrap(), Provider::Azure);
        assert_eq!(" OpenStack ".parse::<Provider>().unwrap(), Provider::OpenStack);
        assert_eq!("STACKIT".parse::<Provider>().unwrap(), Provider::Stackit);
    }

    #[test]
    fn test_parse_unknown() {
        let err = "digitalocean".parse::<Provider>().unwrap_err();
        assert!(matches!(err, PublishError::UnknownProvider(_)));
    }

    #[test]
    fn test_tag_round_trips_through_parse() {
        for provider in Provider::ALL {
            assert_eq!(provider.tag().parse::<Provider>().unwrap(), provider);
        }
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Provider::Gcp).unwrap();
        assert_eq!(json, "\"gcp\"");
    }
}
