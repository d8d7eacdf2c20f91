use std::str::FromStr;

use russh::keys::Algorithm;
use russh::{cipher, kex, mac};

use super::*;

/// SSH algorithm policy offered to devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Modern algorithms only.
    #[default]
    Secure,
    /// Modern algorithms plus widely deployed older ones.
    Balanced,
    /// Everything russh can speak, for old network gear.
    LegacyCompatible,
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "secure" => Ok(Self::Secure),
            "balanced" => Ok(Self::Balanced),
            "legacy" | "legacy_compatible" => Ok(Self::LegacyCompatible),
            other => Err(format!("unknown security level '{other}'")),
        }
    }
}

struct AlgorithmSet {
    kex: &'static [kex::Name],
    key: &'static [Algorithm],
    cipher: &'static [cipher::Name],
    mac: &'static [mac::Name],
}

impl SecurityLevel {
    fn algorithms(self) -> AlgorithmSet {
        match self {
            SecurityLevel::Secure => AlgorithmSet {
                kex: config::SECURE_KEX_ORDER,
                key: config::SECURE_KEY_TYPES,
                cipher: config::SECURE_CIPHERS,
                mac: config::SECURE_MAC_ALGORITHMS,
            },
            SecurityLevel::Balanced => AlgorithmSet {
                kex: config::BALANCED_KEX_ORDER,
                key: config::BALANCED_KEY_TYPES,
                cipher: config::BALANCED_CIPHERS,
                mac: config::BALANCED_MAC_ALGORITHMS,
            },
            SecurityLevel::LegacyCompatible => AlgorithmSet {
                kex: config::LEGACY_KEX_ORDER,
                key: config::LEGACY_KEY_TYPES,
                cipher: config::LEGACY_CIPHERS,
                mac: config::LEGACY_MAC_ALGORITHMS,
            },
        }
    }
}

/// Algorithm policy and host key verification used to open sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::secure_default()
    }
}

impl ConnectionSecurityOptions {
    /// Options for a level, with the host key check that level implies.
    ///
    /// Legacy devices rarely have their keys in `known_hosts`, so the legacy
    /// level skips host key verification.
    pub fn from_level(level: SecurityLevel) -> Self {
        let server_check = match level {
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
            SecurityLevel::Secure | SecurityLevel::Balanced => {
                ServerCheckMethod::DefaultKnownHostsFile
            }
        };
        Self {
            level,
            server_check,
        }
    }

    pub fn secure_default() -> Self {
        Self::from_level(SecurityLevel::Secure)
    }

    pub fn balanced() -> Self {
        Self::from_level(SecurityLevel::Balanced)
    }

    pub fn legacy_compatible() -> Self {
        Self::from_level(SecurityLevel::LegacyCompatible)
    }

    /// Overrides the host key check, e.g. with a custom known_hosts file.
    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = server_check;
        self
    }

    pub(super) fn preferred(&self) -> Preferred {
        let set = self.level.algorithms();
        Preferred {
            kex: Cow::Borrowed(set.kex),
            key: Cow::Borrowed(set.key),
            cipher: Cow::Borrowed(set.cipher),
            mac: Cow::Borrowed(set.mac),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        }
    }
}
