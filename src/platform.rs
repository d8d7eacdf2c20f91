//! Supported device types.
//!
//! Each platform knows how its shell prompt looks, how it paginates, which
//! command turns paging off, and which strings in `show version`-style output
//! identify it during autodetection.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::DeviceHandler;
use crate::error::NetqueryError;

/// Sentinel device type asking the engine to probe the device first.
pub const AUTODETECT: &str = "autodetect";

/// Device types understood by the SSH backend, `autodetect` included.
pub const SUPPORTED_DEVICE_TYPES: &[&str] = &[
    AUTODETECT,
    "arista_eos",
    "cisco_ios",
    "cisco_nxos",
    "cisco_xe",
    "cisco_xr",
    "hp_comware",
    "huawei",
    "juniper_junos",
    "linux",
];

/// Everything the SSH backend needs to drive one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub name: &'static str,
    pub vendor: &'static str,
    pub family: &'static str,
    pub prompts: &'static [&'static str],
    pub more: &'static [&'static str],
    /// Sent once after login so long outputs are not paginated.
    pub disable_paging: Option<&'static str>,
    /// Regexes matched against probe output during autodetection.
    pub signatures: &'static [&'static str],
}

const CISCO_PROMPTS: &[&str] = &[r"^[^\s#>]+(\(\S+\))?[#>]\s*$"];
const CISCO_MORE: &[&str] = &[r"\s*--More--\s*", r"\s*<--- More --->\s*"];

static PLATFORMS: &[Platform] = &[
    Platform {
        name: "arista_eos",
        vendor: "Arista",
        family: "EOS",
        prompts: CISCO_PROMPTS,
        more: CISCO_MORE,
        disable_paging: Some("terminal length 0"),
        signatures: &[r"Arista", r"vEOS"],
    },
    Platform {
        name: "cisco_ios",
        vendor: "Cisco",
        family: "IOS",
        prompts: CISCO_PROMPTS,
        more: CISCO_MORE,
        disable_paging: Some("terminal length 0"),
        signatures: &[r"Cisco IOS Software", r"Cisco Internetwork Operating System Software"],
    },
    Platform {
        name: "cisco_nxos",
        vendor: "Cisco",
        family: "NX-OS",
        prompts: CISCO_PROMPTS,
        more: CISCO_MORE,
        disable_paging: Some("terminal length 0"),
        signatures: &[r"Cisco Nexus Operating System", r"NX-OS"],
    },
    Platform {
        name: "cisco_xe",
        vendor: "Cisco",
        family: "IOS-XE",
        prompts: CISCO_PROMPTS,
        more: CISCO_MORE,
        disable_paging: Some("terminal length 0"),
        signatures: &[r"Cisco IOS[ -]XE Software"],
    },
    Platform {
        name: "cisco_xr",
        vendor: "Cisco",
        family: "IOS-XR",
        prompts: &[r"^RP/\d+/\S+:[^#]+(\(\S+\))?#\s*$"],
        more: CISCO_MORE,
        disable_paging: Some("terminal length 0"),
        signatures: &[r"Cisco IOS XR Software"],
    },
    Platform {
        name: "hp_comware",
        vendor: "HPE",
        family: "Comware",
        prompts: &[r"^[<\[][^\s>\]]+[>\]]\s*$"],
        more: &[r"\s*---- More ----\s*"],
        disable_paging: Some("screen-length disable"),
        signatures: &[r"HPE? Comware", r"H3C Comware"],
    },
    Platform {
        name: "huawei",
        vendor: "Huawei",
        family: "VRP",
        prompts: &[r"^(HRP_M|HRP_S)?[<\[][^\s>\]]+[>\]]\s*$"],
        more: &[r"\s*---- More ----\s*"],
        disable_paging: Some("screen-length 0 temporary"),
        signatures: &[r"Huawei Versatile Routing Platform", r"VRP \(R\) software"],
    },
    Platform {
        name: "juniper_junos",
        vendor: "Juniper",
        family: "JunOS",
        prompts: &[r"^\S+@\S+[>#%]\s*$"],
        more: &[r"\s*---\(more( \d+%)?\)---\s*"],
        disable_paging: Some("set cli screen-length 0"),
        signatures: &[r"JUNOS", r"Junos:"],
    },
    Platform {
        name: "linux",
        vendor: "Linux",
        family: "POSIX shell",
        prompts: &[r"^.*[$#]\s*$"],
        more: &[],
        disable_paging: None,
        signatures: &[r"Linux"],
    },
];

/// Command sent to an unknown device during autodetection.
pub const DETECTION_PROBE: &str = "show version";

/// Prompt patterns good enough to drive a shell before its type is known.
pub const GENERIC_PROMPTS: &[&str] = &[r"^[^\s]*[#>$%\]]\s*$"];

static SIGNATURES: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    PLATFORMS
        .iter()
        .map(|p| {
            let regexes = p
                .signatures
                .iter()
                .filter_map(|s| Regex::new(s).ok())
                .collect();
            (p.name, regexes)
        })
        .collect()
});

/// Returns true if `name` is a supported device type (`autodetect` included).
pub fn is_supported(name: &str) -> bool {
    SUPPORTED_DEVICE_TYPES.contains(&name)
}

/// Looks up a concrete platform by device-type name.
pub fn by_name(name: &str) -> Result<&'static Platform, NetqueryError> {
    PLATFORMS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| NetqueryError::UnsupportedDeviceType(name.to_string()))
}

/// Picks the platform whose signature appears in probe output.
///
/// Platforms are tried in the order of the most specific signature first, so
/// IOS-XE output, which also mentions plain IOS, resolves to `cisco_xe`.
pub fn detect(probe_output: &str) -> Option<&'static str> {
    const PRECEDENCE: &[&str] = &[
        "cisco_xr",
        "cisco_xe",
        "cisco_nxos",
        "cisco_ios",
        "arista_eos",
        "juniper_junos",
        "huawei",
        "hp_comware",
        "linux",
    ];
    PRECEDENCE.iter().copied().find(|name| {
        SIGNATURES
            .iter()
            .find(|(n, _)| n == name)
            .is_some_and(|(_, regexes)| regexes.iter().any(|re| re.is_match(probe_output)))
    })
}

impl Platform {
    /// Builds a line classifier for this platform.
    ///
    /// The enable password, when present, answers `Password:` prompts.
    pub fn handler(&self, enable_password: Option<&str>) -> Result<DeviceHandler, NetqueryError> {
        handler_for(self.prompts, self.more, enable_password)
    }
}

/// Builds a classifier for a shell whose platform is not known yet.
pub fn generic_handler() -> Result<DeviceHandler, NetqueryError> {
    handler_for(GENERIC_PROMPTS, CISCO_MORE, None)
}

fn handler_for(
    prompts: &[&str],
    more: &[&str],
    enable_password: Option<&str>,
) -> Result<DeviceHandler, NetqueryError> {
    let mut dyn_param = HashMap::new();
    if let Some(enable) = enable_password {
        dyn_param.insert("EnablePassword".to_string(), format!("{enable}\n"));
    }
    DeviceHandler::new(
        prompts.iter().copied(),
        more.iter().copied(),
        vec![(
            r"^\x00*\r?(Enable )?Password:\s*$",
            (true, "EnablePassword".to_string()),
        )],
        dyn_param,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LineKind;

    #[test]
    fn every_concrete_platform_is_supported() {
        for platform in PLATFORMS {
            assert!(is_supported(platform.name), "{} missing", platform.name);
        }
        assert!(is_supported(AUTODETECT));
        assert!(!is_supported("cisco_ios_typo"));
    }

    #[test]
    fn by_name_rejects_unknown_platform() {
        let err = by_name("unknown-vendor").expect_err("unknown platform should fail");
        assert!(matches!(err, NetqueryError::UnsupportedDeviceType(_)));
    }

    #[test]
    fn every_platform_builds_a_handler() {
        for platform in PLATFORMS {
            let platform = by_name(platform.name).expect("platform");
            platform.handler(Some("enable")).expect("handler");
        }
        generic_handler().expect("generic handler");
    }

    #[test]
    fn cisco_handler_recognises_prompts_and_more() {
        let handler = by_name("cisco_ios")
            .and_then(|p| p.handler(None))
            .expect("cisco handler");
        assert_eq!(handler.classify("core-sw1#"), LineKind::Prompt);
        assert_eq!(handler.classify("core-sw1(config)#"), LineKind::Prompt);
        assert_eq!(handler.classify(" --More-- "), LineKind::More(" ".to_string()));
        assert_eq!(handler.classify("Cisco IOS Software"), LineKind::Output);
    }

    #[test]
    fn detection_prefers_specific_signatures() {
        assert_eq!(
            detect("Cisco IOS XE Software, Version 17.3\nCisco IOS Software [Amsterdam]"),
            Some("cisco_xe")
        );
        assert_eq!(detect("Cisco IOS Software, C2960 Software"), Some("cisco_ios"));
        assert_eq!(detect("Junos: 21.4R3"), Some("juniper_junos"));
        assert_eq!(detect("% Unknown command"), None);
    }
}
