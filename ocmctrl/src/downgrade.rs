use log::info;
use semver::Version;

use ocmmodel::descriptor::ComponentDescriptor;

/// Label on a component version naming the lowest version it may be
/// downgraded to.
pub const DOWNGRADABLE_LABEL: &str = "downgradable";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    BadVersion(String),
    BadLabel(String),
    /// terminal: retrying cannot help until the desired state changes
    Terminal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Terminal(message) => write!(f, "{message}"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl Error {
    pub fn terminal(&self) -> bool {
        matches!(self, Error::Terminal(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DowngradePolicy {
    /// never move to a lower version
    #[default]
    Deny,
    /// only when the deployed version's `downgradable` label allows it
    Allow,
    /// always
    Enforce,
}

impl std::str::FromStr for DowngradePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "deny" => Ok(DowngradePolicy::Deny),
            "allow" => Ok(DowngradePolicy::Allow),
            "enforce" => Ok(DowngradePolicy::Enforce),
            other => Err(format!("unknown downgrade policy {other}")),
        }
    }
}

fn parse_version(s: &str) -> Result<Version, Error> {
    Version::parse(s.strip_prefix('v').unwrap_or(s))
        .map_err(|_| Error::BadVersion(s.to_string()))
}

/// Decide whether moving from the deployed descriptor to `target_version`
/// is allowed. Upgrades always pass; downgrades depend on the policy.
pub fn check_downgrade(
    current: &ComponentDescriptor,
    target_version: &str,
    policy: DowngradePolicy,
) -> Result<(), Error> {
    let from = parse_version(current.version())?;
    let to = parse_version(target_version)?;
    if to >= from {
        return Ok(());
    }
    match policy {
        DowngradePolicy::Enforce => {
            info!(
                "downgrade {} -> {} enforced for {}",
                current.version(),
                target_version,
                current.name()
            );
            Ok(())
        }
        DowngradePolicy::Deny => Err(denial(current.version(), target_version)),
        DowngradePolicy::Allow => {
            let label = current
                .label(DOWNGRADABLE_LABEL)
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| denial(current.version(), target_version))?;
            let floor = parse_version(&label).map_err(|_| Error::BadLabel(label.clone()))?;
            if to >= floor {
                Ok(())
            } else {
                Err(denial(current.version(), target_version))
            }
        }
    }
}

fn denial(from: &str, to: &str) -> Error {
    Error::Terminal(format!(
        "component version cannot be downgraded from version {from} to version {to}"
    ))
}
