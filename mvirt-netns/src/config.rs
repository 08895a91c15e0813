//! Daemon configuration: which network managers exist and where their plugin
//! binaries and configs live.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::context::validate_identifier;
use crate::error::{Error, Result};

pub const DEFAULT_MANAGER: &str = "default";
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";
pub const DEFAULT_CONF_DIR: &str = "/etc/cni/net.d";

/// Plugin environment of one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub bin_dir: PathBuf,
    pub conf_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bin_dir: DEFAULT_BIN_DIR.into(),
            conf_dir: DEFAULT_CONF_DIR.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// First configured manager; must be one of `managers`.
    pub default_manager: String,
    pub managers: BTreeMap<String, ManagerConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_manager: DEFAULT_MANAGER.to_string(),
            managers: BTreeMap::from([(DEFAULT_MANAGER.to_string(), ManagerConfig::default())]),
        }
    }
}

impl ServiceConfig {
    /// Builds a config from `--manager` flags. Without any, the default
    /// manager is used; otherwise the first one given becomes the default.
    pub fn from_specs(specs: impl IntoIterator<Item = ManagerSpec>) -> Result<Self> {
        let mut default_manager = None;
        let mut managers = BTreeMap::new();
        for spec in specs {
            default_manager.get_or_insert_with(|| spec.name.clone());
            if managers.insert(spec.name.clone(), spec.config).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "network manager {} configured twice",
                    spec.name
                )));
            }
        }

        match default_manager {
            Some(default_manager) => Ok(Self {
                default_manager,
                managers,
            }),
            None => Ok(Self::default()),
        }
    }
}

/// One `NAME=BIN_DIR:CONF_DIR` command line entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSpec {
    pub name: String,
    pub config: ManagerConfig,
}

impl FromStr for ManagerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, dirs) = s.split_once('=').ok_or_else(|| {
            Error::InvalidArgument(format!("expected NAME=BIN_DIR:CONF_DIR, got {s:?}"))
        })?;
        validate_identifier("network manager", name)?;

        let (bin_dir, conf_dir) = dirs.split_once(':').ok_or_else(|| {
            Error::InvalidArgument(format!("expected BIN_DIR:CONF_DIR, got {dirs:?}"))
        })?;
        if bin_dir.is_empty() || conf_dir.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty plugin directory in {s:?}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            config: ManagerConfig {
                bin_dir: bin_dir.into(),
                conf_dir: conf_dir.into(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_manager_spec() {
        let spec: ManagerSpec = "calico=/opt/calico/bin:/etc/calico/net.d".parse().unwrap();
        assert_eq!(spec.name, "calico");
        assert_eq!(spec.config.bin_dir, PathBuf::from("/opt/calico/bin"));
        assert_eq!(spec.config.conf_dir, PathBuf::from("/etc/calico/net.d"));
    }

    #[test]
    fn test_parse_manager_spec_rejects() {
        for bad in [
            "calico",
            "calico=/opt/bin",
            "=/a:/b",
            "bad/name=/a:/b",
            "calico=:/b",
        ] {
            let err = bad.parse::<ManagerSpec>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{bad}");
        }
    }

    #[test]
    fn test_from_specs() {
        let config = ServiceConfig::from_specs(Vec::new()).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.managers[DEFAULT_MANAGER].bin_dir, PathBuf::from(DEFAULT_BIN_DIR));

        let specs = ["b=/b:/bc", "a=/a:/ac"].map(|s| s.parse::<ManagerSpec>().unwrap());
        let config = ServiceConfig::from_specs(specs).unwrap();
        assert_eq!(config.default_manager, "b");
        assert_eq!(config.managers.len(), 2);

        let dup = ["a=/a:/ac", "a=/x:/y"].map(|s| s.parse::<ManagerSpec>().unwrap());
        assert!(ServiceConfig::from_specs(dup).is_err());
    }
}
