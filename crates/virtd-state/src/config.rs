//! Driver configuration snapshots.
//!
//! A [`DriverConfig`] is built once, optionally overridden from a TOML file
//! and `VIRTD_`-prefixed environment variables, and then published on the
//! driver. Published snapshots are immutable: the driver hands out
//! `Arc<DriverConfig>` references and reconfiguration means publishing a
//! brand-new snapshot. Overrides apply through `&mut DriverConfig`, which
//! cannot exist once the value sits behind the published `Arc`, so the
//! immutability contract is enforced by ownership rather than checked at
//! runtime.
//!
//! Operations in flight keep the snapshot that was current when they
//! started; a reload never invalidates references already handed out.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default port range used for incoming migrations.
pub const MIGRATION_PORT_MIN: u16 = 49152;
/// Number of ports reserved for incoming migrations.
pub const MIGRATION_PORT_COUNT: u16 = 64;

/// Seccomp sandbox policy for spawned hypervisor processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeccompPolicy {
    /// Leave the decision to the hypervisor binary.
    HypervisorDefault,
    /// Never enable the sandbox.
    Disabled,
    /// Always enable the sandbox.
    Enabled,
}

/// VNC listening and authentication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncConfig {
    /// Prefer an automatically allocated unix socket over TCP.
    pub auto_unix_socket: bool,
    /// Enable TLS on VNC connections.
    pub tls: bool,
    /// Require client certificate verification.
    pub tls_x509_verify: bool,
    /// Enable SASL authentication.
    pub sasl: bool,
    /// Directory holding the x509 certificates.
    pub tls_x509_cert_dir: PathBuf,
    /// Listen address for VNC servers.
    pub listen: String,
    /// Shared VNC password, if any.
    pub password: Option<String>,
    /// SASL configuration directory, if any.
    pub sasl_dir: Option<PathBuf>,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            auto_unix_socket: false,
            tls: false,
            tls_x509_verify: false,
            sasl: false,
            tls_x509_cert_dir: PathBuf::from("/etc/pki/virtd-vnc"),
            listen: "127.0.0.1".to_string(),
            password: None,
            sasl_dir: None,
        }
    }
}

/// SPICE listening and authentication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiceConfig {
    /// Enable TLS on SPICE connections.
    pub tls: bool,
    /// Directory holding the x509 certificates.
    pub tls_x509_cert_dir: PathBuf,
    /// Listen address for SPICE servers.
    pub listen: String,
    /// Shared SPICE password, if any.
    pub password: Option<String>,
}

impl Default for SpiceConfig {
    fn default() -> Self {
        Self {
            tls: false,
            tls_x509_cert_dir: PathBuf::from("/etc/pki/virtd-spice"),
            listen: "127.0.0.1".to_string(),
            password: None,
        }
    }
}

/// One immutable daemon configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Whether the daemon runs as the system instance. Fixed at
    /// construction; never overridable from a configuration source.
    pub privileged: bool,
    /// Uid hypervisor processes run as.
    pub user: u32,
    /// Gid hypervisor processes run as.
    pub group: u32,
    /// Chown disk images to `user`/`group` on start.
    pub dynamic_ownership: bool,

    /// Bitmask of cgroup controllers to use.
    pub cgroup_controllers: u32,
    /// Device ACL entries granted inside the device cgroup.
    pub cgroup_device_acl: Vec<String>,

    /// Base directory for daemon-owned configuration.
    pub config_base_dir: PathBuf,
    /// Domain definition directory.
    pub config_dir: PathBuf,
    /// Autostart symlink directory.
    pub autostart_dir: PathBuf,
    /// Per-domain log directory.
    pub log_dir: PathBuf,
    /// Runtime state directory.
    pub state_dir: PathBuf,
    /// Directory for hypervisor-owned data (must match `user`/`group`).
    pub lib_dir: PathBuf,
    /// Cache directory (must match `user`/`group`).
    pub cache_dir: PathBuf,
    /// Managed-save image directory.
    pub save_dir: PathBuf,
    /// Snapshot metadata directory.
    pub snapshot_dir: PathBuf,

    /// VNC policy.
    pub vnc: VncConfig,
    /// SPICE policy.
    pub spice: SpiceConfig,

    /// First port used for incoming migration.
    pub remote_port_min: u16,
    /// Last port (inclusive) used for incoming migration.
    pub remote_port_max: u16,

    /// Per-domain process count ceiling; 0 means unlimited.
    pub max_processes: u32,
    /// Per-domain open file ceiling; 0 means unlimited.
    pub max_files: u32,
    /// Maximum queued jobs per domain; 0 means unlimited.
    pub max_queued_jobs: u32,

    /// Security driver names, in probe order.
    pub security_driver_names: Vec<String>,
    /// Confine domains by default.
    pub security_default_confined: bool,
    /// Refuse to start unconfined domains.
    pub security_require_confined: bool,

    /// Image format for managed save.
    pub save_image_format: String,
    /// Image format for core dumps.
    pub dump_image_format: String,
    /// Directory for automatic crash dumps, if enabled.
    pub auto_dump_path: Option<PathBuf>,
    /// Bypass the page cache when auto-dumping.
    pub auto_dump_bypass_cache: bool,
    /// Bypass the page cache when restoring autostarted domains.
    pub auto_start_bypass_cache: bool,

    /// Name of the lock manager plugin.
    pub lock_manager_name: String,

    /// Keepalive probe interval in seconds; 0 disables keepalive.
    pub keepalive_interval_secs: u32,
    /// Unanswered keepalive probes tolerated before disconnect.
    pub keepalive_count: u32,

    /// Seccomp sandbox policy.
    pub seccomp_sandbox: SeccompPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DriverConfig {
    /// Builds a snapshot populated with compiled-in defaults.
    ///
    /// The privileged (system) instance uses the canonical `/etc` and
    /// `/var` trees; the session instance derives its directories from the
    /// invoking user's XDG base directories.
    #[must_use]
    pub fn new(privileged: bool) -> Self {
        let (config_base_dir, log_dir, state_dir, lib_dir, cache_dir) = if privileged {
            (
                PathBuf::from("/etc/virtd"),
                PathBuf::from("/var/log/virtd"),
                PathBuf::from("/run/virtd"),
                PathBuf::from("/var/lib/virtd"),
                PathBuf::from("/var/cache/virtd"),
            )
        } else {
            let config = dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("virtd");
            let data = dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("virtd");
            let cache = dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("virtd");
            (config, data.join("log"), data.join("run"), data, cache)
        };

        let (user, group) = if privileged {
            (0, 0)
        } else {
            (
                nix::unistd::Uid::effective().as_raw(),
                nix::unistd::Gid::effective().as_raw(),
            )
        };

        Self {
            privileged,
            user,
            group,
            dynamic_ownership: privileged,
            cgroup_controllers: 0,
            cgroup_device_acl: vec![
                "/dev/null".to_string(),
                "/dev/full".to_string(),
                "/dev/zero".to_string(),
                "/dev/random".to_string(),
                "/dev/urandom".to_string(),
                "/dev/ptmx".to_string(),
                "/dev/kvm".to_string(),
            ],
            config_dir: config_base_dir.join("domains"),
            autostart_dir: config_base_dir.join("autostart"),
            save_dir: lib_dir.join("save"),
            snapshot_dir: lib_dir.join("snapshot"),
            config_base_dir,
            log_dir,
            state_dir,
            lib_dir,
            cache_dir,
            vnc: VncConfig::default(),
            spice: SpiceConfig::default(),
            remote_port_min: MIGRATION_PORT_MIN,
            remote_port_max: MIGRATION_PORT_MIN + MIGRATION_PORT_COUNT - 1,
            max_processes: 0,
            max_files: 0,
            max_queued_jobs: 100,
            security_driver_names: Vec::new(),
            security_default_confined: true,
            security_require_confined: false,
            save_image_format: "raw".to_string(),
            dump_image_format: "raw".to_string(),
            auto_dump_path: None,
            auto_dump_bypass_cache: false,
            auto_start_bypass_cache: false,
            lock_manager_name: "nop".to_string(),
            keepalive_interval_secs: 5,
            keepalive_count: 5,
            seccomp_sandbox: SeccompPolicy::HypervisorDefault,
        }
    }

    /// Overlays an external configuration source onto this snapshot.
    ///
    /// Sources merge in increasing precedence: current values, the TOML
    /// file at `path`, then `VIRTD_`-prefixed environment variables
    /// (`VIRTD_VNC__TLS=true` targets `vnc.tls`). Only callable before
    /// publication, since publishing consumes the snapshot into an `Arc`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the source cannot be read or
    /// parsed, or [`ConfigError::InvalidValue`] if a merged field is out
    /// of range. Validation runs after the merge, so on failure the
    /// snapshot may carry partially applied values; discard it and build a
    /// fresh one.
    pub fn load_overrides(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let privileged = self.privileged;
        let merged: Self = Figment::new()
            .merge(Serialized::defaults(self.clone()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VIRTD_").split("__"))
            .extract()?;
        *self = merged;
        // Privileged mode is decided by how the daemon was started, never
        // by a configuration source.
        self.privileged = privileged;
        self.validate()
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_port_min >= self.remote_port_max {
            return Err(ConfigError::InvalidValue {
                field: "remote_port_min",
                reason: format!(
                    "port range {}..={} is empty",
                    self.remote_port_min, self.remote_port_max
                ),
            });
        }
        if self.remote_port_min < 1024 {
            return Err(ConfigError::InvalidValue {
                field: "remote_port_min",
                reason: format!("{} is a reserved port", self.remote_port_min),
            });
        }
        if self.vnc.tls && self.vnc.tls_x509_cert_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "vnc.tls_x509_cert_dir",
                reason: "required when vnc.tls is enabled".to_string(),
            });
        }
        if self.spice.tls && self.spice.tls_x509_cert_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "spice.tls_x509_cert_dir",
                reason: "required when spice.tls is enabled".to_string(),
            });
        }
        if self.security_require_confined && !self.security_default_confined {
            return Err(ConfigError::InvalidValue {
                field: "security_require_confined",
                reason: "cannot require confinement while defaulting to unconfined".to_string(),
            });
        }
        if self.keepalive_interval_secs > 0 && self.keepalive_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "keepalive_count",
                reason: "must be non-zero when keepalive is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Number of ports in the migration range.
    #[must_use]
    pub fn remote_port_count(&self) -> u16 {
        self.remote_port_max - self.remote_port_min + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn privileged_defaults_use_system_trees() {
        let cfg = DriverConfig::new(true);
        assert!(cfg.privileged);
        assert_eq!(cfg.user, 0);
        assert_eq!(cfg.config_base_dir, PathBuf::from("/etc/virtd"));
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/virtd"));
        assert_eq!(cfg.config_dir, PathBuf::from("/etc/virtd/domains"));
        assert!(cfg.dynamic_ownership);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn session_defaults_stay_in_user_dirs() {
        let cfg = DriverConfig::new(false);
        assert!(!cfg.privileged);
        assert_eq!(cfg.user, nix::unistd::Uid::effective().as_raw());
        assert!(cfg.config_base_dir.ends_with("virtd"));
        assert!(cfg.save_dir.ends_with("save"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn migration_range_defaults() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.remote_port_min, 49152);
        assert_eq!(cfg.remote_port_max, 49215);
        assert_eq!(cfg.remote_port_count(), 64);
    }

    #[test]
    fn overrides_merge_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "cache_dir = \"/srv/cache/virtd\"\nmax_queued_jobs = 7\n\n[vnc]\nlisten = \"0.0.0.0\"\n"
        )
        .unwrap();

        let mut cfg = DriverConfig::new(true);
        cfg.load_overrides(file.path()).unwrap();

        assert_eq!(cfg.cache_dir, PathBuf::from("/srv/cache/virtd"));
        assert_eq!(cfg.max_queued_jobs, 7);
        assert_eq!(cfg.vnc.listen, "0.0.0.0");
        // Untouched fields keep their compiled-in defaults.
        assert_eq!(cfg.save_image_format, "raw");
        // Privileged mode cannot be overridden by a file.
        assert!(cfg.privileged);
    }

    #[test]
    fn overrides_reject_empty_port_range() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "remote_port_min = 50000\nremote_port_max = 49000\n").unwrap();

        let mut cfg = DriverConfig::new(false);
        let err = cfg.load_overrides(file.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "remote_port_min",
                ..
            }
        ));
    }

    #[test]
    fn overrides_reject_contradictory_confinement() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "security_default_confined = false\nsecurity_require_confined = true\n"
        )
        .unwrap();

        let mut cfg = DriverConfig::new(false);
        assert!(cfg.load_overrides(file.path()).is_err());
    }
}
