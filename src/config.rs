//! Unit process configuration
//!
//! Configuration is read from the environment injected into the unit's pod
//! (downward API for identity, plain variables for tunables). Every value has
//! a default except the unit identity, which falls back to the hostname.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::constants::{
    DEFAULT_DEPARTURE_GRACE_SECS, DEFAULT_HEALTH_ADDR, DEFAULT_LOCK_STALENESS_SECS,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
    DEFAULT_STATUS_INTERVAL_SECS, MYSQL_DATA_DIR, MYSQL_PORT,
};
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;

/// Configuration of a single unit process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Application name (e.g. `mysql-k8s`), shared by every unit
    pub app_name: String,
    /// Unit identifier in `<app>/<ordinal>` form
    pub unit_name: String,
    /// Namespace the deployment lives in
    pub namespace: String,
    /// Address other units use to reach this unit's engine
    pub unit_address: String,
    /// Name of the InnoDB cluster
    pub cluster_name: String,
    /// Bind address of the health, metrics and actions server
    pub health_addr: SocketAddr,
    /// Engine data directory; TLS material is installed here
    pub data_dir: PathBuf,
    /// How long a member may be unreachable before it is removed
    pub departure_grace: Duration,
    /// Age after which an advisory lock may be reclaimed
    pub lock_staleness: Duration,
    /// Interval of the periodic status pass
    pub status_interval: Duration,
    /// Retry policy for admin-client and object-storage calls
    pub retry: RetryPolicy,
}

impl OperatorConfig {
    /// Build a configuration with defaults for a given unit
    pub fn new(app_name: &str, unit_ordinal: u32, namespace: &str) -> Self {
        let unit_name = format!("{}/{}", app_name, unit_ordinal);
        let unit_address = format!("{}-{}.{}-endpoints", app_name, unit_ordinal, app_name);
        Self {
            app_name: app_name.to_string(),
            unit_name,
            namespace: namespace.to_string(),
            unit_address,
            cluster_name: format!("{}-cluster", app_name.replace('-', "_")),
            health_addr: DEFAULT_HEALTH_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            data_dir: PathBuf::from(MYSQL_DATA_DIR),
            departure_grace: Duration::from_secs(DEFAULT_DEPARTURE_GRACE_SECS),
            lock_staleness: Duration::from_secs(DEFAULT_LOCK_STALENESS_SECS),
            status_interval: Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
            retry: RetryPolicy::default(),
        }
    }

    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "mysql-k8s-0".to_string())
        });
        let (pod_app, ordinal) = split_pod_name(&pod_name)?;
        let app_name = std::env::var("APP_NAME").unwrap_or(pod_app);
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });

        let mut config = Self::new(&app_name, ordinal, &namespace);

        if let Ok(address) = std::env::var("POD_IP") {
            config.unit_address = address;
        }
        if let Ok(cluster_name) = std::env::var("CLUSTER_NAME") {
            config.cluster_name = cluster_name;
        }
        if let Ok(addr) = std::env::var("HEALTH_ADDR") {
            config.health_addr = addr
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("HEALTH_ADDR is not a socket address: {}", addr)))?;
        }
        if let Ok(dir) = std::env::var("MYSQL_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.departure_grace =
            Duration::from_secs(env_u64("DEPARTURE_GRACE_SECS", DEFAULT_DEPARTURE_GRACE_SECS)?);
        config.lock_staleness =
            Duration::from_secs(env_u64("LOCK_STALENESS_SECS", DEFAULT_LOCK_STALENESS_SECS)?);
        config.status_interval =
            Duration::from_secs(env_u64("STATUS_INTERVAL_SECS", DEFAULT_STATUS_INTERVAL_SECS)?);
        config.retry = RetryPolicy {
            max_attempts: env_u64("RETRY_MAX_ATTEMPTS", u64::from(DEFAULT_RETRY_MAX_ATTEMPTS))?
                .try_into()
                .map_err(|_| Error::InvalidConfig("RETRY_MAX_ATTEMPTS is too large".to_string()))?,
            base_delay: Duration::from_millis(env_u64(
                "RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
            max_delay: Duration::from_millis(env_u64(
                "RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
            )?),
            jitter: true,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(Error::InvalidConfig("application name is empty".to_string()));
        }
        if self.cluster_name.is_empty() || self.cluster_name.len() > 63 {
            return Err(Error::InvalidConfig(format!(
                "cluster name must be 1-63 characters: {:?}",
                self.cluster_name
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::InvalidConfig(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.status_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "STATUS_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Service address routed to the current primary
    pub fn primary_endpoint(&self) -> String {
        format!("{}-primary:{}", self.app_name, MYSQL_PORT)
    }

    /// Service address load-balanced across the replicas
    pub fn replicas_endpoint(&self) -> String {
        format!("{}-replicas:{}", self.app_name, MYSQL_PORT)
    }

    /// Name of the ConfigMap backing the peer key space
    pub fn peer_configmap_name(&self) -> String {
        format!("{}-peers", self.app_name)
    }

    /// Name of the Secret backing the secret store
    pub fn secret_name(&self) -> String {
        format!("{}-secrets", self.app_name)
    }

    /// Name of the leader election lease
    pub fn lease_name(&self) -> String {
        format!("{}-leader", self.app_name)
    }

    /// Pod name of this unit (`<app>-<ordinal>`)
    pub fn pod_name(&self) -> String {
        self.unit_name.replace('/', "-")
    }
}

/// Split `<app>-<ordinal>` into its parts
fn split_pod_name(pod_name: &str) -> Result<(String, u32)> {
    let (app, ordinal) = pod_name
        .rsplit_once('-')
        .ok_or_else(|| Error::InvalidConfig(format!("pod name has no ordinal: {}", pod_name)))?;
    let ordinal = ordinal
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("pod name has no ordinal: {}", pod_name)))?;
    Ok((app.to_string(), ordinal))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("{} is not an integer: {}", name, value))),
        Err(_) => Ok(default),
    }
}
