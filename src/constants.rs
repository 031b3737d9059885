//! Constants shared across the operator.
//!
//! Relation names, system usernames, secret keys and engine file locations
//! are part of the deployment's external contract and must stay stable across
//! releases.

/// Length of every generated password
pub const PASSWORD_LENGTH: usize = 24;

/// MySQL client port published to requirers
pub const MYSQL_PORT: u16 = 3306;

/// Name of the peer grouping shared by all units
pub const PEER: &str = "database-peers";

/// Container running the database engine
pub const CONTAINER_NAME: &str = "mysql";

// System usernames
pub const ROOT_USERNAME: &str = "root";
pub const CLUSTER_ADMIN_USERNAME: &str = "clusteradmin";
pub const SERVER_CONFIG_USERNAME: &str = "serverconfig";

// Secret store keys for system passwords
pub const ROOT_PASSWORD_KEY: &str = "root-password";
pub const SERVER_CONFIG_PASSWORD_KEY: &str = "server-config-password";
pub const CLUSTER_ADMIN_PASSWORD_KEY: &str = "cluster-admin-password";

/// Prefix of usernames and secret keys issued to database relations
pub const RELATION_USER_PREFIX: &str = "relation-";

// Relation endpoints
pub const DB_RELATION_NAME: &str = "database";
pub const TLS_RELATION: &str = "certificates";
pub const S3_INTEGRATOR_RELATION_NAME: &str = "s3-parameters";

// TLS material file names, relative to the engine data directory
pub const TLS_SSL_CA_FILE: &str = "custom-ca.pem";
pub const TLS_SSL_KEY_FILE: &str = "custom-server-key.pem";
pub const TLS_SSL_CERT_FILE: &str = "custom-server-cert.pem";

// Engine locations
pub const MYSQL_DATA_DIR: &str = "/var/lib/mysql";
pub const MYSQLSH_LOCATION: &str = "/usr/bin/mysqlsh";
pub const MYSQL_CLI_LOCATION: &str = "/usr/bin/mysql";
pub const MYSQLD_SOCK_FILE: &str = "/var/run/mysqld/mysqld.sock";
pub const XTRABACKUP_LOCATION: &str = "xtrabackup";
pub const XBSTREAM_LOCATION: &str = "xbstream";
pub const XTRABACKUP_PLUGIN_DIR: &str = "/usr/lib64/xtrabackup/plugin";
pub const MYSQLD_DEFAULTS_CONFIG_FILE: &str = "/etc/mysql/my.cnf";
pub const TMP_DIR: &str = "/tmp";

// Defaults for tunables exposed through `OperatorConfig`
pub const DEFAULT_DEPARTURE_GRACE_SECS: u64 = 60;
pub const DEFAULT_LOCK_STALENESS_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Upload part size for streamed backups
pub const BACKUP_CHUNK_SIZE: usize = 16 * 1024 * 1024;
