//! [`ClusterAdmin`] backed by `mysqlsh` and `xtrabackup` in the unit's pod
//!
//! Commands run through the Kubernetes exec API in the engine container.
//! `mysqlsh` and shell scripts are fed on stdin, which keeps their passwords
//! off the command line. Cluster status is re-emitted by the script as JSON in
//! the shape [`ClusterTopology::from_status`] reads.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams, AttachedProcess};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::sql::{account, quote_string, scoped_user_statements, shell_escape};
use super::{AdminAccount, AdminError, ByteStream, ClusterAdmin, ClusterTopology, UnitMember};
use crate::constants::{
    CLUSTER_ADMIN_USERNAME, CONTAINER_NAME, MYSQL_PORT, MYSQLD_DEFAULTS_CONFIG_FILE,
    MYSQLD_SOCK_FILE, MYSQLSH_LOCATION, ROOT_USERNAME, TLS_SSL_CA_FILE, TLS_SSL_CERT_FILE,
    TLS_SSL_KEY_FILE, TMP_DIR, XBSTREAM_LOCATION, XTRABACKUP_LOCATION, XTRABACKUP_PLUGIN_DIR,
};
use crate::credentials::{CredentialStore, SystemUser};

/// Schemas that do not count as user data
const SYSTEM_SCHEMAS: [&str; 5] = [
    "mysql",
    "information_schema",
    "performance_schema",
    "sys",
    "mysql_innodb_cluster_metadata",
];

/// Error fragments of a missing cluster, as opposed to a failed lookup
const NO_CLUSTER_MARKERS: [&str; 3] = [
    "standalone instance",
    "metadata schema",
    "not part of any cluster",
];

/// Error fragments worth retrying
const TRANSIENT_MARKERS: [&str; 6] = [
    "Can't connect",
    "Lost connection",
    "MySQL server has gone away",
    "Connection refused",
    "timed out",
    "primary election in progress",
];

/// Instance label in the cluster metadata for a unit id
pub fn instance_label(unit: &str) -> String {
    unit.replace('/', "-")
}

/// Unit id for an instance label (`mysql-k8s-3` -> `mysql-k8s/3`)
pub fn unit_from_label(label: &str) -> String {
    match label.rsplit_once('-') {
        Some((app, ordinal)) if ordinal.chars().all(|c| c.is_ascii_digit()) && !ordinal.is_empty() => {
            format!("{}/{}", app, ordinal)
        }
        _ => label.to_string(),
    }
}

/// `host:port`, adding the MySQL port when missing
fn with_port(address: &str) -> String {
    if address.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        address.to_string()
    } else {
        format!("{}:{}", address, MYSQL_PORT)
    }
}

/// Python literal for a string; JSON strings are valid Python
fn py(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn classify(output: &str) -> AdminError {
    let message = output.trim().to_string();
    if TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker)) {
        AdminError::Transient(message)
    } else {
        AdminError::CommandFailed(message)
    }
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> Result<String, AdminError> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

/// Where a `mysqlsh` script connects
enum Endpoint<'a> {
    Socket,
    Address(&'a str),
}

/// Drives the engine in one unit's pod
#[derive(Clone)]
pub struct MysqlShellAdmin {
    pods: Api<Pod>,
    pod_name: String,
    /// This unit's instance address
    address: String,
    credentials: CredentialStore,
}

impl MysqlShellAdmin {
    pub fn new(
        client: Client,
        namespace: &str,
        pod_name: &str,
        address: &str,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.to_string(),
            address: address.to_string(),
            credentials,
        }
    }

    fn attach_params() -> AttachParams {
        AttachParams {
            container: Some(CONTAINER_NAME.to_string()),
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        }
    }

    async fn password(&self, user: SystemUser) -> Result<String, AdminError> {
        let credentials = self
            .credentials
            .system_credentials()
            .await
            .map_err(|e| AdminError::Transient(format!("system credentials unavailable: {}", e)))?;
        Ok(credentials.get(user).password.clone())
    }

    /// Wait for the exec to finish; failures carry stderr
    async fn finish(mut attached: AttachedProcess, stderr: String) -> Result<(), AdminError> {
        let status = attached
            .take_status()
            .ok_or_else(|| AdminError::Transient("exec returned no status".to_string()))?;
        if let Some(status) = status.await
            && status.status.as_deref() != Some("Success")
        {
            return Err(if stderr.trim().is_empty() {
                classify(&format!("command failed: {:?}", status.message))
            } else {
                classify(&stderr)
            });
        }
        Ok(())
    }

    /// Run `command` with `input` on stdin and return stdout
    async fn exec(&self, command: Vec<String>, input: &[u8]) -> Result<String, AdminError> {
        let mut attached = self
            .pods
            .exec(&self.pod_name, command, &Self::attach_params())
            .await?;

        if let Some(mut stdin) = attached.stdin() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        let stdout = attached
            .stdout()
            .ok_or_else(|| AdminError::Transient("exec returned no stdout".to_string()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| AdminError::Transient("exec returned no stderr".to_string()))?;

        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;
        Self::finish(attached, stderr).await?;
        Ok(stdout)
    }

    /// Run a Python `mysqlsh` script connected as `user`
    async fn mysqlsh(
        &self,
        user: SystemUser,
        endpoint: Endpoint<'_>,
        script: &str,
    ) -> Result<String, AdminError> {
        let password = self.password(user).await?;
        let options = match endpoint {
            Endpoint::Socket => json!({
                "user": user.username(),
                "password": password,
                "socket": MYSQLD_SOCK_FILE,
            }),
            Endpoint::Address(address) => json!({
                "user": user.username(),
                "password": password,
                "host": address.rsplit_once(':').map_or(address, |(host, _)| host),
                "port": MYSQL_PORT,
            }),
        };
        let program = format!(
            "import json\nimport os\nshell.connect({})\n{}\n",
            options, script
        );
        let command = vec![
            MYSQLSH_LOCATION.to_string(),
            "--no-wizard".to_string(),
            "--python".to_string(),
            "--file".to_string(),
            "/dev/stdin".to_string(),
        ];
        self.exec(command, program.as_bytes()).await
    }

    /// Run SQL statements as root over the local socket
    async fn run_sql(&self, statements: &[String]) -> Result<String, AdminError> {
        let script: String = statements
            .iter()
            .map(|statement| format!("session.run_sql({})\n", py(statement)))
            .collect();
        self.mysqlsh(SystemUser::Root, Endpoint::Socket, &script).await
    }

    /// Single-value query as root
    async fn query_value(&self, query: &str) -> Result<String, AdminError> {
        let script = format!("print(session.run_sql({}).fetch_one()[0])", py(query));
        let output = self.mysqlsh(SystemUser::Root, Endpoint::Socket, &script).await?;
        output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AdminError::Parse(format!("no result for {}", query)))
    }

    /// Cluster script run against this unit's instance as the cluster admin
    async fn cluster_script(&self, cluster_name: &str, body: &str) -> Result<String, AdminError> {
        let script = format!(
            "shell.connect_to_primary()\ncluster = dba.get_cluster({})\n{}",
            py(cluster_name),
            body
        );
        self.mysqlsh(
            SystemUser::ClusterAdmin,
            Endpoint::Address(&self.address),
            &script,
        )
        .await
    }

    fn xtrabackup_base() -> Vec<String> {
        vec![
            XTRABACKUP_LOCATION.to_string(),
            format!("--defaults-file={}", MYSQLD_DEFAULTS_CONFIG_FILE),
            format!("--xtrabackup-plugin-dir={}", XTRABACKUP_PLUGIN_DIR),
            format!("--socket={}", MYSQLD_SOCK_FILE),
        ]
    }
}

/// Script restoring a primary. With quorum the group elects its own primary
/// by member weight, so only a lost quorum is acted on.
fn election_script(cluster_name: &str, address: &str, password: &str) -> String {
    format!(
        r#"cluster = dba.get_cluster({name})
status = cluster.status()["defaultReplicaSet"]
if status["status"] == "NO_QUORUM":
    cluster.force_quorum_using_partition_of({uri}, {pw})
elif not any(m.get("mode") == "R/W" and m.get("status") == "ONLINE" for m in status["topology"].values()):
    raise Exception("primary election in progress")
"#,
        name = py(cluster_name),
        uri = py(&format!("{}@{}", CLUSTER_ADMIN_USERNAME, with_port(address))),
        pw = py(password),
    )
}

/// Shell script streaming a backup to stdout; the password reaches
/// `xtrabackup` through its environment
fn backup_script(password: &str, backup_id: &str, incremental_base: Option<&str>) -> String {
    let mut command = MysqlShellAdmin::xtrabackup_base();
    command.extend([
        "--backup".to_string(),
        "--stream=xbstream".to_string(),
        format!("--target-dir={}/xtrabackup-{}", TMP_DIR, backup_id),
        format!("--user={}", SystemUser::ServerConfig.username()),
        format!("--history={}", backup_id),
    ]);
    if let Some(base) = incremental_base {
        command.push(format!("--incremental-history-name={}", base));
    }
    let command: Vec<String> = command.iter().map(String::as_str).map(shell_escape).collect();
    format!(
        "MYSQL_PWD={} exec {}\n",
        shell_escape(password),
        command.join(" ")
    )
}

#[async_trait]
impl ClusterAdmin for MysqlShellAdmin {
    async fn create_cluster(
        &self,
        cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError> {
        let script = format!(
            "cluster = dba.create_cluster({name})\ncluster.set_instance_option({addr}, 'label', {label})\n",
            name = py(cluster_name),
            addr = py(&with_port(address)),
            label = py(&instance_label(unit)),
        );
        self.mysqlsh(SystemUser::ClusterAdmin, Endpoint::Address(address), &script)
            .await?;
        info!(cluster_name, unit, "Cluster created");
        Ok(())
    }

    async fn add_instance(
        &self,
        cluster_name: &str,
        unit: &str,
        address: &str,
    ) -> Result<(), AdminError> {
        let password = self.password(SystemUser::ClusterAdmin).await?;
        let body = format!(
            "cluster.add_instance({uri}, {{'password': {pw}, 'label': {label}, 'recoveryMethod': 'auto'}})\n",
            uri = py(&format!("{}@{}", CLUSTER_ADMIN_USERNAME, with_port(address))),
            pw = py(&password),
            label = py(&instance_label(unit)),
        );
        self.cluster_script(cluster_name, &body).await?;
        Ok(())
    }

    async fn remove_instance(
        &self,
        cluster_name: &str,
        address: &str,
        force: bool,
    ) -> Result<(), AdminError> {
        let password = self.password(SystemUser::ClusterAdmin).await?;
        let body = format!(
            "cluster.remove_instance({uri}, {{'password': {pw}, 'force': {force}}})\n",
            uri = py(&format!("{}@{}", CLUSTER_ADMIN_USERNAME, with_port(address))),
            pw = py(&password),
            force = if force { "True" } else { "False" },
        );
        self.cluster_script(cluster_name, &body).await?;
        Ok(())
    }

    async fn cluster_status(
        &self,
        cluster_name: &str,
    ) -> Result<Option<ClusterTopology>, AdminError> {
        let script = format!(
            r#"try:
    cluster = dba.get_cluster({name})
except Exception as e:
    print(json.dumps({{"error": str(e)}}))
else:
    status = cluster.status()
    topology = status["defaultReplicaSet"]["topology"]
    print(json.dumps({{"defaultreplicaset": {{"topology": {{
        label: {{"address": m.get("address", ""), "mode": m.get("mode", ""), "status": m.get("status", "")}}
        for label, m in topology.items()
    }}}}}}))
"#,
            name = py(cluster_name)
        );
        let output = self
            .mysqlsh(
                SystemUser::ClusterAdmin,
                Endpoint::Address(&self.address),
                &script,
            )
            .await?;
        let line = output
            .lines()
            .rev()
            .find(|line| line.trim_start().starts_with('{'))
            .ok_or_else(|| AdminError::Parse("cluster status printed no JSON".to_string()))?;
        let document: Value = serde_json::from_str(line)
            .map_err(|e| AdminError::Parse(format!("cluster status is not JSON: {}", e)))?;

        if let Some(error) = document.get("error").and_then(Value::as_str) {
            if NO_CLUSTER_MARKERS.iter().any(|marker| error.contains(marker)) {
                debug!(cluster_name, "No cluster found");
                return Ok(None);
            }
            return Err(classify(error));
        }

        let labelled = ClusterTopology::from_status(&document)?;
        let mut topology = ClusterTopology::new();
        for member in labelled.members() {
            topology.insert(UnitMember::new(
                &unit_from_label(&member.unit_id),
                &member.address,
                member.role,
                member.status,
            ));
        }
        Ok(Some(topology))
    }

    async fn elect_primary(&self, cluster_name: &str) -> Result<(), AdminError> {
        let password = self.password(SystemUser::ClusterAdmin).await?;
        let script = election_script(cluster_name, &self.address, &password);
        // No primary to connect to; any reachable member answers
        self.mysqlsh(
            SystemUser::ClusterAdmin,
            Endpoint::Address(&self.address),
            &script,
        )
        .await?;
        Ok(())
    }

    async fn configure_instance(&self, accounts: &[AdminAccount]) -> Result<(), AdminError> {
        let mut statements = Vec::new();
        for admin in accounts {
            statements.push(format!(
                "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {}",
                account(&admin.username),
                quote_string(&admin.password)
            ));
            statements.push(format!(
                "GRANT ALL ON *.* TO {} WITH GRANT OPTION",
                account(&admin.username)
            ));
        }
        self.run_sql(&statements).await?;

        let cluster_admin = accounts
            .iter()
            .find(|a| a.username == CLUSTER_ADMIN_USERNAME)
            .ok_or_else(|| {
                AdminError::InvalidArgument("cluster admin account missing".to_string())
            })?;
        let script = format!(
            "dba.configure_instance({uri}, {{'password': {pw}, 'restart': 'true'}})\n",
            uri = py(&format!("{}@{}", CLUSTER_ADMIN_USERNAME, with_port(&self.address))),
            pw = py(&cluster_admin.password),
        );
        self.mysqlsh(SystemUser::Root, Endpoint::Socket, &script).await?;
        info!(accounts = accounts.len(), "Instance configured");
        Ok(())
    }

    async fn create_scoped_user(
        &self,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AdminError> {
        if !super::sql::is_valid_database_name(database) {
            return Err(AdminError::InvalidArgument(format!(
                "invalid database name {:?}",
                database
            )));
        }
        self.run_sql(&scoped_user_statements(database, username, password))
            .await?;
        Ok(())
    }

    async fn drop_scoped_user(&self, username: &str) -> Result<(), AdminError> {
        self.run_sql(&[format!("DROP USER IF EXISTS {}", account(username))])
            .await?;
        Ok(())
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<(), AdminError> {
        let statement = format!(
            "ALTER USER {} IDENTIFIED BY {}",
            account(username),
            quote_string(password)
        );
        // The stored root password may already be the new one
        let (user, endpoint) = if username == ROOT_USERNAME {
            (SystemUser::ClusterAdmin, Endpoint::Address(self.address.as_str()))
        } else {
            (SystemUser::Root, Endpoint::Socket)
        };
        self.mysqlsh(user, endpoint, &format!("session.run_sql({})\n", py(&statement)))
            .await?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String, AdminError> {
        self.query_value("SELECT @@version").await
    }

    async fn data_dir_empty(&self) -> Result<bool, AdminError> {
        let excluded: Vec<String> = SYSTEM_SCHEMAS.iter().map(|s| quote_string(s)).collect();
        let count = self
            .query_value(&format!(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name NOT IN ({})",
                excluded.join(", ")
            ))
            .await?;
        let count: u64 = count
            .parse()
            .map_err(|_| AdminError::Parse(format!("schema count is not a number: {}", count)))?;
        Ok(count == 0)
    }

    async fn backup_to(
        &self,
        backup_id: &str,
        incremental_base: Option<&str>,
    ) -> Result<ByteStream, AdminError> {
        let password = self.password(SystemUser::ServerConfig).await?;
        let script = backup_script(&password, backup_id, incremental_base);

        let mut attached = self
            .pods
            .exec(
                &self.pod_name,
                vec!["sh".to_string(), "-s".to_string()],
                &Self::attach_params(),
            )
            .await?;
        if let Some(mut stdin) = attached.stdin() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let stdout = attached
            .stdout()
            .ok_or_else(|| AdminError::Transient("exec returned no stdout".to_string()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| AdminError::Transient("exec returned no stderr".to_string()))?;
        // xtrabackup logs heavily on stderr; drain it so stdout keeps flowing
        let stderr = tokio::spawn(read_stream(stderr));
        info!(backup_id, incremental_base, "Streaming backup");

        let completion = futures::stream::once(async move {
            let stderr = stderr
                .await
                .map_err(|e| AdminError::Transient(format!("stderr reader failed: {}", e)))??;
            Self::finish(attached, stderr).await
        })
        .filter_map(|result| async move { result.err().map(Err) });

        Ok(ReaderStream::new(stdout)
            .map_err(AdminError::from)
            .chain(completion)
            .boxed())
    }

    async fn restore_from(&self, chain: Vec<ByteStream>) -> Result<(), AdminError> {
        let restore_dir = format!("{}/restore", TMP_DIR);
        let parts = chain.len();
        if parts == 0 {
            return Err(AdminError::InvalidArgument("empty backup chain".to_string()));
        }

        self.exec(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("rm -rf {dir} && mkdir -p {dir}", dir = shell_escape(&restore_dir)),
            ],
            &[],
        )
        .await?;

        for (index, mut stream) in chain.into_iter().enumerate() {
            let target = format!("{}/{}", restore_dir, index);
            let command = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "mkdir -p {dir} && {xbstream} -x -C {dir}",
                    dir = shell_escape(&target),
                    xbstream = XBSTREAM_LOCATION
                ),
            ];
            let mut attached = self
                .pods
                .exec(&self.pod_name, command, &Self::attach_params())
                .await?;
            let mut stdin = attached
                .stdin()
                .ok_or_else(|| AdminError::Transient("exec returned no stdin".to_string()))?;
            let stderr = attached
                .stderr()
                .ok_or_else(|| AdminError::Transient("exec returned no stderr".to_string()))?;
            let stderr = tokio::spawn(read_stream(stderr));

            while let Some(chunk) = stream.next().await {
                stdin.write_all(&chunk?).await?;
            }
            stdin.shutdown().await?;
            let stderr = stderr
                .await
                .map_err(|e| AdminError::Transient(format!("stderr reader failed: {}", e)))??;
            Self::finish(attached, stderr).await?;
            debug!(part = index, "Extracted backup part");
        }

        let root_password = self.password(SystemUser::Root).await?;
        let base = shell_escape(&format!("{}/0", restore_dir));
        let xtrabackup = Self::xtrabackup_base()
            .into_iter()
            .map(|arg| shell_escape(&arg))
            .collect::<Vec<_>>()
            .join(" ");
        let mut script = vec!["set -e".to_string()];
        script.push(format!("{} --prepare --apply-log-only --target-dir={}", xtrabackup, base));
        for index in 1..parts {
            script.push(format!(
                "{} --prepare --apply-log-only --target-dir={} --incremental-dir={}",
                xtrabackup,
                base,
                shell_escape(&format!("{}/{}", restore_dir, index))
            ));
        }
        script.push(format!("{} --prepare --target-dir={}", xtrabackup, base));
        script.push(format!(
            "MYSQL_PWD={} mysqladmin --user={} --socket={} shutdown",
            shell_escape(&root_password),
            ROOT_USERNAME,
            MYSQLD_SOCK_FILE
        ));
        script.push(format!(
            "find {} -mindepth 1 -maxdepth 1 ! -name {} ! -name {} ! -name {} -exec rm -rf {{}} +",
            crate::constants::MYSQL_DATA_DIR,
            TLS_SSL_CA_FILE,
            TLS_SSL_CERT_FILE,
            TLS_SSL_KEY_FILE
        ));
        script.push(format!(
            "{} --copy-back --target-dir={} --datadir={}",
            xtrabackup,
            base,
            crate::constants::MYSQL_DATA_DIR
        ));
        script.push(format!("rm -rf {}", shell_escape(&restore_dir)));

        // Fed on stdin to keep the password off the command line
        self.exec(vec!["sh".to_string(), "-s".to_string()], script.join("\n").as_bytes())
            .await?;
        info!(parts, "Backup chain restored into the data directory");
        Ok(())
    }

    async fn reload_tls(&self) -> Result<(), AdminError> {
        let script = format!(
            r#"custom = [{ca}, {cert}, {key}]
datadir = session.run_sql("SELECT @@datadir").fetch_one()[0]
if all(os.path.exists(os.path.join(datadir, f)) for f in custom):
    files = custom
else:
    files = ["ca.pem", "server-cert.pem", "server-key.pem"]
session.run_sql("SET PERSIST ssl_ca = '" + files[0] + "'")
session.run_sql("SET PERSIST ssl_cert = '" + files[1] + "'")
session.run_sql("SET PERSIST ssl_key = '" + files[2] + "'")
session.run_sql("ALTER INSTANCE RELOAD TLS")
"#,
            ca = py(TLS_SSL_CA_FILE),
            cert = py(TLS_SSL_CERT_FILE),
            key = py(TLS_SSL_KEY_FILE),
        );
        self.mysqlsh(SystemUser::Root, Endpoint::Socket, &script).await?;
        info!("Engine reloaded TLS material");
        Ok(())
    }
}
