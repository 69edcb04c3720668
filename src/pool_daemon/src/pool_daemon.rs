use crate::admin::{AdminShell, FaultStatus};
use crate::config::PoolDaemonConfig;
use log::{error, info};
use pool_lib::{LocalNamespace, PoolError, PoolResult};
use pool_p2p::CompanionRegistry;
use replica_store::{FileStore, Repository, SqliteMetaStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct PoolDaemonRunOptions {
    pub config_path: PathBuf,
}

/// A pool: its repository, the companions copying into it and the admin
/// interpreter.
pub struct PoolDaemon {
    repository: Arc<Repository>,
    namespace: Arc<LocalNamespace>,
    registry: Arc<CompanionRegistry>,
    shell: AdminShell,
}

impl PoolDaemon {
    pub async fn open(config: &PoolDaemonConfig) -> PoolResult<Self> {
        std::fs::create_dir_all(&config.base_dir).map_err(|e| {
            PoolError::DiskError(format!(
                "create {} failed: {}",
                config.base_dir.display(),
                e
            ))
        })?;

        let meta = Arc::new(SqliteMetaStore::new(&config.meta_db_path())?);
        let files = FileStore::new(&config.data_dir())?;
        let namespace = Arc::new(LocalNamespace::new());
        let repository = Repository::new(
            config.repository_config()?,
            meta,
            files,
            namespace.clone(),
        );
        let faults = Arc::new(FaultStatus::default());
        repository.add_fault_listener(faults.clone());

        repository.init()?;
        repository.load().await?;
        info!(
            "PoolDaemon: pool {} open at {}",
            config.pool_name,
            config.base_dir.display()
        );

        let registry = Arc::new(CompanionRegistry::new(
            repository.clone(),
            namespace.clone(),
            config.companion.clone(),
        ));
        let shell = AdminShell::new(repository.clone(), registry.clone(), faults);
        Ok(Self {
            repository,
            namespace,
            registry,
            shell,
        })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn namespace(&self) -> &Arc<LocalNamespace> {
        &self.namespace
    }

    pub fn registry(&self) -> &Arc<CompanionRegistry> {
        &self.registry
    }

    pub async fn execute(&self, command: &str) -> PoolResult<String> {
        self.shell.execute(command).await
    }

    pub async fn shutdown(&self) -> PoolResult<()> {
        self.registry.cancel_all("pool shutdown");
        self.repository.shutdown().await
    }
}

/// Reads admin commands from stdin until `quit`, end of input or ctrl-c.
async fn serve_admin(daemon: &PoolDaemon) -> PoolResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("PoolDaemon: interrupted");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let command = line.trim();
        if command == "quit" || command == "exit" {
            break;
        }

        let mut reply = match daemon.execute(command).await {
            Ok(reply) => reply,
            Err(e) => format!("error: {}", e),
        };
        if !reply.is_empty() && !reply.ends_with('\n') {
            reply.push('\n');
        }
        stdout.write_all(reply.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

pub fn run_pool_daemon(options: PoolDaemonRunOptions) -> PoolResult<()> {
    let config = PoolDaemonConfig::load(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| PoolError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let daemon = PoolDaemon::open(&config).await?;
        let served = serve_admin(&daemon).await;
        if let Err(e) = &served {
            error!("PoolDaemon: admin loop failed: {}", e);
        }
        let closed = daemon.shutdown().await;
        served.and(closed)
    })
}
