//! Schema migrations: compare the migrations shipped in the source tree with
//! the versions the database has recorded, and run the migration command
//! under the cluster-wide advisory lock only if something is pending.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tracing::{info, warn};

use crate::dblock::{DbLocker, MIGRATIONS_LOCK_KEY};
use crate::errors::{Result, SupervisorError};
use crate::process::RunOptions;
use crate::task::{OneShot, RunContext};

pub const TASK_NAME: &str = "migrations";

/// Relative to the app directory
pub const MIGRATIONS_SUBDIR: &str = "db/migrate";

static MIGRATION_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Za-z]+)_(.+)\.([^.]+)$").unwrap()
});

/// Identifier of every `<id>_<label>.<ext>` file directly in `dir`
pub fn scan_migrations(dir: &Path) -> Result<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(caps) = MIGRATION_FILE.captures(name) {
            ids.insert(caps[1].to_string());
        }
    }
    Ok(ids)
}

/// Ids on disk that the database has not recorded
pub fn pending(on_disk: &BTreeSet<String>, applied: &HashSet<String>) -> BTreeSet<String> {
    on_disk
        .iter()
        .filter(|id| !applied.contains(*id))
        .cloned()
        .collect()
}

/// Versions listed in `schema_migrations`
pub async fn applied_versions(options: &PgConnectOptions) -> Result<HashSet<String>> {
    let mut conn = PgConnection::connect_with(options).await?;
    let rows = sqlx::query_scalar::<_, String>("SELECT version FROM schema_migrations")
        .fetch_all(&mut conn)
        .await;
    let _ = conn.close().await;
    Ok(rows?.into_iter().collect())
}

/// One-shot task bringing the app's schema up to date
#[derive(Debug, Clone)]
pub struct Migrations {
    /// App directory, relative to the source tree
    pub app_dir: PathBuf,
    pub depends: Vec<String>,
    /// Run when the schema table cannot be read outside production
    pub setup_command: Vec<String>,
    pub migrate_command: Vec<String>,
}

impl Migrations {
    pub fn new(app_dir: impl Into<PathBuf>, depends: Vec<String>) -> Self {
        Self {
            app_dir: app_dir.into(),
            depends,
            setup_command: rake("db:setup"),
            migrate_command: rake("db:migrate"),
        }
    }

    async fn run_command(&self, ctx: &RunContext, command: &[String]) -> Result<()> {
        let Some((program, args)) = command.split_first() else {
            return Err(SupervisorError::Config("empty migration command".to_string()));
        };
        ctx.run_program(&self.app_dir, RunOptions::new(), program, args)
            .await
    }
}

fn rake(target: &str) -> Vec<String> {
    ["bundle", "exec", "rake", target]
        .into_iter()
        .map(String::from)
        .collect()
}

#[async_trait]
impl OneShot for Migrations {
    fn name(&self) -> String {
        TASK_NAME.to_string()
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        let dir = ctx
            .runner()
            .resolve_dir(&self.app_dir)
            .join(MIGRATIONS_SUBDIR);
        let on_disk = scan_migrations(&dir)?;
        let options = ctx.cluster().postgresql.connection.connect_options()?;

        let applied = tokio::select! {
            _ = ctx.token().cancelled() => return Err(SupervisorError::Cancelled),
            applied = applied_versions(&options) => applied,
        };
        let applied = match applied {
            Ok(applied) => applied,
            Err(err) if !ctx.setup().cluster_type.is_production() => {
                warn!(error = %err, "cannot read schema_migrations; running first-time setup");
                return self.run_command(ctx, &self.setup_command).await;
            }
            Err(err) => return Err(err),
        };

        let todo = pending(&on_disk, &applied);
        if todo.is_empty() {
            info!(on_disk = on_disk.len(), "no pending migrations");
            return Ok(());
        }
        info!(pending = todo.len(), "running migrations");

        let lock = DbLocker::new(MIGRATIONS_LOCK_KEY);
        lock.lock(ctx.token(), &options).await?;
        let result = self.run_command(ctx, &self.migrate_command).await;
        if let Err(err) = lock.unlock().await {
            warn!(error = %err, "error releasing migrations lock");
        }
        result
    }
}
