//! A throwaway PostgreSQL server for `-own-temporary-database` runs.
//!
//! Without that flag the database is external and this task is ready at
//! once.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::certs;
use crate::config::join_host_port;
use crate::errors::{Result, SupervisorError};
use crate::logs::LogSink;
use crate::process::RunOptions;
use crate::task::{RunContext, Service, ServiceLaunch};

pub const TASK_NAME: &str = "postgresql";

/// PostgreSQL refuses to run as root, so a root supervisor uses this account
pub const POSTGRES_USER: &str = "postgres";

#[derive(Debug, Clone, Default)]
pub struct PostgreSql;

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

fn run_options() -> RunOptions {
    if running_as_root() {
        RunOptions::new().user(POSTGRES_USER)
    } else {
        RunOptions::new()
    }
}

fn data_dir(ctx: &RunContext) -> PathBuf {
    ctx.setup().temp_dir.join("pgdata")
}

/// Hand `path` to the postgres account when running as root
fn chown_for_postgres(path: &Path) -> Result<()> {
    if !running_as_root() {
        return Ok(());
    }
    let user = flotilla_unix::users::resolve_user(POSTGRES_USER, None)?;
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(user.uid)),
        Some(nix::unistd::Gid::from_raw(user.gid)),
    )
    .map_err(|e| SupervisorError::Io(e.into()))
}

/// Copy the server certificate and key into the data dir, where `ssl = on`
/// expects them
fn install_tls_files(ctx: &RunContext, datadir: &Path) -> Result<()> {
    let paths = certs::CertPaths::in_dir(&ctx.setup().temp_dir);
    for (src, name) in [(&paths.server_cert, "server.crt"), (&paths.server_key, "server.key")] {
        let dst = datadir.join(name);
        std::fs::copy(src, &dst)?;
        std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o600))?;
        chown_for_postgres(&dst)?;
    }
    Ok(())
}

async fn pg_bindir(ctx: &RunContext) -> Result<PathBuf> {
    let (sink, buf) = LogSink::capture();
    ctx.run_program(".", RunOptions::new().output(sink), "pg_config", &["--bindir"])
        .await?;
    let dir = buf.contents().trim().to_string();
    if dir.is_empty() {
        return Err(SupervisorError::Config("pg_config --bindir: empty output".to_string()));
    }
    Ok(PathBuf::from(dir))
}

/// Quote `s` as an SQL string literal
fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quote `s` as an SQL identifier
fn sql_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[async_trait]
impl Service for PostgreSql {
    fn name(&self) -> String {
        TASK_NAME.to_string()
    }

    fn depends(&self) -> Vec<String> {
        vec![certs::TASK_NAME.to_string()]
    }

    async fn prepare(&self, ctx: &RunContext) -> Result<Vec<ServiceLaunch>> {
        if !ctx.setup().options.own_temporary_database {
            return Ok(Vec::new());
        }
        let conn = &ctx.cluster().postgresql.connection;
        let bindir = pg_bindir(ctx).await?;
        let datadir = data_dir(ctx);
        std::fs::create_dir_all(&datadir)?;
        std::fs::set_permissions(&datadir, std::fs::Permissions::from_mode(0o700))?;
        chown_for_postgres(&datadir)?;

        let datadir_arg = datadir.display().to_string();
        ctx.run_program(
            &ctx.setup().temp_dir,
            run_options(),
            &bindir.join("initdb").display().to_string(),
            &["-D", datadir_arg.as_str(), "-E", "utf8"],
        )
        .await?;
        install_tls_files(ctx, &datadir)?;

        let socket_dir = ctx.setup().temp_dir.display().to_string();
        let launch = ServiceLaunch::new(
            &ctx.setup().temp_dir,
            bindir.join("postgres").display().to_string(),
            [
                "-l",
                "-k",
                socket_dir.as_str(),
                "-D",
                datadir_arg.as_str(),
                "-h",
                conn.host.as_str(),
                "-p",
                conn.port.as_str(),
            ],
        )
        .options(run_options())
        .ready_probe(join_host_port(&conn.host, &conn.port));
        Ok(vec![launch])
    }

    /// Create the cluster's role and database on the fresh server
    async fn started(&self, ctx: &RunContext) -> Result<()> {
        if !ctx.setup().options.own_temporary_database {
            return Ok(());
        }
        let conn = &ctx.cluster().postgresql.connection;
        let statements = [
            format!(
                "CREATE ROLE {} WITH SUPERUSER LOGIN PASSWORD {}",
                sql_ident(&conn.user),
                sql_literal(&conn.password)
            ),
            format!(
                "CREATE DATABASE {} WITH OWNER {} TEMPLATE template0 ENCODING 'utf8'",
                sql_ident(&conn.dbname),
                sql_ident(&conn.user)
            ),
        ];
        for sql in statements {
            ctx.run_program(
                &ctx.setup().temp_dir,
                run_options(),
                "psql",
                &[
                    "--host",
                    conn.host.as_str(),
                    "--port",
                    conn.port.as_str(),
                    "--dbname",
                    "postgres",
                    "--command",
                    sql.as_str(),
                ],
            )
            .await?;
        }
        info!(database = %conn.dbname, user = %conn.user, "created owned database");
        Ok(())
    }
}
