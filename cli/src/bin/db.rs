use berth_cli::{Error, tracing::Tracing, util::ui::UI};
use berth_config::{Config, DatabaseConfig, Environment, load_config, parse_env};
use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, MySql};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use time::OffsetDateTime;
use url::Url;

#[tokio::main]
async fn main() -> ExitCode {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    let args = Cli::parse();
    let mut ui = UI::new(&mut stdout, &mut stderr, !args.no_color, !args.quiet);

    match cli(&mut ui, args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            ui.error(e.to_string().as_str(), &e.into());
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "A CLI tool to manage the session database.", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Choose the environment (development, test, production).", value_parser = parse_env, default_value = "development")]
    env: Environment,

    #[arg(long, global = true, help = "Disable colored output.")]
    no_color: bool,

    #[arg(long, global = true, help = "Disable debug output.")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Drop the database")]
    Drop,
    #[command(about = "Create the database")]
    Create,
    #[command(about = "Migrate the database")]
    Migrate,
    #[command(about = "Reset (drop, create, migrate) the database")]
    Reset,
    #[command(about = "Delete expired session rows")]
    Sweep,
}

#[allow(missing_docs)]
async fn cli(ui: &mut UI<'_>, cli: Cli) -> Result<(), Error> {
    let config: Result<Config, berth_config::Error> = load_config(&cli.env);
    match config {
        Ok(config) => {
            Tracing::init(&config.tracing);
            match cli.command {
                Commands::Drop => {
                    ui.info(&format!("Dropping {} database…", &cli.env));
                    let db_name = drop(&config.database)
                        .await
                        .context("Could not drop database!")?;
                    ui.success(&format!("Dropped database {} successfully.", db_name));
                    Ok(())
                }
                Commands::Create => {
                    ui.info(&format!("Creating {} database…", &cli.env));
                    let db_name = create(&config.database)
                        .await
                        .context("Could not create database!")?;
                    ui.success(&format!("Created database {} successfully.", db_name));
                    Ok(())
                }
                Commands::Migrate => {
                    ui.info(&format!("Migrating {} database…", &cli.env));
                    ui.indent();
                    let migrations = migrate(ui, &config.database)
                        .await
                        .context("Could not migrate database!");
                    ui.outdent();
                    let migrations = migrations?;
                    ui.success(&format!("{} migrations applied.", migrations));
                    Ok(())
                }
                Commands::Reset => {
                    ui.info(&format!("Resetting {} database…", &cli.env));
                    ui.indent();
                    let result = reset(ui, &config.database)
                        .await
                        .context("Could not reset the database!");
                    ui.outdent();
                    let db_name = result?;
                    ui.success(&format!("Reset database {} successfully.", db_name));
                    Ok(())
                }
                Commands::Sweep => {
                    ui.info(&format!(
                        "Sweeping expired sessions from the {} database…",
                        &cli.env
                    ));
                    let deleted = sweep(&config.database)
                        .await
                        .context("Could not sweep expired sessions!")?;
                    ui.success(&format!("Removed {} expired session(s).", deleted));
                    Ok(())
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn drop(config: &DatabaseConfig) -> Result<String, Error> {
    let db_name = get_db_name(config);

    MySql::drop_database(&config.url)
        .await
        .context("Failed to drop the database!")?;

    Ok(db_name)
}

async fn create(config: &DatabaseConfig) -> Result<String, Error> {
    let db_name = get_db_name(config);

    if !MySql::database_exists(&config.url).await? {
        MySql::create_database(&config.url).await?;
    }

    Ok(db_name)
}

async fn migrate(ui: &mut UI<'_>, config: &DatabaseConfig) -> Result<i32, Error> {
    let db_config = get_db_config(config);
    let migrations_path = store_package_root()?.join("migrations");
    let migrator = Migrator::new(Path::new(&migrations_path))
        .await
        .context("Failed to create migrator!")?;
    let mut connection = db_config
        .connect()
        .await
        .context("Failed to connect to database!")?;

    connection
        .ensure_migrations_table()
        .await
        .context("Failed to ensure migrations table!")?;

    let applied_migrations: HashMap<_, _> = connection
        .list_applied_migrations()
        .await
        .context("Failed to list applied migrations!")?
        .into_iter()
        .map(|m| (m.version, m))
        .collect();

    let mut applied = 0;
    for migration in migrator.iter() {
        if !applied_migrations.contains_key(&migration.version) {
            connection
                .apply(migration)
                .await
                .context("Failed to apply migration {}!")?;
            ui.log(&format!("Applied migration {}.", migration.version));
            applied += 1;
        }
    }

    Ok(applied)
}

async fn reset(ui: &mut UI<'_>, config: &DatabaseConfig) -> Result<String, Error> {
    ui.log("Dropping database…");
    drop(config).await?;
    ui.log("Recreating database…");
    let db_name = create(config).await?;
    ui.log("Migrating database…");
    ui.indent();
    let migration_result = migrate(ui, config).await;
    ui.outdent();

    match migration_result {
        Ok(_) => Ok(db_name),
        Err(e) => Err(e),
    }
}

/// Delete all session rows that expired before now. The same statement the
/// store's deferred collector runs, callable from cron or by hand.
async fn sweep(config: &DatabaseConfig) -> Result<u64, Error> {
    let mut connection = get_db_client(config).await;
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let result = sqlx::query("DELETE FROM sessions WHERE expiration < ?")
        .bind(now)
        .execute(&mut connection)
        .await?;

    Ok(result.rows_affected())
}

fn get_db_name(config: &DatabaseConfig) -> String {
    let db_url = Url::parse(&config.url).expect("Invalid DATABASE_URL!");
    db_url.path().trim_start_matches('/').to_string()
}

fn get_db_config(config: &DatabaseConfig) -> MySqlConnectOptions {
    let db_url = Url::parse(&config.url).expect("Invalid DATABASE_URL!");
    ConnectOptions::from_url(&db_url).expect("Invalid DATABASE_URL!")
}

async fn get_db_client(config: &DatabaseConfig) -> MySqlConnection {
    let db_config = get_db_config(config);
    let connection: MySqlConnection = Connection::connect_with(&db_config).await.unwrap();
    connection
}

/// Find the root of the store package in the berth workspace.
fn store_package_root() -> Result<PathBuf, Error> {
    Ok(PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR")
            .wrap_err("This command needs to be invoked using cargo")?,
    )
    .join("..")
    .join("store")
    .canonicalize()?)
}
