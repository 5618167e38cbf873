//! CLI commands

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use farmreg_core::ClientConfig;
use farmreg_http::{CallOptions, Credentials, FarmRegClient, Method, Session};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_FILE: &str = "config.toml";
const SESSION_FILE: &str = "session.json";

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the session
    Login {
        #[command(subcommand)]
        command: LoginCommands,
    },

    /// End the stored session
    Logout,

    /// Show the signed-in user as reported by the backend
    Whoami {
        /// Only read the stored session, without contacting the backend
        #[arg(long)]
        local: bool,
    },

    /// Print the stored session
    Session {
        /// Include raw tokens in the output
        #[arg(long)]
        show_tokens: bool,
    },

    /// Check the stored session against one or more roles
    Authorize {
        /// Roles that grant access (any one is enough)
        #[arg(required = true)]
        roles: Vec<String>,
    },

    /// Issue an API call with the stored session
    Call {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the base URL, e.g. /farmers
        path: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,

        /// Send without the access token
        #[arg(long)]
        no_auth: bool,
    },

    /// Client configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum LoginCommands {
    /// Administrator login with email and password
    Admin {
        username: String,

        #[arg(long, env = "FARMREG_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Extension officer login
    Operator {
        username: String,

        #[arg(long, env = "FARMREG_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Farmer login with NRC number and date of birth
    Farmer {
        nrc: String,

        /// Date of birth as YYYY-MM-DD
        #[arg(long)]
        dob: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Generate a configuration file
    Init {
        /// Output file path (defaults to DATA_DIR/config.toml)
        output: Option<PathBuf>,

        /// Registry API base URL
        #[arg(long)]
        base_url: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

impl Commands {
    pub async fn execute(self, data_dir: PathBuf, config_file: Option<PathBuf>) -> Result<()> {
        let config_file = config_file.as_deref();

        match self {
            Commands::Config { command } => command.execute(&data_dir, config_file),
            Commands::Login { command } => {
                let client = connect(&data_dir, config_file)?;
                login(&client, command.into_credentials()).await
            }
            Commands::Logout => {
                connect(&data_dir, config_file)?.logout().await;
                println!("Logged out");
                Ok(())
            }
            Commands::Whoami { local } => whoami(&connect(&data_dir, config_file)?, local).await,
            Commands::Session { show_tokens } => {
                show_session(&connect(&data_dir, config_file)?, show_tokens)
            }
            Commands::Authorize { roles } => authorize(&connect(&data_dir, config_file)?, &roles),
            Commands::Call {
                method,
                path,
                data,
                no_auth,
            } => {
                let client = connect(&data_dir, config_file)?;
                call(&client, &method, &path, data.as_deref(), no_auth).await
            }
        }
    }
}

impl LoginCommands {
    fn into_credentials(self) -> Credentials {
        match self {
            LoginCommands::Admin { username, password } => {
                Credentials::password(username, password)
            }
            LoginCommands::Operator { username, password } => {
                Credentials::Operator { username, password }
            }
            LoginCommands::Farmer { nrc, dob } => Credentials::Farmer {
                nrc,
                date_of_birth: dob,
            },
        }
    }
}

impl ConfigCommands {
    pub fn execute(self, data_dir: &Path, config_file: Option<&Path>) -> Result<()> {
        match self {
            ConfigCommands::Init {
                output,
                base_url,
                force,
            } => {
                let config_path = output.unwrap_or_else(|| data_dir.join(CONFIG_FILE));
                if config_path.exists() && !force {
                    bail!(
                        "{} already exists, pass --force to overwrite",
                        config_path.display()
                    );
                }

                let mut config = ClientConfig::default();
                if let Some(base_url) = base_url {
                    config.base_url = base_url;
                }
                config.validate()?;
                config.save(&config_path)?;

                println!("Generated configuration at: {}", config_path.display());
                Ok(())
            }
            ConfigCommands::Show => {
                let config = load_config(data_dir, config_file)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

/// Load the client configuration, defaulting session storage to the data dir
fn load_config(data_dir: &Path, config_file: Option<&Path>) -> Result<ClientConfig> {
    let default_file = data_dir.join(CONFIG_FILE);
    let path = config_file.or_else(|| default_file.exists().then_some(default_file.as_path()));

    let mut config = ClientConfig::load(path)
        .with_context(|| format!("failed to load configuration from {path:?}"))?;
    if config.storage_path.is_none() {
        config.storage_path = Some(data_dir.join(SESSION_FILE));
    }
    Ok(config)
}

fn connect(data_dir: &Path, config_file: Option<&Path>) -> Result<FarmRegClient> {
    let config = load_config(data_dir, config_file)?;
    Ok(FarmRegClient::from_config(&config)?)
}

async fn login(client: &FarmRegClient, credentials: Credentials) -> Result<()> {
    let session = client.login_with(credentials).await?;
    let user = session
        .user
        .as_ref()
        .map_or("<unknown>", |u| u.display_name.as_str());

    info!(user, "Session stored");
    println!("Logged in as {user} (roles: {})", format_roles(&session));
    Ok(())
}

async fn whoami(client: &FarmRegClient, local: bool) -> Result<()> {
    if local {
        let session = client.session().context("not logged in")?;
        let user = session.user.context("stored session carries no user")?;
        println!("{}", serde_json::to_string_pretty(&user)?);
        return Ok(());
    }

    let user = client.me().await?;
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

fn show_session(client: &FarmRegClient, show_tokens: bool) -> Result<()> {
    let Some(session) = client.session() else {
        println!("Not logged in");
        return Ok(());
    };

    let mut summary = json!({
        "user": session.user,
        "issued_at": session.issued_at,
        "has_refresh_token": session.refresh_token.is_some(),
    });
    if show_tokens {
        summary["access_token"] = json!(session.access_token);
        summary["refresh_token"] = json!(session.refresh_token);
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn authorize(client: &FarmRegClient, roles: &[String]) -> Result<()> {
    let required: Vec<&str> = roles.iter().map(String::as_str).collect();
    let user = client.authorize(&required)?;
    println!("Access granted to {} ({})", user.display_name, user.roles.join(", "));
    Ok(())
}

async fn call(
    client: &FarmRegClient,
    method: &str,
    path: &str,
    data: Option<&str>,
    no_auth: bool,
) -> Result<()> {
    let method = parse_method(method)?;
    let body = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--data is not valid JSON")?;

    let mut options = CallOptions::default();
    if no_auth {
        options = options.without_auth();
    }

    let response = client.call(method, path, body, options).await?;
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method: {method}"))
}

fn format_roles(session: &Session) -> String {
    if session.roles().is_empty() {
        "none".to_string()
    } else {
        session.roles().join(", ")
    }
}
