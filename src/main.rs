//! campus-cli - command-line client for the campus school-management API

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use campus_cli::api::ApiRequest;
use campus_cli::{auth, ApiClient, ApiError, Config, FileTokenStore, Resource};

#[derive(Parser)]
#[command(name = "campus-cli")]
#[command(about = "Command-line client for the campus school-management API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server origin (overrides config file)
    #[arg(long, global = true)]
    server: Option<String>,

    /// API path prefix (overrides config file)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Credentials file (default: platform data directory)
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the token pair
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Password (read from stdin if omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Clear stored credentials
    Logout,

    /// Show stored session status
    Status,

    /// List a resource collection
    List {
        /// students, parents, teachers, classes, enrollments, grades,
        /// attendance, invoices, payments, fees, announcements, messages, terms
        resource: Resource,

        /// Filter as key=value (repeatable)
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },

    /// Show one record
    Show { resource: Resource, id: String },

    /// Create a record from a JSON body
    Create { resource: Resource, body: String },

    /// Replace a record with a JSON body
    Update {
        resource: Resource,
        id: String,
        body: String,
    },

    /// Delete a record
    Delete { resource: Resource, id: String },

    /// Send a raw request relative to the API base
    Request {
        /// HTTP method
        method: String,

        /// Path, e.g. /students?classId=3
        path: String,

        /// JSON body
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let client = build_client(&cli)?;

    match cli.command {
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            auth::login(&client, &email, &password)
                .await
                .map_err(explain)?;
            println!("Login successful.");
        }
        Commands::Logout => {
            auth::logout(&client);
            println!("Logged out.");
        }
        Commands::Status => {
            let status = auth::status(&client);
            println!("Server:      {}", client.base_url());
            println!("{}", status);
            if !status.can_authenticate() {
                println!("\nRun 'campus-cli login' to authenticate.");
            }
        }
        Commands::List { resource, filters } => {
            let filters = parse_filters(&filters)?;
            let filters: Vec<(&str, &str)> =
                filters.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let value = client
                .resource(resource)
                .list(&filters)
                .await
                .map_err(explain)?;
            print_json(&value)?;
        }
        Commands::Show { resource, id } => {
            let value = client.resource(resource).fetch(&id).await.map_err(explain)?;
            print_json(&value)?;
        }
        Commands::Create { resource, body } => {
            let body = parse_body(&body)?;
            let value = client
                .resource(resource)
                .create(&body)
                .await
                .map_err(explain)?;
            print_json(&value)?;
        }
        Commands::Update { resource, id, body } => {
            let body = parse_body(&body)?;
            let value = client
                .resource(resource)
                .update(&id, &body)
                .await
                .map_err(explain)?;
            print_json(&value)?;
        }
        Commands::Delete { resource, id } => {
            let value = client.resource(resource).remove(&id).await.map_err(explain)?;
            print_json(&value)?;
        }
        Commands::Request { method, path, data } => {
            raw_request(&client, &method, &path, data.as_deref()).await?;
        }
    }

    Ok(())
}

fn build_client(cli: &Cli) -> Result<ApiClient> {
    let mut config = Config::load()?;
    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.clone();
    }

    let store = match &cli.credentials {
        Some(path) => FileTokenStore::open(path)?,
        None => FileTokenStore::open_default()?,
    };
    tracing::debug!("Credentials file: {}", store.path().display());

    ApiClient::from_config(&config, Arc::new(store)).context("Invalid configuration")
}

/// Attach a next step to session errors.
fn explain(err: ApiError) -> anyhow::Error {
    if err.is_auth_rejected() {
        anyhow::Error::new(err).context("Not logged in or session expired. Run 'campus-cli login'.")
    } else {
        anyhow::Error::new(err)
    }
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    io::stderr().flush().ok();

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

fn parse_filters(filters: &[String]) -> Result<Vec<(String, String)>> {
    filters
        .iter()
        .map(|f| match f.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => bail!("Filter must be key=value, got '{}'", f),
        })
        .collect()
}

fn parse_body(body: &str) -> Result<Value> {
    serde_json::from_str(body).context("Body is not valid JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn raw_request(client: &ApiClient, method: &str, path: &str, data: Option<&str>) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid HTTP method '{}'", method))?;

    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let pairs: Vec<(String, String)> = query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let mut request = ApiRequest::new(method, path).query(&pairs);
    if let Some(data) = data {
        request = request.json(&parse_body(data)?)?;
    }

    let resp = client.send(request).await.map_err(explain)?;
    let status = resp.status();
    let text = resp.text().await.context("Failed to read response body")?;
    tracing::debug!("HTTP {}", status.as_u16());

    match serde_json::from_str::<Value>(&text) {
        Ok(value) => print_json(&value)?,
        Err(_) if !text.is_empty() => println!("{}", text),
        Err(_) => {}
    }
    Ok(())
}
