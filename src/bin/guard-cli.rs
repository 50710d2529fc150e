use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for the edge guard admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081", env = "EDGE_GUARD_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "EDGE_GUARD_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check guard status
    Status,
    /// Show aggregated security metrics
    Metrics,
    /// List security events, newest first
    Events {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// low, medium, high or critical
        #[arg(long)]
        severity: Option<String>,
        /// Event type, e.g. rate_limit_exceeded
        #[arg(long = "type")]
        event_type: Option<String>,
    },
    /// Show the block record for an identity
    Block { identity: String },
    /// Lift the block on an identity
    Unblock { identity: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match cli.command {
        Commands::Status => client.get(format!("{base}/admin/status")),
        Commands::Metrics => client.get(format!("{base}/admin/security/metrics")),
        Commands::Events {
            offset,
            limit,
            severity,
            event_type,
        } => {
            let mut query = vec![("offset", offset.to_string()), ("limit", limit.to_string())];
            if let Some(severity) = severity {
                query.push(("severity", severity));
            }
            if let Some(event_type) = event_type {
                query.push(("type", event_type));
            }
            client.get(format!("{base}/admin/security/events")).query(&query)
        }
        Commands::Block { identity } => client.get(format!(
            "{base}/admin/security/blocks/{}",
            urlencoding::encode(&identity)
        )),
        Commands::Unblock { identity } => client.delete(format!(
            "{base}/admin/security/blocks/{}",
            urlencoding::encode(&identity)
        )),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
