use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context as _, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use clap::{Parser, ValueEnum};

use autograph::formats::new_reference;
use autograph::hawk::{build_authorization_header, RequestInfo};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Route {
    Data,
    File,
    Hash,
}

impl Route {
    fn path(&self) -> &'static str {
        match self {
            Route::Data => "/sign/data",
            Route::File => "/sign/file",
            Route::Hash => "/sign/hash",
        }
    }
}

/// Hawk-signs one request against a running autograph service and
/// prints the response.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "http://127.0.0.1:8000")]
    target: String,
    #[clap(long, env = "HAWK_ID")]
    id: String,
    #[clap(long, env = "HAWK_KEY")]
    key: String,
    #[clap(long, value_enum, default_value = "data")]
    route: Route,
    /// Inline payload; base64-encoded for data/file, hex for hash.
    #[clap(long, conflicts_with = "infile")]
    data: Option<String>,
    /// Read the payload from a file instead.
    #[clap(long)]
    infile: Option<std::path::PathBuf>,
    /// Target signer; the principal's default when absent.
    #[clap(long)]
    keyid: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let input = match (&args.data, &args.infile) {
        (Some(data), None) => data.clone(),
        (None, Some(path)) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match args.route {
                Route::Hash => hex::encode(raw),
                _ => B64.encode(raw),
            }
        }
        _ => bail!("exactly one of --data or --infile is required"),
    };

    let mut task = serde_json::json!({ "input": input });
    if let Some(keyid) = &args.keyid {
        task["keyid"] = serde_json::Value::String(keyid.clone());
    }
    let body = serde_json::to_vec(&vec![task])?;

    let target = reqwest::Url::parse(&args.target).context("invalid target URL")?;
    let host = target.host_str().context("target URL has no host")?;
    let port = target
        .port_or_known_default()
        .context("target URL has no port")?;
    let path = args.route.path();

    let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
    let authorization = build_authorization_header(
        &args.id,
        &args.key,
        &RequestInfo {
            method: "POST",
            path,
            host,
            port,
            content_type: "application/json",
            body: &body,
        },
        ts,
        &new_reference(),
        "",
    );

    let url = target.join(path)?;
    let response = reqwest::Client::new()
        .post(url)
        .header(reqwest::header::AUTHORIZATION, authorization)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    println!("{status}\n{text}");
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
