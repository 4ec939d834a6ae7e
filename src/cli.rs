use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use netops::operation::data::ProgressHandler;
use netops::{
    Completion, CompletionDispatcher, Credential, DataProgress, DataTaskOperation,
    HttpTransport, HttpTransportConfig, OperationInfo, RegisteredOperation, SessionConfig,
    SessionManager,
};

#[derive(Parser, Debug)]
#[command(
    name = "netops",
    version,
    about = "Fetch URLs through a netops session manager"
)]
pub struct FetchArgs {
    /// URLs to fetch
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Session config file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Cap on concurrent transfers
    #[arg(short = 'j', long)]
    pub max_concurrent: Option<usize>,

    /// Directory to write response bodies into
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Credential for Basic authentication challenges, as user:password
    #[arg(short, long)]
    pub user: Option<String>,

    /// Accept invalid certificates and host name mismatches
    #[arg(short = 'k', long, default_value_t = false)]
    pub insecure: bool,

    /// Print operation snapshots as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Outcome of one fetch, reported after completion
struct FetchOutcome {
    url: String,
    completion: Completion,
    info: Option<OperationInfo>,
}

/// Load and override configuration from the command line
fn load_config(args: &FetchArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_operations = Some(max);
    }
    if args.insecure {
        config.security.allow_invalid_certificates = true;
        config.security.validates_domain_name = false;
    }
    Ok(config)
}

fn parse_credential(user: &str) -> Credential {
    match user.split_once(':') {
        Some((name, password)) => Credential::password(name, password),
        None => Credential::password(user, ""),
    }
}

/// File name for a URL's body: last path segment, or `index`
fn output_name(index: usize, url: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "index".to_string());
    format!("{}-{}", index, segment)
}

async fn write_body(dir: &Path, name: &str, body: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Fetch every URL through one manager; returns whether all succeeded
pub async fn run(args: FetchArgs) -> Result<bool> {
    let config = load_config(&args)?;
    let runtime = Handle::current();

    let transport = HttpTransport::new(HttpTransportConfig::from(&config), runtime.clone())
        .context("Failed to create HTTP transport")?;
    let manager = SessionManager::from_config(&config, transport)
        .context("Invalid session configuration")?;
    manager.set_dispatcher(CompletionDispatcher::on_runtime("netops.cli", &runtime));
    if let Some(user) = &args.user {
        manager.set_credential(Some(parse_credential(user)));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Completion)>();
    let mut operations: Vec<(String, Option<Arc<DataTaskOperation>>)> = Vec::new();
    let mut all_ok = true;

    for (index, url) in args.urls.iter().enumerate() {
        let progress_url = url.clone();
        let progress: ProgressHandler = Arc::new(move |_: &DataTaskOperation, p: DataProgress| {
            match p.fraction() {
                Some(fraction) => debug!("{}: {:.0}%", progress_url, fraction * 100.0),
                None => debug!("{}: {} bytes", progress_url, p.received),
            }
        });
        let tx = tx.clone();
        match manager.data_operation_with_url(url, Some(progress), move |_, completion| {
            let _ = tx.send((index, completion));
        }) {
            Ok(op) => operations.push((url.clone(), Some(op))),
            Err(e) => {
                error!("{}: {}", url, e);
                operations.push((url.clone(), None));
                all_ok = false;
            }
        }
    }
    drop(tx);

    let expected = operations.iter().filter(|(_, op)| op.is_some()).count();
    info!("Fetching {} URL(s) with session {}", expected, manager.identifier());

    let mut outcomes = Vec::with_capacity(expected);
    while outcomes.len() < expected {
        tokio::select! {
            received = rx.recv() => {
                let Some((index, completion)) = received else {
                    break;
                };
                let (url, op) = &operations[index];
                let info = op
                    .as_ref()
                    .map(|op| RegisteredOperation::Data(Arc::clone(op)).info());
                outcomes.push((index, FetchOutcome { url: url.clone(), completion, info }));
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling outstanding transfers");
                manager.invalidate_and_cancel();
            }
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    let mut snapshots = Vec::new();
    for (index, outcome) in outcomes {
        let FetchOutcome { url, completion, info } = outcome;
        if let Some(info) = info {
            snapshots.push(info);
        }

        let status = completion.response.as_ref().map(|r| r.status);
        match completion.into_result() {
            Ok(body) => {
                let body = body.unwrap_or_default();
                if !args.json {
                    println!(
                        "{}  {}  {} bytes",
                        url,
                        status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                        body.len()
                    );
                }
                if let Some(dir) = &args.output {
                    let path = write_body(dir, &output_name(index, &url), &body).await?;
                    info!("Saved {} to {}", url, path.display());
                }
                if status.is_some_and(|s| !s.is_success()) {
                    all_ok = false;
                }
            }
            Err(e) => {
                all_ok = false;
                if !args.json {
                    println!("{}  failed: {}", url, e);
                }
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }

    if !manager.is_invalidated() {
        manager.finish_tasks_and_invalidate();
    }
    Ok(all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = FetchArgs::parse_from([
            "netops",
            "-j",
            "2",
            "--user",
            "alice:secret",
            "--json",
            "https://example.com/a",
            "https://example.com/b",
        ]);
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.max_concurrent, Some(2));
        assert!(args.json);
        assert!(!args.insecure);

        let config = load_config(&args).unwrap();
        assert_eq!(config.max_concurrent_operations, Some(2));
    }

    #[test]
    fn test_insecure_relaxes_policy() {
        let args = FetchArgs::parse_from(["netops", "-k", "https://example.com"]);
        let config = load_config(&args).unwrap();
        assert!(config.security.allow_invalid_certificates);
        assert!(!config.security.validates_domain_name);
    }

    #[test]
    fn test_parse_credential() {
        assert_eq!(parse_credential("alice:a:b"), Credential::password("alice", "a:b"));
        assert_eq!(parse_credential("bob"), Credential::password("bob", ""));
    }

    #[test]
    fn test_output_name() {
        assert_eq!(output_name(0, "https://example.com/files/report.pdf"), "0-report.pdf");
        assert_eq!(output_name(3, "https://example.com/"), "3-index");
        assert_eq!(output_name(1, "not a url"), "1-index");
    }
}
