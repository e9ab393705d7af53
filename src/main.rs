use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;

use herald::config::Config;
use herald::http::HttpPools;
use herald::logging;
use herald::notifications::{
    BodyFormat, Dispatcher, NotifyOptions, NotifyType, Response, ServiceContext, ServiceRegistry,
};

/// Send one notification to every destination URL.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Notification title.
    #[arg(short, long, default_value = "")]
    title: String,

    /// Notification body. Read from stdin when omitted.
    #[arg(short, long)]
    body: Option<String>,

    /// info, success, warning or error.
    #[arg(short = 'n', long = "type", default_value = "info")]
    notify_type: NotifyType,

    /// Only notify destinations carrying this tag. Repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// text, markdown or html.
    #[arg(long)]
    format: Option<BodyFormat>,

    /// File path or http(s) URL to attach. Repeatable.
    #[arg(long = "attach")]
    attachments: Vec<String>,

    /// Configuration file; defaults to ./herald.toml or the user config dir.
    #[arg(long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Overall deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Destination URLs, in addition to those in the configuration file.
    urls: Vec<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path.cloned().or_else(Config::default_path) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn read_body(cli_body: Option<String>) -> Result<String> {
    if let Some(body) = cli_body {
        return Ok(body);
    }
    let mut body = String::new();
    tokio::io::stdin()
        .read_to_string(&mut body)
        .await
        .context("reading body from stdin")?;
    Ok(body.trim_end().to_string())
}

fn print_response(response: &Response) {
    let millis = response.duration.as_millis();
    match &response.error {
        None => println!("ok    {:<10} {} ({millis} ms)", response.service_id, response.service_url),
        Some(err) => println!("FAIL  {:<10} {} ({millis} ms): {err}", response.service_id, response.service_url),
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(cli.config.as_ref())?;
    logging::init(&config.logging());

    let pools = if config.http().insecure_tls() {
        HttpPools::insecure()
    } else {
        HttpPools::new()
    };
    let mut dispatcher = Dispatcher::with_registry(ServiceRegistry::global(), ServiceContext::new(Arc::new(pools)));
    let policy = config.attachments().policy();
    dispatcher.attachments().set_max_size(policy.max_size);
    dispatcher.attachments().set_fetch_timeout(policy.fetch_timeout);
    dispatcher.set_timeout(
        cli.timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.dispatcher().timeout()),
    );

    let mut rejected = 0usize;
    let configured = config
        .destinations
        .iter()
        .map(|destination| (destination.url.as_str(), destination.tags.clone()));
    let given = cli.urls.iter().map(|url| (url.as_str(), Vec::new()));
    for (url, tags) in given.chain(configured) {
        if let Err(err) = dispatcher.add(url, tags) {
            rejected += 1;
            eprintln!("skipping {}: {err}", herald::notifications::url::redact(url));
        }
    }
    if dispatcher.count() == 0 {
        anyhow::bail!("no usable destination URLs");
    }

    for location in &cli.attachments {
        dispatcher
            .attachments()
            .add_location(location)
            .await
            .with_context(|| format!("attaching {location}"))?;
    }

    let body = read_body(cli.body).await?;
    let mut options = NotifyOptions::new().tags(cli.tags);
    if let Some(format) = cli.format {
        options = options.body_format(format);
    }

    let responses = dispatcher.notify(&cli.title, &body, cli.notify_type, options).await;
    for response in &responses {
        print_response(response);
    }
    if responses.is_empty() {
        eprintln!("no destination matched the requested tags");
    }
    Ok(rejected == 0 && !responses.is_empty() && responses.iter().all(|response| response.success))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("herald: {err:#}");
            ExitCode::FAILURE
        }
    }
}
