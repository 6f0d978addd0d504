use std::rc::Rc;

use anyhow::{bail, Context as _, Result};
use enclave::{
    BundleRequest, ContextOptions, HostPage, HttpFetcher, IsolatedContext, LoaderConfig,
    ModuleLoader,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: enclave <bundle-url> [--id <id>] [--text] [--sandbox <frame-url>]";

struct Args {
    url: String,
    id: Option<String>,
    text: bool,
    sandbox: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut url = None;
    let mut id = None;
    let mut text = false;
    let mut sandbox = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--id" => id = Some(args.next().context("--id needs a value")?),
            "--text" => text = true,
            "--sandbox" => sandbox = Some(args.next().context("--sandbox needs a URL")?),
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            _ if url.is_none() => url = Some(arg),
            _ => bail!("unexpected argument {arg}\n{USAGE}"),
        }
    }

    let Some(url) = url else {
        bail!("{USAGE}");
    };
    Ok(Args {
        url,
        id,
        text,
        sandbox,
    })
}

/// Id a bundle registers under when none is given: its file stem.
fn default_id(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    file.strip_suffix(".js").unwrap_or(file).to_string()
}

async fn run(args: Args) -> Result<serde_json::Value> {
    let config = LoaderConfig::from_env().context("failed to load loader config")?;
    let fetcher = HttpFetcher::new(config.fetch_cookie.clone())?;
    let host = HostPage::new(config, Rc::new(fetcher))?;
    let loader = ModuleLoader::new(&host)?;

    let id = args.id.clone().unwrap_or_else(|| default_id(&args.url));
    let mut request = BundleRequest::new(id, args.url.clone());
    if args.text {
        request = request.text_mode();
    }

    let context = match &args.sandbox {
        Some(frame_url) => {
            let options = ContextOptions::default().with_url(frame_url.clone());
            Some(IsolatedContext::create(&host, options).await?)
        }
        None => None,
    };
    if let Some(context) = &context {
        request = request.with_context(context);
    }

    let exports = loader.require_ensure(request).await?;
    exports.to_json()
}

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match rt.block_on(run(args)) {
        Ok(exports) => match serde_json::to_string_pretty(&exports) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to render exports: {err}");
                std::process::exit(1);
            }
        },
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::default_id;

    #[test]
    fn bundle_id_defaults_to_file_stem() {
        assert_eq!(default_id("https://cdn.example.com/apps/dashboard.js?v=3"), "dashboard");
        assert_eq!(default_id("/a.js"), "a");
        assert_eq!(default_id("widget"), "widget");
    }
}
