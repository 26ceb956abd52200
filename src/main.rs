use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: scim serve --config <path> | scim verify-log --path <decisions.jsonl>";

#[tokio::main]
async fn main() {
    init_tracing();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => {
            let config_path = flag_value(&mut args, "--config")
                .unwrap_or_else(|| "./config/example-config.yaml".to_string());
            serve(&config_path).await;
        }
        "verify-log" => {
            let Some(path) = flag_value(&mut args, "--path") else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match scim_server::verify_decision_log(&path) {
                Ok(report) => println!("{report}"),
                Err(e) => {
                    eprintln!("decision log verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(config_path: &str) {
    let cfg = match scim_config::load_and_validate(config_path) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(path = %config_path, store = %cfg.store.kind, "config loaded");

    if let Err(e) = scim_server::serve(cfg).await {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Option<String> {
    let mut value = None;
    while let Some(arg) = args.next() {
        if arg == flag {
            value = args.next();
        }
    }
    value
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing::subscriber::set_global_default(
        tracing_subscriber::fmt().with_env_filter(filter).finish(),
    )
    .is_err()
    {
        eprintln!("tracing subscriber already installed");
    }
}
