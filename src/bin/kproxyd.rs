//! kproxyd — authenticated HTTP proxy daemon over the UDP session transport.
//!
//! Usage:
//!   kproxyd -c /path/to/config.yaml
//!   kproxyd -l 0.0.0.0:4000 --auth user:pass
//!
//! Flags override config file values. `--auth` may repeat.

use std::process;

use log::{error, info};

use kproxy::config::{self, CredentialConfig, ServerConfig, TransportSettings};
use kproxy::proxy::ProxyServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config_path: Option<String>,
    listen: Option<String>,
    auth: Vec<CredentialConfig>,
    verbose: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: create runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        error!("fatal: {}", e);
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Args {
    let mut parsed = Args {
        config_path: None,
        listen: None,
        auth: Vec::new(),
        verbose: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" if i + 1 < args.len() => {
                parsed.config_path = Some(args[i + 1].clone());
                i += 1;
            }
            "-l" if i + 1 < args.len() => {
                parsed.listen = Some(args[i + 1].clone());
                i += 1;
            }
            "--auth" if i + 1 < args.len() => {
                match args[i + 1].split_once(':') {
                    Some((user, pass)) => parsed.auth.push(CredentialConfig {
                        username: user.to_string(),
                        password: pass.to_string(),
                    }),
                    None => {
                        eprintln!("--auth expects user:pass");
                        process::exit(1);
                    }
                }
                i += 1;
            }
            "-v" => parsed.verbose = true,
            "-V" => {
                println!("kproxyd {}", VERSION);
                process::exit(0);
            }
            other => {
                eprintln!("unknown flag: {}", other);
                usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    if parsed.config_path.is_none() && (parsed.listen.is_none() || parsed.auth.is_empty()) {
        usage();
        process::exit(1);
    }
    parsed
}

fn usage() {
    eprintln!("Usage: kproxyd -c <config.yaml>");
    eprintln!("       kproxyd -l <addr:port> --auth <user:pass> [--auth ...] [-v]");
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = match &args.config_path {
        Some(path) => config::load(path)?,
        None => ServerConfig {
            listen: String::new(),
            credentials: Vec::new(),
            cert: String::new(),
            key: String::new(),
            verbose: false,
            transport: TransportSettings::default(),
        },
    };

    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if !args.auth.is_empty() {
        cfg.credentials.extend(args.auth);
    }
    if args.verbose {
        cfg.verbose = true;
    }

    let level = if cfg.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    cfg.validate()?;

    if let Some(tls) = cfg.load_tls()? {
        info!(
            "tls material loaded ({} cert bytes, {} key bytes), held for external use",
            tls.cert.len(),
            tls.key.len()
        );
    }

    let server = ProxyServer::bind(&cfg).await?;
    info!("kproxyd {} listening on {}", VERSION, server.local_addr());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.notify_one();
        }
    });

    server.serve().await;
    Ok(())
}
