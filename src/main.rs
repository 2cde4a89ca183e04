use std::sync::Arc;

use log::info;

use snell_server::config::{ServerConfig, DEFAULT_OBFS_HOST};
use snell_server::resolver::{NativeResolver, Resolver};
use snell_server::tcp_server::run_tcp_server;

fn print_usage(arg0: &str) {
    eprintln!(
        "Usage: {arg0} [options]\n\
         \x20 -c, --config FILE     configuration file (ignores other options)\n\
         \x20 -l, --listen IP:PORT  listening address\n\
         \x20 -k, --psk KEY         pre-shared key\n\
         \x20     --obfs METHOD     obfuscator method (http or tls)\n\
         \x20     --obfs-host HOST  obfuscator hostname (default {DEFAULT_OBFS_HOST})\n\
         \x20 -v, --verbose         increase logging verbosity (repeatable)\n\
         \x20 -h, --help            print help"
    );
}

fn main() {
    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);

    let mut config_file: Option<String> = None;
    let mut listen: Option<String> = None;
    let mut psk: Option<String> = None;
    let mut obfs: Option<String> = None;
    let mut obfs_host = DEFAULT_OBFS_HOST.to_string();
    let mut verbose = 0u8;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let mut take_value = |name: &str| {
            iter.next().unwrap_or_else(|| {
                eprintln!("Missing value for {name}.");
                print_usage(&arg0);
                std::process::exit(1);
            })
        };
        match arg.as_str() {
            "-c" | "--config" => config_file = Some(take_value("--config")),
            "-l" | "--listen" => listen = Some(take_value("--listen")),
            "-k" | "--psk" => psk = Some(take_value("--psk")),
            "--obfs" => obfs = Some(take_value("--obfs")),
            "--obfs-host" => obfs_host = take_value("--obfs-host"),
            "-v" | "--verbose" => verbose += 1,
            "-h" | "--help" => {
                print_usage(&arg0);
                std::process::exit(0);
            }
            other => {
                eprintln!("Invalid argument: {other}");
                print_usage(&arg0);
                std::process::exit(1);
            }
        }
    }

    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let config = match config_file {
        Some(path) => {
            info!("configuration file specified, ignore other cli options");
            ServerConfig::from_ini_file(&path)
        }
        None => ServerConfig::new(
            listen.as_deref().unwrap_or(""),
            psk.unwrap_or_default(),
            obfs,
            obfs_host,
        ),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load server config: {e}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("could not build tokio runtime");

    runtime.block_on(async move {
        let resolver: Arc<dyn Resolver> = Arc::new(NativeResolver::new());
        tokio::select! {
            result = run_tcp_server(config, resolver) => {
                if let Err(e) = result {
                    eprintln!("Server error: {e}");
                    std::process::exit(1);
                }
            }
            _ = shutdown_signal() => {
                info!("shutting down");
            }
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
