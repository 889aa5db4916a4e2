// Copyright 2020 Joyent, Inc.

use std::path::Path;
use std::process;
use std::sync::Mutex;

use clap::{crate_version, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use dataserve::config::ServerConfig;
use dataserve::plugin::PluginRegistry;
use dataserve::server;

static APP: &'static str = "dataserve";
static DEFAULT_CONFIG: &'static str = "dataserve.toml";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Data-access server")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("Path to the TOML configuration file")
                .long("config")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on, overriding the configuration")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let mut config =
        ServerConfig::load(Path::new(config_path)).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration {}: {}", config_path, e);
            process::exit(1)
        });
    if let Some(listen) = matches.value_of("listen") {
        config.listen = listen.parse().unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });
    }

    let plugins = PluginRegistry::with_builtins();
    for entry in plugins.iter() {
        info!(root_log, "plugin registered";
            "format" => &entry.format, "request" => entry.request);
    }

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", config.listen, e);
        process::exit(1)
    });
    info!(root_log, "listening for data requests";
        "address" => config.listen, "version" => config.server_version);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let process_log = root_log.new(o!("peer" => peer));
                let plugins = plugins.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    server::make_task(
                        stream,
                        &plugins,
                        &config,
                        Some(&process_log),
                    )
                    .await;
                });
            }
            Err(e) => {
                error!(root_log, "failed to accept socket"; "err" => %e);
            }
        }
    }
}
