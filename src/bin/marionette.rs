//! Marionette command-line front end
//!
//! A programmable client/server proxy that lets the user control network
//! traffic features with a lightweight domain-specific language.

use clap::{Parser, Subcommand};
use marionette::plugins::model;
use marionette::{mar, ClientProxy, Config, Dialer, Listener, Result, StreamSet};
use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "marionette", version, about = "Programmable traffic-shaping proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the client proxy
    Client {
        /// Local bind address for plain TCP connections
        #[arg(long, default_value = "127.0.0.1:8079")]
        bind: String,
        /// Server IP address; the port comes from the document
        #[arg(long, default_value = "127.0.0.1")]
        server: String,
        /// Format name, optionally NAME:VERSION
        #[arg(long)]
        format: String,
        /// model.sleep() multiplier
        #[arg(long, default_value_t = 1.0)]
        sleep_factor: f64,
        /// Debug logging enabled
        #[arg(long)]
        debug: bool,
    },
    /// Run the server proxy
    Server {
        /// Bind address for covertext sessions; a bare IP takes the port
        /// from the document
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Format name, optionally NAME:VERSION
        #[arg(long)]
        format: String,
        /// Address application streams are proxied to
        #[arg(long, default_value = "127.0.0.1:8080")]
        proxy: String,
        /// model.sleep() multiplier
        #[arg(long, default_value_t = 1.0)]
        sleep_factor: f64,
        /// Debug logging enabled
        #[arg(long)]
        debug: bool,
    },
    /// Show the available formats
    Formats,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Client { bind, server, format, sleep_factor, debug } => {
            let mut config = Config::client(&format);
            config.bind = bind;
            config.server_host = server;
            config.sleep_factor = sleep_factor;
            run_client(config, debug)
        }
        Command::Server { bind, format, proxy, sleep_factor, debug } => {
            let mut config = Config::server(&format);
            config.bind = bind;
            config.proxy_target = proxy;
            config.sleep_factor = sleep_factor;
            run_server(config, debug)
        }
        Command::Formats => {
            for doc in mar::formats() {
                println!("{}:{}", doc.name, doc.version);
            }
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .with_target(false)
        .init();
}

fn load_document(config: &Config) -> Result<Arc<mar::Document>> {
    let (name, version) = mar::split_format(&config.format);
    mar::format(name, version)
}

// A bare IP in the bind address takes its port from the document.
fn resolve_bind(bind: &str, doc: &mar::Document) -> String {
    if bind.contains(':') {
        bind.to_string()
    } else {
        format!("{}:{}", bind, doc.port)
    }
}

fn run_client(config: Config, debug: bool) -> Result<()> {
    config.validate()?;
    init_logging(debug);
    model::set_sleep_factor(config.sleep_factor);

    let doc = load_document(&config)?;
    let stream_set = StreamSet::new();
    let dialer = Arc::new(Dialer::new(doc, &config.server_host, stream_set)?);

    let listener = TcpListener::bind(&config.bind)
        .map_err(|e| marionette::Error::Io(e.to_string()))?;
    let mut proxy = ClientProxy::new(listener, dialer)?;
    proxy.open()?;

    println!("listening on {}, connected to {}", config.bind, config.server_host);
    park();
}

fn run_server(config: Config, debug: bool) -> Result<()> {
    config.validate()?;
    init_logging(debug);
    model::set_sleep_factor(config.sleep_factor);

    let doc = load_document(&config)?;
    let addr = resolve_bind(&config.bind, &doc);
    let listener = Listener::new(doc, &addr, &config.proxy_target)?;

    println!("listening on {}, proxying to {}", listener.local_addr(), config.proxy_target);
    park();
}

// Serve until killed.
fn park() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
