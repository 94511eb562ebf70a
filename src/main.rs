use std::fs::{remove_file, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use framecast::config::Config;
use framecast::error::Result;
use framecast::exchange::Exchange;
use framecast::server::ServerGuard;
use framecast::source;

#[derive(Parser, Debug)]
#[command(version, about = "Latest-frame streaming daemon", long_about = None)]
struct Args {
    /// Path to a JSON configuration file; defaults apply when omitted.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Where to write the pidfile.
    #[arg(long = "pidfile", default_value = "/tmp/framecast.pid")]
    pidfile: PathBuf,
}

struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn new(path: PathBuf) -> Result<Self> {
        let pid = unsafe { libc::getpid() };

        info!(path = %path.display(), "creating pidfile");
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(format!("{}", pid).as_bytes())?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = remove_file(&self.path) {
            error!(error = %e, "couldn't delete pidfile");
        }
    }
}

fn run(args: Args) -> Result<()> {
    info!("framecast started");
    let _pidfile = PidFile::new(args.pidfile)?;

    let config = Arc::new(match args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    });

    // Ctrl-C flips the run flag; the loop below does the actual teardown by
    // letting the guards drop.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received ctrl-c - closing");
        r.store(false, Ordering::SeqCst);
    })
    .expect("couldn't set ctrl-c handler");

    // Frame source feeds the exchange; the exchange feeds the sessions.
    let receiver = source::start(&config)?;
    let exchange = Arc::new(Exchange::new(receiver)?);
    let _server = ServerGuard::new(config, exchange)?;

    // Poll for shutdown twenty times per second.
    while running.load(Ordering::SeqCst) {
        sleep(Duration::from_millis(50));
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "something went wrong");
        std::process::exit(1);
    }
}
