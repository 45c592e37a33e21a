//! ferry client: list, put and get against a ferryd server

use anyhow::{Context, Result};
use clap::Parser;

use ferry::cli::{default_local, default_remote, init_logging, ClientCommand, ClientOpts};
use ferry::error::ServerError;
use ferry::net_async::client;

fn main() {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .ok();

    let opts = ClientOpts::parse();
    init_logging(opts.verbose);

    if let Err(e) = run(opts) {
        match e.downcast_ref::<ServerError>() {
            Some(server) => eprintln!("{}", server),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(opts: ClientOpts) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let copts = opts.client_options();
    let (host, port) = (opts.host.as_str(), opts.port);

    match &opts.command {
        ClientCommand::List { path } => {
            let mut listing = rt.block_on(client::list(host, port, path, &copts))?;
            listing.dirs.sort();
            listing.files.sort();
            for d in &listing.dirs {
                println!("<DIR>  {}", d);
            }
            for f in &listing.files {
                println!("<FILE> {}", f);
            }
        }
        ClientCommand::Put { local, remote } => {
            let remote = match remote {
                Some(r) => r.clone(),
                None => default_remote(local)?,
            };
            let sent = rt.block_on(client::put(host, port, local, &remote, &copts))?;
            println!("Uploaded {} ({} bytes)", remote, sent);
        }
        ClientCommand::Get { remote, local } => {
            let local = match local {
                Some(l) => l.clone(),
                None => default_local(remote)?,
            };
            let received = rt.block_on(client::get(host, port, remote, &local, &copts))?;
            println!("Downloaded {} ({} bytes)", local.display(), received);
        }
    }
    Ok(())
}
