use clap::{App, AppSettings, Arg, ErrorKind};
use tokio::signal;

use rendezvous::server::config::ServerConfig;
use rendezvous::server::Server;
use rendezvous::Error;

// RUST_LOG=debug cargo run --bin rendezvous-server -- 8888 9333 relay

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let app = App::new("Rendezvous Server")
        .version("0.1.0")
        .author("Rain Liu <yliu@webrtc.rs>")
        .about("NAT traversal rendezvous server: compact UDP signaling plus relay TCP signaling on one port pair")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(
            Arg::with_name("port")
                .index(1)
                .default_value("8888")
                .help("Main port, bound as both TCP and UDP (1..65535)."),
        )
        .arg(
            Arg::with_name("probe_port")
                .index(2)
                .default_value("0")
                .help("NAT-probe UDP port; 0 disables probing."),
        )
        .arg(
            Arg::with_name("relay")
                .index(3)
                .help("Pass the token 'relay' to advertise relayed-data support."),
        )
        .arg(
            Arg::with_name("lang")
                .long("lang")
                .takes_value(true)
                .help("Log message language tag (informational)."),
        );

    let matches = match app.try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if err.kind() == ErrorKind::DisplayHelp || err.kind() == ErrorKind::DisplayVersion =>
        {
            print!("{err}");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let port = match matches.value_of("port").unwrap_or_default().parse::<u16>() {
        Ok(p) if p != 0 => p,
        _ => {
            eprintln!("port must be in 1..65535");
            std::process::exit(1);
        }
    };
    let probe_port = match matches
        .value_of("probe_port")
        .unwrap_or_default()
        .parse::<u16>()
    {
        Ok(p) => p,
        Err(err) => {
            eprintln!("probe_port: {err}");
            std::process::exit(1);
        }
    };
    let relay_available = match matches.value_of("relay") {
        None => false,
        Some("relay") => true,
        Some(other) => {
            eprintln!("unexpected argument '{other}' (did you mean 'relay'?)");
            std::process::exit(1);
        }
    };
    if let Some(lang) = matches.value_of("lang") {
        log::debug!("language switch: {lang}");
    }

    let mut server = Server::new(ServerConfig {
        port,
        probe_port,
        relay_available,
        ..Default::default()
    })
    .await?;

    println!("listening on udp/tcp port {port}, waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    println!("\nshutting down...");
    server.close().await?;

    Ok(())
}
