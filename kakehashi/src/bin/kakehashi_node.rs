//! The legacy-side endpoint binary.
//!
//! `kakehashi_node [flags] <host> <port>` dials the relay, mirrors the
//! Host Agent's terminal onto this terminal, and serves the agent's file
//! and process operations against this machine.
//!
//! Exit codes: 0 orderly goodbye, 1 connection or handshake failure,
//! 2 usage error, 3 protocol error.

use kakehashi_core::connection::error::ConnectionError;
use kakehashi_core::node::{NodeConfig, run_node};
use kakehashi_wire::{DEFAULT_WINDOW, MAX_WINDOW, MIN_WINDOW, SessionFlags};

fn usage() -> ! {
    eprintln!(
        "usage: kakehashi_node [--simple] [--resume] [--log] [--window <bytes>] <host> <port>"
    );
    std::process::exit(2);
}

fn parse_args() -> NodeConfig {
    let mut flags = SessionFlags::new();
    let mut log = false;
    let mut window = DEFAULT_WINDOW;
    let mut positional: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simple" => flags = flags.with_simple(),
            "--resume" => flags = flags.with_resume(),
            "--log" => log = true,
            "--window" => {
                window = match args.next().and_then(|v| v.parse().ok()) {
                    Some(w) => w,
                    None => usage(),
                };
                if !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
                    eprintln!(
                        "kakehashi_node: --window must be between {} and {}",
                        MIN_WINDOW, MAX_WINDOW
                    );
                    std::process::exit(2);
                }
            }
            other if other.starts_with("--") => usage(),
            _ => positional.push(arg),
        }
    }

    if positional.len() != 2 {
        usage();
    }
    let port: u16 = match positional[1].parse() {
        Ok(port) => port,
        Err(_) => usage(),
    };

    NodeConfig {
        host: positional[0].clone(),
        port,
        flags,
        recv_window: window,
        log,
    }
}

#[tokio::main]
async fn main() {
    let config = parse_args();
    match run_node(config).await {
        Ok(farewell) => {
            if farewell.reason.is_orderly() {
                std::process::exit(0);
            }
            eprintln!("kakehashi_node: session ended: {}", farewell.reason);
            std::process::exit(3);
        }
        Err(err) => {
            eprintln!("kakehashi_node: {}", err);
            let code = match err {
                ConnectionError::IoError(_)
                | ConnectionError::ConnectionClosed
                | ConnectionError::HandshakeTimeout
                | ConnectionError::UnsupportedProtocolVersion(_) => 1,
                _ => 3,
            };
            std::process::exit(code);
        }
    }
}
