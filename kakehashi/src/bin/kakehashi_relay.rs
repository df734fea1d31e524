//! The standalone relay binary.
//!
//! `kakehashi_relay [--log] [--window <bytes>] <bind-addr>` listens for
//! one legacy connection at a time and bridges it onto this process's
//! stdio, the arrangement when a Host Agent spawns the relay as a
//! subprocess. Embedders wanting the tool-call API use
//! `kakehashi::start_relay` directly instead.

use kakehashi_core::relay::{RelayConfig, run_relay};
use kakehashi_wire::{DEFAULT_WINDOW, MAX_WINDOW, MIN_WINDOW};

fn usage() -> ! {
    eprintln!("usage: kakehashi_relay [--log] [--window <bytes>] <bind-addr>");
    std::process::exit(2);
}

fn parse_args() -> RelayConfig {
    let mut log = false;
    let mut window = DEFAULT_WINDOW;
    let mut positional: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log" => log = true,
            "--window" => {
                window = match args.next().and_then(|v| v.parse().ok()) {
                    Some(w) => w,
                    None => usage(),
                };
                if !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
                    eprintln!(
                        "kakehashi_relay: --window must be between {} and {}",
                        MIN_WINDOW, MAX_WINDOW
                    );
                    std::process::exit(2);
                }
            }
            other if other.starts_with("--") => usage(),
            _ => positional.push(arg),
        }
    }

    if positional.len() != 1 {
        usage();
    }

    RelayConfig {
        bind: positional[0].clone(),
        recv_window: window,
        log,
    }
}

#[tokio::main]
async fn main() {
    let config = parse_args();
    match run_relay(config).await {
        Ok(farewell) => {
            if farewell.reason.is_orderly() {
                std::process::exit(0);
            }
            eprintln!("kakehashi_relay: session ended: {}", farewell.reason);
            std::process::exit(3);
        }
        Err(err) => {
            eprintln!("kakehashi_relay: {}", err);
            std::process::exit(1);
        }
    }
}
