use std::time::Duration;

use clap::Parser;
use log::warn;
use tokio::time::sleep;

use sniffer154::device::Sniffer;

/// Streams capture records from an IEEE 802.15.4 sniffer device to stdout.
#[derive(Parser)]
#[command(name = "sniffer154", version, about)]
struct Args {
    /// Serial port the sniffer is attached to
    #[arg(short = 'p', long)]
    port: String,

    /// Channel to capture on (page 0: 0-26)
    #[arg(short = 'c', long)]
    channel: i32,
}

/// Breather between bring-up stages; the firmware settles between commands.
const STAGE_PAUSE: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    simplelog::TermLogger::init(
        log::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();

    let device = Sniffer::new();
    if let Err(e) = device.connect(&args.port).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    sleep(STAGE_PAUSE).await;

    let mut ready = device.reset().await;
    if ready {
        sleep(STAGE_PAUSE).await;
        device.status().await;
        sleep(STAGE_PAUSE).await;

        ready = device.channel(args.channel).await;
        if ready {
            sleep(STAGE_PAUSE).await;
            // The transceiver may refuse the channel; then nothing is stored.
            ready = device.current_channel().is_some();
            if ready {
                device.enable(true).await;
                sleep(STAGE_PAUSE).await;
            }
        }
    }

    eprintln!("{}", device.status_line());

    if !ready {
        device.disconnect().await;
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("shutdown signal unavailable: {e}");
    }
    if device.enable(false).await {
        warn!("capture may still be enabled");
    }
    sleep(STAGE_PAUSE).await;
    device.disconnect().await;
}
