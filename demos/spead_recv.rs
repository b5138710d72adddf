//! Minimal CLI exercising the ingest pipeline end to end: binds a
//! receiver, prints one line per decoded packet, and stops cleanly on
//! Ctrl-C or a stream-term packet.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Dump SPEAD packet headers arriving on a UDP port")]
struct Opt {
    /// UDP port to listen on.
    #[arg(short, long, default_value_t = spead_rx::DEFAULT_PORT)]
    port: u16,

    /// Verbosity (-v, -vv, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .verbosity(opt.verbose as usize + 1)
        .init()?;

    let seen = Arc::new(AtomicU64::new(0));
    let seen_cb = Arc::clone(&seen);

    let mut receiver = spead_rx::Receiver::new();
    receiver.set_callback(move |pkt| {
        let n = seen_cb.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "#{n} heap_cnt={} payload_off={} payload_len={} n_items={} term={}",
            pkt.heap_cnt(),
            pkt.payload_off(),
            pkt.payload_len(),
            pkt.items().len(),
            pkt.is_stream_ctrl_term(),
        );
        0
    });

    let cfg = spead_rx::ReceiverConfig { port: opt.port, ..spead_rx::ReceiverConfig::default() };
    receiver.start(&cfg)?;
    log::info!("listening on UDP port {}", opt.port);

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst))?;

    while running.load(Ordering::SeqCst) && receiver.state() == spead_rx::ReceiverState::Running {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    if receiver.state() == spead_rx::ReceiverState::Running {
        receiver.stop()?;
    }
    let stats = receiver.stats();
    log::info!(
        "stopped: received={} decoded={} dropped={}",
        stats.packets_received,
        stats.packets_decoded,
        stats.packets_dropped,
    );
    Ok(())
}
