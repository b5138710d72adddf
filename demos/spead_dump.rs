//! Decode a single captured SPEAD datagram from a file and print its
//! header, item-pointer table, and payload length. Handy for inspecting
//! a packet saved with `tcpdump -w` and extracted with a payload-only
//! tool, without needing a live UDP source.
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Dump one SPEAD datagram read from a file")]
struct Opt {
    /// Path to a file containing exactly one raw SPEAD datagram.
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    stderrlog::new().module(module_path!()).verbosity(2).init()?;
    let opt = Opt::parse();
    let bytes = std::fs::read(&opt.path)?;

    let mut pkt = spead_rx::Packet::new();
    let consumed = pkt.unpack(&bytes)?;

    println!("consumed {consumed} of {} bytes", bytes.len());
    println!("heap_cnt      = {}", pkt.heap_cnt());
    println!("heap_len      = {}", pkt.heap_len());
    println!("payload_off   = {}", pkt.payload_off());
    println!("payload_len   = {}", pkt.payload_len());
    println!("stream_term   = {}", pkt.is_stream_ctrl_term());
    println!("items:");
    for item in pkt.items() {
        let mode = if item.immediate { "immediate" } else { "direct" };
        println!("  id=0x{:02x} {mode} value/addr={}", item.id, item.address);
    }
    Ok(())
}
