/*! Buffered UDP ingest pipeline: a producer thread reads datagrams off
a raw socket into [`crate::ring::SlotRing`] slots, and a consumer thread
drains the ring, decodes each packet, and hands it to a user callback.

Socket setup goes through raw `libc` calls rather than
[`std::net::UdpSocket`]'s constructors, the same way this crate's
teacher reaches for direct syscalls (`mmap`/`munmap` in its circular
buffer) instead of a higher-level wrapper whenever the standard library
doesn't expose the exact knob needed (here: `SO_RCVBUF`/`SO_RCVBUFFORCE`
and `IP_ADD_MEMBERSHIP`). Once bound, the resulting file descriptor is
wrapped in a [`std::net::UdpSocket`] for `recv_from`.
*/
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::receiver::Stats;
use crate::ring::SlotRing;
use crate::{Error, MAX_PACKET_LEN, Packet, Result};

const SELECT_TIMEOUT: Duration = Duration::from_millis(50);
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Socket-level configuration for [`Pipeline::start`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// UDP port to bind.
    pub port: u16,
    /// Address to bind to (`INADDR_ANY` by default).
    pub bind_addr: Ipv4Addr,
    /// Number of slots in the ring.
    pub ring_capacity: usize,
    /// Requested OS receive-buffer size in bytes, if any.
    pub rcvbuf: Option<usize>,
    /// Multicast group to join, if any.
    pub multicast_group: Option<Ipv4Addr>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            ring_capacity: crate::DEFAULT_RING_CAPACITY,
            rcvbuf: None,
            multicast_group: None,
        }
    }
}

fn os_err(context: &str) -> Error {
    Error::SocketError(format!("{context}: {}", std::io::Error::last_os_error()))
}

fn bind_socket(cfg: &IngestConfig) -> Result<UdpSocket> {
    // SAFETY: a single AF_INET/SOCK_DGRAM socket() call with no shared
    // state; the returned fd is checked for -1 before use.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(os_err("socket"));
    }
    let one: libc::c_int = 1;
    // SAFETY: fd is a valid, just-created socket; the option pointer and
    // length describe a live local `c_int`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = os_err("setsockopt(SO_REUSEADDR)");
        // SAFETY: fd was just returned by socket() above and is not yet
        // owned by any Rust wrapper.
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // SAFETY: zero-initialized sockaddr_in is a valid representation
    // (all-zero address/port/family before the fields below are set).
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = cfg.port.to_be();
    addr.sin_addr.s_addr = u32::from(cfg.bind_addr).to_be();
    // SAFETY: addr is a valid, fully-initialized sockaddr_in matching the
    // length passed.
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = os_err("bind");
        // SAFETY: see close() above.
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if let Some(bytes) = cfg.rcvbuf {
        set_rcvbuf(fd, bytes);
    }

    if let Some(group) = cfg.multicast_group {
        if let Err(e) = join_multicast(fd, group) {
            // SAFETY: see close() above.
            unsafe { libc::close(fd) };
            return Err(e);
        }
    }

    // SAFETY: fd is a live, bound, fully-configured socket not yet owned
    // by any other wrapper; UdpSocket takes ownership from here.
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

fn set_rcvbuf(fd: RawFd, bytes: usize) {
    let size = bytes as libc::c_int;
    // SAFETY: fd is valid; size is a live local `c_int`.
    let mut rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: same preconditions as the SO_RCVBUF attempt above.
            rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUFFORCE,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
        }
    }
    if rc != 0 {
        log::warn!(
            "failed to grow receive buffer to {bytes} bytes via SO_RCVBUF/SO_RCVBUFFORCE: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn join_multicast(fd: RawFd, group: Ipv4Addr) -> Result<()> {
    let mreq = libc::ip_mreq {
        imr_multiaddr: libc::in_addr { s_addr: u32::from(group).to_be() },
        imr_interface: libc::in_addr { s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be() },
    };
    // SAFETY: fd is valid; mreq is a live, fully-initialized local value
    // matching the length passed.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &mreq as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(os_err("setsockopt(IP_ADD_MEMBERSHIP)"));
    }
    Ok(())
}

/// Waits up to `timeout` for `fd` to become readable. Returns `Ok(false)`
/// on timeout or on an interrupted call (treated as "not yet readable,
/// try again"), matching the producer's tolerance for `EINTR`.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    // SAFETY: zero-initialized fd_set is the documented way to obtain an
    // empty set before FD_SET populates it.
    let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
    // SAFETY: readfds is a valid, live fd_set; fd is a valid descriptor.
    unsafe {
        libc::FD_ZERO(&mut readfds);
        libc::FD_SET(fd, &mut readfds);
    }
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: readfds and tv are valid, live local values; fd + 1 is the
    // conventional `nfds` argument for a single watched descriptor.
    let rc = unsafe {
        libc::select(
            fd + 1,
            &mut readfds,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }
    Ok(rc > 0)
}

fn producer_loop(socket: UdpSocket, ring: Arc<SlotRing<Vec<u8>>>, running: Arc<AtomicBool>) {
    let fd = socket.as_raw_fd();
    while running.load(Ordering::Relaxed) {
        match wait_readable(fd, SELECT_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::error!("producer select failed, stopping: {e}");
                running.store(false, Ordering::Relaxed);
                break;
            }
        }
        let idx = ring.claim_write();
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => {
                buf.truncate(n);
                ring.store(idx, buf);
            }
            Err(e) => {
                log::warn!("recvfrom failed: {e}");
                ring.store(idx, Vec::new());
            }
        }
        ring.publish_write(idx);
    }
}

fn consumer_loop(
    ring: Arc<SlotRing<Vec<u8>>>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Stats>>,
    callback: Arc<dyn Fn(Packet) -> i32 + Send + Sync>,
) {
    loop {
        let idx = match ring.claim_read_poll(CONSUMER_POLL_INTERVAL, || running.load(Ordering::Relaxed)) {
            Some(idx) => idx,
            None => break,
        };
        let bytes = ring.take(idx).unwrap_or_default();
        {
            let mut s = stats.lock().expect("stats mutex poisoned");
            s.packets_received += 1;
        }
        let mut pkt = Packet::new();
        match pkt.unpack(&bytes) {
            Ok(_) => {
                {
                    let mut s = stats.lock().expect("stats mutex poisoned");
                    s.packets_decoded += 1;
                }
                let term = pkt.is_stream_ctrl_term();
                let rc = callback(pkt);
                ring.publish_read(idx);
                if rc != 0 || term {
                    running.store(false, Ordering::Relaxed);
                }
            }
            Err(e) => {
                log::debug!("dropping undecodable packet: {e}");
                {
                    let mut s = stats.lock().expect("stats mutex poisoned");
                    s.packets_dropped += 1;
                }
                ring.publish_read(idx);
            }
        }
    }
}

/// Owns the socket, ring, and the two worker threads for one ingest
/// session. Created and torn down by [`crate::receiver::Receiver`].
pub struct Pipeline {
    running: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl Pipeline {
    /// Bind the socket and spawn the producer/consumer threads.
    pub fn start(
        cfg: &IngestConfig,
        stats: Arc<Mutex<Stats>>,
        callback: Arc<dyn Fn(Packet) -> i32 + Send + Sync>,
    ) -> Result<Self> {
        let socket = bind_socket(cfg)?;
        let local_addr = socket.local_addr().map_err(Error::Io)?;
        let ring = Arc::new(SlotRing::new(cfg.ring_capacity));
        let running = Arc::new(AtomicBool::new(true));

        let producer = {
            let ring = Arc::clone(&ring);
            let running = Arc::clone(&running);
            std::thread::spawn(move || producer_loop(socket, ring, running))
        };
        let consumer = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || consumer_loop(ring, running, stats, callback))
        };

        Ok(Self {
            running,
            producer: Some(producer),
            consumer: Some(consumer),
            local_addr,
        })
    }

    /// The socket's bound local address, useful when `port: 0` let the
    /// OS pick an ephemeral port.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Signal both workers to stop and join them. Bounded by the select
    /// timeout (producer) and the poll interval (consumer); never
    /// blocks on an in-flight callback beyond its own completion.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.producer.take() {
            let _ = h.join();
        }
        if let Some(h) = self.consumer.take() {
            let _ = h.join();
        }
    }

    /// `true` if either worker has not yet observed a stop request.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn loopback_round_trip_delivers_packet() {
        let received: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_cb = Arc::clone(&received);
        let stats = Arc::new(Mutex::new(Stats::default()));

        let cfg = IngestConfig {
            port: 0,
            ..IngestConfig::default()
        };
        let pipeline = Pipeline::start(
            &cfg,
            Arc::clone(&stats),
            Arc::new(move |pkt: Packet| {
                received_cb.lock().unwrap().push(pkt.heap_cnt());
                0
            }),
        )
        .expect("pipeline should start on an ephemeral port");
        let addr = pipeline.local_addr();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut datagram = vec![0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x01];
        let word: u64 = 0x8000_0100_0000_0007;
        datagram.extend_from_slice(&word.to_be_bytes());
        sender.send_to(&datagram, addr).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if received.lock().unwrap().len() == 1 || std::time::Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        pipeline.stop();

        let got = received.lock().unwrap();
        assert_eq!(*got, vec![7]);
        let s = stats.lock().unwrap();
        assert_eq!(s.packets_received, 1);
        assert_eq!(s.packets_decoded, 1);
    }
}
