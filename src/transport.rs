//! Moving wait records from the kernel to the wait log writer.
//!
//! Records arrive through a BPF perf event array, one ring per CPU, so they
//! are ordered per CPU only. Nothing here sorts them. When a ring fills up the
//! kernel drops records and libbpf reports how many through the lost callback.
//! Records then wait in a bounded queue for the writer thread; a full queue
//! drops them too. Both kinds of loss are counted in a [`DropCounter`] and
//! never treated as an error.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use libbpf_rs::{MapCore, PerfBuffer, PerfBufferBuilder};
use tracing::{debug, trace};

const EPOLL_TOKEN_TRANSPORT: u64 = 0;
const EPOLL_TOKEN_SHUTDOWN: u64 = 1;

/// Records that may wait for the writer thread before new ones are dropped.
pub const WAIT_QUEUE_CAPACITY: usize = 16384;

/// How long the final drain waits for hooks that were already past the
/// `tracing_enabled` check when it was cleared.
pub const FINAL_DRAIN_SETTLE: Duration = Duration::from_millis(20);

/// Counts records the kernel dropped because the consumer fell behind.
#[derive(Debug, Default, Clone)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn add(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An eventfd that wakes the transport pump when it is time to stop.
pub struct ShutdownSignal {
    eventfd: OwnedFd,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn signal(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    pub fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Whether [`signal`](Self::signal) has been called. Does not reset it.
    pub fn is_signalled(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.eventfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, 0) > 0 && pfd.revents & libc::POLLIN != 0 }
    }
}

/// Something the pump can wait on and drain.
pub trait EventSource {
    /// An fd that becomes readable when records are pending.
    fn epoll_fd(&self) -> RawFd;
    /// Deliver every pending record to the callbacks.
    fn consume(&self) -> Result<()>;
}

impl EventSource for PerfBuffer<'_> {
    fn epoll_fd(&self) -> RawFd {
        PerfBuffer::epoll_fd(self)
    }

    fn consume(&self) -> Result<()> {
        PerfBuffer::consume(self)?;
        Ok(())
    }
}

fn create_transport_epoll(source_fd: RawFd, shutdown_fd: RawFd) -> io::Result<OwnedFd> {
    let epoll_fd = {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { OwnedFd::from_raw_fd(fd) }
    };

    for (fd, token) in [
        (source_fd, EPOLL_TOKEN_TRANSPORT),
        (shutdown_fd, EPOLL_TOKEN_SHUTDOWN),
    ] {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0
        {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(epoll_fd)
}

/// Deliver records from `source` until `shutdown` is signalled.
///
/// Records still buffered when the signal arrives are left in place; the
/// caller disables the hooks first and then calls [`EventSource::consume`]
/// once more so the tail of the trace is not lost.
pub fn pump_until_shutdown<S: EventSource + ?Sized>(
    source: &S,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let epoll_fd = create_transport_epoll(source.epoll_fd(), shutdown.fd())?;
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];

    loop {
        let n = unsafe { libc::epoll_wait(epoll_fd.as_raw_fd(), events.as_mut_ptr(), 2, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        let mut should_exit = false;
        for event in events.iter().take(n as usize) {
            if event.u64 == EPOLL_TOKEN_SHUTDOWN {
                should_exit = true;
            }
        }

        if should_exit {
            debug!("transport pump received shutdown");
            return Ok(());
        }

        source.consume()?;
    }
}

/// Drain `source` once the hooks are disabled: deliver what is pending, give
/// hooks still in flight [`FINAL_DRAIN_SETTLE`] to finish, deliver again.
pub fn final_drain<S: EventSource + ?Sized>(source: &S, settle: Duration) -> Result<()> {
    source.consume()?;
    thread::sleep(settle);
    source.consume()
}

/// Queue one sample for the writer. A full queue or a writer that has
/// stopped counts the sample as dropped.
pub fn forward_sample(tx: &SyncSender<Vec<u8>>, drops: &DropCounter, data: &[u8]) {
    match tx.try_send(data.to_vec()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => drops.add(1),
        Err(TrySendError::Disconnected(_)) => {
            trace!("wait log writer is gone, dropping record");
            drops.add(1);
        }
    }
}

/// Open the perf buffer on the `wait_events` map. Every sample is copied and
/// queued on `tx`; lost and unqueued samples are added to `drops`.
pub fn open_wait_transport<'a, M>(
    map: &'a M,
    pages: usize,
    tx: SyncSender<Vec<u8>>,
    drops: DropCounter,
) -> Result<PerfBuffer<'a>>
where
    M: MapCore,
{
    let sample_drops = drops.clone();
    let perf = PerfBufferBuilder::new(map)
        .pages(pages)
        .sample_cb(move |_cpu: i32, data: &[u8]| forward_sample(&tx, &sample_drops, data))
        .lost_cb(move |cpu: i32, count: u64| {
            trace!("cpu {} lost {} wait records", cpu, count);
            drops.add(count);
        })
        .build()?;
    Ok(perf)
}
