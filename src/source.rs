//! Blocking sources of raw input events.

use crate::decoder::RawEvent;
use evdev::Device;
use log::{debug, warn};
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
};
use std::{
    io::{self, ErrorKind},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Something which can unblock a waiting [`EventSource`] from another thread
pub trait Interrupt: Send + Sync {
    fn interrupt(&self) -> io::Result<()>;
}

impl Interrupt for Waker {
    fn interrupt(&self) -> io::Result<()> {
        self.wake()
    }
}

pub trait EventSource: Send {
    /// Block until the next events are available. `Ok(None)` means the source
    /// was interrupted and the reader should stop; an error means the device
    /// is gone.
    fn next_batch(&mut self) -> io::Result<Option<Vec<RawEvent>>>;

    fn interrupter(&self) -> Arc<dyn Interrupt>;
}

const DEVICE: Token = Token(0);
const WAKER: Token = Token(1);

/// An evdev input device
pub struct InputSource {
    path: PathBuf,
    device: Device,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    grabbed: bool,
}

impl InputSource {
    /// Open the device for non-blocking reads, optionally grabbing it so that
    /// its events no longer reach other readers such as the console
    pub fn open(path: &Path, grab: bool) -> io::Result<Self> {
        let mut device = Device::open(path)?;

        fcntl(device.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let poll = Poll::new()?;

        poll.registry().register(
            &mut SourceFd(&device.as_raw_fd()),
            DEVICE,
            Interest::READABLE,
        )?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        if grab {
            device.grab()?;
            debug!("{}: grabbed", path.display());
        }

        Ok(InputSource {
            path: path.to_owned(),
            device,
            poll,
            events: Events::with_capacity(4),
            waker,
            grabbed: grab,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.device.name()
    }
}

/// Wait for readiness. Returns true once the waker has fired.
fn woken(poll: &mut Poll, events: &mut Events, timeout: Option<Duration>) -> io::Result<bool> {
    match poll.poll(events, timeout) {
        Ok(()) => Ok(events.iter().any(|ev| ev.token() == WAKER)),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(e),
    }
}

impl EventSource for InputSource {
    fn next_batch(&mut self) -> io::Result<Option<Vec<RawEvent>>> {
        // a device which always has events ready never blocks below
        if woken(&mut self.poll, &mut self.events, Some(Duration::ZERO))? {
            return Ok(None);
        }

        loop {
            match self.device.fetch_events() {
                Ok(iter) => {
                    let batch: Vec<RawEvent> = iter.map(RawEvent::from).collect();

                    if !batch.is_empty() {
                        return Ok(Some(batch));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => (),
                Err(e) => return Err(e),
            }

            if woken(&mut self.poll, &mut self.events, None)? {
                return Ok(None);
            }
        }
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.waker.clone()
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        if self.grabbed {
            if let Err(e) = self.device.ungrab() {
                // the device may already have been unplugged
                if e.raw_os_error() != Some(Errno::ENODEV as i32) {
                    warn!("{}: failed to release grab: {e}", self.path.display());
                }
            }
        }
    }
}
