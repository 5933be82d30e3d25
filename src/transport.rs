use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::*;
use crate::error::{Error, Result};

/// Vendor and product id of the dictionary family.
pub const VENDOR_ID: u16 = 0x07cf;
pub const PRODUCT_ID: u16 = 0x6101;

const VENDOR_INTERFACE: devfs::c_uint = 0;
const BULK_TIMEOUT_MS: devfs::c_uint = 10_000;
const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(3000);
const WATCHDOG_BUFFER_LEN: usize = 16;

/// Transport seam between the OBEX session and the USB plumbing.
///
/// `UsbTransport` is the production implementation; tests drive the
/// session through scripted implementations of this trait.
pub trait Transport {
    /// Open (or re-open) the underlying link.  Idempotent when the
    /// link is already open.
    fn open_link(&mut self) -> Result<()>;
    /// Tear the link down; further I/O fails until `open_link`.
    fn close_link(&mut self);
    /// Write one bulk-out transfer in full.
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Read one bulk-in transfer into `buf`, returning the byte count.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Submit the interrupt watchdog transfer.
    fn start_watchdog(&mut self) -> Result<()>;
    /// Cancel the watchdog if it is in flight.
    fn cancel_watchdog(&mut self);
    /// Service pending USB events, waiting at most `timeout`.
    fn pump_events(&mut self, timeout: Duration) -> Result<()>;
    /// True once the watchdog has observed the device go away.
    fn unplugged(&self) -> bool;
}

/// Bulk-pair plus interrupt-endpoint I/O against the vendor USB device,
/// layered on usbfs.
pub struct UsbTransport {
    link: Option<Link>,
    unplugged: bool,
}

struct Link {
    file: File,
    endpoints: Endpoints,
    watchdog: Watchdog,
}

// The URB and its buffer are owned by the kernel between submit and
// reap; both live in stable heap allocations for that whole window.
struct Watchdog {
    urb: Box<Urb>,
    buffer: Box<[u8; WATCHDOG_BUFFER_LEN]>,
    pending: bool,
    submitted_at: Instant,
    unplugged: bool,
}

impl UsbTransport {
    /// Find and open the first attached dictionary device.
    pub fn open() -> Result<Self> {
        let link = Link::open_first()?;
        Ok(UsbTransport { link: Some(link), unplugged: false })
    }

    /// Open a specific device previously found via
    /// [`deviceinfo_enumerate`].
    pub fn from_deviceinfo(info: &DeviceInfo) -> Result<Self> {
        let link = Link::open_info(info)?;
        Ok(UsbTransport { link: Some(link), unplugged: false })
    }

    /// Raw file descriptor of the open link, for external event loops.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.link.as_ref().map(|l| l.file.as_raw_fd())
    }

    fn link_mut(&mut self) -> Result<&mut Link> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed")))
    }
}

impl Transport for UsbTransport {
    fn open_link(&mut self) -> Result<()> {
        if self.link.is_none() {
            self.link = Some(Link::open_first()?);
            self.unplugged = false;
        }
        Ok(())
    }

    fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.cancel_watchdog();
            let iface = VENDOR_INTERFACE;
            unsafe {
                let _ = devfs::releaseinterface(link.file.as_raw_fd(), &iface);
            }
            debug!("usb link closed");
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let link = self.link_mut()?;
        let mut off = 0;
        while off < data.len() {
            let n = link.bulk_out(&data[off..])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(io::ErrorKind::WriteZero, "bulk write stalled")));
            }
            off += n;
        }
        trace!("bulk-out {} bytes", data.len());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let link = self.link_mut()?;
        let n = link.bulk_in(buf)?;
        trace!("bulk-in {} bytes", n);
        Ok(n)
    }

    fn start_watchdog(&mut self) -> Result<()> {
        let link = self.link_mut()?;
        if !link.watchdog.pending {
            link.submit_watchdog()?;
        }
        Ok(())
    }

    fn cancel_watchdog(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.cancel_watchdog();
        }
    }

    fn pump_events(&mut self, timeout: Duration) -> Result<()> {
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Ok(()),
        };
        if !timeout.is_zero() {
            let mut fds = [PollFd::new(link.file.as_raw_fd(), PollFlags::POLLOUT)];
            devfs::nix_result_to_io_result(poll(&mut fds, timeout.as_millis() as devfs::c_int))
                .map_err(Error::Io)?;
        }
        link.reap_completions();
        if link.watchdog.pending && link.watchdog.submitted_at.elapsed() >= WATCHDOG_TIMEOUT {
            trace!("watchdog timed out, recycling");
            unsafe {
                let _ = devfs::discardurb(link.file.as_raw_fd(), &*link.watchdog.urb);
            }
            link.reap_completions();
        }
        if link.watchdog.unplugged {
            self.unplugged = true;
        }
        Ok(())
    }

    fn unplugged(&self) -> bool {
        self.unplugged || self.link.as_ref().map_or(false, |l| l.watchdog.unplugged)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close_link();
    }
}

impl Link {
    fn open_first() -> Result<Link> {
        let info = deviceinfo_enumerate()
            .find(is_dictionary)
            .ok_or(Error::NotFound)?;
        Link::open_info(&info)
    }

    fn open_info(info: &DeviceInfo) -> Result<Link> {
        let endpoints = info.endpoints()?;
        let file = open_busdev(info.busnum()?, info.devnum()?)?;
        let iface = VENDOR_INTERFACE;
        unsafe {
            devfs::nix_result_to_io_result(devfs::claiminterface(file.as_raw_fd(), &iface))?;
        }
        debug!(
            "opened device, bulk-in {:#04x} bulk-out {:#04x} interrupt-in {:#04x}",
            endpoints.bulk_in, endpoints.bulk_out, endpoints.interrupt_in
        );
        Ok(Link {
            file,
            endpoints,
            watchdog: Watchdog {
                urb: Box::new(Urb::default()),
                buffer: Box::new([0; WATCHDOG_BUFFER_LEN]),
                pending: false,
                submitted_at: Instant::now(),
                unplugged: false,
            },
        })
    }

    fn bulk_out(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut xfer = devfs::BulkTransfer {
            ep: self.endpoints.bulk_out as devfs::c_uint,
            len: data.len() as devfs::c_uint,
            timeout: BULK_TIMEOUT_MS,
            data: data.as_ptr() as *mut u8,
        };
        unsafe { devfs::nix_result_to_io_result(devfs::bulk(self.file.as_raw_fd(), &mut xfer)) }
            .map(|n| n as usize)
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut xfer = devfs::BulkTransfer {
            ep: self.endpoints.bulk_in as devfs::c_uint,
            len: buf.len() as devfs::c_uint,
            timeout: BULK_TIMEOUT_MS,
            data: buf.as_mut_ptr(),
        };
        unsafe { devfs::nix_result_to_io_result(devfs::bulk(self.file.as_raw_fd(), &mut xfer)) }
            .map(|n| n as usize)
    }

    fn submit_watchdog(&mut self) -> Result<()> {
        let urb = &mut *self.watchdog.urb;
        *urb = Urb::new(UrbType::Interrupt, self.endpoints.interrupt_in, UrbFlags::empty());
        urb.buffer = self.watchdog.buffer.as_mut_ptr();
        urb.buffer_length = WATCHDOG_BUFFER_LEN as i32;
        unsafe {
            devfs::nix_result_to_io_result(devfs::submiturb(self.file.as_raw_fd(), &*self.watchdog.urb))
                .map_err(Error::Io)?;
        }
        self.watchdog.pending = true;
        self.watchdog.submitted_at = Instant::now();
        Ok(())
    }

    /// Reap completed URBs without waiting.  The watchdog is the only
    /// transfer this crate keeps in flight.
    fn reap_completions(&mut self) {
        loop {
            let mut urbp: *mut Urb = ptr::null_mut();
            match unsafe { devfs::reapurbndelay(self.file.as_raw_fd(), &mut urbp) } {
                Ok(_) => {}
                Err(Errno::EAGAIN) => return,
                Err(err) => {
                    // reap failing outright means the node is dead
                    if !self.watchdog.unplugged {
                        warn!("urb reap failed ({}), latching unplug", err);
                    }
                    self.watchdog.unplugged = true;
                    self.watchdog.pending = false;
                    return;
                }
            }
            if !ptr::eq(urbp as *const Urb, &*self.watchdog.urb as *const Urb) {
                continue;
            }
            self.watchdog.pending = false;
            match self.watchdog.urb.status {
                0 => {
                    // device pulsed the interrupt endpoint; keep listening
                    let _ = self.submit_watchdog();
                }
                s if s == -nix::libc::ENOENT || s == -nix::libc::ECONNRESET => {
                    // our own discard (timeout recycle); resubmit
                    let _ = self.submit_watchdog();
                }
                s => {
                    if !self.watchdog.unplugged {
                        debug!("watchdog completed with status {}, latching unplug", s);
                    }
                    self.watchdog.unplugged = true;
                }
            }
        }
    }

    fn cancel_watchdog(&mut self) {
        if !self.watchdog.pending {
            return;
        }
        unsafe {
            let _ = devfs::discardurb(self.file.as_raw_fd(), &*self.watchdog.urb);
        }
        // The kernel still owns the buffers until the discarded urb is
        // reaped; wait for it before letting them go.
        let mut urbp: *mut Urb = ptr::null_mut();
        let _ = unsafe { devfs::reapurb(self.file.as_raw_fd(), &mut urbp) };
        self.watchdog.pending = false;
    }
}

fn is_dictionary(di: &DeviceInfo) -> bool {
    match di.device_descriptor() {
        Ok(descr) => descr.idVendor == VENDOR_ID && descr.idProduct == PRODUCT_ID,
        _ => false,
    }
}

fn open_busdev(busnum: u32, devnum: u32) -> io::Result<File> {
    let mut openopts = std::fs::OpenOptions::new();
    openopts.read(true).write(true);

    // pick first available path for device
    openopts.open(format!("/dev/bus/usb/{:03}/{:03}", busnum, devnum))
        .or_else(|_| openopts.open(format!("/dev/usbdev{}.{}", busnum, devnum)))
        .or_else(|_| openopts.open(format!("/proc/bus/usb/{:03}/{:03}", busnum, devnum)))
}
