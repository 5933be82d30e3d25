
use std::mem::size_of;
pub use nix::libc::{c_uint, c_int};
use std::io;
use nix;

/// Argument block for the synchronous bulk-transfer ioctl.
///
/// `ep` carries the endpoint address (bit 7 set for IN endpoints) and
/// `timeout` is in milliseconds.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct BulkTransfer {
    pub ep: c_uint,
    pub len: c_uint,
    pub timeout: c_uint, // in milliseconds
    pub data: *mut u8,
}

bitflags! {
    #[repr(C)]
    pub struct UrbFlags: u32 {
        const URB_SHORT_NOT_OK      = 0x01;
        const URB_ISO_ASAP          = 0x02;
        const URB_BULK_CONTINUATION = 0x04;
        const URB_NO_FSBR           = 0x20;
        const URB_ZERO_PACKET       = 0x40;
        const URB_NO_INTERRUPT      = 0x80;
    }
}

/// The type of transfer.  Only interrupt transfers are submitted
/// asynchronously by this crate; bulk I/O goes through the synchronous
/// ioctl.
#[derive(Debug, Copy, Clone)]
pub enum UrbType {
    Iso = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct Urb {
    pub urbtype: u8, // "type" is Rust keyword
    pub endpoint: u8,
    pub status: i32, // reap result
    pub flags: UrbFlags,
    pub buffer: *mut u8, // assigned upon submit
    pub buffer_length: i32, // assigned upon submit
    pub actual_length: i32, // reap result
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32, // reap result
    pub signr: u32, // signal to be sent on completion, or 0 if none should be sent.
    pub usercontext: usize,
}

impl Urb {
    pub fn new(urbtype: UrbType, endpoint: u8, flags: UrbFlags) -> Urb {
        Urb {
            urbtype: urbtype as u8,
            endpoint,
            flags,
            ..Urb::default()
        }
    }
}

impl Default for Urb {
    fn default() -> Urb {
        Urb {
            urbtype: UrbType::Interrupt as u8,
            endpoint: 0,
            status: -22, // -EINVAL, in case status is read before urb is used.
            flags: UrbFlags::empty(),
            buffer: 0 as *mut u8,
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: 0,
        }
    }
}

// Sigh, usbfs ioctls have incorrect inversion of read and write.
// This doesn't matter at all from C, but nix crate applies const/mut to
// wrappers.

// #define USBDEVFS_BULK              _IOWR('U', 2, struct usbdevfs_bulktransfer)
ioctl_readwrite!(bulk, b'U', 2, BulkTransfer);

// #define USBDEVFS_SUBMITURB         _IOR('U', 10, struct usbdevfs_urb)
ioctl_write_ptr_bad!(submiturb, request_code_read!(b'U', 10, size_of::<Urb>()), Urb);

// #define USBDEVFS_DISCARDURB        _IO('U', 11)
ioctl_write_ptr_bad!(discardurb, request_code_none!(b'U', 11), Urb);

// #define USBDEVFS_REAPURB           _IOW('U', 12, void *)
ioctl_read_bad!(reapurb, request_code_write!(b'U', 12, size_of::<*mut Urb>()), *mut Urb);

// #define USBDEVFS_REAPURBNDELAY     _IOW('U', 13, void *)
ioctl_read_bad!(reapurbndelay, request_code_write!(b'U', 13, size_of::<*mut Urb>()), *mut Urb);

// #define USBDEVFS_CLAIMINTERFACE    _IOR('U', 15, unsigned int)
ioctl_write_ptr_bad!(claiminterface, request_code_read!(b'U', 15, size_of::<c_uint>()), c_uint);

// #define USBDEVFS_RELEASEINTERFACE  _IOR('U', 16, unsigned int)
ioctl_write_ptr_bad!(releaseinterface, request_code_read!(b'U', 16, size_of::<c_uint>()), c_uint);

fn nix_err_to_io_err(err: nix::Error) -> io::Error {
    io::Error::from(err)
}

pub fn nix_result_to_io_result<T>(res: nix::Result<T>) -> io::Result<T> {
    res.map_err(nix_err_to_io_err)
}
