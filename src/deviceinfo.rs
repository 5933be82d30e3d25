use std::io::Read;
use std::{fmt, fs, io};
use std::ffi::{OsStr, OsString};

const SYSFS_DEVICE_PATH: &'static str = "/sys/bus/usb/devices";

// descriptor types used while walking the sysfs blob
const DESC_DEVICE: u8 = 1;
const DESC_ENDPOINT: u8 = 5;

/// Provides metadata about a specific USB device.
///
/// All information is collected from the linux `sysfs` directory.
/// See the function deviceinfo_enumerate()
#[derive(Debug)]
pub struct DeviceInfo {
    dir: OsString,
}

/// Fields of the standard device descriptor this driver cares about.
#[derive(Debug, Copy, Clone)]
pub struct DeviceDescriptor {
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
}

/// Endpoint addresses of the vendor interface: the bulk pair carrying
/// the protocol stream and the interrupt-in endpoint used as a
/// disconnect watchdog.
#[derive(Debug, Copy, Clone)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: u8,
}

impl DeviceInfo {
    /// Open device info from a sysfs device directory name.
    pub fn from_devpath<P: AsRef<OsStr>>(p: P) -> DeviceInfo {
        DeviceInfo { dir: p.as_ref().to_os_string() }
    }

    /// Read and decode the device descriptor from the sysfs
    /// `descriptors` attribute.
    pub fn device_descriptor(&self) -> io::Result<DeviceDescriptor> {
        let blob = self.descriptors()?;
        if blob.len() < 18 || blob[1] != DESC_DEVICE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad device descriptor"));
        }
        Ok(DeviceDescriptor {
            idVendor: u16::from_le_bytes([blob[8], blob[9]]),
            idProduct: u16::from_le_bytes([blob[10], blob[11]]),
            bcdDevice: u16::from_le_bytes([blob[12], blob[13]]),
        })
    }

    /// Endpoint addresses of the first bulk pair and the first
    /// interrupt-in endpoint found in the `descriptors` blob.
    pub fn endpoints(&self) -> io::Result<Endpoints> {
        walk_endpoints(&self.descriptors()?)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "required endpoints not present"))
    }

    pub fn busnum(&self) -> io::Result<u32> {
        read_sysfs_num(&self.dir, "busnum")
    }
    pub fn devnum(&self) -> io::Result<u32> {
        read_sysfs_num(&self.dir, "devnum")
    }

    fn descriptors(&self) -> io::Result<Vec<u8>> {
        let filename = fmt::format(format_args!(
            "{}/{}/descriptors",
            SYSFS_DEVICE_PATH,
            self.dir.to_string_lossy()
        ));
        let mut blob = Vec::new();
        fs::File::open(filename)?.read_to_end(&mut blob)?;
        Ok(blob)
    }
}

fn walk_endpoints(blob: &[u8]) -> Option<Endpoints> {
    let mut bulk_in = None;
    let mut bulk_out = None;
    let mut interrupt_in = None;
    let mut off = 0;
    while off + 2 <= blob.len() {
        let len = blob[off] as usize;
        if len < 2 || off + len > blob.len() {
            break; // truncated descriptor, stop walking
        }
        if blob[off + 1] == DESC_ENDPOINT && len >= 7 {
            let address = blob[off + 2];
            let attributes = blob[off + 3];
            match (attributes & 0x03, address & 0x80 != 0) {
                (2, true) => bulk_in = bulk_in.or(Some(address)),
                (2, false) => bulk_out = bulk_out.or(Some(address)),
                (3, true) => interrupt_in = interrupt_in.or(Some(address)),
                _ => {}
            }
        }
        off += len;
    }
    Some(Endpoints {
        bulk_in: bulk_in?,
        bulk_out: bulk_out?,
        interrupt_in: interrupt_in?,
    })
}

fn read_sysfs_num<T: std::str::FromStr>(dirname: &OsStr, attr: &str) -> io::Result<T> {
    let filename = fmt::format(format_args!(
        "{}/{}/{}",
        SYSFS_DEVICE_PATH,
        dirname.to_string_lossy(),
        attr
    ));
    let mut buf = String::new();
    fs::File::open(filename)?.read_to_string(&mut buf)?;
    buf.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "bad parse"))
}

/// Enumerate all USB devices known to sysfs.
///
/// # Examples
///
/// Find an attached dictionary:
///
/// ```no_run
/// use lexlink::deviceinfo_enumerate;
///
/// let dict = deviceinfo_enumerate().find(|di| {
///     match di.device_descriptor() {
///         Ok(descr) => descr.idVendor == 0x07cf && descr.idProduct == 0x6101,
///         _ => false,
///     }
/// });
/// ```
pub fn deviceinfo_enumerate() -> impl Iterator<Item = DeviceInfo> {
    fs::read_dir(SYSFS_DEVICE_PATH)
        .into_iter()
        .flat_map(|x| x) // produce empty iterator if read_dir failed
        .filter_map(|x| x.ok()) // discard erroneous dir entries
        .map(|x| x.file_name())
        .filter(is_device_dirname) //discard non-device filnames
        .map(|x| DeviceInfo { dir: x })
}

fn is_device_dirname(dirname: &OsString) -> bool {
    match dirname.to_str() {
        Some(x) => !x.starts_with("usb") && !x.contains(":"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::walk_endpoints;

    #[test]
    fn finds_bulk_pair_and_interrupt() {
        let blob = [
            9, 2, 32, 0, 1, 1, 0, 0x80, 50, // config
            9, 4, 0, 0, 3, 0xff, 0xff, 0xff, 0, // interface
            7, 5, 0x82, 0x02, 0x00, 0x02, 0, // bulk in 0x82
            7, 5, 0x02, 0x02, 0x00, 0x02, 0, // bulk out 0x02
            7, 5, 0x83, 0x03, 0x10, 0x00, 8, // interrupt in 0x83
        ];
        let ep = walk_endpoints(&blob).unwrap();
        assert_eq!((ep.bulk_in, ep.bulk_out, ep.interrupt_in), (0x82, 0x02, 0x83));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = [9, 2, 32, 0, 1, 1, 0, 0x80, 50, 7, 5, 0x82];
        assert!(walk_endpoints(&blob).is_none());
    }
}
