//! Content management: the install/remove/decrypt/list workflows, the
//! on-device `admini` content index, selective encryption on transfer,
//! and per-user authentication with its persistent key store.
//!
//! Workflows print one line per transferred file and aggregate their
//! device steps so that the final lock is always issued; the aggregate
//! fails if any step failed.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::device::{AuthInfo, CryptKey, Device, Mode, Region};
use crate::encoding;
use crate::error::{Error, Result};
use crate::transport::{Transport, UsbTransport};
use crate::util;

/// Fixed master key scattered into the CryptKey exchange when
/// installing new content.
const INSTALL_KEY: [u8; 16] = [
    0x42, 0x72, 0xb7, 0xb5, 0x9e, 0x30, 0x83, 0x45, 0xc3, 0xb5, 0x41, 0x53, 0x71, 0xc4, 0x95,
    0x00,
];

/// File names the device may expose its content index under, tried in
/// order until one exists with a non-empty body.
const ADMINI_LIST: [&str; 10] = [
    "admini.inf",
    "adminikr.inf",
    "adminicn.inf",
    "adminiin.inf",
    "adminiit.inf",
    "adminide.inf",
    "adminies.inf",
    "adminifr.inf",
    "adminiru.inf",
    "sound.inf",
];

pub const ADMINI_RECORD_LEN: usize = 180;

/// One record of the on-device content index: 32-byte id, display name,
/// and the 16-byte master key of the content.
#[derive(Clone)]
pub struct AdminiRecord {
    raw: [u8; ADMINI_RECORD_LEN],
}

impl AdminiRecord {
    fn from_slice(raw: &[u8]) -> AdminiRecord {
        let mut record = AdminiRecord { raw: [0; ADMINI_RECORD_LEN] };
        record.raw.copy_from_slice(raw);
        record
    }

    /// Content id, NUL padding stripped.
    pub fn id(&self) -> &[u8] {
        trim_nul(&self.raw[..32])
    }

    /// Display name in the device's regional charset.
    pub fn name(&self) -> &[u8] {
        trim_nul(&self.raw[32..164])
    }

    /// Master key of the content.
    pub fn key(&self) -> &[u8; 16] {
        self.raw[164..].try_into().unwrap()
    }

    fn matches(&self, id: &str) -> bool {
        let query = id.as_bytes();
        if query.len() >= 32 {
            return self.raw[..32] == query[..32];
        }
        self.raw[..query.len()] == *query && self.raw[query.len()] == 0
    }
}

impl fmt::Debug for AdminiRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AdminiRecord")
            .field("id", &String::from_utf8_lossy(self.id()))
            .field("name", &String::from_utf8_lossy(self.name()))
            .finish()
    }
}

/// A content item presented to the user: the short id plus the display
/// name converted to the host locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    pub name: String,
}

/// Content-management engine driving a connected device.
///
/// Owns the device handle plus the host-side layout: operating mode,
/// region, and the data directory with staged content and the user-key
/// store.
pub struct ContentEngine<T: Transport = UsbTransport> {
    device: Device<T>,
    mode: Mode,
    region: Region,
    data_dir: PathBuf,
}

impl<T: Transport> ContentEngine<T> {
    pub fn new(device: Device<T>, mode: Mode, region: Region, data_dir: impl Into<PathBuf>) -> Self {
        ContentEngine { device, mode, region, data_dir: data_dir.into() }
    }

    pub fn device_mut(&mut self) -> &mut Device<T> {
        &mut self.device
    }

    pub fn into_device(self) -> Device<T> {
        self.device
    }

    /// Install staged content with the given id onto the device.
    ///
    /// Refuses when the content is already installed, when the staging
    /// directory is missing, or when it does not fit the free capacity.
    pub fn install(&mut self, root: &str, id: &str) -> Result<()> {
        let mut ck = CryptKey::from_master(&INSTALL_KEY);
        if self.find(root, id)?.is_some() {
            println!("Content with id {} already installed.", id);
            return Err(Error::Io(io::Error::new(io::ErrorKind::AlreadyExists, "already installed")));
        }
        let dir = self.content_dir(id);
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(err) => {
                println!("Can find dictionary directory {}.", id);
                return Err(err.into());
            }
        };
        let free = match self.device.capacity() {
            Ok(cap) => cap.free,
            Err(err) => {
                println!("Insufficent space on device.");
                return Err(err);
            }
        };
        match dir_size(&dir) {
            Ok(size) if size < free => {}
            _ => {
                println!("Insufficent space on device.");
                return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "insufficient space")));
            }
        }
        let name = match self.display_name(&dir) {
            Some(name) => name,
            None => {
                println!("{}: can't determine name", id);
                return Err(Error::invalid_data("missing content name"));
            }
        };
        debug!("installing {} ({} region)", id, self.region.as_str());

        let mut steps = Steps::new();
        steps.run(self.device.unlock());
        steps.run(self.device.cname(&name, id));
        steps.run(self.device.crypt_key(&mut ck));
        if steps.ok() {
            let path = match self.mode {
                Mode::Cd => format!("{}\\{}", root, id),
                _ => format!("{}\\{}\\_CONTENT", root, id),
            };
            let _ = self.device.set_path(&path, true);
            for entry in listing.flatten() {
                let fname = match entry.file_name().into_string() {
                    Ok(fname) => fname,
                    Err(_) => continue,
                };
                if !util::is_valid_sfn(&fname) {
                    continue;
                }
                if entry.metadata().map(|m| m.is_file()).unwrap_or(false) {
                    print!("Transferring {}...", fname);
                    if self.upload_file(&dir, &fname, &ck.xor) {
                        println!("Done");
                    } else {
                        println!("Failed");
                    }
                }
            }
            if self.mode == Mode::Library {
                let _ = self.device.set_path(&format!("{}\\{}\\_USER", root, id), true);
            }
        }
        steps.run(self.device.lock());
        steps.finish()
    }

    /// Remove installed content with the given id from the device.
    pub fn remove(&mut self, root: &str, id: &str) -> Result<()> {
        let info = match self.find(root, id)? {
            Some(info) => info,
            None => {
                println!("No content with id {} installed.", id);
                return Err(Error::NotFound);
            }
        };
        let mut ck = CryptKey::from_master(info.key());
        print!("Removing {}...", id);
        let mut steps = Steps::new();
        steps.run(self.device.unlock());
        steps.run(self.device.cname(info.name(), id));
        steps.run(self.device.crypt_key(&mut ck));
        if steps.ok() {
            steps.run(self.device.remove_file(id, false));
        }
        steps.run(self.device.lock());
        if steps.ok() {
            println!("Done");
        } else {
            println!("Failed");
        }
        steps.finish()
    }

    /// Download installed content into a fresh local mirror, undoing
    /// the transfer encryption.
    pub fn decrypt(&mut self, root: &str, id: &str) -> Result<()> {
        let dir = self.content_dir(id);
        let path = match self.mode {
            Mode::Cd => format!("{}\\{}", root, id),
            _ => format!("{}\\{}\\_CONTENT", root, id),
        };
        let info = match self.find(root, id)? {
            Some(info) => info,
            None => {
                println!("No content with id {} installed.", id);
                return Err(Error::NotFound);
            }
        };
        if self.device.set_path(&path, false).is_err() {
            println!("No content with id {} installed.", id);
            return Err(Error::NotFound);
        }
        if dir.is_dir() {
            println!("Local version of {} already exists", id);
            return Err(Error::Io(io::Error::new(io::ErrorKind::AlreadyExists, "local copy exists")));
        }
        if let Err(err) = make_dir_0770(&dir) {
            println!("Failed to create local directory {}", id);
            return Err(err.into());
        }
        let xor = util::get_xor_key(info.key());
        let entries = self.device.list()?;
        for entry in &entries {
            if !entry.is_file() {
                continue;
            }
            let name = String::from_utf8_lossy(&entry.name).into_owned();
            if has_extension(&name, "cjs") {
                continue;
            }
            print!("Decrypting {}...", name);
            if self.download_file(&dir, &name, &xor) {
                println!("Done");
            } else {
                println!("Failed");
            }
        }
        Ok(())
    }

    /// List content installed on the device under `root`.
    pub fn list_remote(&mut self, root: &str) -> Result<Vec<ContentItem>> {
        self.device.set_path(root, false)?;
        let buf = match self.read_admini() {
            Ok(buf) => buf,
            Err(Error::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut items = Vec::new();
        for (i, raw) in buf.chunks_exact(ADMINI_RECORD_LEN).enumerate() {
            let record = AdminiRecord::from_slice(raw);
            let id = String::from_utf8_lossy(record.id()).into_owned();
            let name = encoding::decode_charset(self.region.charset(), record.name());
            println!("{}. {} ({})", i, name, id);
            items.push(ContentItem { id, name });
        }
        Ok(items)
    }

    /// List content staged in the local data directory.
    pub fn list_local(&mut self) -> Result<Vec<ContentItem>> {
        let root = self.staging_root();
        let listing = fs::read_dir(&root)?;
        let mut items = Vec::new();
        for entry in listing.flatten() {
            let id = match entry.file_name().into_string() {
                Ok(id) => id,
                Err(_) => continue,
            };
            if id.starts_with('.') {
                continue;
            }
            let name = match self.display_name(&entry.path()) {
                Some(name) => name,
                None => continue,
            };
            let name = encoding::decode_charset(self.region.charset(), &name);
            println!("{}. {} ({})", items.len(), name, id);
            items.push(ContentItem { id, name });
        }
        Ok(items)
    }

    /// Authenticate `user` against internal memory and any inserted SD
    /// cards, provisioning cards that do not know the user yet.
    ///
    /// Without an explicit challenge the stored key from the user-key
    /// store is used; a missing entry fails with `NotFound`.
    pub fn auth(&mut self, user: &str, challenge: Option<&[u8; 20]>) -> Result<()> {
        let challenge = match challenge {
            Some(challenge) => *challenge,
            None => load_user_key(&self.data_dir, user)?.ok_or(Error::NotFound)?,
        };
        let mut info = AuthInfo::default();
        info.blk1.copy_from_slice(b"FFFFFFFFFFFFFFFF");
        let n = user.len().min(24);
        info.blk2[..n].copy_from_slice(&user.as_bytes()[..n]);
        let _ = self.device.set_path("\\_INTERNAL_00", false);
        self.device.auth_challenge(&challenge)?;
        let _ = self.device.set_path("", false);
        let entries = self.device.list()?;
        for entry in &entries {
            if matches!(entry.name.as_slice(), b"_SD_00" | b"_SD_01") {
                let path = format!("\\{}", String::from_utf8_lossy(&entry.name));
                let _ = self.device.set_path(&path, false);
                if self.device.auth_challenge(&challenge).is_err() {
                    // register the user on a card that does not know
                    // them; no fresh challenge is sent on that card
                    let _ = self.device.auth_info(&mut info);
                }
            }
        }
        self.device.user_id(user)
    }

    /// Wipe authentication state and register `user` as the device
    /// owner, persisting the returned key in the user-key store.
    ///
    /// The device deletes installed add-ons as a side effect.
    pub fn reset(&mut self, user: &str) -> Result<()> {
        let mut info = AuthInfo::default();
        info.blk1.copy_from_slice(b"FFFFFFFFFFFFFFFF");
        let n = user.len().min(24);
        info.blk2[..n].copy_from_slice(&user.as_bytes()[..n]);
        let _ = self.device.set_path("\\_INTERNAL_00", false);
        self.device.auth_info(&mut info)?;
        self.device.user_id(user)?;
        print!("User {} with key 0x", user);
        for b in info.challenge {
            print!("{:02X}", b);
        }
        println!(" registered");
        if save_user_key(&self.data_dir, user, &info.challenge).is_err() {
            println!("Warning - Failed to save authentication info!");
        }
        self.auth(user, Some(&info.challenge))
    }

    fn find(&mut self, root: &str, id: &str) -> Result<Option<AdminiRecord>> {
        self.device.set_path(root, false)?;
        let buf = match self.read_admini() {
            Ok(buf) => buf,
            Err(Error::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(scan_admini(&buf, id))
    }

    /// Fetch the first content index file that exists with a non-empty
    /// body.
    fn read_admini(&mut self) -> Result<Vec<u8>> {
        for name in ADMINI_LIST {
            match self.device.get_file(name) {
                Ok(buf) if !buf.is_empty() => {
                    debug!("content index found in {}", name);
                    return Ok(buf);
                }
                Ok(_) => continue,
                Err(Error::Internal) => return Err(Error::Internal),
                Err(_) => continue,
            }
        }
        Err(Error::NotFound)
    }

    fn upload_file(&mut self, dir: &Path, name: &str, xor: &[u8; 16]) -> bool {
        let mut data = match fs::read(dir.join(name)) {
            Ok(data) => data,
            Err(_) => return false,
        };
        if is_crypted_ext(name) {
            util::crypt_data(&mut data, xor);
        }
        self.device.send_file(name, &data).is_ok()
    }

    fn download_file(&mut self, dir: &Path, name: &str, xor: &[u8; 16]) -> bool {
        let mut data = match self.device.get_file(name) {
            Ok(data) => data,
            Err(_) => return false,
        };
        if is_crypted_ext(name) {
            util::crypt_data(&mut data, xor);
        }
        fs::write(dir.join(name), data).is_ok()
    }

    fn staging_root(&self) -> PathBuf {
        match self.mode {
            Mode::Cd => self.data_dir.join("sound"),
            _ => self.data_dir.join(self.region.as_str()),
        }
    }

    fn content_dir(&self, id: &str) -> PathBuf {
        self.staging_root().join(id)
    }

    fn display_name(&self, dir: &Path) -> Option<Vec<u8>> {
        match self.mode {
            Mode::Cd => cd_name(dir),
            _ => dict_name(dir),
        }
    }
}

/// Accumulates workflow step results.  The workflow always proceeds to
/// its final lock step; the aggregate fails if any step failed.
struct Steps {
    first_err: Option<Error>,
}

impl Steps {
    fn new() -> Steps {
        Steps { first_err: None }
    }

    fn run(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                if self.first_err.is_none() {
                    self.first_err = Some(err);
                }
                false
            }
        }
    }

    fn ok(&self) -> bool {
        self.first_err.is_none()
    }

    fn finish(self) -> Result<()> {
        match self.first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Scan 180-byte records for the first whose id matches; a trailing
/// partial record is silently ignored.
fn scan_admini(buf: &[u8], id: &str) -> Option<AdminiRecord> {
    buf.chunks_exact(ADMINI_RECORD_LEN).find_map(|raw| {
        let record = AdminiRecord::from_slice(raw);
        record.matches(id).then(|| record)
    })
}

/// Selective policy: only these extensions are XOR-transformed on
/// transfer, in either direction.
fn is_crypted_ext(name: &str) -> bool {
    has_extension(name, "txt") || has_extension(name, "bmp") || has_extension(name, "htm")
}

fn has_extension(name: &str, ext: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, e)) => e.eq_ignore_ascii_case(ext),
        None => false,
    }
}

/// CD content names come from the first CR-terminated line of the
/// playlist.
fn cd_name(dir: &Path) -> Option<Vec<u8>> {
    let data = fs::read(dir.join("playlist.htm")).ok()?;
    let end = data.iter().position(|b| *b == 0x0d)?;
    Some(data[..end].to_vec())
}

/// Dictionary names sit between `<title>` and `</title>` of the
/// description page.
fn dict_name(dir: &Path) -> Option<Vec<u8>> {
    let data = fs::read(dir.join("diction.htm")).ok()?;
    let start = find_bytes(&data, b"<title>")? + 7;
    let end = find_bytes(&data, b"</title>")?;
    if end < start {
        return None;
    }
    Some(data[start..end].to_vec())
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            size += meta.len();
        }
    }
    Ok(size)
}

fn make_dir_0770(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o770).create(dir)
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

/// Look up a stored 20-byte user key by exact name.  A missing store
/// reads as empty; any other I/O error propagates.
fn load_user_key(data_dir: &Path, name: &str) -> Result<Option<[u8; 20]>> {
    let buf = match fs::read(data_dir.join("users.dat")) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(scan_user_keys(&buf, name))
}

/// Append `(name, key)` to the store; duplicate names leave the file
/// byte-identical.
fn save_user_key(data_dir: &Path, name: &str, key: &[u8; 20]) -> Result<()> {
    make_dir_0770(data_dir)?;
    let path = data_dir.join("users.dat");
    let mut buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    if scan_user_keys(&buf, name).is_some() {
        return Ok(());
    }
    let stored = name.len() + 1; // including the NUL
    if stored > u8::MAX as usize {
        return Err(Error::invalid_data("user name too long"));
    }
    buf.push(stored as u8);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key);
    fs::write(path, buf)?;
    Ok(())
}

fn scan_user_keys(buf: &[u8], name: &str) -> Option<[u8; 20]> {
    let mut off = 0;
    while off < buf.len() {
        let stored = buf[off] as usize;
        let end = off + 1 + stored + 20;
        if stored == 0 || end > buf.len() {
            return None; // malformed tail, stop scanning
        }
        let entry = &buf[off + 1..off + 1 + stored];
        if entry[..stored - 1] == *name.as_bytes() && entry[stored - 1] == 0 {
            let mut key = [0u8; 20];
            key.copy_from_slice(&buf[off + 1 + stored..end]);
            return Some(key);
        }
        off = end;
    }
    None
}
