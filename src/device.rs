//! One method per vendor command, built on the OBEX session.
//!
//! Every command checks the link state before any I/O and maps device
//! response codes into [`Error`](crate::Error).  File transfers report
//! progress through the observers registered on the handle.

use std::io;

use log::debug;

use crate::encoding;
use crate::error::{Error, Result};
use crate::obex::{self, Request};
use crate::session::{DisconnectFn, ProgressFn, Session};
use crate::transport::{Transport, UsbTransport};
use crate::util;

bitflags! {
    /// Capability tokens reported by the model command.
    pub struct Capabilities: u32 {
        const SW  = 0x0001;
        const ST  = 0x0002;
        const T   = 0x0004;
        const P   = 0x0008;
        const F   = 0x0010;
        const EXT = 0x0020;
        const C   = 0x0040;
        const C2  = 0x0080;
        const C3  = 0x0100;
    }
}

/// Operating mode selected at connect time; decides the on-device
/// directory layout and the protocol version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Library,
    Text,
    Cd,
}

impl Mode {
    fn bits(self) -> u16 {
        match self {
            Mode::Text => 0x0100,
            Mode::Cd => 0x0200,
            Mode::Library => 0x0400,
        }
    }
}

/// Market region of the device; selects the locale byte and the charset
/// used for display names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Ja,
    Kr,
    Cn,
    In,
    It,
    De,
    Es,
    Fr,
    Ru,
}

impl Region {
    pub fn locale(self) -> u8 {
        match self {
            Region::Ja => 0x20,
            Region::Cn => 0x30,
            Region::In => 0x40,
            Region::Kr => 0x50,
            Region::It => 0x60,
            Region::De => 0x70,
            Region::Es => 0x80,
            Region::Fr => 0x90,
            Region::Ru => 0xa0,
        }
    }

    /// Short id used for host-side staging directories.
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Ja => "ja",
            Region::Kr => "kr",
            Region::Cn => "cn",
            Region::In => "in",
            Region::It => "it",
            Region::De => "de",
            Region::Es => "es",
            Region::Fr => "fr",
            Region::Ru => "ru",
        }
    }

    /// Charset the device uses for display names in this region.
    pub fn charset(self) -> &'static str {
        match self {
            Region::Ja => "Shift_JIS",
            Region::Kr => "EUC-KR",
            Region::Cn => "GBK",
            Region::In => "UTF-8",
            Region::It | Region::De | Region::Es | Region::Fr => "windows-1252",
            Region::Ru => "windows-1251",
        }
    }
}

/// Mode and region presented to the device at connect.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub mode: Mode,
    pub region: Region,
}

impl ConnectOptions {
    /// 16-bit wire form: mode bits in the high byte, locale in the low.
    pub fn bits(self) -> u16 {
        self.mode.bits() | self.region.locale() as u16
    }

    /// Protocol version byte derived from mode and locale.
    pub(crate) fn version(self) -> u8 {
        let locale = self.region.locale();
        match self.mode {
            Mode::Text => locale,
            Mode::Cd => 0xf0,
            Mode::Library => locale.wrapping_sub(0x0f),
        }
    }
}

/// Model information of a connected device.
#[derive(Debug, Clone)]
pub struct Model {
    pub model: [u8; 14],
    pub sub_model: [u8; 6],
    pub ext_model: [u8; 6],
    pub capabilities: Capabilities,
}

impl Default for Model {
    fn default() -> Model {
        Model {
            model: [0; 14],
            sub_model: [0; 6],
            ext_model: [0; 6],
            capabilities: Capabilities::empty(),
        }
    }
}

impl Model {
    pub fn is_ext(&self) -> bool {
        self.capabilities.contains(Capabilities::EXT)
    }
}

/// Capacity of the currently selected storage medium, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capacity {
    pub total: u64,
    pub free: u64,
}

/// One entry of an on-device directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub size: u16,
    pub flags: u8,
    /// Entry name, NUL terminator stripped.
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Regular files carry zero flags.
    pub fn is_file(&self) -> bool {
        self.flags == 0
    }
}

/// CryptKey exchange block: two caller-supplied half-keys in, the
/// session key and its derived xor stream out.
#[derive(Debug, Clone)]
pub struct CryptKey {
    pub blk1: [u8; 16],
    pub blk2: [u8; 16],
    pub key: [u8; 16],
    pub xor: [u8; 16],
}

impl CryptKey {
    /// Scatter a 16-byte master key into the half-key layout the device
    /// expects.
    pub fn from_master(master: &[u8; 16]) -> CryptKey {
        let mut ck = CryptKey { blk1: [0; 16], blk2: [0; 16], key: [0; 16], xor: [0; 16] };
        ck.blk1[..2].copy_from_slice(&master[..2]);
        ck.blk1[10..12].copy_from_slice(&master[10..12]);
        ck.blk2[..8].copy_from_slice(&master[2..10]);
        ck.blk2[8..12].copy_from_slice(&master[12..16]);
        ck
    }
}

/// Authentication exchange block.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub blk1: [u8; 16],
    pub blk2: [u8; 24],
    pub challenge: [u8; 20],
}

impl Default for AuthInfo {
    fn default() -> AuthInfo {
        AuthInfo { blk1: [0; 16], blk2: [0; 24], challenge: [0; 20] }
    }
}

/// Handle to one attached dictionary device.
///
/// The handle starts disconnected; [`connect`](Device::connect) brings
/// the link up.  Exactly one request is in flight at a time.
pub struct Device<T: Transport = UsbTransport> {
    session: Session<T>,
}

impl Device<UsbTransport> {
    /// Open the first attached dictionary device.
    pub fn open() -> Result<Device<UsbTransport>> {
        Ok(Device::with_transport(UsbTransport::open()?))
    }
}

impl<T: Transport> Device<T> {
    /// Build a handle over an arbitrary transport.
    pub fn with_transport(transport: T) -> Device<T> {
        Device { session: Session::new(transport) }
    }

    /// Access the underlying transport, e.g. for event-loop
    /// integration.
    pub fn transport(&self) -> &T {
        self.session.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.session.transport_mut()
    }

    /// Connect using the given mode and region.  Must not be called on
    /// an already-connected handle.
    pub fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        self.session.connect(options.version(), options.region.locale())
    }

    /// Disconnect from the device.  Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        self.session.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Check for a pending disconnect event.  Call this periodically
    /// from the main loop; without it no disconnect notification is
    /// delivered.
    pub fn poll_disconnect(&mut self) {
        self.session.poll_disconnect()
    }

    /// Observer invoked after each uploaded chunk with
    /// `(filename, transferred, total)`.  `None` clears it.
    pub fn set_upload_observer(&mut self, observer: Option<Box<ProgressFn>>) {
        self.session.set_upload_observer(observer)
    }

    /// Observer invoked after each downloaded chunk with
    /// `(filename, transferred, total)`.  `None` clears it.
    pub fn set_download_observer(&mut self, observer: Option<Box<ProgressFn>>) {
        self.session.set_download_observer(observer)
    }

    /// Observer invoked once per disconnect with the latched reason.
    pub fn set_disconnect_observer(&mut self, observer: Option<Box<DisconnectFn>>) {
        self.session.set_disconnect_observer(observer)
    }

    /// Upload a file to the current device path.
    pub fn send_file(&mut self, filename: &str, data: &[u8]) -> Result<()> {
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, encoding::to_utf16be(filename));
        req.add_u32(obex::HDR_LENGTH, data.len() as u32);
        req.add_bytes(obex::HDR_BODY, data.to_vec());
        self.session.request(&req).map(drop)
    }

    /// Download a file from the current device path.  The buffer is
    /// sized from the LENGTH header of the response.
    pub fn get_file(&mut self, filename: &str) -> Result<Vec<u8>> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, encoding::to_utf16be(filename));
        let rsp = self.session.request(&req)?;
        let len = rsp.length().unwrap_or(rsp.body().len() as u32) as usize;
        let mut data = rsp.into_body();
        data.truncate(len);
        Ok(data)
    }

    /// Set the current path on the device.
    ///
    /// Paths use `\` as separator and start with one of the storage
    /// roots (`\_INTERNAL_00`, `\_SD_00`, `\_SD_01`).  An empty path
    /// selects the medium list, which [`list`](Device::list) can then
    /// enumerate.
    pub fn set_path(&mut self, path: &str, create: bool) -> Result<()> {
        let mut req = Request::new(obex::CMD_SETPATH);
        req.set_non_header(&[if create { 0x00 } else { 0x02 }, 0x00]);
        let name = if path.is_empty() { Vec::new() } else { encoding::to_utf16be(path) };
        req.add_bytes(obex::HDR_NAME, name);
        self.session.request(&req).map(drop)
    }

    /// Remove a file from the device.  Some models require the filename
    /// in UTF-16BE when operating in text mode.
    pub fn remove_file(&mut self, filename: &str, to_unicode: bool) -> Result<()> {
        let body = if to_unicode {
            encoding::to_utf16be(filename)
        } else {
            let mut b = filename.as_bytes().to_vec();
            b.push(0);
            b
        };
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, obex::NAME_REMOVE);
        req.add_u32(obex::HDR_LENGTH, body.len() as u32);
        req.add_bytes(obex::HDR_BODY, body);
        self.session.request(&req).map(drop)
    }

    /// Format the inserted SD card.
    pub fn sd_format(&mut self) -> Result<()> {
        self.put_nul_body(obex::NAME_SDFORMAT)
    }

    /// List the current device path.
    pub fn list(&mut self) -> Result<Vec<DirEntry>> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, obex::NAME_LIST);
        let rsp = self.session.request(&req)?;
        parse_list(rsp.body())
    }

    /// Capacity of the storage medium selected with
    /// [`set_path`](Device::set_path).
    pub fn capacity(&mut self) -> Result<Capacity> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, obex::NAME_CAP);
        let rsp = self.session.request(&req)?;
        parse_capacity(rsp.body())
    }

    /// Model information of the connected device.
    pub fn model(&mut self) -> Result<Model> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, obex::NAME_MODEL);
        let rsp = self.session.request(&req)?;
        parse_model(rsp.body())
    }

    /// Update the user id of the connected device.  Names longer than
    /// 16 bytes are refused.
    pub fn user_id(&mut self, name: &str) -> Result<()> {
        if name.len() > 16 {
            return Err(Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "user id too long")));
        }
        let mut body = [0u8; 17];
        body[..name.len()].copy_from_slice(name.as_bytes());
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, obex::NAME_USERID);
        req.add_u32(obex::HDR_LENGTH, body.len() as u32);
        req.add_bytes(obex::HDR_BODY, body.to_vec());
        self.session.request(&req).map(drop)
    }

    /// Run the CryptKey exchange.  `key.blk1`/`key.blk2` are inputs;
    /// the session key and its xor stream come back in `key.key` and
    /// `key.xor`.
    pub fn crypt_key(&mut self, key: &mut CryptKey) -> Result<()> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, obex::NAME_CRYPTKEY);
        let mut half = [0u8; 28];
        half[..16].copy_from_slice(&key.blk1);
        half[16..].copy_from_slice(&key.blk2[..12]);
        req.add_bytes(obex::HDR_CRYPTKEY, half.to_vec());
        let result = self.session.request(&req);
        if let Ok(rsp) = &result {
            if rsp.body().len() >= 12 {
                key.key[..12].copy_from_slice(&rsp.body()[..12]);
            }
        }
        key.key[12..16].copy_from_slice(&key.blk2[8..12]);
        key.xor = util::get_xor_key(&key.key);
        result.map(drop)
    }

    /// Register an add-on's display name under its install directory.
    pub fn cname(&mut self, name: &[u8], dir_id: &str) -> Result<()> {
        let mut body = Vec::with_capacity(dir_id.len() + name.len() + 2);
        body.extend_from_slice(dir_id.as_bytes());
        body.push(0);
        body.extend_from_slice(name);
        body.push(0);
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, obex::NAME_CNAME);
        req.add_u32(obex::HDR_LENGTH, body.len() as u32);
        req.add_bytes(obex::HDR_BODY, body);
        self.session.request(&req).map(drop)
    }

    /// Unlock the device prior to adding or removing add-ons.
    pub fn unlock(&mut self) -> Result<()> {
        self.put_nul_body(obex::NAME_UNLOCK)
    }

    /// Lock the device after adding or removing add-ons.
    pub fn lock(&mut self) -> Result<()> {
        self.put_nul_body(obex::NAME_LOCK)
    }

    /// Present a 20-byte challenge key to the current storage medium.
    pub fn auth_challenge(&mut self, challenge: &[u8; 20]) -> Result<()> {
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, obex::NAME_AUTHCHALLENGE);
        req.add_u32(obex::HDR_LENGTH, challenge.len() as u32);
        req.add_bytes(obex::HDR_BODY, challenge.to_vec());
        self.session.request(&req).map(drop)
    }

    /// Reset authentication info.  On return `info.challenge` holds the
    /// new challenge key for the medium.
    ///
    /// Issuing this command causes the device to delete installed
    /// add-ons.
    pub fn auth_info(&mut self, info: &mut AuthInfo) -> Result<()> {
        let mut req = Request::new(obex::CMD_GET);
        req.add_bytes(obex::HDR_NAME, obex::NAME_AUTHINFO);
        let mut blocks = [0u8; 40];
        blocks[..16].copy_from_slice(&info.blk1);
        blocks[16..].copy_from_slice(&info.blk2);
        req.add_bytes(obex::HDR_AUTHINFO, blocks.to_vec());
        let rsp = self.session.request(&req)?;
        if rsp.body().len() < 20 {
            return Err(Error::invalid_data("short auth challenge"));
        }
        info.challenge.copy_from_slice(&rsp.body()[..20]);
        debug!("received new auth challenge");
        Ok(())
    }

    fn put_nul_body(&mut self, command: &[u8]) -> Result<()> {
        let mut req = Request::new(obex::CMD_PUT);
        req.add_bytes(obex::HDR_NAME, command);
        req.add_u32(obex::HDR_LENGTH, 1);
        req.add_bytes(obex::HDR_BODY, vec![0u8]);
        self.session.request(&req).map(drop)
    }
}

fn parse_list(body: &[u8]) -> Result<Vec<DirEntry>> {
    if body.len() < 2 {
        return Err(Error::invalid_data("short list"));
    }
    let count = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        if off + 3 > body.len() {
            return Err(Error::invalid_data("truncated list entry"));
        }
        let size = u16::from_be_bytes([body[off], body[off + 1]]);
        if (size as usize) < 3 || off + size as usize > body.len() {
            return Err(Error::invalid_data("bad list entry size"));
        }
        let flags = body[off + 2];
        let mut name = body[off + 3..off + size as usize].to_vec();
        while name.last() == Some(&0) {
            name.pop();
        }
        entries.push(DirEntry { size, flags, name });
        off += size as usize;
    }
    Ok(entries)
}

fn parse_capacity(body: &[u8]) -> Result<Capacity> {
    if body.len() == 24 {
        Ok(Capacity {
            total: u64::from_be_bytes(body[8..16].try_into().unwrap()),
            free: u64::from_be_bytes(body[16..24].try_into().unwrap()),
        })
    } else if body.len() >= 8 {
        Ok(Capacity {
            total: u32::from_be_bytes(body[0..4].try_into().unwrap()) as u64,
            free: u32::from_be_bytes(body[4..8].try_into().unwrap()) as u64,
        })
    } else {
        Err(Error::invalid_data("short capacity body"))
    }
}

fn parse_model(body: &[u8]) -> Result<Model> {
    if body.len() < 23 {
        return Err(Error::invalid_data("short model body"));
    }
    let mut model = Model::default();
    model.model.copy_from_slice(&body[..14]);
    model.sub_model.copy_from_slice(&body[14..20]);
    for token in body[23..].split(|b| *b == 0) {
        if token.is_empty() {
            continue;
        }
        // prefix order matters: SW before ST, CY before C
        if token.starts_with(b"SW") {
            model.capabilities |= Capabilities::SW;
        } else if token.starts_with(b"ST") {
            model.capabilities |= Capabilities::ST;
        } else if token.starts_with(b"T") {
            model.capabilities |= Capabilities::T;
        } else if token.starts_with(b"P") {
            model.capabilities |= Capabilities::P;
        } else if token.starts_with(b"F") {
            model.capabilities |= Capabilities::F;
        } else if token.starts_with(b"CY") {
            let n = token.len().min(6);
            model.ext_model[..n].copy_from_slice(&token[..n]);
            model.capabilities |= Capabilities::EXT;
        } else if token.starts_with(b"C") {
            if model.capabilities.contains(Capabilities::C2) {
                model.capabilities |= Capabilities::C3;
            } else if model.capabilities.contains(Capabilities::C) {
                model.capabilities |= Capabilities::C2;
            } else {
                model.capabilities |= Capabilities::C;
            }
        }
    }
    Ok(model)
}
