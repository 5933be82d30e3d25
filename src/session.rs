//! Single-request OBEX session over a [`Transport`].
//!
//! The session tracks the link state machine, owns the progress and
//! disconnect observers, and enforces that a fatal device error poisons
//! the handle until the next successful connect.

use std::io;
use std::time::Duration;

use log::{debug, warn};

use crate::encoding;
use crate::error::{Error, Result};
use crate::obex::{self, Request, Response, TransferObserver};
use crate::transport::Transport;

/// Why a handle left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Orderly disconnect requested by the host.
    Normal,
    /// The device reported an internal error.
    Error,
    /// The watchdog observed the device go away.
    Unplugged,
}

impl Reason {
    /// Fatal reasons poison the handle; commands fail fast with
    /// [`Error::Internal`] until the next connect.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Reason::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    PreConnect,
    Connected,
    /// Reason latched, disconnect observer not yet notified.
    Disconnecting(Reason),
    /// Observer notified of a fatal reason; still refusing commands.
    Poisoned(Reason),
}

pub type ProgressFn = dyn FnMut(&str, u32, u32);
pub type DisconnectFn = dyn FnMut(Reason);

pub(crate) struct Session<T: Transport> {
    transport: T,
    state: LinkState,
    upload_cb: Option<Box<ProgressFn>>,
    download_cb: Option<Box<ProgressFn>>,
    disconnect_cb: Option<Box<DisconnectFn>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Session<T> {
        Session {
            transport,
            state: LinkState::PreConnect,
            upload_cb: None,
            download_cb: None,
            disconnect_cb: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn set_upload_observer(&mut self, observer: Option<Box<ProgressFn>>) {
        self.upload_cb = observer;
    }

    pub fn set_download_observer(&mut self, observer: Option<Box<ProgressFn>>) {
        self.download_cb = observer;
    }

    pub fn set_disconnect_observer(&mut self, observer: Option<Box<DisconnectFn>>) {
        self.disconnect_cb = observer;
    }

    /// Open the link and perform the protocol connect.  Succeeds from
    /// any state except an already-connected one and resets a poisoned
    /// handle.
    pub fn connect(&mut self, version: u8, locale: u8) -> Result<()> {
        if self.is_connected() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "already connected",
            )));
        }
        self.transport.open_link()?;
        match self.try_connect(version, locale) {
            Ok(()) => {
                debug!("connected (version {:#04x}, locale {:#04x})", version, locale);
                self.state = LinkState::Connected;
                Ok(())
            }
            Err(err) => {
                self.transport.close_link();
                Err(err)
            }
        }
    }

    fn try_connect(&mut self, version: u8, locale: u8) -> Result<()> {
        let mut req = Request::new(obex::CMD_CONNECT);
        let max = (obex::MAX_PACKET as u16).to_be_bytes();
        req.set_non_header(&[version, locale, max[0], max[1]]);
        let rsp = obex::exchange(&mut self.transport, &req, None)?;
        if rsp.code() != obex::RSP_SUCCESS {
            return Err(Error::Unexpected(rsp.code()));
        }
        self.transport.start_watchdog()
    }

    /// Orderly disconnect.  Idempotent; a reason latched earlier is
    /// left in place.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!("disconnecting");
            self.transport.cancel_watchdog();
            let _ = obex::exchange(&mut self.transport, &Request::new(obex::CMD_DISCONNECT), None);
            self.transport.close_link();
            self.state = LinkState::Disconnecting(Reason::Normal);
        }
        Ok(())
    }

    /// Service USB events and deliver a pending disconnect notification
    /// exactly once.  Call this periodically from the main loop; without
    /// it no disconnect notification is delivered.
    pub fn poll_disconnect(&mut self) {
        if self.is_connected() {
            let _ = self.transport.pump_events(Duration::ZERO);
            self.adopt_unplug();
        }
        if let LinkState::Disconnecting(reason) = self.state {
            if let Some(cb) = self.disconnect_cb.as_mut() {
                cb(reason);
            }
            // actual teardown; harmless when already torn down
            self.transport.cancel_watchdog();
            let _ = obex::exchange(&mut self.transport, &Request::new(obex::CMD_DISCONNECT), None);
            self.transport.close_link();
            self.state = match reason {
                Reason::Error => LinkState::Poisoned(Reason::Error),
                _ => LinkState::PreConnect,
            };
        }
    }

    /// Send one request and map the response code into the error
    /// taxonomy, handling internal-server-error teardown.
    pub fn request(&mut self, req: &Request) -> Result<Response> {
        self.adopt_unplug();
        self.check_ready()?;
        let rsp = {
            let slot = match req.opcode() {
                obex::CMD_PUT => self.upload_cb.as_mut(),
                obex::CMD_GET => self.download_cb.as_mut(),
                _ => None,
            };
            let mut observer = match (file_context(req), slot) {
                (Some((name, total)), Some(cb)) => {
                    Some(TransferObserver { name, total, notify: cb.as_mut() })
                }
                _ => None,
            };
            obex::exchange(&mut self.transport, req, observer.as_mut())?
        };
        self.finish(rsp)
    }

    fn adopt_unplug(&mut self) {
        if self.state == LinkState::Connected && self.transport.unplugged() {
            debug!("unplug latched by watchdog");
            self.state = LinkState::Disconnecting(Reason::Unplugged);
        }
    }

    fn check_ready(&self) -> Result<()> {
        match self.state {
            LinkState::Connected => Ok(()),
            LinkState::Disconnecting(r) | LinkState::Poisoned(r) if r.is_fatal() => {
                Err(Error::Internal)
            }
            _ => Err(Error::NotFound),
        }
    }

    fn finish(&mut self, rsp: Response) -> Result<Response> {
        match rsp.code() {
            obex::RSP_SUCCESS => Ok(rsp),
            obex::RSP_FORBIDDEN => Err(Error::Forbidden),
            obex::RSP_NOT_FOUND => Err(Error::NotFound),
            obex::RSP_INTERNAL_SERVER_ERROR => {
                // Nothing works after an internal error and some models
                // auto-disconnect; send an explicit disconnect for the
                // ones that do not.
                warn!("device reported internal server error");
                self.transport.cancel_watchdog();
                let _ =
                    obex::exchange(&mut self.transport, &Request::new(obex::CMD_DISCONNECT), None);
                self.state = LinkState::Disconnecting(Reason::Error);
                Err(Error::Internal)
            }
            code => Err(Error::Unexpected(code)),
        }
    }
}

/// Derive the file-transfer context of a request: the decoded filename
/// and the advertised upload length.  Command pseudo-names and nameless
/// requests carry no context.
fn file_context(req: &Request) -> Option<(String, u32)> {
    let name = req.find_bytes(obex::HDR_NAME)?;
    if name.is_empty() || obex::is_command(name) {
        return None;
    }
    let decoded = encoding::from_utf16be(name).unwrap_or_else(|| "Unknown".to_string());
    let total = req.find_u32(obex::HDR_LENGTH).unwrap_or(0);
    Some((decoded, total))
}
