//! Lexlink is a driver for the handheld electronic dictionaries that speak
//! a vendor dialect of OBEX over USB (vendor id 0x07cf).  It installs,
//! removes, and retrieves add-on dictionary and CD-audio content and
//! manages the per-user authentication state gating those operations.
//!
//! # Features
//! * Full vendor command surface: connect, setpath, get, put, list,
//!   capacity, model, userid, cryptkey, cname, lock/unlock,
//!   authchallenge, authinfo, sdformat, remove.
//! * Content engine on top of it: install/remove/decrypt/list workflows,
//!   the on-device `admini` content index, selective encryption on
//!   transfer, and a persistent user-key store.
//! * Talks straight to usbfs; the only external requirement is usbfs
//!   support in the kernel.  Linux only.
//! * The USB plumbing sits behind the [`Transport`] trait, so the whole
//!   protocol stack can be driven against a scripted device in tests.
//!
//! # Examples
//!
//! Connect and list the storage mediums:
//!
//! ```no_run
//! use lexlink::*;
//!
//! fn main() -> Result<()> {
//!     let mut device = Device::open()?;
//!     device.connect(ConnectOptions { mode: Mode::Library, region: Region::Ja })?;
//!     device.set_path("", false)?;
//!     for entry in device.list()? {
//!         println!("{}", String::from_utf8_lossy(&entry.name));
//!     }
//!     device.disconnect()?;
//!     Ok(())
//! }
//! ```
//!
//! Install staged content:
//!
//! ```no_run
//! use lexlink::*;
//!
//! fn main() -> Result<()> {
//!     let mut device = Device::open()?;
//!     device.connect(ConnectOptions { mode: Mode::Cd, region: Region::Ja })?;
//!     let data_dir = default_data_dir().expect("no data directory");
//!     let mut engine = ContentEngine::new(device, Mode::Cd, Region::Ja, data_dir);
//!     engine.install("\\_INTERNAL_00", "ABC123")?;
//!     engine.device_mut().disconnect()?;
//!     Ok(())
//! }
//! ```


#![allow(non_snake_case)]

extern crate libc;

#[macro_use]
extern crate nix;

#[macro_use]
extern crate bitflags;

mod devfs;
pub use devfs::{UrbFlags, UrbType};
pub use devfs::{BulkTransfer, Urb};

mod deviceinfo;
pub use deviceinfo::*;

mod error;
pub use error::{Error, Result};

mod encoding;
pub use encoding::*;

mod transport;
pub use transport::*;

pub mod obex;

mod session;
pub use session::{DisconnectFn, ProgressFn, Reason};

mod device;
pub use device::*;

mod content;
pub use content::*;

mod util;
pub use util::*;
