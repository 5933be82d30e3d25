//! Scripted in-memory device speaking the OBEX dialect, mounted behind
//! the `Transport` seam so the whole stack above it runs unmodified.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::time::Duration;

use lexlink::obex::{self, parse_headers, OBEX_FINAL};
use lexlink::{Error, Result, Transport};

pub struct FakeTransport {
    pub dev: FakeDevice,
    queue: VecDeque<Vec<u8>>,
    open: bool,
}

impl FakeTransport {
    pub fn new(dev: FakeDevice) -> FakeTransport {
        FakeTransport { dev, queue: VecDeque::new(), open: true }
    }
}

impl Transport for FakeTransport {
    fn open_link(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close_link(&mut self) {
        self.open = false;
        self.queue.clear();
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed")));
        }
        assert!(data.len() >= 3, "runt frame");
        let advertised = u16::from_be_bytes([data[1], data[2]]) as usize;
        assert_eq!(advertised, data.len(), "frame length mismatch");
        let rsp = self.dev.handle(data[0], &data[3..]);
        self.queue.push_back(rsp);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.queue.pop_front() {
            Some(rsp) => {
                buf[..rsp.len()].copy_from_slice(&rsp);
                Ok(rsp.len())
            }
            None => Err(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "no response queued"))),
        }
    }

    fn start_watchdog(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel_watchdog(&mut self) {}

    fn pump_events(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn unplugged(&self) -> bool {
        self.dev.unplugged
    }
}

struct Installed {
    id: String,
    name: Vec<u8>,
    key: [u8; 16],
}

#[derive(Default)]
struct PutAccumulator {
    name: Option<Vec<u8>>,
    body: Vec<u8>,
}

pub struct FakeDevice {
    cwd: String,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    installed: Vec<Installed>,
    challenges: BTreeMap<String, [u8; 20]>,
    user: Option<String>,
    locked: bool,

    pending_name: Option<(String, Vec<u8>)>,
    pending_key: Option<[u8; 16]>,
    content_put_seen: bool,
    put_acc: PutAccumulator,
    pending_get: Option<VecDeque<Vec<u8>>>,

    capacity: (u64, u64),
    chunk: usize,
    file_put_count: u32,
    fail_file_put: Option<u32>,
    pub unplugged: bool,

    /// Commands seen, in order, for sequence assertions.
    pub log: Vec<String>,
}

impl FakeDevice {
    pub fn new() -> FakeDevice {
        let mut dirs = BTreeSet::new();
        dirs.insert("\\_INTERNAL_00".to_string());
        FakeDevice {
            cwd: String::new(),
            dirs,
            files: BTreeMap::new(),
            installed: Vec::new(),
            challenges: BTreeMap::new(),
            user: None,
            locked: true,
            pending_name: None,
            pending_key: None,
            content_put_seen: false,
            put_acc: PutAccumulator::default(),
            pending_get: None,
            capacity: (64 << 20, 32 << 20),
            chunk: usize::MAX,
            file_put_count: 0,
            fail_file_put: None,
            unplugged: false,
            log: Vec::new(),
        }
    }

    pub fn with_sd(mut self) -> FakeDevice {
        self.dirs.insert("\\_SD_00".to_string());
        self
    }

    pub fn with_capacity(mut self, total: u64, free: u64) -> FakeDevice {
        self.capacity = (total, free);
        self
    }

    /// Split GET bodies into response chunks of this size, forcing the
    /// client through the continuation path.
    pub fn with_chunk(mut self, chunk: usize) -> FakeDevice {
        self.chunk = chunk;
        self
    }

    /// Respond with INTERNAL_SERVER_ERROR to the n-th file upload.
    pub fn with_fail_put(mut self, nth: u32) -> FakeDevice {
        self.fail_file_put = Some(nth);
        self
    }

    pub fn installed_ids(&self) -> Vec<String> {
        self.installed.iter().map(|e| e.id.clone()).collect()
    }

    fn handle(&mut self, code: u8, payload: &[u8]) -> Vec<u8> {
        match code {
            0x80 => {
                self.log.push("Connect".to_string());
                // version, flags, max packet echoed back
                let mut rsp = vec![obex::RSP_SUCCESS | OBEX_FINAL, 0, 0];
                rsp.extend_from_slice(&[0x10, 0x00, 0x80, 0x00]);
                patch(rsp)
            }
            0x81 => {
                self.log.push("Disconnect".to_string());
                simple(obex::RSP_SUCCESS | OBEX_FINAL)
            }
            0x85 => self.setpath(payload),
            c if c & !OBEX_FINAL == obex::CMD_PUT => self.put(c & OBEX_FINAL != 0, payload),
            c if c & !OBEX_FINAL == obex::CMD_GET => self.get(payload),
            _ => simple(obex::RSP_INTERNAL_SERVER_ERROR | OBEX_FINAL),
        }
    }

    fn setpath(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 2 {
            return simple(obex::RSP_INTERNAL_SERVER_ERROR | OBEX_FINAL);
        }
        let create = payload[0] & 0x02 == 0;
        let mut name = None;
        parse_headers(&payload[2..], |tag, value| {
            if tag == obex::HDR_NAME {
                name = Some(value.to_vec());
            }
        })
        .unwrap();
        let path = name
            .map(|n| lexlink::from_utf16be(&n).expect("path not UTF-16BE"))
            .unwrap_or_default();
        self.log.push(format!("SetPath {:?} create={}", path, create));
        if path.is_empty() {
            self.cwd.clear();
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if !self.dirs.contains(&path) {
            if !create {
                return simple(obex::RSP_NOT_FOUND | OBEX_FINAL);
            }
            // create the directory and any missing parents
            let mut prefix = String::new();
            for comp in path.split('\\').filter(|c| !c.is_empty()) {
                prefix.push('\\');
                prefix.push_str(comp);
                self.dirs.insert(prefix.clone());
            }
        }
        self.cwd = path;
        simple(obex::RSP_SUCCESS | OBEX_FINAL)
    }

    fn get(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut name = None;
        let mut cryptkey = None;
        let mut authinfo = None;
        parse_headers(payload, |tag, value| match tag {
            obex::HDR_NAME => name = Some(value.to_vec()),
            obex::HDR_CRYPTKEY => cryptkey = Some(value.to_vec()),
            obex::HDR_AUTHINFO => authinfo = Some(value.to_vec()),
            _ => {}
        })
        .unwrap();
        let name = match name {
            Some(name) => name,
            None => return self.continue_get(),
        };
        if name == obex::NAME_CAP {
            self.log.push("Cap".to_string());
            let mut body = vec![0u8; 8];
            body.extend_from_slice(&self.capacity.0.to_be_bytes());
            body.extend_from_slice(&self.capacity.1.to_be_bytes());
            return self.serve(&body, false);
        }
        if name == obex::NAME_LIST {
            self.log.push("List".to_string());
            let body = self.list_body();
            return self.serve(&body, false);
        }
        if name == obex::NAME_CRYPTKEY {
            self.log.push("CryptKey".to_string());
            return self.cryptkey(cryptkey.as_deref().unwrap_or(&[]));
        }
        if name == obex::NAME_AUTHINFO {
            self.log.push("AuthInfo".to_string());
            return self.authinfo(authinfo.as_deref().unwrap_or(&[]));
        }
        if obex::is_command(&name) {
            return simple(obex::RSP_NOT_FOUND | OBEX_FINAL);
        }
        let filename = lexlink::from_utf16be(&name).expect("filename not UTF-16BE");
        self.get_named_file(&filename)
    }

    fn get_named_file(&mut self, filename: &str) -> Vec<u8> {
        self.log.push(format!("Get {}", filename));
        if filename == "admini.inf" && self.at_storage_root() {
            let body = self.admini_body();
            return self.serve(&body, true);
        }
        let path = format!("{}\\{}", self.cwd, filename);
        match self.files.get(&path) {
            Some(data) => {
                let data = data.clone();
                self.serve(&data, true)
            }
            None => simple(obex::RSP_NOT_FOUND | OBEX_FINAL),
        }
    }

    /// First response of a possibly chunked body; remaining chunks are
    /// handed out by `continue_get`.
    fn serve(&mut self, data: &[u8], with_length: bool) -> Vec<u8> {
        let total = data.len() as u32;
        let mut chunks: VecDeque<Vec<u8>> =
            data.chunks(self.chunk.max(1)).map(|c| c.to_vec()).collect();
        if chunks.is_empty() {
            chunks.push_back(Vec::new());
        }
        let first = chunks.pop_front().unwrap();
        let done = chunks.is_empty();
        self.pending_get = if done { None } else { Some(chunks) };
        let mut payload = Vec::new();
        if with_length {
            payload.push(obex::HDR_LENGTH);
            payload.extend_from_slice(&total.to_be_bytes());
        }
        push_framed(&mut payload, obex::HDR_BODY, &first);
        packet(if done { obex::RSP_SUCCESS | OBEX_FINAL } else { obex::RSP_SUCCESS }, payload)
    }

    fn continue_get(&mut self) -> Vec<u8> {
        let chunks = match self.pending_get.as_mut() {
            Some(chunks) => chunks,
            None => return simple(obex::RSP_NOT_FOUND | OBEX_FINAL),
        };
        let chunk = chunks.pop_front().unwrap();
        let done = chunks.is_empty();
        if done {
            self.pending_get = None;
        }
        let mut payload = Vec::new();
        push_framed(&mut payload, if done { obex::HDR_BODY_END } else { obex::HDR_BODY }, &chunk);
        packet(if done { obex::RSP_SUCCESS | OBEX_FINAL } else { obex::RSP_SUCCESS }, payload)
    }

    fn put(&mut self, is_final: bool, payload: &[u8]) -> Vec<u8> {
        {
            let acc = &mut self.put_acc;
            parse_headers(payload, |tag, value| match tag {
                obex::HDR_NAME => acc.name = Some(value.to_vec()),
                obex::HDR_BODY | obex::HDR_BODY_END => acc.body.extend_from_slice(value),
                _ => {}
            })
            .unwrap();
        }
        if !is_final {
            return simple(obex::RSP_CONTINUE | OBEX_FINAL);
        }
        let acc = std::mem::take(&mut self.put_acc);
        let name = acc.name.unwrap_or_default();
        if name == obex::NAME_REMOVE {
            return self.remove(&acc.body);
        }
        if name == obex::NAME_SDFORMAT {
            self.log.push("SdFormat".to_string());
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if name == obex::NAME_USERID {
            let user = String::from_utf8_lossy(trim_nul(&acc.body)).into_owned();
            self.log.push(format!("UserId {}", user));
            self.user = Some(user);
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if name == obex::NAME_CNAME {
            let mut split = acc.body.splitn(2, |b| *b == 0);
            let id = String::from_utf8_lossy(split.next().unwrap_or(&[])).into_owned();
            let display = trim_nul(split.next().unwrap_or(&[])).to_vec();
            self.log.push(format!("CName {}", id));
            self.pending_name = Some((id, display));
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if name == obex::NAME_UNLOCK {
            self.log.push("Unlock".to_string());
            self.locked = false;
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if name == obex::NAME_LOCK {
            self.log.push("Lock".to_string());
            self.locked = true;
            self.commit_pending();
            return simple(obex::RSP_SUCCESS | OBEX_FINAL);
        }
        if name == obex::NAME_AUTHCHALLENGE {
            return self.auth_challenge(&acc.body);
        }
        if obex::is_command(&name) {
            return simple(obex::RSP_NOT_FOUND | OBEX_FINAL);
        }
        let filename = lexlink::from_utf16be(&name).expect("filename not UTF-16BE");
        self.put_file(&filename, acc.body)
    }

    fn put_file(&mut self, filename: &str, body: Vec<u8>) -> Vec<u8> {
        self.file_put_count += 1;
        if self.fail_file_put == Some(self.file_put_count) {
            self.log.push(format!("Put {} (injected failure)", filename));
            return simple(obex::RSP_INTERNAL_SERVER_ERROR | OBEX_FINAL);
        }
        self.log.push(format!("Put {}", filename));
        self.files.insert(format!("{}\\{}", self.cwd, filename), body);
        self.content_put_seen = true;
        simple(obex::RSP_SUCCESS | OBEX_FINAL)
    }

    fn remove(&mut self, body: &[u8]) -> Vec<u8> {
        let id = String::from_utf8_lossy(trim_nul(body)).into_owned();
        self.log.push(format!("Remove {}", id));
        self.installed.retain(|e| e.id != id);
        let exact = format!("{}\\{}", self.cwd, id);
        let prefix = format!("{}\\", exact);
        self.files.retain(|p, _| p != &exact && !p.starts_with(&prefix));
        self.dirs.retain(|p| p != &exact && !p.starts_with(&prefix));
        simple(obex::RSP_SUCCESS | OBEX_FINAL)
    }

    fn cryptkey(&mut self, half: &[u8]) -> Vec<u8> {
        if half.len() != 28 {
            return simple(obex::RSP_INTERNAL_SERVER_ERROR | OBEX_FINAL);
        }
        let mut key12 = [0u8; 12];
        for i in 0..12 {
            key12[i] = half[i] ^ half[16 + (i % 8)] ^ 0x3c;
        }
        let mut full = [0u8; 16];
        full[..12].copy_from_slice(&key12);
        full[12..].copy_from_slice(&half[24..28]);
        self.pending_key = Some(full);
        self.serve(&key12, false)
    }

    fn authinfo(&mut self, blocks: &[u8]) -> Vec<u8> {
        if blocks.len() != 40 {
            return simple(obex::RSP_INTERNAL_SERVER_ERROR | OBEX_FINAL);
        }
        let challenge = derive_challenge(&blocks[16..40]);
        let medium = self.medium();
        self.challenges.insert(medium, challenge);
        self.serve(&challenge, false)
    }

    fn auth_challenge(&mut self, body: &[u8]) -> Vec<u8> {
        let medium = self.medium();
        let accepted = body.len() == 20 && self.challenges.get(&medium).map(|c| &c[..]) == Some(body);
        self.log.push(format!("AuthChallenge {}", if accepted { "ok" } else { "rejected" }));
        if accepted {
            simple(obex::RSP_SUCCESS | OBEX_FINAL)
        } else {
            simple(obex::RSP_FORBIDDEN | OBEX_FINAL)
        }
    }

    fn commit_pending(&mut self) {
        if let Some((id, name)) = self.pending_name.take() {
            if self.content_put_seen {
                let key = self.pending_key.unwrap_or([0; 16]);
                self.installed.retain(|e| e.id != id);
                self.installed.push(Installed { id, name, key });
            }
        }
        self.pending_key = None;
        self.content_put_seen = false;
    }

    fn admini_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for entry in &self.installed {
            let mut record = [0u8; 180];
            let id = entry.id.as_bytes();
            record[..id.len().min(32)].copy_from_slice(&id[..id.len().min(32)]);
            let n = entry.name.len().min(131);
            record[32..32 + n].copy_from_slice(&entry.name[..n]);
            record[164..].copy_from_slice(&entry.key);
            body.extend_from_slice(&record);
        }
        body
    }

    fn list_body(&self) -> Vec<u8> {
        let mut names: Vec<(Vec<u8>, u8)> = Vec::new();
        if self.cwd.is_empty() {
            for dir in &self.dirs {
                if dir.matches('\\').count() == 1 {
                    names.push((dir[1..].as_bytes().to_vec(), 1));
                }
            }
        } else {
            let prefix = format!("{}\\", self.cwd);
            for path in self.files.keys() {
                if let Some(rest) = path.strip_prefix(&prefix) {
                    if !rest.contains('\\') {
                        names.push((rest.as_bytes().to_vec(), 0));
                    }
                }
            }
            for dir in &self.dirs {
                if let Some(rest) = dir.strip_prefix(&prefix) {
                    if !rest.contains('\\') {
                        names.push((rest.as_bytes().to_vec(), 1));
                    }
                }
            }
        }
        let mut body = (names.len() as u16).to_be_bytes().to_vec();
        for (name, flags) in names {
            body.extend_from_slice(&((name.len() + 4) as u16).to_be_bytes());
            body.push(flags);
            body.extend_from_slice(&name);
            body.push(0);
        }
        body
    }

    fn at_storage_root(&self) -> bool {
        !self.cwd.is_empty() && self.cwd.matches('\\').count() == 1
    }

    fn medium(&self) -> String {
        match self.cwd.split('\\').nth(1) {
            Some(root) if !root.is_empty() => format!("\\{}", root),
            _ => "\\_INTERNAL_00".to_string(),
        }
    }
}

/// Challenge the device derives from the user block; deterministic so
/// the host and the assertions agree.
pub fn derive_challenge(blk2: &[u8]) -> [u8; 20] {
    let mut challenge = [0u8; 20];
    for i in 0..20 {
        challenge[i] = blk2[i % blk2.len()] ^ (i as u8).wrapping_mul(7) ^ 0x55;
    }
    challenge
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

fn simple(code: u8) -> Vec<u8> {
    vec![code, 0x00, 0x03]
}

fn packet(code: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = vec![code, 0, 0];
    out.extend_from_slice(&payload);
    patch(out)
}

fn patch(mut out: Vec<u8>) -> Vec<u8> {
    let len = (out.len() as u16).to_be_bytes();
    out[1] = len[0];
    out[2] = len[1];
    out
}

fn push_framed(out: &mut Vec<u8>, tag: u8, data: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&((data.len() + 3) as u16).to_be_bytes());
    out.extend_from_slice(data);
}
