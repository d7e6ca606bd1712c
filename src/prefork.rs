//! Command execution through pre-forked servers.
//!
//! A [`Prefork`] pool launches one `kamado-prefork` child per worker slot.
//! Every child listens on a loopback port and runs the commands it receives
//! with [`exec::run`](crate::exec::run), which saves the build process from
//! forking itself for every command.
//!
//! Messages are framed by a fixed-width ASCII header of [`HEADER_SIZE`]
//! bytes. The header holds comma-separated fields padded with spaces, and
//! its last [`COOKIE_LEN`] bytes carry the shared secret of the pool:
//!
//! ```text
//! REQ,<len>                      request, CBOR-encoded `Request` follows
//! RES,<code>,<len>[,timeout]     response, CBOR-encoded (stdout, stderr, exception) follows if len > 0
//! BYE                            end of the conversation
//! ```

use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::ExecError;
use crate::exec::{self, Exec, Request, Response};

pub const HEADER_SIZE: usize = 64;

/// Width of the shared secret at the end of every header.
pub const COOKIE_LEN: usize = 20;

/// Environment variable through which a child receives the shared secret.
pub const KEY_VAR: &str = "KAMADO_PREFORK_KEY";

const REQ: &str = "REQ";
const RES: &str = "RES";
const BYE: &str = "BYE";
const TIMEOUT: &str = "timeout";

const INVALID_KEY: &str = "Invalid key given!";

const CONNECT_ATTEMPTS: usize = 30;
const CONNECT_DELAY: Duration = Duration::from_millis(10);

/// Upper bound on a payload, a larger announced length is a protocol error.
const MAX_PAYLOAD: usize = 1 << 30;

/// Bytes of a rejected request read before answering.
const DISCARD_LIMIT: u64 = 64 * 1024;
const DISCARD_TIMEOUT: Duration = Duration::from_millis(100);

/// A decoded header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Req { len: usize },
    Res { code: i32, len: usize, timed_out: bool },
    Bye,
}

impl Header {
    fn fields(&self) -> Vec<String> {
        match self {
            Header::Req { len } => vec![REQ.into(), len.to_string()],
            Header::Res {
                code,
                len,
                timed_out,
            } => {
                let mut fields = vec![RES.into(), code.to_string(), len.to_string()];
                if *timed_out {
                    fields.push(TIMEOUT.into());
                }
                fields
            }
            Header::Bye => vec![BYE.into()],
        }
    }

    /// Encodes the header, appending `cookie` or blank space in its place.
    pub fn encode(&self, cookie: Option<&str>) -> Result<[u8; HEADER_SIZE], ExecError> {
        let fields = self.fields().join(",");
        let width = HEADER_SIZE - COOKIE_LEN;

        if fields.len() > width {
            return Err(ExecError::Protocol(format!("header too long: {fields:?}")));
        }

        let mut buffer = [b' '; HEADER_SIZE];
        buffer[..fields.len()].copy_from_slice(fields.as_bytes());

        if let Some(cookie) = cookie {
            if cookie.len() != COOKIE_LEN || !cookie.is_ascii() {
                return Err(ExecError::Protocol("malformed cookie".into()));
            }
            buffer[width..].copy_from_slice(cookie.as_bytes());
        }

        Ok(buffer)
    }

    /// Decodes the field part of a header. Request headers are restricted
    /// to `[A-Za-z0-9_, ]`, responses may also carry a signed exit code.
    pub fn decode(buffer: &[u8; HEADER_SIZE]) -> Result<Header, ExecError> {
        let raw = &buffer[..HEADER_SIZE - COOKIE_LEN];
        let text = std::str::from_utf8(raw)
            .map_err(|_| ExecError::Protocol("header is not ASCII".into()))?;

        let signed = text.starts_with(RES);
        let valid = text.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b',' | b' ') || (signed && b == b'-')
        });

        if !valid || text.trim().is_empty() {
            return Err(ExecError::Protocol(format!("invalid header {text:?}")));
        }

        let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();
        let number = |field: Option<&&str>| -> Result<i64, ExecError> {
            field
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| ExecError::Protocol(format!("invalid header {text:?}")))
        };

        let length = |field: Option<&&str>| -> Result<usize, ExecError> {
            let len = number(field)?;
            match usize::try_from(len) {
                Ok(len) if len <= MAX_PAYLOAD => Ok(len),
                _ => Err(ExecError::Protocol(format!("invalid payload length {len}"))),
            }
        };

        match fields[0] {
            REQ => Ok(Header::Req {
                len: length(fields.get(1))?,
            }),
            RES => Ok(Header::Res {
                code: i32::try_from(number(fields.get(1))?)
                    .map_err(|_| ExecError::Protocol(format!("invalid header {text:?}")))?,
                len: length(fields.get(2))?,
                timed_out: fields.get(3) == Some(&TIMEOUT),
            }),
            BYE => Ok(Header::Bye),
            kind => Err(ExecError::Protocol(format!("unknown message kind {kind:?}"))),
        }
    }
}

/// The cookie part of a raw header.
fn cookie_of(buffer: &[u8; HEADER_SIZE]) -> &[u8] {
    &buffer[HEADER_SIZE - COOKIE_LEN..]
}

/// Compares two byte strings without short-circuiting on the first
/// difference.
pub fn safe_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A fresh random shared secret.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOKIE_LEN)
        .map(char::from)
        .collect()
}

fn read_header(stream: &mut impl Read) -> io::Result<[u8; HEADER_SIZE]> {
    let mut buffer = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn read_payload(stream: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Reads and drops up to `len` bytes, giving up on a silent peer.
fn discard(stream: &mut TcpStream, len: u64) {
    if len == 0 || stream.set_read_timeout(Some(DISCARD_TIMEOUT)).is_err() {
        return;
    }

    if let Err(e) = io::copy(&mut (&mut *stream).take(len), &mut io::sink()) {
        tracing::debug!("prefork: discarding request body: {e}");
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ExecError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| ExecError::Codec(e.to_string()))?;
    Ok(buffer)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ExecError> {
    ciborium::from_reader(bytes).map_err(|e| ExecError::Codec(e.to_string()))
}

type Payload = (Vec<u8>, Vec<u8>, String);

fn send_response(stream: &mut impl Write, response: &Response) -> Result<(), ExecError> {
    let exception = response.exception.clone().unwrap_or_default();

    let payload = match response.stdout.is_empty() && response.stderr.is_empty() && exception.is_empty() {
        true => Vec::new(),
        false => encode(&(&response.stdout, &response.stderr, &exception))?,
    };

    let header = Header::Res {
        code: response.code,
        len: payload.len(),
        timed_out: response.timed_out,
    };

    stream.write_all(&header.encode(None)?)?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

fn failure(exception: impl Into<String>) -> Response {
    Response {
        code: -1,
        exception: Some(exception.into()),
        ..Response::default()
    }
}

/// Serves connections one after another until the listener fails.
///
/// With `key` set, every header must carry it as cookie. Without one the
/// cookie slot must be blank.
pub fn serve(listener: TcpListener, key: Option<&str>) -> io::Result<()> {
    let mut expected = [b' '; COOKIE_LEN];
    if let Some(key) = key {
        if key.len() != COOKIE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "malformed key"));
        }
        expected.copy_from_slice(key.as_bytes());
    }

    for stream in listener.incoming() {
        let stream = stream?;
        let peer = stream.peer_addr().ok();

        if let Err(e) = handle_connection(stream, &expected) {
            tracing::warn!("prefork: connection {peer:?} closed: {e}");
        }
    }

    Ok(())
}

fn handle_connection(mut stream: TcpStream, expected: &[u8]) -> Result<(), ExecError> {
    stream.set_nodelay(true)?;

    loop {
        let buffer = match read_header(&mut stream) {
            Ok(buffer) => buffer,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let header = Header::decode(&buffer);

        if !safe_compare(cookie_of(&buffer), expected) {
            let announced = match &header {
                Ok(Header::Req { len }) => *len as u64,
                _ => 0,
            };

            // At most a bounded prefix of an unauthenticated body is read,
            // unread data would reset the connection under the reply.
            discard(&mut stream, announced.min(DISCARD_LIMIT));
            send_response(&mut stream, &failure(INVALID_KEY))?;
            return Err(ExecError::Auth);
        }

        let payload = match &header {
            Ok(Header::Req { len }) => read_payload(&mut stream, *len)?,
            _ => Vec::new(),
        };

        match header {
            Ok(Header::Req { .. }) => (),
            Ok(Header::Bye) => return Ok(()),
            Ok(header) => {
                let error = ExecError::Protocol(format!("unexpected {header:?}"));
                send_response(&mut stream, &failure(error.to_string()))?;
                return Err(error);
            }
            Err(error) => {
                send_response(&mut stream, &failure(error.to_string()))?;
                return Err(error);
            }
        }

        let request: Request = match decode(&payload) {
            Ok(request) => request,
            Err(error) => {
                send_response(&mut stream, &failure(error.to_string()))?;
                return Err(error);
            }
        };

        let response = exec::run(&request).unwrap_or_else(|e| failure(e.to_string()));
        send_response(&mut stream, &response)?;
    }
}

/// Connection of one worker slot.
#[derive(Debug)]
struct Slot {
    addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl Slot {
    fn connect(&mut self) -> Result<&mut TcpStream, ExecError> {
        if self.stream.is_none() {
            let mut last = None;

            for _ in 0..CONNECT_ATTEMPTS {
                match TcpStream::connect(self.addr) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        self.stream = Some(stream);
                        break;
                    }
                    Err(e) => {
                        last = Some(e);
                        thread::sleep(CONNECT_DELAY);
                    }
                }
            }

            if self.stream.is_none() {
                let e = last.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
                return Err(ExecError::Io(e));
            }
        }

        self.stream
            .as_mut()
            .ok_or_else(|| ExecError::Io(io::Error::from(io::ErrorKind::NotConnected)))
    }

    fn call(&mut self, request: &Request, key: Option<&str>) -> Result<Response, ExecError> {
        let result = self.exchange(request, key);

        if result.is_err() {
            self.stream = None;
        }

        result
    }

    fn exchange(&mut self, request: &Request, key: Option<&str>) -> Result<Response, ExecError> {
        let payload = encode(request)?;
        let header = Header::Req { len: payload.len() }.encode(key)?;

        let stream = self.connect()?;
        stream.write_all(&header)?;
        stream.write_all(&payload)?;
        stream.flush()?;

        let (code, len, timed_out) = match Header::decode(&read_header(stream)?)? {
            Header::Res {
                code,
                len,
                timed_out,
            } => (code, len, timed_out),
            header => return Err(ExecError::Protocol(format!("unexpected {header:?}"))),
        };

        let (stdout, stderr, exception) = match len {
            0 => Payload::default(),
            len => decode::<Payload>(&read_payload(stream, len)?)?,
        };

        let exception = Some(exception).filter(|e| !e.is_empty());
        if code == -1 && exception.as_deref() == Some(INVALID_KEY) {
            return Err(ExecError::Auth);
        }

        Ok(Response {
            code,
            stdout,
            stderr,
            exception,
            timed_out,
        })
    }

    fn bye(&mut self, key: Option<&str>) {
        if let Some(mut stream) = self.stream.take()
            && let Ok(header) = Header::Bye.encode(key)
        {
            let _ = stream.write_all(&header);
        }
    }
}

/// Client side of a pool of prefork servers, one per worker slot.
///
/// A request issued for slot `n` always goes to the `n`-th server. Each slot
/// is guarded by its own lock, and the scheduler never has two requests in
/// flight for the same slot, so the lock is never contended.
#[derive(Debug)]
pub struct Prefork {
    key: Option<String>,
    slots: Vec<Mutex<Slot>>,
    children: Mutex<Vec<Child>>,
}

impl Prefork {
    /// Launches `jobs` servers from the `kamado-prefork` executable at
    /// `program`, sharing a freshly generated key.
    pub fn spawn(program: impl AsRef<OsStr>, jobs: usize) -> Result<Self, ExecError> {
        let program = program.as_ref();
        let key = generate_key();
        let mut children = Vec::with_capacity(jobs);
        let mut addrs = Vec::with_capacity(jobs);

        for _ in 0..jobs.max(1) {
            let mut child = Command::new(program)
                .env(KEY_VAR, &key)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()
                .map_err(|e| ExecError::Spawn(program.to_string_lossy().into_owned(), e))?;

            let port = match read_port(&mut child) {
                Ok(port) => port,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            };

            tracing::debug!("prefork: server {} listening on port {port}", child.id());
            addrs.push(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
            children.push(child);
        }

        let mut pool = Self::connect(addrs, Some(key));
        pool.children = Mutex::new(children);
        Ok(pool)
    }

    /// A pool over servers that are already running.
    pub fn connect(addrs: Vec<SocketAddr>, key: Option<String>) -> Self {
        let slots = addrs
            .into_iter()
            .map(|addr| Mutex::new(Slot { addr, stream: None }))
            .collect();

        Self {
            key,
            slots,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Reads the port announced by a freshly started server on its stdout, the
/// rest of the output is forwarded to ours.
fn read_port(child: &mut Child) -> Result<u16, ExecError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Protocol("server stdout is not piped".into()))?;

    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let port = line
        .trim()
        .parse()
        .map_err(|_| ExecError::Protocol(format!("server announced no port: {line:?}")))?;

    thread::Builder::new()
        .name(format!("prefork-out-{port}"))
        .spawn(move || {
            let _ = io::copy(&mut reader, &mut io::stdout());
        })?;

    Ok(port)
}

impl Exec for Prefork {
    fn name(&self) -> &'static str {
        "prefork"
    }

    fn exec(&self, slot: usize, request: &Request) -> Result<Response, ExecError> {
        if self.slots.is_empty() {
            return Err(ExecError::Protocol("no prefork servers".into()));
        }

        let key = self.key.as_deref();
        let mut slot = self.slots[slot % self.slots.len()].lock().unwrap();

        match slot.call(request, key) {
            Err(e) if e.is_protocol() => {
                tracing::warn!("prefork: {e}, reconnecting to {}", slot.addr);
                slot.call(request, key)
            }
            result => result,
        }
    }
}

impl Drop for Prefork {
    fn drop(&mut self) {
        let key = self.key.clone();

        for slot in &self.slots {
            if let Ok(mut slot) = slot.lock() {
                slot.bye(key.as_deref());
            }
        }

        if let Ok(mut children) = self.children.lock() {
            for mut child in children.drain(..) {
                drop(child.stdin.take());
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
