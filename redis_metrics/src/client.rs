//! A minimal RESP2 client for the commands a scrape needs.
//!
//! Only `AUTH`, `PING`, `INFO` and `SENTINEL MASTERS` are ever sent. The
//! connection is opened lazily on first use and dropped on any error, the
//! next command dials again. Every dial is bounded by the node's connect
//! timeout and every reply by its read timeout.

use std::{io, time::Duration};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time,
};
use tracing::{debug, trace};

use crate::{
    config::{NodeSpec, Role},
    report::Report,
};

/// Bulk strings longer than this are refused.
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;
/// Arrays longer than this are refused.
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Errors produced by [`Client`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A dial or read did not complete in time.
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    /// The peer sent something that is not RESP or not the expected reply.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The server answered with an error reply.
    #[error("Server error: {0}")]
    Server(String),
}

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    SimpleString(String),
    /// `-ERR message`
    Error(String),
    /// `:1000`
    Integer(i64),
    /// `$6\r\nfoobar`
    BulkString(Vec<u8>),
    /// `$-1` or `*-1`
    Null,
    /// `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// The value as text, for simple and bulk strings.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// Encode `args` as a RESP array of bulk strings.
#[must_use]
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.push(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        buf.push(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

fn length(content: &str, max: usize) -> Result<Option<usize>, Error> {
    let len: i64 = content
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid length {content:?}")))?;
    if len < 0 {
        return Ok(None);
    }
    match usize::try_from(len) {
        Ok(len) if len <= max => Ok(Some(len)),
        _ => Err(Error::Protocol(format!("length {len} exceeds {max}"))),
    }
}

/// Decode one RESP2 value from `reader`.
pub fn decode<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<RespValue, Error>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    async move {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(type_byte) = line.chars().next() else {
            return Err(Error::Protocol("empty line".to_string()));
        };
        let content = &line[type_byte.len_utf8()..];

        match type_byte {
            '+' => Ok(RespValue::SimpleString(content.to_string())),
            '-' => Ok(RespValue::Error(content.to_string())),
            ':' => content
                .parse()
                .map(RespValue::Integer)
                .map_err(|_| Error::Protocol(format!("invalid integer {content:?}"))),
            '$' => {
                let Some(len) = length(content, MAX_BULK_LEN)? else {
                    return Ok(RespValue::Null);
                };
                let mut data = vec![0; len + 2];
                reader.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    return Err(Error::Protocol("bulk string not terminated".to_string()));
                }
                data.truncate(len);
                Ok(RespValue::BulkString(data))
            }
            '*' => {
                let Some(count) = length(content, MAX_ARRAY_LEN)? else {
                    return Ok(RespValue::Null);
                };
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(decode(reader).await?);
                }
                Ok(RespValue::Array(elements))
            }
            other => Err(Error::Protocol(format!("invalid type byte {other:?}"))),
        }
    }
    .boxed()
}

/// The requests a node loop makes of its node.
#[async_trait]
pub trait Fetch: Send {
    /// Check that the node answers. Never fails, an unreachable node is
    /// simply not alive.
    async fn probe(&mut self) -> bool;

    /// Fetch the raw text of the node's `INFO` report.
    ///
    /// # Errors
    ///
    /// Returns an error if the node can't be reached or replies unexpectedly.
    async fn fetch_report(&mut self) -> Result<String, Error>;

    /// Fetch the masters a sentinel monitors, one report per master.
    ///
    /// # Errors
    ///
    /// Returns an error if the node can't be reached or replies unexpectedly.
    async fn sentinel_masters(&mut self) -> Result<Vec<Report>, Error>;
}

/// Creates a [`Fetch`] for a node.
pub trait Connect: Send + Sync + 'static {
    /// The fetcher produced.
    type Fetch: Fetch + 'static;

    /// Create a fetcher for `spec`. No connection is made until first use.
    fn connect(&self, spec: &NodeSpec) -> Self::Fetch;
}

/// Produces [`Client`] instances talking TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Fetch = Client;

    fn connect(&self, spec: &NodeSpec) -> Client {
        Client::new(spec.clone())
    }
}

/// A RESP2 connection to a single node.
#[derive(Debug)]
pub struct Client {
    spec: NodeSpec,
    conn: Option<BufReader<TcpStream>>,
}

impl Client {
    /// Create a client for `spec`, not yet connected.
    #[must_use]
    pub fn new(spec: NodeSpec) -> Self {
        Self { spec, conn: None }
    }

    async fn dial(&self) -> Result<BufReader<TcpStream>, Error> {
        let address = &self.spec.address;
        debug!(node = %self.spec.name, %address, "Connecting");
        let stream = time::timeout(
            self.spec.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| Error::Timeout("connect", self.spec.connect_timeout))??;
        stream.set_nodelay(true)?;
        let mut conn = BufReader::new(stream);

        if let Some(password) = &self.spec.password {
            match self.roundtrip(&mut conn, &["AUTH", password.as_str()]).await? {
                RespValue::SimpleString(_) => {}
                other => return Err(unexpected("AUTH", &other)),
            }
        }
        Ok(conn)
    }

    async fn roundtrip(
        &self,
        conn: &mut BufReader<TcpStream>,
        args: &[&str],
    ) -> Result<RespValue, Error> {
        trace!(node = %self.spec.name, command = args[0], "Sending");
        conn.get_mut().write_all(&encode_command(args)).await?;
        let reply = time::timeout(self.spec.read_timeout, decode(conn))
            .await
            .map_err(|_| Error::Timeout("read", self.spec.read_timeout))??;
        match reply {
            RespValue::Error(message) => Err(Error::Server(message)),
            reply => Ok(reply),
        }
    }

    /// Send `args` and read the reply, connecting first if needed. The
    /// connection is dropped if anything fails.
    async fn command(&mut self, args: &[&str]) -> Result<RespValue, Error> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.dial().await?,
        };
        let reply = self.roundtrip(&mut conn, args).await?;
        self.conn = Some(conn);
        Ok(reply)
    }
}

fn unexpected(command: &str, reply: &RespValue) -> Error {
    Error::Protocol(format!("unexpected reply to {command}: {reply:?}"))
}

#[async_trait]
impl Fetch for Client {
    async fn probe(&mut self) -> bool {
        match self.command(&["PING"]).await {
            Ok(RespValue::SimpleString(pong)) if pong == "PONG" => true,
            Ok(other) => {
                debug!(node = %self.spec.name, "Probe failed: {}", unexpected("PING", &other));
                self.conn = None;
                false
            }
            Err(err) => {
                debug!(node = %self.spec.name, "Probe failed: {err}");
                false
            }
        }
    }

    async fn fetch_report(&mut self) -> Result<String, Error> {
        let args: &[&str] = match self.spec.role {
            Role::Standalone => &["INFO", "all"],
            Role::Sentinel => &["INFO"],
        };
        match self.command(args).await? {
            RespValue::BulkString(text) => Ok(String::from_utf8_lossy(&text).into_owned()),
            other => Err(unexpected("INFO", &other)),
        }
    }

    async fn sentinel_masters(&mut self) -> Result<Vec<Report>, Error> {
        match self.command(&["SENTINEL", "MASTERS"]).await? {
            RespValue::Array(masters) => masters.iter().map(master_report).collect(),
            other => Err(unexpected("SENTINEL MASTERS", &other)),
        }
    }
}

/// A master is a flat array of alternating field names and values.
fn master_report(master: &RespValue) -> Result<Report, Error> {
    let RespValue::Array(pairs) = master else {
        return Err(unexpected("SENTINEL MASTERS", master));
    };
    Ok(pairs
        .chunks_exact(2)
        .filter_map(|pair| {
            Some((pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string()))
        })
        .collect())
}
