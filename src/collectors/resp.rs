//! Minimal blocking RESP client
//!
//! Scrapes happen inside `Collector::collect`, which is synchronous, so this
//! client uses plain sockets with timeouts instead of the async runtime.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Longest bulk reply accepted from a server
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

/// Deepest array nesting accepted from a server
const MAX_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

#[derive(Debug)]
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    /// Connect to `address`, trying every resolved socket address in turn
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, RespError> {
        let mut last_err = None;

        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    let writer = stream.try_clone()?;
                    return Ok(Self {
                        reader: BufReader::new(stream),
                        writer,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))
            .into())
    }

    /// Send one command and wait for its reply. Server errors become `Err`.
    pub fn execute(&mut self, args: &[&str]) -> Result<Reply, RespError> {
        self.writer.write_all(&encode_command(args))?;
        self.writer.flush()?;

        match read_reply(&mut self.reader)? {
            Reply::Error(message) => Err(RespError::Server(message)),
            reply => Ok(reply),
        }
    }

    /// Fetch the `INFO` text
    pub fn info(&mut self) -> Result<String, RespError> {
        match self.execute(&["INFO"])? {
            Reply::Bulk(Some(body)) => Ok(String::from_utf8_lossy(&body).into_owned()),
            Reply::Simple(body) => Ok(body),
            other => Err(RespError::Protocol(format!(
                "unexpected INFO reply: {:?}",
                other
            ))),
        }
    }
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Read one reply from `reader`
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply, RespError> {
    read_nested(reader, 0)
}

fn read_nested<R: BufRead>(reader: &mut R, depth: usize) -> Result<Reply, RespError> {
    if depth > MAX_DEPTH {
        return Err(RespError::Protocol(format!(
            "array nesting deeper than {}",
            MAX_DEPTH
        )));
    }

    let line = read_line(reader)?;
    let rest = line
        .get(1..)
        .ok_or_else(|| RespError::Protocol(format!("malformed line {:?}", line)))?;

    match line.as_bytes()[0] {
        b'+' => Ok(Reply::Simple(rest.to_string())),
        b'-' => Ok(Reply::Error(rest.to_string())),
        b':' => Ok(Reply::Integer(parse_int(rest)?)),
        b'$' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(RespError::Protocol(format!("bulk reply too large: {}", len)));
            }

            let mut body = vec![0u8; len + 2];
            reader.read_exact(&mut body)?;
            if &body[len..] != b"\r\n" {
                return Err(RespError::Protocol("bulk reply not terminated".to_string()));
            }
            body.truncate(len);
            Ok(Reply::Bulk(Some(body)))
        }
        b'*' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Reply::Array(None));
            }
            let mut items = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                items.push(read_nested(reader, depth + 1)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(RespError::Protocol(format!(
            "unknown reply prefix {:?}",
            other as char
        ))),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, RespError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    match line.strip_suffix("\r\n") {
        Some(stripped) if !stripped.is_empty() => Ok(stripped.to_string()),
        _ => Err(RespError::Protocol(format!("malformed line {:?}", line))),
    }
}

fn parse_int(s: &str) -> Result<i64, RespError> {
    s.parse()
        .map_err(|_| RespError::Protocol(format!("invalid integer {:?}", s)))
}
