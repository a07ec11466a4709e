// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NBD client side: TCP connection establishment, fixed-newstyle option
//! negotiation and transmission-phase framing.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;

use base::debug;
use base::info;
use base::warn;
use nbd_sys::*;
use remain::sorted;
use thiserror::Error as ThisError;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::device::DiskFlags;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("connection not allowed by server policy: {0}")]
    AccessDenied(String),
    #[error("could not resolve or connect to {host}:{port}: {err}")]
    Connect {
        host: String,
        port: u16,
        err: io::Error,
    },
    #[error("backend connection closed: {0}")]
    Disconnected(io::Error),
    #[error("invalid negotiation magic {0:#x}")]
    InvalidHandshakeMagic(u64),
    #[error("invalid reply magic {0:#x}")]
    InvalidReplyMagic(u32),
    #[error("old-style NBD servers are not supported")]
    OldStyleServer,
    #[error("server rejected the export: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Size and capability flags of the negotiated export.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportInfo {
    pub size: u64,
    pub transmission_flags: u16,
}

impl ExportInfo {
    /// ORs the capabilities advertised by the server into `flags`. Per the
    /// protocol, the capability bits only count when HAS_FLAGS is set.
    pub fn apply_to(&self, flags: &mut DiskFlags) {
        let tf = self.transmission_flags;
        flags.read_only |= check_export_flag(tf, NBD_FLAG_READ_ONLY);
        flags.flush_supported |= check_export_flag(tf, NBD_FLAG_SEND_FLUSH);
        flags.fua_supported |= check_export_flag(tf, NBD_FLAG_SEND_FUA);
        flags.unmap_supported |= check_export_flag(tf, NBD_FLAG_SEND_TRIM);
    }
}

/// Maps every socket error on an established connection to `Disconnected`;
/// the dispatcher treats them all as a dead backend.
fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(Error::Disconnected)
}

fn write_all(writer: &mut impl Write, buf: &[u8]) -> Result<()> {
    writer.write_all(buf).map_err(Error::Disconnected)
}

/// Opens a TCP connection to the NBD server, trying each resolved address in
/// turn.
pub fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let connect_err = |err| Error::Connect {
        host: host.to_string(),
        port,
        err,
    };
    let addrs = (host, port).to_socket_addrs().map_err(connect_err)?;
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(sock) => {
                info!("connected to NBD server at {}", addr);
                return Ok(sock);
            }
            Err(e) => last_err = e,
        }
    }
    Err(connect_err(last_err))
}

fn send_option(sock: &mut TcpStream, option: u32, data: &[u8]) -> Result<()> {
    let header = nbd_option_header {
        magic: NBD_OPTION_MAGIC.into(),
        option: option.into(),
        length: (data.len() as u32).into(),
    };
    write_all(sock, header.as_bytes())?;
    write_all(sock, data)
}

struct OptionReply {
    reply_type: u32,
    data: Vec<u8>,
}

fn read_option_reply(sock: &mut TcpStream) -> Result<OptionReply> {
    let mut header = [0u8; std::mem::size_of::<nbd_option_reply_header>()];
    read_exact(sock, &mut header)?;
    let header = nbd_option_reply_header::read_from_bytes(&header[..]).unwrap();
    if header.magic.get() != NBD_REP_MAGIC {
        return Err(Error::InvalidHandshakeMagic(header.magic.get()));
    }
    let mut data = vec![0u8; header.length.get() as usize];
    read_exact(sock, &mut data)?;
    Ok(OptionReply {
        reply_type: header.reply_type.get(),
        data,
    })
}

fn parse_export_sizes(data: &[u8]) -> ExportInfo {
    ExportInfo {
        size: u64::from_be_bytes(data[0..8].try_into().unwrap()),
        transmission_flags: u16::from_be_bytes(data[8..10].try_into().unwrap()),
    }
}

/// Falls back to the pre-GO export selection: the server answers with the
/// export size and flags directly, plus 124 bytes of padding unless both
/// sides agreed on NO_ZEROES.
fn send_opt_export_name(
    sock: &mut TcpStream,
    export_name: &str,
    no_zeroes: bool,
) -> Result<ExportInfo> {
    send_option(sock, NBD_OPT_EXPORT_NAME, export_name.as_bytes())?;
    let mut buf = [0u8; 10];
    read_exact(sock, &mut buf)?;
    let info = parse_export_sizes(&buf);
    if !no_zeroes {
        let mut pad = [0u8; 124];
        read_exact(sock, &mut pad)?;
    }
    Ok(info)
}

/// Runs the fixed-newstyle handshake and selects `export_name` via
/// NBD_OPT_GO, falling back to NBD_OPT_EXPORT_NAME on servers that do not
/// support it.
pub fn negotiate(sock: &mut TcpStream, export_name: &str) -> Result<ExportInfo> {
    let mut greeting = [0u8; 8];
    read_exact(sock, &mut greeting)?;
    if greeting != NBD_INIT_PASSWD {
        return Err(Error::InvalidHandshakeMagic(u64::from_be_bytes(greeting)));
    }

    let mut magic = [0u8; 8];
    read_exact(sock, &mut magic)?;
    let magic = u64::from_be_bytes(magic);
    if magic != NBD_OPTION_MAGIC {
        if magic == NBD_CLIENT_MAGIC {
            info!("old-style NBD server detected");
            return Err(Error::OldStyleServer);
        }
        return Err(Error::InvalidHandshakeMagic(magic));
    }

    let mut global_flags = [0u8; 2];
    read_exact(sock, &mut global_flags)?;
    let global_flags = u16::from_be_bytes(global_flags);

    let mut client_flags = NBD_FLAG_FIXED_NEWSTYLE as u32;
    let no_zeroes = global_flags & NBD_FLAG_NO_ZEROES != 0;
    if no_zeroes {
        client_flags |= NBD_FLAG_NO_ZEROES as u32;
    }
    write_all(sock, &client_flags.to_be_bytes())?;

    // NBD_OPT_GO data: name length, name, and the (empty) information
    // request list.
    let mut go_data = Vec::with_capacity(export_name.len() + 6);
    go_data.extend_from_slice(&(export_name.len() as u32).to_be_bytes());
    go_data.extend_from_slice(export_name.as_bytes());
    go_data.extend_from_slice(&0u16.to_be_bytes());
    send_option(sock, NBD_OPT_GO, &go_data)?;

    let mut export_info = None;
    loop {
        let reply = read_option_reply(sock)?;
        if reply.reply_type & NBD_REP_FLAG_ERROR != 0 {
            let message = String::from_utf8_lossy(&reply.data).into_owned();
            return match reply.reply_type {
                NBD_REP_ERR_UNSUP => {
                    warn!("server does not support NBD_OPT_GO, falling back to NBD_OPT_EXPORT_NAME");
                    send_opt_export_name(sock, export_name, no_zeroes)
                }
                NBD_REP_ERR_POLICY => Err(Error::AccessDenied(message)),
                _ => Err(Error::Rejected(message)),
            };
        }
        match reply.reply_type {
            NBD_REP_INFO => {
                if reply.data.len() >= 12 {
                    let info_type = u16::from_be_bytes(reply.data[0..2].try_into().unwrap());
                    if info_type == NBD_INFO_EXPORT {
                        export_info = Some(parse_export_sizes(&reply.data[2..12]));
                    } else {
                        debug!("ignoring NBD info type {}", info_type);
                    }
                }
            }
            NBD_REP_ACK => break,
            other => warn!("ignoring unknown reply to NBD_OPT_GO: {}", other),
        }
    }
    export_info.ok_or_else(|| Error::Rejected("server sent no export info".to_string()))
}

/// Sends a payload-less transmission request (read, flush, trim).
pub fn send_command(
    mut sock: impl Write,
    request_type: u32,
    tag: u64,
    offset: u64,
    length: u32,
) -> Result<()> {
    let request = nbd_request {
        magic: NBD_REQUEST_MAGIC.into(),
        request_type: request_type.into(),
        handle: tag.to_ne_bytes(),
        offset: offset.into(),
        length: length.into(),
    };
    write_all(&mut sock, request.as_bytes())
}

/// Sends a write request, coalescing header and payload into `scratch` so
/// the transfer hits the socket as a single send. `scratch` grows on demand
/// and is never shrunk.
pub fn send_write(
    mut sock: impl Write,
    request_type: u32,
    tag: u64,
    offset: u64,
    payload: &[u8],
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let request = nbd_request {
        magic: NBD_REQUEST_MAGIC.into(),
        request_type: request_type.into(),
        handle: tag.to_ne_bytes(),
        offset: offset.into(),
        length: (payload.len() as u32).into(),
    };
    let header = request.as_bytes();
    let needed = header.len() + payload.len();
    if scratch.len() < needed {
        scratch.resize(needed, 0);
    }
    scratch[..header.len()].copy_from_slice(header);
    scratch[header.len()..needed].copy_from_slice(payload);
    write_all(&mut sock, &scratch[..needed])
}

/// Reads one transmission reply header, returning the server error code and
/// the echoed tag.
pub fn read_reply(mut sock: impl Read) -> Result<(u32, u64)> {
    let mut buf = [0u8; std::mem::size_of::<nbd_reply>()];
    read_exact(&mut sock, &mut buf)?;
    let reply = nbd_reply::read_from_bytes(&buf[..]).unwrap();
    if reply.magic.get() != NBD_REPLY_MAGIC {
        return Err(Error::InvalidReplyMagic(reply.magic.get()));
    }
    Ok((reply.error.get(), u64::from_ne_bytes(reply.handle)))
}

/// Length-exact payload read into `buf`.
pub fn read_payload(mut sock: impl Read, buf: &mut [u8]) -> Result<()> {
    read_exact(&mut sock, buf)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Serves one scripted fixed-newstyle negotiation on a loopback socket.
    fn scripted_server(
        replies: Vec<(u32, Vec<u8>)>,
    ) -> (std::net::SocketAddr, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&NBD_INIT_PASSWD).unwrap();
            sock.write_all(&NBD_OPTION_MAGIC.to_be_bytes()).unwrap();
            sock.write_all(&(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes())
                .unwrap();

            let mut client_flags = [0u8; 4];
            sock.read_exact(&mut client_flags).unwrap();

            // Option header plus data.
            let mut header = [0u8; 16];
            sock.read_exact(&mut header).unwrap();
            let length = u32::from_be_bytes(header[12..16].try_into().unwrap());
            let mut option_data = vec![0u8; length as usize];
            sock.read_exact(&mut option_data).unwrap();

            for (reply_type, data) in replies {
                let header = nbd_option_reply_header {
                    magic: NBD_REP_MAGIC.into(),
                    option: NBD_OPT_GO.into(),
                    reply_type: reply_type.into(),
                    length: (data.len() as u32).into(),
                };
                sock.write_all(header.as_bytes()).unwrap();
                sock.write_all(&data).unwrap();
            }
            option_data
        });
        (addr, server)
    }

    fn info_export_reply(size: u64, flags: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(&flags.to_be_bytes());
        data
    }

    #[test]
    fn negotiate_with_opt_go() {
        let (addr, server) = scripted_server(vec![
            (
                NBD_REP_INFO,
                info_export_reply(1 << 20, NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH),
            ),
            (NBD_REP_ACK, Vec::new()),
        ]);
        let mut sock = TcpStream::connect(addr).unwrap();
        let info = negotiate(&mut sock, "export-a").unwrap();
        assert_eq!(info.size, 1 << 20);
        assert_eq!(
            info.transmission_flags,
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH
        );

        // The server saw the export name inside the OPT_GO payload.
        let option_data = server.join().unwrap();
        let name_len = u32::from_be_bytes(option_data[0..4].try_into().unwrap()) as usize;
        assert_eq!(&option_data[4..4 + name_len], b"export-a");
    }

    #[test]
    fn negotiate_policy_error_is_access_denied() {
        let (addr, _server) =
            scripted_server(vec![(NBD_REP_ERR_POLICY, b"not allowed".to_vec())]);
        let mut sock = TcpStream::connect(addr).unwrap();
        match negotiate(&mut sock, "export-a") {
            Err(Error::AccessDenied(msg)) => assert_eq!(msg, "not allowed"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn negotiate_other_error_is_rejected() {
        let (addr, _server) = scripted_server(vec![(
            NBD_REP_FLAG_ERROR | 7,
            b"server exploded".to_vec(),
        )]);
        let mut sock = TcpStream::connect(addr).unwrap();
        assert!(matches!(
            negotiate(&mut sock, "export-a"),
            Err(Error::Rejected(_))
        ));
    }

    #[test]
    fn capability_flags_require_has_flags() {
        let mut flags = DiskFlags::default();
        ExportInfo {
            size: 0,
            transmission_flags: NBD_FLAG_SEND_TRIM | NBD_FLAG_SEND_FUA,
        }
        .apply_to(&mut flags);
        assert!(!flags.unmap_supported);
        assert!(!flags.fua_supported);

        ExportInfo {
            size: 0,
            transmission_flags: NBD_FLAG_HAS_FLAGS
                | NBD_FLAG_SEND_TRIM
                | NBD_FLAG_SEND_FUA
                | NBD_FLAG_READ_ONLY,
        }
        .apply_to(&mut flags);
        assert!(flags.unmap_supported);
        assert!(flags.fua_supported);
        assert!(flags.read_only);
    }

    #[test]
    fn request_frame_round_trip() {
        let mut frame = Vec::new();
        send_command(&mut frame, NBD_CMD_FLUSH, 9, 0x1000, 0).unwrap();
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[0..4], &NBD_REQUEST_MAGIC.to_be_bytes());
        assert_eq!(&frame[4..8], &NBD_CMD_FLUSH.to_be_bytes());
        assert_eq!(u64::from_ne_bytes(frame[8..16].try_into().unwrap()), 9);
    }

    #[test]
    fn write_frame_coalesces_payload() {
        let mut frame = Vec::new();
        let mut scratch = Vec::new();
        let payload = vec![0xaa; 512];
        send_write(&mut frame, NBD_CMD_WRITE, 3, 512, &payload, &mut scratch).unwrap();
        assert_eq!(frame.len(), 28 + 512);
        assert_eq!(&frame[28..], &payload[..]);
        assert!(scratch.len() >= 28 + 512);
    }

    #[test]
    fn reply_magic_is_checked() {
        let mut bad = vec![0u8; 16];
        bad[0..4].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        assert!(matches!(
            read_reply(&bad[..]),
            Err(Error::InvalidReplyMagic(0xdeadbeef))
        ));
    }
}
