// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NBD wire protocol constants and frame layouts.
//!
//! Covers the fixed-newstyle negotiation phase (option haggling) and the
//! transmission phase. All multi-byte integers on the wire are big-endian
//! except the request/reply handle, which the server echoes back opaquely.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(dead_code)]

use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::byteorder::big_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The 8 bytes a server greets clients with ("NBDMAGIC").
pub const NBD_INIT_PASSWD: [u8; 8] = *b"NBDMAGIC";
/// "IHAVEOPT"; follows the greeting on newstyle servers and prefixes every
/// client option.
pub const NBD_OPTION_MAGIC: u64 = 0x49484156454F5054;
/// Sent instead of [`NBD_OPTION_MAGIC`] by old-style servers.
pub const NBD_CLIENT_MAGIC: u64 = 0x00420281861253;
/// Prefixes every option reply from the server.
pub const NBD_REP_MAGIC: u64 = 0x3E889045565A9;

/// Prefixes every transmission-phase request.
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Prefixes every transmission-phase reply.
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_GO: u32 = 7;

pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = 1 | NBD_REP_FLAG_ERROR;
pub const NBD_REP_ERR_POLICY: u32 = 2 | NBD_REP_FLAG_ERROR;

pub const NBD_INFO_EXPORT: u16 = 0;

// Global handshake flags (and the client flags mirroring them).
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Per-export transmission flags.
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

// Transmission request types.
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

// Per-command flag bits, OR-ed into the request type field.
pub const NBD_CMD_FLAG_FUA: u32 = 1 << 16;

/// Returns whether `export_flags` carries `flag`, which per the protocol is
/// only meaningful when `NBD_FLAG_HAS_FLAGS` is set as well.
pub fn check_export_flag(export_flags: u16, flag: u16) -> bool {
    export_flags & NBD_FLAG_HAS_FLAGS != 0 && export_flags & flag != 0
}

/// Client option header sent during negotiation, followed by `length` bytes
/// of option data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct nbd_option_header {
    pub magic: U64,
    pub option: U32,
    pub length: U32,
}
const_assert_eq!(std::mem::size_of::<nbd_option_header>(), 16);

/// Server reply header during negotiation, followed by `length` bytes of
/// reply data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct nbd_option_reply_header {
    pub magic: U64,
    pub option: U32,
    pub reply_type: U32,
    pub length: U32,
}
const_assert_eq!(std::mem::size_of::<nbd_option_reply_header>(), 20);

/// Transmission-phase request. For `NBD_CMD_WRITE` the header is followed by
/// `length` bytes of payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct nbd_request {
    pub magic: U32,
    pub request_type: U32,
    pub handle: [u8; 8],
    pub offset: U64,
    pub length: U32,
}
const_assert_eq!(std::mem::size_of::<nbd_request>(), 28);

/// Transmission-phase reply. For a successful `NBD_CMD_READ` the header is
/// followed by the requested payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct nbd_reply {
    pub magic: U32,
    pub error: U32,
    pub handle: [u8; 8],
}
const_assert_eq!(std::mem::size_of::<nbd_reply>(), 16);

pub fn nbd_cmd_str(request_type: u32) -> &'static str {
    match request_type & 0xffff {
        NBD_CMD_READ => "NBD_CMD_READ",
        NBD_CMD_WRITE => "NBD_CMD_WRITE",
        NBD_CMD_DISC => "NBD_CMD_DISC",
        NBD_CMD_FLUSH => "NBD_CMD_FLUSH",
        NBD_CMD_TRIM => "NBD_CMD_TRIM",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    use super::*;

    #[test]
    fn request_layout() {
        let req = nbd_request {
            magic: NBD_REQUEST_MAGIC.into(),
            request_type: NBD_CMD_READ.into(),
            handle: 0x1122334455667788u64.to_ne_bytes(),
            offset: 0x1000.into(),
            length: 0x200.into(),
        };
        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 0, 0, 0, 0x10, 0]);
        assert_eq!(&bytes[24..28], &[0, 0, 0x02, 0]);
    }

    #[test]
    fn reply_parse() {
        let bytes = [
            0x67, 0x44, 0x66, 0x98, // magic
            0, 0, 0, 5, // error
            1, 2, 3, 4, 5, 6, 7, 8, // handle, opaque
        ];
        let reply = nbd_reply::read_from_bytes(&bytes[..]).unwrap();
        assert_eq!(reply.magic.get(), NBD_REPLY_MAGIC);
        assert_eq!(reply.error.get(), 5);
        assert_eq!(reply.handle, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn export_flag_gating() {
        assert!(check_export_flag(
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_TRIM,
            NBD_FLAG_SEND_TRIM
        ));
        // Without HAS_FLAGS the other bits are meaningless.
        assert!(!check_export_flag(NBD_FLAG_SEND_TRIM, NBD_FLAG_SEND_TRIM));
    }
}
