//! The wire codec: message framing, the closed set of message types, and the
//! encode/decode pair every transport-facing component goes through. A message on the
//! wire is an 8-byte header (`length`, `type`, both big-endian `u32`) followed by
//! exactly `length` bytes of body. `length` never includes the header itself.

use crate::error::{ErrorKind, ProtoError, ProtoResult};
use crate::magic::{self, MAGIC_LEN};
use crate::services::{Services, Strictness};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{Cursor, Read};

pub const HEADER_SIZE: usize = 8;

/// Largest body this codec will ever accept. Guards against a corrupt or hostile
/// header claiming an unbounded allocation before the type is even known.
pub const MAX_BODY_SIZE: usize = 1 << 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub body_len: u32,
    pub msg_type: u32,
}

impl Header {
    pub fn decode(buf: &[u8]) -> ProtoResult<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtoError::Wait);
        }
        let mut cursor = Cursor::new(buf);
        let body_len = cursor.read_u32::<BigEndian>()?;
        let msg_type = cursor.read_u32::<BigEndian>()?;
        if body_len as usize > MAX_BODY_SIZE {
            return Err(ProtoError::Fatal(ErrorKind::SizeOutOfRange));
        }
        Ok(Header { body_len, msg_type })
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.body_len).unwrap();
        out.write_u32::<BigEndian>(self.msg_type).unwrap();
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum MessageType {
    ConnectReq = 1,
    ConnectCnf = 2,
    ConnectRej = 3,
    CloseReq = 4,
    SlicedInd = 5,
    ServiceReq = 6,
    ServiceCnf = 7,
    ServiceRej = 8,
    ChnTokenReq = 9,
    ChnTokenCnf = 10,
    ChnTokenInd = 11,
    ChnNotifyReq = 12,
    ChnNotifyCnf = 13,
    ChnReclaimReq = 14,
    ChnReclaimCnf = 15,
    ChnSuspendReq = 16,
    ChnSuspendCnf = 17,
    ChnSuspendRej = 18,
    ChnIoctlReq = 19,
    ChnIoctlCnf = 20,
    ChnIoctlRej = 21,
    ChnChangeInd = 22,
    DaemonPidReq = 23,
    DaemonPidCnf = 24,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtoError;

    fn try_from(value: u32) -> ProtoResult<MessageType> {
        use MessageType::*;
        Ok(match value {
            1 => ConnectReq,
            2 => ConnectCnf,
            3 => ConnectRej,
            4 => CloseReq,
            5 => SlicedInd,
            6 => ServiceReq,
            7 => ServiceCnf,
            8 => ServiceRej,
            9 => ChnTokenReq,
            10 => ChnTokenCnf,
            11 => ChnTokenInd,
            12 => ChnNotifyReq,
            13 => ChnNotifyCnf,
            14 => ChnReclaimReq,
            15 => ChnReclaimCnf,
            16 => ChnSuspendReq,
            17 => ChnSuspendCnf,
            18 => ChnSuspendRej,
            19 => ChnIoctlReq,
            20 => ChnIoctlCnf,
            21 => ChnIoctlRej,
            22 => ChnChangeInd,
            23 => DaemonPidReq,
            24 => DaemonPidCnf,
            other => return Err(ProtoError::Fatal(ErrorKind::UnknownMessageType(other))),
        })
    }
}

/// Channel priority class a client requests in `ConnectRequest` and that the
/// scheduler sorts on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Background = 1,
    Interactive = 2,
    Record = 3,
}

impl Priority {
    pub fn from_wire(value: u32) -> ProtoResult<Priority> {
        match value {
            1 => Ok(Priority::Background),
            2 => Ok(Priority::Interactive),
            3 => Ok(Priority::Record),
            _ => Err(ProtoError::Fatal(ErrorKind::SizeOutOfRange)),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SubPriority {
    Minimal = 0x00,
    Check = 0x10,
    Update = 0x20,
    Initial = 0x30,
    VpsPdc = 0x40,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub magic: [u8; MAGIC_LEN],
    pub endian_magic: u32,
    pub version: u32,
    /// The connecting process's pid, carried so `DaemonPidReq` and diagnostics can
    /// name who is holding a session without relying on `SO_PEERCRED`.
    pub pid: u32,
    /// Raw client flags (suppress-indications, no-timeout, ...); see `client::ClientFlags`.
    pub flags: u32,
    /// The scanning system the client expects the device to be tuned to, wire-encoded
    /// the same way as `ConnectConfirm.scanning`. `0` means "don't care".
    pub scanning: u32,
    /// How many buffered `SlicedIndication`s the client wants queued on its behalf
    /// before the daemon starts dropping frames to it.
    pub buffer_count: u32,
    /// The service mask the client wants granted immediately on connect, at
    /// `initial_strictness`, instead of waiting for a separate `ServiceRequest`.
    pub initial_services: Services,
    pub initial_strictness: i8,
    pub client_name: String,
    pub device_name: String,
}

#[derive(Debug, Clone)]
pub struct ConnectConfirm {
    pub version: u32,
    pub scanning: u32,
    pub services: Services,
}

#[derive(Debug, Clone)]
pub struct ConnectReject {
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub services: Services,
    pub strictness: Strictness,
    pub commit: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfirm {
    pub granted: Services,
    pub scanning: u32,
}

#[derive(Debug, Clone)]
pub struct ServiceReject {
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SlicedLine {
    pub id: Services,
    pub line: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SlicedIndication {
    pub timestamp: f64,
    pub lines: Vec<SlicedLine>,
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ChnTokenIndication {
    pub token_id: u32,
}

#[derive(Debug, Clone)]
pub struct ChnNotifyRequest {
    pub profile_sub_prio: u32,
    pub profile_allow_suspend: bool,
    pub min_duration: u32,
    pub exp_duration: u32,
}

#[derive(Debug, Clone)]
pub struct ChnChangeIndication {
    pub scanning: u32,
}

/// A fully decoded message, tagged by the variant it was decoded as. Every variant
/// corresponds to exactly one [`MessageType`]; [`Message::msg_type`] recovers it.
#[derive(Debug, Clone)]
pub enum Message {
    ConnectReq(ConnectRequest),
    ConnectCnf(ConnectConfirm),
    ConnectRej(ConnectReject),
    CloseReq,
    SlicedInd(SlicedIndication),
    ServiceReq(ServiceRequest),
    ServiceCnf(ServiceConfirm),
    ServiceRej(ServiceReject),
    ChnTokenReq,
    ChnTokenCnf,
    ChnTokenInd(ChnTokenIndication),
    ChnNotifyReq(ChnNotifyRequest),
    ChnNotifyCnf,
    ChnReclaimReq,
    ChnReclaimCnf,
    ChnSuspendReq { commit: bool },
    ChnSuspendCnf,
    ChnSuspendRej,
    ChnIoctlReq { request: u32, arg: Vec<u8> },
    ChnIoctlCnf { result: i32, arg: Vec<u8> },
    ChnIoctlRej,
    ChnChangeInd(ChnChangeIndication),
    DaemonPidReq,
    DaemonPidCnf { pid: u32 },
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        use Message::*;
        match self {
            ConnectReq(_) => MessageType::ConnectReq,
            ConnectCnf(_) => MessageType::ConnectCnf,
            ConnectRej(_) => MessageType::ConnectRej,
            CloseReq => MessageType::CloseReq,
            SlicedInd(_) => MessageType::SlicedInd,
            ServiceReq(_) => MessageType::ServiceReq,
            ServiceCnf(_) => MessageType::ServiceCnf,
            ServiceRej(_) => MessageType::ServiceRej,
            ChnTokenReq => MessageType::ChnTokenReq,
            ChnTokenCnf => MessageType::ChnTokenCnf,
            ChnTokenInd(_) => MessageType::ChnTokenInd,
            ChnNotifyReq(_) => MessageType::ChnNotifyReq,
            ChnNotifyCnf => MessageType::ChnNotifyCnf,
            ChnReclaimReq => MessageType::ChnReclaimReq,
            ChnReclaimCnf => MessageType::ChnReclaimCnf,
            ChnSuspendReq { .. } => MessageType::ChnSuspendReq,
            ChnSuspendCnf => MessageType::ChnSuspendCnf,
            ChnSuspendRej => MessageType::ChnSuspendRej,
            ChnIoctlReq { .. } => MessageType::ChnIoctlReq,
            ChnIoctlCnf { .. } => MessageType::ChnIoctlCnf,
            ChnIoctlRej => MessageType::ChnIoctlRej,
            ChnChangeInd(_) => MessageType::ChnChangeInd,
            DaemonPidReq => MessageType::DaemonPidReq,
            DaemonPidCnf { .. } => MessageType::DaemonPidCnf,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        encode_body(self, &mut body);

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        Header {
            body_len: body.len() as u32,
            msg_type: self.msg_type() as u32,
        }
        .encode(&mut out);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(header: Header, body: &[u8]) -> ProtoResult<Message> {
        if body.len() != header.body_len as usize {
            return Err(ProtoError::Fatal(ErrorKind::SizeMismatch));
        }
        let msg_type = MessageType::try_from(header.msg_type)?;
        decode_body(msg_type, body)
    }
}

fn write_fixed_str(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (width - take), 0);
}

fn read_fixed_str(cursor: &mut Cursor<&[u8]>, width: usize) -> ProtoResult<String> {
    let start = cursor.position() as usize;
    let buf = cursor.get_ref();
    if start + width > buf.len() {
        return Err(ProtoError::Fatal(ErrorKind::SizeMismatch));
    }
    let slice = &buf[start..start + width];
    cursor.set_position((start + width) as u64);
    let nul = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    Ok(String::from_utf8_lossy(&slice[..nul]).into_owned())
}

fn encode_body(msg: &Message, out: &mut Vec<u8>) {
    match msg {
        Message::ConnectReq(req) => {
            out.extend_from_slice(&req.magic);
            out.write_u32::<BigEndian>(req.endian_magic).unwrap();
            out.write_u32::<BigEndian>(req.version).unwrap();
            out.write_u32::<BigEndian>(req.pid).unwrap();
            out.write_u32::<BigEndian>(req.flags).unwrap();
            out.write_u32::<BigEndian>(req.scanning).unwrap();
            out.write_u32::<BigEndian>(req.buffer_count).unwrap();
            out.write_u32::<BigEndian>(req.initial_services.bits()).unwrap();
            out.write_i8(req.initial_strictness).unwrap();
            write_fixed_str(out, &req.client_name, magic::CLIENT_NAME_MAX_LENGTH);
            write_fixed_str(out, &req.device_name, magic::DEV_NAME_MAX_LENGTH);
        }
        Message::ConnectCnf(cnf) => {
            out.write_u32::<BigEndian>(cnf.version).unwrap();
            out.write_u32::<BigEndian>(cnf.scanning).unwrap();
            out.write_u32::<BigEndian>(cnf.services.bits()).unwrap();
        }
        Message::ConnectRej(rej) => {
            write_fixed_str(out, &rej.reason, magic::ERROR_STR_MAX_LENGTH);
        }
        Message::CloseReq => {}
        Message::SlicedInd(ind) => {
            out.write_f64::<BigEndian>(ind.timestamp).unwrap();
            out.write_u32::<BigEndian>(ind.lines.len() as u32).unwrap();
            out.write_u32::<BigEndian>(ind.raw.is_some() as u32).unwrap();
            for line in &ind.lines {
                out.write_u32::<BigEndian>(line.id.bits()).unwrap();
                out.write_u32::<BigEndian>(line.line).unwrap();
                out.write_u32::<BigEndian>(line.data.len() as u32).unwrap();
                out.extend_from_slice(&line.data);
            }
            if let Some(raw) = &ind.raw {
                out.write_u32::<BigEndian>(raw.len() as u32).unwrap();
                out.extend_from_slice(raw);
            }
        }
        Message::ServiceReq(req) => {
            out.write_u32::<BigEndian>(req.services.bits()).unwrap();
            out.write_i8(req.strictness.get()).unwrap();
            out.write_u8(req.commit as u8).unwrap();
        }
        Message::ServiceCnf(cnf) => {
            out.write_u32::<BigEndian>(cnf.granted.bits()).unwrap();
            out.write_u32::<BigEndian>(cnf.scanning).unwrap();
        }
        Message::ServiceRej(rej) => {
            write_fixed_str(out, &rej.reason, magic::ERROR_STR_MAX_LENGTH);
        }
        Message::ChnTokenReq | Message::ChnTokenCnf => {}
        Message::ChnTokenInd(ind) => {
            out.write_u32::<BigEndian>(ind.token_id).unwrap();
        }
        Message::ChnNotifyReq(req) => {
            out.write_u32::<BigEndian>(req.profile_sub_prio).unwrap();
            out.write_u8(req.profile_allow_suspend as u8).unwrap();
            out.write_u32::<BigEndian>(req.min_duration).unwrap();
            out.write_u32::<BigEndian>(req.exp_duration).unwrap();
        }
        Message::ChnNotifyCnf | Message::ChnReclaimReq | Message::ChnReclaimCnf => {}
        Message::ChnSuspendReq { commit } => {
            out.write_u8(*commit as u8).unwrap();
        }
        Message::ChnSuspendCnf | Message::ChnSuspendRej => {}
        Message::ChnIoctlReq { request, arg } => {
            out.write_u32::<BigEndian>(*request).unwrap();
            out.write_u32::<BigEndian>(arg.len() as u32).unwrap();
            out.extend_from_slice(arg);
        }
        Message::ChnIoctlCnf { result, arg } => {
            out.write_i32::<BigEndian>(*result).unwrap();
            out.write_u32::<BigEndian>(arg.len() as u32).unwrap();
            out.extend_from_slice(arg);
        }
        Message::ChnIoctlRej => {}
        Message::ChnChangeInd(ind) => {
            out.write_u32::<BigEndian>(ind.scanning).unwrap();
        }
        Message::DaemonPidReq => {}
        Message::DaemonPidCnf { pid } => {
            out.write_u32::<BigEndian>(*pid).unwrap();
        }
    }
}

/// Upper bound on a message type's body size, checked before a single field of it is
/// parsed — rejects a declared length that could never be valid for that type even if
/// every byte in it turned out to be well-formed.
pub fn message_max_size(msg_type: MessageType) -> usize {
    use MessageType::*;
    match msg_type {
        ConnectReq => {
            MAGIC_LEN + 4 * 7 + 1 + magic::CLIENT_NAME_MAX_LENGTH + magic::DEV_NAME_MAX_LENGTH
        }
        ConnectCnf => 12,
        ConnectRej => magic::ERROR_STR_MAX_LENGTH,
        CloseReq => 0,
        SlicedInd => MAX_BODY_SIZE,
        ServiceReq => 4 + 1 + 1,
        ServiceCnf => 8,
        ServiceRej => magic::ERROR_STR_MAX_LENGTH,
        ChnTokenReq | ChnTokenCnf => 0,
        ChnTokenInd => 4,
        ChnNotifyReq => 4 + 1 + 4 + 4,
        ChnNotifyCnf | ChnReclaimReq | ChnReclaimCnf => 0,
        ChnSuspendReq => 1,
        ChnSuspendCnf | ChnSuspendRej => 0,
        ChnIoctlReq => MAX_BODY_SIZE,
        ChnIoctlCnf => MAX_BODY_SIZE,
        ChnIoctlRej => 0,
        ChnChangeInd => 4,
        DaemonPidReq => 0,
        DaemonPidCnf => 4,
    }
}

fn decode_body(msg_type: MessageType, body: &[u8]) -> ProtoResult<Message> {
    if body.len() > message_max_size(msg_type) {
        return Err(ProtoError::Fatal(ErrorKind::SizeOutOfRange));
    }

    let mut cursor = Cursor::new(body);
    let size_err = || ProtoError::Fatal(ErrorKind::SizeMismatch);

    let msg = match msg_type {
        MessageType::ConnectReq => {
            let mut magic_buf = [0u8; MAGIC_LEN];
            cursor.read_exact(&mut magic_buf).map_err(|_| size_err())?;
            let endian_magic = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let version = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let pid = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let flags = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let scanning = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let buffer_count = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let initial_services = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let initial_strictness = cursor.read_i8().map_err(|_| size_err())?;
            let client_name = read_fixed_str(&mut cursor, magic::CLIENT_NAME_MAX_LENGTH)?;
            let device_name = read_fixed_str(&mut cursor, magic::DEV_NAME_MAX_LENGTH)?;
            Message::ConnectReq(ConnectRequest {
                magic: magic_buf,
                endian_magic,
                version,
                pid,
                flags,
                scanning,
                buffer_count,
                initial_services: Services::from_bits_truncate(initial_services),
                initial_strictness,
                client_name,
                device_name,
            })
        }
        MessageType::ConnectCnf => {
            let version = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let scanning = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let services = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::ConnectCnf(ConnectConfirm {
                version,
                scanning,
                services: Services::from_bits_truncate(services),
            })
        }
        MessageType::ConnectRej => Message::ConnectRej(ConnectReject {
            reason: read_fixed_str(&mut cursor, magic::ERROR_STR_MAX_LENGTH)?,
        }),
        MessageType::CloseReq => Message::CloseReq,
        MessageType::SlicedInd => {
            let timestamp = cursor.read_f64::<BigEndian>().map_err(|_| size_err())?;
            let line_count = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let has_raw = cursor.read_u32::<BigEndian>().map_err(|_| size_err())? != 0;
            let mut lines = Vec::with_capacity(line_count as usize);
            for _ in 0..line_count {
                let id = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
                let line = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
                let len = cursor.read_u32::<BigEndian>().map_err(|_| size_err())? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data).map_err(|_| size_err())?;
                lines.push(SlicedLine {
                    id: Services::from_bits_truncate(id),
                    line,
                    data,
                });
            }
            let raw = if has_raw {
                let len = cursor.read_u32::<BigEndian>().map_err(|_| size_err())? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data).map_err(|_| size_err())?;
                Some(data)
            } else {
                None
            };
            Message::SlicedInd(SlicedIndication {
                timestamp,
                lines,
                raw,
            })
        }
        MessageType::ServiceReq => {
            let services = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let strictness = cursor.read_i8().map_err(|_| size_err())?;
            let commit = cursor.read_u8().map_err(|_| size_err())? != 0;
            Message::ServiceReq(ServiceRequest {
                services: Services::from_bits_truncate(services),
                strictness: Strictness::clamped(strictness),
                commit,
            })
        }
        MessageType::ServiceCnf => {
            let granted = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let scanning = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::ServiceCnf(ServiceConfirm {
                granted: Services::from_bits_truncate(granted),
                scanning,
            })
        }
        MessageType::ServiceRej => Message::ServiceRej(ServiceReject {
            reason: read_fixed_str(&mut cursor, magic::ERROR_STR_MAX_LENGTH)?,
        }),
        MessageType::ChnTokenReq => Message::ChnTokenReq,
        MessageType::ChnTokenCnf => Message::ChnTokenCnf,
        MessageType::ChnTokenInd => {
            let token_id = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::ChnTokenInd(ChnTokenIndication { token_id })
        }
        MessageType::ChnNotifyReq => {
            let profile_sub_prio = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let profile_allow_suspend = cursor.read_u8().map_err(|_| size_err())? != 0;
            let min_duration = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let exp_duration = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::ChnNotifyReq(ChnNotifyRequest {
                profile_sub_prio,
                profile_allow_suspend,
                min_duration,
                exp_duration,
            })
        }
        MessageType::ChnNotifyCnf => Message::ChnNotifyCnf,
        MessageType::ChnReclaimReq => Message::ChnReclaimReq,
        MessageType::ChnReclaimCnf => Message::ChnReclaimCnf,
        MessageType::ChnSuspendReq => {
            let commit = cursor.read_u8().map_err(|_| size_err())? != 0;
            Message::ChnSuspendReq { commit }
        }
        MessageType::ChnSuspendCnf => Message::ChnSuspendCnf,
        MessageType::ChnSuspendRej => Message::ChnSuspendRej,
        MessageType::ChnIoctlReq => {
            let request = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            let len = cursor.read_u32::<BigEndian>().map_err(|_| size_err())? as usize;
            let mut arg = vec![0u8; len];
            cursor.read_exact(&mut arg).map_err(|_| size_err())?;
            Message::ChnIoctlReq { request, arg }
        }
        MessageType::ChnIoctlCnf => {
            let result = cursor.read_i32::<BigEndian>().map_err(|_| size_err())?;
            let len = cursor.read_u32::<BigEndian>().map_err(|_| size_err())? as usize;
            let mut arg = vec![0u8; len];
            cursor.read_exact(&mut arg).map_err(|_| size_err())?;
            Message::ChnIoctlCnf { result, arg }
        }
        MessageType::ChnIoctlRej => Message::ChnIoctlRej,
        MessageType::ChnChangeInd => {
            let scanning = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::ChnChangeInd(ChnChangeIndication { scanning })
        }
        MessageType::DaemonPidReq => Message::DaemonPidReq,
        MessageType::DaemonPidCnf => {
            let pid = cursor.read_u32::<BigEndian>().map_err(|_| size_err())?;
            Message::DaemonPidCnf { pid }
        }
    };

    if cursor.position() as usize != body.len() {
        return Err(size_err());
    }
    Ok(msg)
}

/// Checks a freshly decoded `ConnectRequest` against the magic string and endian
/// sentinel before anything else about it is trusted. Returns `Ok(())` when this
/// process and the peer agree on byte order; a mismatch is reported as fatal rather
/// than transformed (see the design notes on why byte-swap transform is not wired up).
pub fn check_connect_preamble(req: &ConnectRequest) -> ProtoResult<()> {
    if req.magic.as_ref() != magic::MAGIC_STR.as_ref() {
        return Err(ProtoError::Fatal(ErrorKind::BadMagic));
    }
    if req.endian_magic != magic::ENDIAN_MAGIC {
        return Err(ProtoError::Fatal(ErrorKind::BadEndianMagic));
    }
    if req.version != magic::COMPAT_VERSION {
        return Err(ProtoError::Fatal(ErrorKind::IncompatibleVersion));
    }
    Ok(())
}
