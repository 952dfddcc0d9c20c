//! Constants identifying the protocol and framing every peer must agree on before any
//! message body is trusted.

/// Sent as the first 16 bytes of a `ConnectRequest` body; anything else is not this
/// protocol at all and the connection is dropped without a reply.
pub const MAGIC_STR: &[u8; 16] = b"RUSTVBI PROXY\0\0\0";
pub const MAGIC_LEN: usize = 16;

/// Written by the sender in its own byte order. A reader that sees this value decoded
/// in its own byte order is talking to a peer of the same endianness; a reader that
/// sees [`ENDIAN_MISMATCH`] is talking to a peer of the opposite endianness, and the
/// mismatch is currently surfaced as a hard connect failure rather than transformed
/// (see the endian note in the connect handshake for why).
pub const ENDIAN_MAGIC: u32 = 0x1122_3344;
/// What [`ENDIAN_MAGIC`] decodes to when read with the wrong byte order.
pub const ENDIAN_MISMATCH: u32 = 0x4433_2211;

pub const VERSION: u32 = 0x0001_0000;
pub const COMPAT_VERSION: u32 = 0x0001_0000;

pub const CLIENT_NAME_MAX_LENGTH: usize = 64;
pub const DEV_NAME_MAX_LENGTH: usize = 128;
pub const ERROR_STR_MAX_LENGTH: usize = 128;

/// Size of one raw (unsliced) VBI line payload.
pub const RAW_LINE_SIZE: usize = 2048;

/// Byte size of a `SlicedIndication` body carrying `sliced_count` lines and `raw_count`
/// raw lines.
#[inline]
pub fn sliced_indication_size(sliced_count: u32, raw_count: u32) -> usize {
    const SLICED_LINE_SIZE: usize = 44;
    sliced_count as usize * SLICED_LINE_SIZE + raw_count as usize * RAW_LINE_SIZE
}
