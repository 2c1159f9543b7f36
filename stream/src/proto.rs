//! Packet framing.
//!
//! Two wire formats share one logical [Packet]. All integers are big-endian.
//!
//! Simple, fixed head of 16B:
//!
//! | 4B  | 4B       | 4B  | 4B         |
//! | seq | err_code | cmd | packet_len |
//!
//! Guarded, fixed head of 24B:
//!
//! | 4B         | 4B  | 4B  | 4B       | 4B       | 1B      | 1B      | 1B  | 1B  |
//! | packet_len | seq | cmd | checksum | err_code | version | padding | SOH | EOH |
//!
//! `packet_len` counts the head and the body. The guarded checksum is the CRC32 of the whole frame
//! with the checksum field zeroed.

use crate::error::*;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use wirerpc_core::io::{AsyncBufRead, AsyncBufWrite, AsyncRead, AsyncWrite};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Upper bound of `packet_len`, a larger head is treated as garbage instead of being allocated.
pub const MAX_PACKET_LEN: usize = 64 << 20;

pub const GUARDED_VERSION: u8 = 1;
pub const GUARDED_SOH: u8 = 0x01;
pub const GUARDED_EOH: u8 = 0x02;

const MAX_HEAD_LEN: usize = 24;

/// One logical request or response on the wire
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u32,
    /// 0 on success, see [code](crate::error::code)
    pub err_code: u32,
    pub cmd: u32,
    pub body: Vec<u8>,
}

impl Packet {
    #[inline]
    pub fn new(cmd: u32, body: Vec<u8>) -> Self {
        Self { seq: 0, err_code: code::OK, cmd, body }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packet(seq={}, cmd={}, err={}, body={}B)",
            self.seq,
            self.cmd,
            self.err_code,
            self.body.len()
        )
    }
}

/// Head fields parsed before the body is read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHead {
    pub seq: u32,
    pub err_code: u32,
    pub cmd: u32,
    pub body_len: usize,
}

/// A wire format variant, selected as a type parameter by the server and the client.
pub trait WireFormat: Send + Sync + 'static + Sized {
    const NAME: &'static str;

    const HEAD_LEN: usize;

    /// Fill `head` (of HEAD_LEN) for `pkt`
    fn encode_head(pkt: &Packet, head: &mut [u8]);

    /// Validate and parse a head of HEAD_LEN
    fn decode_head(head: &[u8]) -> Result<FrameHead, RpcErr>;

    /// Integrity check after the body is read
    #[inline(always)]
    fn verify(_head: &[u8], _body: &[u8]) -> Result<(), RpcErr> {
        Ok(())
    }

    /// Construct the decoder over the read half of a stream
    #[inline]
    fn new_reader<R: AsyncRead>(reader: R, buf_size: usize) -> PacketReader<R, Self> {
        PacketReader::new(reader, buf_size)
    }

    /// Construct the encoder over the write half of a stream
    #[inline]
    fn new_writer<Wr: AsyncWrite>(writer: Wr, buf_size: usize) -> PacketWriter<Wr, Self> {
        PacketWriter::new(writer, buf_size)
    }
}

#[inline]
fn check_packet_len(packet_len: usize, head_len: usize) -> Result<usize, RpcErr> {
    if packet_len < head_len || packet_len > MAX_PACKET_LEN {
        return Err(RpcErr::InvalidFrame);
    }
    Ok(packet_len - head_len)
}

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(C)]
struct SimpleHead {
    seq: U32<BigEndian>,
    err_code: U32<BigEndian>,
    cmd: U32<BigEndian>,
    packet_len: U32<BigEndian>,
}

/// No integrity check, the head carries only the four fields
pub struct Simple;

impl WireFormat for Simple {
    const NAME: &'static str = "simple";

    const HEAD_LEN: usize = size_of::<SimpleHead>();

    #[inline]
    fn encode_head(pkt: &Packet, head: &mut [u8]) {
        let h = SimpleHead {
            seq: U32::new(pkt.seq),
            err_code: U32::new(pkt.err_code),
            cmd: U32::new(pkt.cmd),
            packet_len: U32::new((Self::HEAD_LEN + pkt.body.len()) as u32),
        };
        head.copy_from_slice(h.as_bytes());
    }

    #[inline]
    fn decode_head(head: &[u8]) -> Result<FrameHead, RpcErr> {
        let h = SimpleHead::read_from(head).ok_or(RpcErr::InvalidFrame)?;
        let body_len = check_packet_len(h.packet_len.get() as usize, Self::HEAD_LEN)?;
        Ok(FrameHead { seq: h.seq.get(), err_code: h.err_code.get(), cmd: h.cmd.get(), body_len })
    }
}

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(C)]
struct GuardedHead {
    packet_len: U32<BigEndian>,
    seq: U32<BigEndian>,
    cmd: U32<BigEndian>,
    checksum: U32<BigEndian>,
    err_code: U32<BigEndian>,
    version: u8,
    padding: u8,
    soh: u8,
    eoh: u8,
}

const GUARDED_CHECKSUM_OFFSET: usize = 12;

/// Version byte, start/end of head sentinels, and a CRC32 over the frame
pub struct Guarded;

impl Guarded {
    #[inline]
    fn checksum(head: &[u8], body: &[u8]) -> u32 {
        let mut zeroed = [0u8; MAX_HEAD_LEN];
        let zeroed = &mut zeroed[..head.len()];
        zeroed.copy_from_slice(head);
        zeroed[GUARDED_CHECKSUM_OFFSET..GUARDED_CHECKSUM_OFFSET + 4].fill(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(zeroed);
        hasher.update(body);
        hasher.finalize()
    }
}

impl WireFormat for Guarded {
    const NAME: &'static str = "guarded";

    const HEAD_LEN: usize = size_of::<GuardedHead>();

    #[inline]
    fn encode_head(pkt: &Packet, head: &mut [u8]) {
        let mut h = GuardedHead {
            packet_len: U32::new((Self::HEAD_LEN + pkt.body.len()) as u32),
            seq: U32::new(pkt.seq),
            cmd: U32::new(pkt.cmd),
            checksum: U32::new(0),
            err_code: U32::new(pkt.err_code),
            version: GUARDED_VERSION,
            padding: 0,
            soh: GUARDED_SOH,
            eoh: GUARDED_EOH,
        };
        h.checksum = U32::new(Self::checksum(h.as_bytes(), &pkt.body));
        head.copy_from_slice(h.as_bytes());
    }

    #[inline]
    fn decode_head(head: &[u8]) -> Result<FrameHead, RpcErr> {
        let h = GuardedHead::read_from(head).ok_or(RpcErr::InvalidFrame)?;
        if h.soh != GUARDED_SOH || h.eoh != GUARDED_EOH {
            return Err(RpcErr::InvalidFrame);
        }
        if h.version != GUARDED_VERSION {
            return Err(RpcErr::InvalidFrame);
        }
        let body_len = check_packet_len(h.packet_len.get() as usize, Self::HEAD_LEN)?;
        Ok(FrameHead { seq: h.seq.get(), err_code: h.err_code.get(), cmd: h.cmd.get(), body_len })
    }

    #[inline]
    fn verify(head: &[u8], body: &[u8]) -> Result<(), RpcErr> {
        let h = GuardedHead::read_from(head).ok_or(RpcErr::InvalidFrame)?;
        if h.checksum.get() != Self::checksum(head, body) {
            return Err(RpcErr::InvalidFrame);
        }
        Ok(())
    }
}

/// Decoder owning the buffered read half of a connection
pub struct PacketReader<R: AsyncRead, W: WireFormat> {
    inner: AsyncBufRead<R>,
    head: [u8; MAX_HEAD_LEN],
    _phan: PhantomData<fn(&W)>,
}

impl<R: AsyncRead, W: WireFormat> PacketReader<R, W> {
    pub fn new(reader: R, buf_size: usize) -> Self {
        Self { inner: AsyncBufRead::new(reader, buf_size), head: [0; MAX_HEAD_LEN], _phan: PhantomData }
    }

    /// Read one whole frame.
    ///
    /// Returns `Closed` when the peer closes the stream, `InvalidFrame` when the frame is corrupted.
    /// Either way the stream must not be read again.
    pub async fn read_packet(&mut self) -> Result<Packet, RpcErr> {
        let head = &mut self.head[..W::HEAD_LEN];
        self.inner.read_exact(head).await?;
        let fh = W::decode_head(head)?;
        let mut body = vec![0u8; fh.body_len];
        if fh.body_len > 0 {
            self.inner.read_exact(&mut body).await?;
        }
        W::verify(&self.head[..W::HEAD_LEN], &body)?;
        Ok(Packet { seq: fh.seq, err_code: fh.err_code, cmd: fh.cmd, body })
    }
}

/// Encoder owning the buffered write half of a connection.
///
/// Frames stay in the buffer until [PacketWriter::flush], or until the buffer fills up.
pub struct PacketWriter<Wr: AsyncWrite, W: WireFormat> {
    inner: AsyncBufWrite<Wr>,
    _phan: PhantomData<fn(&W)>,
}

impl<Wr: AsyncWrite, W: WireFormat> PacketWriter<Wr, W> {
    pub fn new(writer: Wr, buf_size: usize) -> Self {
        Self { inner: AsyncBufWrite::new(writer, buf_size), _phan: PhantomData }
    }

    pub async fn write_packet(&mut self, pkt: &Packet) -> Result<(), RpcErr> {
        if W::HEAD_LEN + pkt.body.len() > MAX_PACKET_LEN {
            return Err(RpcErr::InvalidFrame);
        }
        let mut head = [0u8; MAX_HEAD_LEN];
        let head = &mut head[..W::HEAD_LEN];
        W::encode_head(pkt, head);
        self.inner.write_all(head).await?;
        if !pkt.body.is_empty() {
            self.inner.write_all(&pkt.body).await?;
        }
        Ok(())
    }

    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<(), RpcErr> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write direction
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
