//! Frame format for the process-group transport.
//!
//! Every message is `[op u8][len u64 LE][len × f32 LE]`. Handshakes use a
//! fixed 14-byte record instead.

use recipes_core::error::DistError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAGIC: u32 = 0x4352_4e4e;
const PROTOCOL_VERSION: u16 = 1;
const HANDSHAKE_LEN: usize = 14;
const ACK: u8 = 0x06;

/// Collective operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Barrier = 1,
    Broadcast = 2,
    Reduce = 3,
    ReduceResult = 4,
}

impl Op {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Op::Barrier),
            2 => Some(Op::Broadcast),
            3 => Some(Op::Reduce),
            4 => Some(Op::ReduceResult),
            _ => None,
        }
    }
}

/// What a joining rank announces to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub rank: u32,
    pub world_size: u32,
}

impl Handshake {
    fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf[6..10].copy_from_slice(&self.rank.to_le_bytes());
        buf[10..14].copy_from_slice(&self.world_size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, DistError> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(DistError::handshake(format!("bad magic {magic:#x}")));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != PROTOCOL_VERSION {
            return Err(DistError::handshake(format!(
                "protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        Ok(Self {
            rank: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            world_size: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }
}

pub async fn write_handshake<W>(w: &mut W, handshake: Handshake) -> Result<(), DistError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&handshake.encode()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_handshake<R>(r: &mut R) -> Result<Handshake, DistError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    r.read_exact(&mut buf).await?;
    Handshake::decode(&buf)
}

pub async fn write_ack<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), DistError> {
    w.write_all(&[ACK]).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_ack<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), DistError> {
    let byte = r.read_u8().await?;
    if byte != ACK {
        return Err(DistError::handshake("coordinator refused the join"));
    }
    Ok(())
}

/// Write one frame.
pub async fn write_frame<W>(w: &mut W, op: Op, payload: &[f32]) -> Result<(), DistError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(9 + payload.len() * 4);
    buf.push(op as u8);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    for value in payload {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame and check it carries `expected` with exactly
/// `expected_len` values.
///
/// The length prefix is checked before anything is allocated.
pub async fn read_frame<R>(r: &mut R, expected: Op, expected_len: usize) -> Result<Vec<f32>, DistError>
where
    R: AsyncRead + Unpin,
{
    let op = r.read_u8().await?;
    match Op::from_u8(op) {
        Some(actual) if actual == expected => {}
        actual => {
            return Err(DistError::Desync {
                expected: format!("{expected:?}"),
                actual: actual.map_or_else(|| format!("op {op}"), |a| format!("{a:?}")),
            });
        }
    }
    let len = r.read_u64_le().await?;
    if len != expected_len as u64 {
        return Err(DistError::LengthMismatch {
            expected: expected_len,
            actual: usize::try_from(len).unwrap_or(usize::MAX),
        });
    }
    let mut bytes = vec![0u8; expected_len * 4];
    r.read_exact(&mut bytes).await?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
