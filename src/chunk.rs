//! Fixed-capacity chunk encoders: timestamp deltas, run-length (durations/periods), Gorilla XOR (values).
//!
//! A [`Chunk`] is a shared handle to one encoded block of at most [`SAMPLES_PER_CHUNK`] positional
//! slots. Writes go through a [`ChunkAppender`] cursor and always land at the next free slot.
//! Each chunk carries its own lock, so cursor writes never need the owning series' lock.

use crate::error::ChunkError;
use crate::types::Value;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of sample slots in every chunk.
pub const SAMPLES_PER_CHUNK: u16 = 120;

/// Chunk encoding, fixed by column kind. Serde: lowercase string (e.g. `"xor"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Zigzag varint deltas between consecutive values. Used for timestamps.
    Delta,
    /// (value, run length) pairs. Used for durations and periods.
    Rle,
    /// Gorilla-style XOR + leading/trailing-zero bitpacking. Used for stack-node values.
    Xor,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::Delta => "delta",
            Encoding::Rle => "rle",
            Encoding::Xor => "xor",
        })
    }
}

/// Sample count and encoded size of a single chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub samples: u16,
    pub bytes: usize,
}

/// Produces fresh chunks for a series. Swappable through [`crate::SeriesConfig`].
pub trait ChunkFactory: fmt::Debug + Send + Sync + 'static {
    fn new_chunk(&self, encoding: Encoding) -> Result<Chunk, ChunkError>;
}

#[derive(Debug, Default)]
pub struct DefaultChunkFactory;

impl ChunkFactory for DefaultChunkFactory {
    #[inline]
    fn new_chunk(&self, encoding: Encoding) -> Result<Chunk, ChunkError> {
        Ok(Chunk::new(encoding))
    }
}

pub fn default_chunk_factory() -> Arc<dyn ChunkFactory> {
    Arc::new(DefaultChunkFactory)
}

/// Shared handle to one encoded block. Cloning shares the underlying block.
#[derive(Debug, Clone)]
pub struct Chunk {
    encoding: Encoding,
    state: Arc<RwLock<ChunkState>>,
}

#[derive(Debug)]
struct ChunkState {
    num_samples: u16,
    body: Body,
}

#[derive(Debug)]
enum Body {
    /// Encoder state is live; appends go straight into it.
    Live(Codec),
    /// Opened from raw bytes; encoder state is recovered on the first cursor request.
    Encoded(Vec<u8>),
}

impl Chunk {
    /// Creates an empty chunk.
    pub fn new(encoding: Encoding) -> Self {
        Self::with_body(encoding, 0, Body::Live(Codec::new(encoding)))
    }

    /// Re-opens a previously encoded block. The bytes are not validated until a cursor is
    /// requested or the values are decoded.
    pub fn from_bytes(encoding: Encoding, bytes: Vec<u8>, num_samples: u16) -> Self {
        Self::with_body(encoding, num_samples, Body::Encoded(bytes))
    }

    fn with_body(encoding: Encoding, num_samples: u16, body: Body) -> Self {
        Self {
            encoding,
            state: Arc::new(RwLock::new(ChunkState { num_samples, body })),
        }
    }

    // Poisoned chunk locks are recovered: codec appends never leave a partial sample behind.
    fn read(&self) -> RwLockReadGuard<'_, ChunkState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChunkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether both handles share one underlying block.
    pub fn same_block(&self, other: &Chunk) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn num_samples(&self) -> u16 {
        self.read().num_samples
    }

    pub fn is_full(&self) -> bool {
        self.num_samples() >= SAMPLES_PER_CHUNK
    }

    /// Encoded size in bytes.
    pub fn num_bytes(&self) -> usize {
        match &self.read().body {
            Body::Live(codec) => codec.num_bytes(),
            Body::Encoded(bytes) => bytes.len(),
        }
    }

    /// Copy of the encoded block.
    pub fn bytes(&self) -> Vec<u8> {
        match &self.read().body {
            Body::Live(codec) => codec.bytes(),
            Body::Encoded(bytes) => bytes.clone(),
        }
    }

    pub fn stats(&self) -> ChunkStats {
        let state = self.read();
        let bytes = match &state.body {
            Body::Live(codec) => codec.num_bytes(),
            Body::Encoded(bytes) => bytes.len(),
        };
        ChunkStats {
            samples: state.num_samples,
            bytes,
        }
    }

    /// Decodes every sample currently held by the chunk.
    pub fn values(&self) -> Result<Vec<Value>, ChunkError> {
        let state = self.read();
        let bytes = match &state.body {
            Body::Live(codec) => codec.bytes(),
            Body::Encoded(bytes) => bytes.clone(),
        };
        decode(self.encoding, &bytes, state.num_samples as usize)
    }

    /// Returns a write cursor positioned after the last sample.
    ///
    /// # Errors
    /// Returns [`ChunkError::Corrupt`] if the chunk was opened from bytes that cannot be decoded.
    pub fn appender(&self) -> Result<ChunkAppender, ChunkError> {
        let mut state = self.write();
        let recovered = match &state.body {
            Body::Live(_) => None,
            Body::Encoded(bytes) => {
                if state.num_samples > SAMPLES_PER_CHUNK {
                    return Err(ChunkError::Corrupt {
                        encoding: self.encoding,
                        details: format!(
                            "{} samples exceed chunk capacity of {}",
                            state.num_samples, SAMPLES_PER_CHUNK
                        ),
                    });
                }
                let mut codec = Codec::new(self.encoding);
                for v in decode(self.encoding, bytes, state.num_samples as usize)? {
                    codec.append(v);
                }
                Some(codec)
            }
        };
        if let Some(codec) = recovered {
            state.body = Body::Live(codec);
        }
        Ok(ChunkAppender {
            chunk: self.clone(),
        })
    }
}

/// Write cursor over the tail of a chunk.
#[derive(Debug)]
pub struct ChunkAppender {
    chunk: Chunk,
}

impl ChunkAppender {
    /// Writes `value` at `slot`.
    ///
    /// Slots between the current sample count and `slot` are filled with zeros so the value lands
    /// at its positional index. Slots already written and slots past capacity are ignored.
    pub fn append_at(&mut self, slot: u16, value: Value) {
        debug_assert!(slot < SAMPLES_PER_CHUNK, "slot {slot} out of chunk bounds");
        if slot >= SAMPLES_PER_CHUNK {
            return;
        }
        let mut state = self.chunk.write();
        debug_assert!(
            slot >= state.num_samples,
            "slot {slot} already written (num_samples={})",
            state.num_samples
        );
        if slot < state.num_samples {
            return;
        }
        let ChunkState { num_samples, body } = &mut *state;
        // Cursors are only handed out once the body is live.
        if let Body::Live(codec) = body {
            while *num_samples < slot {
                codec.append(0);
                *num_samples += 1;
            }
            codec.append(value);
            *num_samples += 1;
        }
    }

    /// The chunk this cursor writes into.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }
}

// --- Codecs ---

#[derive(Debug)]
enum Codec {
    Delta(DeltaCodec),
    Rle(RleCodec),
    Xor(XorCodec),
}

impl Codec {
    fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Delta => Codec::Delta(DeltaCodec::default()),
            Encoding::Rle => Codec::Rle(RleCodec::default()),
            Encoding::Xor => Codec::Xor(XorCodec::default()),
        }
    }

    fn append(&mut self, v: Value) {
        match self {
            Codec::Delta(c) => c.append(v),
            Codec::Rle(c) => c.append(v),
            Codec::Xor(c) => c.append(v),
        }
    }

    fn num_bytes(&self) -> usize {
        match self {
            Codec::Delta(c) => c.buf.len(),
            Codec::Rle(c) => c.num_bytes(),
            Codec::Xor(c) => c.bits.buf.len(),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            Codec::Delta(c) => c.buf.clone(),
            Codec::Rle(c) => c.bytes(),
            Codec::Xor(c) => c.bits.buf.clone(),
        }
    }
}

fn decode(encoding: Encoding, bytes: &[u8], count: usize) -> Result<Vec<Value>, ChunkError> {
    let res = match encoding {
        Encoding::Delta => decode_delta(bytes, count),
        Encoding::Rle => decode_rle(bytes, count),
        Encoding::Xor => decode_xor(bytes, count),
    };
    res.map_err(|details| ChunkError::Corrupt { encoding, details })
}

/// First value as a zigzag varint, then zigzag varint deltas.
#[derive(Debug, Default)]
struct DeltaCodec {
    buf: Vec<u8>,
    prev: Option<Value>,
}

impl DeltaCodec {
    fn append(&mut self, v: Value) {
        let encoded = match self.prev {
            None => v,
            Some(prev) => v.wrapping_sub(prev),
        };
        write_var_u64(&mut self.buf, zigzag(encoded));
        self.prev = Some(v);
    }
}

fn decode_delta(bytes: &[u8], count: usize) -> Result<Vec<Value>, String> {
    let mut cur = Cursor::new(bytes);
    let mut out = Vec::with_capacity(count);
    let mut prev: Value = 0;
    for i in 0..count {
        let d = unzigzag(read_var_u64(&mut cur)?);
        prev = if i == 0 { d } else { prev.wrapping_add(d) };
        out.push(prev);
    }
    ensure_consumed(&cur, bytes.len())?;
    Ok(out)
}

/// Runs of identical values.
#[derive(Debug, Default)]
struct RleCodec {
    runs: Vec<(Value, u16)>,
}

impl RleCodec {
    fn append(&mut self, v: Value) {
        match self.runs.last_mut() {
            Some((last, len)) if *last == v => *len += 1,
            _ => self.runs.push((v, 1)),
        }
    }

    fn num_bytes(&self) -> usize {
        self.runs
            .iter()
            .map(|&(v, len)| var_u64_len(zigzag(v)) + var_u64_len(len as u64))
            .sum()
    }

    fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.num_bytes());
        for &(v, len) in &self.runs {
            write_var_u64(&mut buf, zigzag(v));
            write_var_u64(&mut buf, len as u64);
        }
        buf
    }
}

fn decode_rle(bytes: &[u8], count: usize) -> Result<Vec<Value>, String> {
    let mut cur = Cursor::new(bytes);
    let mut out = Vec::with_capacity(count);
    while (cur.position() as usize) < bytes.len() {
        let v = unzigzag(read_var_u64(&mut cur)?);
        let len = read_var_u64(&mut cur)? as usize;
        if len == 0 || out.len() + len > count {
            return Err(format!("Run length {} overflows sample count {}", len, count));
        }
        out.extend(std::iter::repeat(v).take(len));
    }
    if out.len() != count {
        return Err(format!("Decoded {} samples, expected {}", out.len(), count));
    }
    Ok(out)
}

/// Gorilla XOR over the two's complement bits of each value.
#[derive(Debug, Default)]
struct XorCodec {
    bits: BitStream,
    prev: Option<u64>,
    prev_leading: u8,
    prev_trailing: u8,
    prev_sigbits: u8,
}

impl XorCodec {
    fn append(&mut self, v: Value) {
        let cur = v as u64;
        let prev = match self.prev {
            None => {
                self.bits.push_bytes(&cur.to_le_bytes());
                self.prev = Some(cur);
                return;
            }
            Some(p) => p,
        };

        let x = prev ^ cur;
        if x == 0 {
            self.bits.push_bit(false);
        } else {
            self.bits.push_bit(true);
            let leading = x.leading_zeros() as u8;
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 64 - leading - trailing;

            if self.prev_sigbits != 0
                && leading >= self.prev_leading
                && trailing >= self.prev_trailing
            {
                self.bits.push_bit(false);
                self.bits.push_bits(x >> self.prev_trailing, self.prev_sigbits);
            } else {
                self.bits.push_bit(true);
                self.bits.push_bits(leading as u64, 6);
                self.bits.push_bits((sigbits - 1) as u64, 6);
                self.bits.push_bits(x >> trailing, sigbits);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
                self.prev_sigbits = sigbits;
            }
        }
        self.prev = Some(cur);
    }
}

fn decode_xor(bytes: &[u8], count: usize) -> Result<Vec<Value>, String> {
    if count == 0 {
        if !bytes.is_empty() {
            return Err("Trailing bytes in empty chunk".to_string());
        }
        return Ok(Vec::new());
    }
    let mut cur = Cursor::new(bytes);
    let mut first = [0u8; 8];
    cur.read_exact(&mut first)
        .map_err(|e| format!("Truncated first value: {}", e))?;
    let first = u64::from_le_bytes(first);

    let mut out = Vec::with_capacity(count);
    out.push(first as Value);
    let mut br = BitReader::new(&mut cur);

    let mut prev = first;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for _ in 1..count {
        if !br.read_bit()? {
            out.push(prev as Value);
            continue;
        }
        let (sigbits, trailing) = if !br.read_bit()? {
            if prev_sigbits == 0 {
                return Err("XOR reuse window before initialization".to_string());
            }
            (prev_sigbits, prev_trailing)
        } else {
            let leading = br.read_bits(6)? as u8;
            let sigbits = (br.read_bits(6)? as u8).saturating_add(1);
            let trailing = 64u8
                .checked_sub(leading)
                .and_then(|t| t.checked_sub(sigbits))
                .ok_or_else(|| format!("Invalid XOR window leading={} sigbits={}", leading, sigbits))?;
            prev_trailing = trailing;
            prev_sigbits = sigbits;
            (sigbits, trailing)
        };
        let significant = br.read_bits(sigbits)?;
        prev ^= significant << trailing;
        out.push(prev as Value);
    }
    Ok(out)
}

// --- Bit and varint helpers ---

/// Append-only bit stream; bits fill each byte from the most significant end.
#[derive(Debug)]
struct BitStream {
    buf: Vec<u8>,
    // Bits used in the last byte of `buf`; 8 means a new byte is needed.
    used: u8,
}

impl Default for BitStream {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            used: 8,
        }
    }
}

impl BitStream {
    fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.used, 8);
        self.buf.extend_from_slice(bytes);
    }

    fn push_bit(&mut self, bit: bool) {
        if self.used == 8 {
            self.buf.push(0);
            self.used = 0;
        }
        if bit {
            if let Some(last) = self.buf.last_mut() {
                *last |= 1u8 << (7 - self.used);
            }
        }
        self.used += 1;
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }
}

struct BitReader<'a, R: Read> {
    r: &'a mut R,
    cur: u8,
    left: u8,
}

impl<'a, R: Read> BitReader<'a, R> {
    fn new(r: &'a mut R) -> Self {
        Self { r, cur: 0, left: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, String> {
        if self.left == 0 {
            let mut b = [0u8; 1];
            self.r
                .read_exact(&mut b)
                .map_err(|e| format!("Truncated bit stream: {}", e))?;
            self.cur = b[0];
            self.left = 8;
        }
        let bit = (self.cur & (1u8 << (self.left - 1))) != 0;
        self.left -= 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, String> {
        let mut out = 0u64;
        for _ in 0..count {
            out <<= 1;
            out |= if self.read_bit()? { 1 } else { 0 };
        }
        Ok(out)
    }
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn var_u64_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

fn ensure_consumed(cur: &Cursor<&[u8]>, len: usize) -> Result<(), String> {
    let pos = cur.position() as usize;
    if pos != len {
        return Err(format!("{} trailing bytes after last sample", len - pos));
    }
    Ok(())
}
