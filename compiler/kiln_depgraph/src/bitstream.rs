//! Bitstream Container
//!
//! A minimal LLVM-style bitstream: values are emitted LSB-first into a
//! little-endian byte stream, grouped into blocks with their own abbrevia-
//! tion scopes. Abbreviations describe record layouts (fixed-width, VBR,
//! arrays, blobs) so records cost a handful of bits instead of a header
//! each. Block 0 is the block-info block; abbreviations defined there
//! apply to every instance of the block named by the preceding SETBID
//! record.
//!
//! Only the features the dependency-graph format needs are implemented;
//! Char6 encoding and multi-word fixed fields are not.

use std::fmt;

use rustc_hash::FxHashMap;

/// Reserved abbreviation ids.
pub const END_BLOCK: u64 = 0;
pub const ENTER_SUBBLOCK: u64 = 1;
pub const DEFINE_ABBREV: u64 = 2;
pub const UNABBREV_RECORD: u64 = 3;
/// First id assignable to an application abbreviation.
pub const FIRST_APP_ABBREV: u64 = 4;

/// The block-info block's well-known id.
pub const BLOCKINFO_BLOCK_ID: u64 = 0;
/// Record codes inside the block-info block.
pub const BLOCKINFO_SETBID: u64 = 1;
pub const BLOCKINFO_BLOCKNAME: u64 = 2;
pub const BLOCKINFO_SETRECORDNAME: u64 = 3;

/// One operand of an abbreviation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbbrevOp {
    /// A value baked into the abbreviation; not present in the stream.
    Literal(u64),
    /// Fixed-width field.
    Fixed(u32),
    /// Variable-bit-rate field with the given chunk width.
    Vbr(u32),
    /// Length-prefixed run of the following operand. Must be second to
    /// last, followed by its element operand.
    Array,
    /// Length-prefixed byte string, 32-bit aligned. Must be last.
    Blob,
}

impl AbbrevOp {
    const ENC_FIXED: u64 = 1;
    const ENC_VBR: u64 = 2;
    const ENC_ARRAY: u64 = 3;
    const ENC_BLOB: u64 = 5;
}

/// A record layout: the operands in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbrev {
    pub ops: Vec<AbbrevOp>,
}

impl Abbrev {
    #[must_use]
    pub fn new(ops: Vec<AbbrevOp>) -> Self {
        Abbrev { ops }
    }
}

/// A decoded record: code, scalar fields, optional trailing blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub code: u64,
    pub fields: Vec<u64>,
    pub blob: Option<Vec<u8>>,
}

/// Error reading a bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitstreamError {
    /// Ran off the end of the stream.
    UnexpectedEof,
    /// The stream does not start with the expected signature.
    InvalidSignature,
    /// An abbreviation id with no definition in scope.
    InvalidAbbrevId(u64),
    /// An abbreviation definition the reader cannot represent.
    MalformedAbbrev,
    /// `enter_block`/`skip_block` called without a pending sub-block.
    NoPendingBlock,
}

impl fmt::Display for BitstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitstreamError::UnexpectedEof => f.write_str("unexpected end of bitstream"),
            BitstreamError::InvalidSignature => f.write_str("invalid bitstream signature"),
            BitstreamError::InvalidAbbrevId(id) => write!(f, "invalid abbreviation id {id}"),
            BitstreamError::MalformedAbbrev => f.write_str("malformed abbreviation definition"),
            BitstreamError::NoPendingBlock => f.write_str("no pending sub-block to enter"),
        }
    }
}

impl std::error::Error for BitstreamError {}

struct WriteScope {
    abbrev_width: u32,
    abbrevs: Vec<Abbrev>,
    /// Byte offset of the 32-bit word holding the block length.
    len_pos: usize,
    block_id: u64,
}

/// Streaming bitstream writer.
pub struct BitstreamWriter {
    buffer: Vec<u8>,
    cur: u64,
    cur_bits: u32,
    scopes: Vec<WriteScope>,
    blockinfo: FxHashMap<u64, Vec<Abbrev>>,
    blockinfo_setbid: Option<u64>,
}

impl BitstreamWriter {
    /// Start a stream opening with the four-byte signature.
    #[must_use]
    pub fn with_signature(signature: &[u8; 4]) -> Self {
        let mut writer = BitstreamWriter {
            buffer: Vec::with_capacity(256),
            cur: 0,
            cur_bits: 0,
            scopes: Vec::new(),
            blockinfo: FxHashMap::default(),
            blockinfo_setbid: None,
        };
        for &byte in signature {
            writer.emit(u64::from(byte), 8);
        }
        writer
    }

    fn abbrev_width(&self) -> u32 {
        self.scopes.last().map_or(2, |s| s.abbrev_width)
    }

    /// Emit `bits` bits of `value`, LSB first.
    pub fn emit(&mut self, value: u64, bits: u32) {
        debug_assert!(bits > 0 && bits <= 32);
        debug_assert!(value < (1u64 << bits));
        self.cur |= value << self.cur_bits;
        self.cur_bits += bits;
        while self.cur_bits >= 8 {
            self.buffer.push(self.cur as u8);
            self.cur >>= 8;
            self.cur_bits -= 8;
        }
    }

    /// Emit `value` in VBR chunks of `width` bits.
    pub fn emit_vbr(&mut self, mut value: u64, width: u32) {
        debug_assert!(width >= 2);
        let mask = (1u64 << (width - 1)) - 1;
        loop {
            let chunk = value & mask;
            value >>= width - 1;
            if value != 0 {
                self.emit(chunk | (mask + 1), width);
            } else {
                self.emit(chunk, width);
                break;
            }
        }
    }

    fn align32(&mut self) {
        if self.cur_bits > 0 {
            self.buffer.push(self.cur as u8);
            self.cur = 0;
            self.cur_bits = 0;
        }
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
    }

    /// Open a sub-block. Its length word is backpatched at `end_block`.
    pub fn enter_subblock(&mut self, block_id: u64, abbrev_width: u32) {
        self.emit(ENTER_SUBBLOCK, self.abbrev_width());
        self.emit_vbr(block_id, 8);
        self.emit_vbr(u64::from(abbrev_width), 4);
        self.align32();
        let len_pos = self.buffer.len();
        self.buffer.extend_from_slice(&[0, 0, 0, 0]);
        let abbrevs = self.blockinfo.get(&block_id).cloned().unwrap_or_default();
        self.scopes.push(WriteScope {
            abbrev_width,
            abbrevs,
            len_pos,
            block_id,
        });
        if block_id == BLOCKINFO_BLOCK_ID {
            self.blockinfo_setbid = None;
        }
    }

    /// Close the innermost block.
    pub fn end_block(&mut self) {
        self.emit(END_BLOCK, self.abbrev_width());
        self.align32();
        let scope = match self.scopes.pop() {
            Some(scope) => scope,
            None => return,
        };
        let body_len = ((self.buffer.len() - scope.len_pos - 4) / 4) as u32;
        self.buffer[scope.len_pos..scope.len_pos + 4].copy_from_slice(&body_len.to_le_bytes());
    }

    fn emit_abbrev_definition(&mut self, abbrev: &Abbrev) {
        self.emit(DEFINE_ABBREV, self.abbrev_width());
        self.emit_vbr(abbrev.ops.len() as u64, 5);
        for op in &abbrev.ops {
            match op {
                AbbrevOp::Literal(value) => {
                    self.emit(1, 1);
                    self.emit_vbr(*value, 8);
                }
                AbbrevOp::Fixed(width) => {
                    self.emit(0, 1);
                    self.emit(AbbrevOp::ENC_FIXED, 3);
                    self.emit_vbr(u64::from(*width), 5);
                }
                AbbrevOp::Vbr(width) => {
                    self.emit(0, 1);
                    self.emit(AbbrevOp::ENC_VBR, 3);
                    self.emit_vbr(u64::from(*width), 5);
                }
                AbbrevOp::Array => {
                    self.emit(0, 1);
                    self.emit(AbbrevOp::ENC_ARRAY, 3);
                }
                AbbrevOp::Blob => {
                    self.emit(0, 1);
                    self.emit(AbbrevOp::ENC_BLOB, 3);
                }
            }
        }
    }

    /// Define an abbreviation in the current block; returns its id.
    pub fn define_abbrev(&mut self, abbrev: Abbrev) -> u64 {
        self.emit_abbrev_definition(&abbrev);
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return FIRST_APP_ABBREV,
        };
        scope.abbrevs.push(abbrev);
        FIRST_APP_ABBREV + scope.abbrevs.len() as u64 - 1
    }

    /// Inside the block-info block: define an abbreviation that applies
    /// to every instance of `block_id`, emitting SETBID as needed.
    ///
    /// Returns the id the abbreviation will have in that block.
    pub fn define_blockinfo_abbrev(&mut self, block_id: u64, abbrev: Abbrev) -> u64 {
        debug_assert!(
            self.scopes.last().is_some_and(|s| s.block_id == BLOCKINFO_BLOCK_ID),
            "blockinfo abbrevs must be defined inside the blockinfo block"
        );
        if self.blockinfo_setbid != Some(block_id) {
            self.emit_unabbrev_record(BLOCKINFO_SETBID, &[block_id]);
            self.blockinfo_setbid = Some(block_id);
        }
        self.emit_abbrev_definition(&abbrev);
        let abbrevs = self.blockinfo.entry(block_id).or_default();
        abbrevs.push(abbrev);
        FIRST_APP_ABBREV + abbrevs.len() as u64 - 1
    }

    /// Emit a record with no abbreviation: code + VBR6 fields.
    pub fn emit_unabbrev_record(&mut self, code: u64, fields: &[u64]) {
        self.emit(UNABBREV_RECORD, self.abbrev_width());
        self.emit_vbr(code, 6);
        self.emit_vbr(fields.len() as u64, 6);
        for &field in fields {
            self.emit_vbr(field, 6);
        }
    }

    /// Emit a record through an abbreviation defined in this block.
    ///
    /// `fields` must line up with the abbreviation's operands, including
    /// literal operands (whose values are checked, not emitted). A blob
    /// operand consumes `blob` instead of a field.
    pub fn emit_record(&mut self, abbrev_id: u64, fields: &[u64], blob: Option<&[u8]>) {
        let width = self.abbrev_width();
        let abbrev = {
            let scope = self.scopes.last().expect("record emitted outside any block");
            scope.abbrevs[(abbrev_id - FIRST_APP_ABBREV) as usize].clone()
        };
        self.emit(abbrev_id, width);
        let mut next_field = 0usize;
        let mut ops = abbrev.ops.iter().peekable();
        while let Some(op) = ops.next() {
            match op {
                AbbrevOp::Literal(value) => {
                    debug_assert_eq!(fields[next_field], *value, "literal operand mismatch");
                    next_field += 1;
                }
                AbbrevOp::Fixed(field_width) => {
                    self.emit(fields[next_field], *field_width);
                    next_field += 1;
                }
                AbbrevOp::Vbr(field_width) => {
                    self.emit_vbr(fields[next_field], *field_width);
                    next_field += 1;
                }
                AbbrevOp::Array => {
                    let element = ops.next().expect("array operand lacks an element type");
                    let rest = &fields[next_field..];
                    self.emit_vbr(rest.len() as u64, 6);
                    for &value in rest {
                        match element {
                            AbbrevOp::Fixed(w) => self.emit(value, *w),
                            AbbrevOp::Vbr(w) => self.emit_vbr(value, *w),
                            _ => unreachable!("unsupported array element"),
                        }
                    }
                    next_field = fields.len();
                }
                AbbrevOp::Blob => {
                    let bytes = blob.unwrap_or(&[]);
                    self.emit_vbr(bytes.len() as u64, 6);
                    self.align32();
                    for &byte in bytes {
                        self.emit(u64::from(byte), 8);
                    }
                    self.align32();
                }
            }
        }
    }

    /// Flush and return the finished stream.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.align32();
        self.buffer
    }
}

/// What `advance` found next in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// A sub-block header; call `enter_block` or `skip_block`.
    SubBlock(u64),
    /// The end of the current block.
    EndBlock,
    /// A record; call `read_record` with this abbreviation id.
    Record(u64),
    EndOfStream,
}

struct ReadScope {
    abbrev_width: u32,
    abbrevs: Vec<Abbrev>,
    block_id: u64,
}

struct PendingBlock {
    block_id: u64,
    abbrev_width: u32,
    /// Bit position just past the block body, for skipping.
    end_bit: usize,
}

/// Streaming bitstream reader.
pub struct BitstreamReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
    scopes: Vec<ReadScope>,
    blockinfo: FxHashMap<u64, Vec<Abbrev>>,
    blockinfo_setbid: Option<u64>,
    pending: Option<PendingBlock>,
}

impl<'a> BitstreamReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        BitstreamReader {
            data,
            bit_pos: 0,
            scopes: Vec::new(),
            blockinfo: FxHashMap::default(),
            blockinfo_setbid: None,
            pending: None,
        }
    }

    /// Consume and check the four-byte signature.
    pub fn expect_signature(&mut self, signature: &[u8; 4]) -> Result<(), BitstreamError> {
        for &expected in signature {
            if self.read(8)? != u64::from(expected) {
                return Err(BitstreamError::InvalidSignature);
            }
        }
        Ok(())
    }

    fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.bit_pos
    }

    /// Read `bits` bits, LSB first.
    pub fn read(&mut self, bits: u32) -> Result<u64, BitstreamError> {
        let mut result = 0u64;
        let mut got = 0u32;
        while got < bits {
            let byte = *self
                .data
                .get(self.bit_pos / 8)
                .ok_or(BitstreamError::UnexpectedEof)?;
            let bit_off = (self.bit_pos % 8) as u32;
            let avail = 8 - bit_off;
            let take = (bits - got).min(avail);
            let chunk = (u64::from(byte) >> bit_off) & ((1u64 << take) - 1);
            result |= chunk << got;
            got += take;
            self.bit_pos += take as usize;
        }
        Ok(result)
    }

    /// Read a VBR-encoded value with the given chunk width.
    pub fn read_vbr(&mut self, width: u32) -> Result<u64, BitstreamError> {
        let hi_bit = 1u64 << (width - 1);
        let mask = hi_bit - 1;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let chunk = self.read(width)?;
            result |= (chunk & mask) << shift;
            if chunk & hi_bit == 0 {
                return Ok(result);
            }
            shift += width - 1;
        }
    }

    fn align32(&mut self) {
        self.bit_pos = (self.bit_pos + 31) & !31;
    }

    fn abbrev_width(&self) -> u32 {
        self.scopes.last().map_or(2, |s| s.abbrev_width)
    }

    /// Step to the next entry, handling abbreviation definitions
    /// transparently.
    pub fn advance(&mut self) -> Result<Entry, BitstreamError> {
        loop {
            let width = self.abbrev_width();
            if self.scopes.is_empty() && self.bits_remaining() < width as usize {
                return Ok(Entry::EndOfStream);
            }
            match self.read(width)? {
                END_BLOCK => {
                    self.align32();
                    self.scopes.pop();
                    return Ok(Entry::EndBlock);
                }
                ENTER_SUBBLOCK => {
                    let block_id = self.read_vbr(8)?;
                    let abbrev_width = self.read_vbr(4)? as u32;
                    self.align32();
                    let len_words = self.read(32)? as usize;
                    if abbrev_width == 0 || abbrev_width > 32 {
                        return Err(BitstreamError::MalformedAbbrev);
                    }
                    self.pending = Some(PendingBlock {
                        block_id,
                        abbrev_width,
                        end_bit: self.bit_pos + len_words * 32,
                    });
                    return Ok(Entry::SubBlock(block_id));
                }
                DEFINE_ABBREV => {
                    let abbrev = self.read_abbrev_definition()?;
                    let in_blockinfo = self
                        .scopes
                        .last()
                        .is_some_and(|s| s.block_id == BLOCKINFO_BLOCK_ID);
                    if in_blockinfo {
                        let target = self
                            .blockinfo_setbid
                            .ok_or(BitstreamError::MalformedAbbrev)?;
                        self.blockinfo.entry(target).or_default().push(abbrev);
                    } else if let Some(scope) = self.scopes.last_mut() {
                        scope.abbrevs.push(abbrev);
                    } else {
                        return Err(BitstreamError::MalformedAbbrev);
                    }
                }
                id => return Ok(Entry::Record(id)),
            }
        }
    }

    fn read_abbrev_definition(&mut self) -> Result<Abbrev, BitstreamError> {
        let num_ops = self.read_vbr(5)? as usize;
        let mut ops = Vec::with_capacity(num_ops);
        for _ in 0..num_ops {
            if self.read(1)? == 1 {
                ops.push(AbbrevOp::Literal(self.read_vbr(8)?));
            } else {
                match self.read(3)? {
                    AbbrevOp::ENC_FIXED => ops.push(AbbrevOp::Fixed(self.read_vbr(5)? as u32)),
                    AbbrevOp::ENC_VBR => ops.push(AbbrevOp::Vbr(self.read_vbr(5)? as u32)),
                    AbbrevOp::ENC_ARRAY => ops.push(AbbrevOp::Array),
                    AbbrevOp::ENC_BLOB => ops.push(AbbrevOp::Blob),
                    _ => return Err(BitstreamError::MalformedAbbrev),
                }
            }
        }
        Ok(Abbrev { ops })
    }

    /// Enter the block announced by the last `advance`.
    pub fn enter_block(&mut self) -> Result<u64, BitstreamError> {
        let pending = self.pending.take().ok_or(BitstreamError::NoPendingBlock)?;
        let abbrevs = self
            .blockinfo
            .get(&pending.block_id)
            .cloned()
            .unwrap_or_default();
        self.scopes.push(ReadScope {
            abbrev_width: pending.abbrev_width,
            abbrevs,
            block_id: pending.block_id,
        });
        if pending.block_id == BLOCKINFO_BLOCK_ID {
            self.blockinfo_setbid = None;
        }
        Ok(pending.block_id)
    }

    /// Skip over the block announced by the last `advance`.
    pub fn skip_block(&mut self) -> Result<(), BitstreamError> {
        let pending = self.pending.take().ok_or(BitstreamError::NoPendingBlock)?;
        if pending.end_bit > self.data.len() * 8 {
            return Err(BitstreamError::UnexpectedEof);
        }
        self.bit_pos = pending.end_bit;
        Ok(())
    }

    /// Read the record body for the abbreviation id `advance` returned.
    pub fn read_record(&mut self, abbrev_id: u64) -> Result<Record, BitstreamError> {
        if abbrev_id == UNABBREV_RECORD {
            let code = self.read_vbr(6)?;
            let count = self.read_vbr(6)? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(self.read_vbr(6)?);
            }
            return Ok(Record {
                code,
                fields,
                blob: None,
            });
        }

        let abbrev = {
            let scope = self.scopes.last().ok_or(BitstreamError::NoPendingBlock)?;
            scope
                .abbrevs
                .get((abbrev_id.wrapping_sub(FIRST_APP_ABBREV)) as usize)
                .ok_or(BitstreamError::InvalidAbbrevId(abbrev_id))?
                .clone()
        };

        let mut values = Vec::new();
        let mut blob = None;
        let mut ops = abbrev.ops.iter().peekable();
        while let Some(op) = ops.next() {
            match op {
                AbbrevOp::Literal(value) => values.push(*value),
                AbbrevOp::Fixed(width) => values.push(self.read(*width)?),
                AbbrevOp::Vbr(width) => values.push(self.read_vbr(*width)?),
                AbbrevOp::Array => {
                    let element = ops.next().ok_or(BitstreamError::MalformedAbbrev)?;
                    let count = self.read_vbr(6)? as usize;
                    for _ in 0..count {
                        match element {
                            AbbrevOp::Fixed(w) => values.push(self.read(*w)?),
                            AbbrevOp::Vbr(w) => values.push(self.read_vbr(*w)?),
                            _ => return Err(BitstreamError::MalformedAbbrev),
                        }
                    }
                }
                AbbrevOp::Blob => {
                    let len = self.read_vbr(6)? as usize;
                    self.align32();
                    let start = self.bit_pos / 8;
                    if start + len > self.data.len() {
                        return Err(BitstreamError::UnexpectedEof);
                    }
                    blob = Some(self.data[start..start + len].to_vec());
                    self.bit_pos += len * 8;
                    self.align32();
                }
            }
        }

        if values.is_empty() {
            return Err(BitstreamError::MalformedAbbrev);
        }
        let code = values.remove(0);
        Ok(Record {
            code,
            fields: values,
            blob,
        })
    }

    /// Consume a block-info block the cursor is positioned at, recording
    /// its abbreviations. Name records are skipped.
    pub fn read_block_info(&mut self) -> Result<(), BitstreamError> {
        self.enter_block()?;
        loop {
            match self.advance()? {
                Entry::EndBlock => return Ok(()),
                Entry::Record(id) => {
                    let record = self.read_record(id)?;
                    if record.code == BLOCKINFO_SETBID {
                        let target =
                            *record.fields.first().ok_or(BitstreamError::MalformedAbbrev)?;
                        self.blockinfo_setbid = Some(target);
                    }
                    // BLOCKNAME / SETRECORDNAME are informational only.
                }
                Entry::SubBlock(_) => self.skip_block()?,
                Entry::EndOfStream => return Err(BitstreamError::UnexpectedEof),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: &[u8; 4] = b"TEST";
    const BLOCK: u64 = 9;

    #[test]
    fn test_fixed_and_vbr_roundtrip() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.emit(5, 3);
        writer.emit(1, 1);
        writer.emit_vbr(1_000_000, 6);
        writer.emit_vbr(0, 6);
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        assert_eq!(reader.read(3).unwrap(), 5);
        assert_eq!(reader.read(1).unwrap(), 1);
        assert_eq!(reader.read_vbr(6).unwrap(), 1_000_000);
        assert_eq!(reader.read_vbr(6).unwrap(), 0);
    }

    #[test]
    fn test_bad_signature() {
        let writer = BitstreamWriter::with_signature(SIG);
        let bytes = writer.finish();
        let mut reader = BitstreamReader::new(&bytes);
        assert_eq!(
            reader.expect_signature(b"NOPE"),
            Err(BitstreamError::InvalidSignature)
        );
    }

    #[test]
    fn test_unabbrev_record_roundtrip() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCK, 4);
        writer.emit_unabbrev_record(7, &[1, 2, 300]);
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCK));
        reader.enter_block().unwrap();
        let Entry::Record(id) = reader.advance().unwrap() else {
            panic!("expected a record");
        };
        let record = reader.read_record(id).unwrap();
        assert_eq!(record.code, 7);
        assert_eq!(record.fields, vec![1, 2, 300]);
        assert_eq!(reader.advance().unwrap(), Entry::EndBlock);
        assert_eq!(reader.advance().unwrap(), Entry::EndOfStream);
    }

    #[test]
    fn test_abbreviated_record_with_blob() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCK, 4);
        let abbrev = writer.define_abbrev(Abbrev::new(vec![
            AbbrevOp::Literal(2),
            AbbrevOp::Fixed(3),
            AbbrevOp::Vbr(13),
            AbbrevOp::Blob,
        ]));
        writer.emit_record(abbrev, &[2, 6, 4321], Some(b"fingerprint"));
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCK));
        reader.enter_block().unwrap();
        let Entry::Record(id) = reader.advance().unwrap() else {
            panic!("expected a record");
        };
        let record = reader.read_record(id).unwrap();
        assert_eq!(record.code, 2);
        assert_eq!(record.fields, vec![6, 4321]);
        assert_eq!(record.blob.as_deref(), Some(b"fingerprint".as_slice()));
    }

    #[test]
    fn test_array_operand() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCK, 4);
        let abbrev = writer.define_abbrev(Abbrev::new(vec![
            AbbrevOp::Literal(5),
            AbbrevOp::Array,
            AbbrevOp::Vbr(8),
        ]));
        writer.emit_record(abbrev, &[5, 10, 20, 30_000], None);
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        reader.advance().unwrap();
        reader.enter_block().unwrap();
        let Entry::Record(id) = reader.advance().unwrap() else {
            panic!("expected a record");
        };
        let record = reader.read_record(id).unwrap();
        assert_eq!(record.code, 5);
        assert_eq!(record.fields, vec![10, 20, 30_000]);
    }

    #[test]
    fn test_blockinfo_abbrevs_apply_to_target_block() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCKINFO_BLOCK_ID, 2);
        let abbrev = writer.define_blockinfo_abbrev(
            BLOCK,
            Abbrev::new(vec![AbbrevOp::Literal(3), AbbrevOp::Vbr(6)]),
        );
        writer.end_block();
        writer.enter_subblock(BLOCK, 4);
        writer.emit_record(abbrev, &[3, 99], None);
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCKINFO_BLOCK_ID));
        reader.read_block_info().unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCK));
        reader.enter_block().unwrap();
        let Entry::Record(id) = reader.advance().unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(id, abbrev);
        let record = reader.read_record(id).unwrap();
        assert_eq!(record.code, 3);
        assert_eq!(record.fields, vec![99]);
    }

    #[test]
    fn test_skip_block() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCK, 4);
        writer.emit_unabbrev_record(1, &[42; 8]);
        writer.end_block();
        writer.enter_subblock(BLOCK + 1, 4);
        writer.emit_unabbrev_record(2, &[7]);
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes);
        reader.expect_signature(SIG).unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCK));
        reader.skip_block().unwrap();
        assert_eq!(reader.advance().unwrap(), Entry::SubBlock(BLOCK + 1));
        reader.enter_block().unwrap();
        let Entry::Record(id) = reader.advance().unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(reader.read_record(id).unwrap().code, 2);
    }

    #[test]
    fn test_truncated_stream() {
        let mut writer = BitstreamWriter::with_signature(SIG);
        writer.enter_subblock(BLOCK, 4);
        writer.emit_unabbrev_record(1, &[1, 2, 3]);
        writer.end_block();
        let bytes = writer.finish();

        let mut reader = BitstreamReader::new(&bytes[..bytes.len() - 6]);
        reader.expect_signature(SIG).unwrap();
        let mut saw_eof = false;
        for _ in 0..16 {
            match reader.advance() {
                Ok(Entry::SubBlock(_)) => {
                    if reader.enter_block().is_err() {
                        saw_eof = true;
                        break;
                    }
                }
                Ok(Entry::Record(id)) => {
                    if reader.read_record(id).is_err() {
                        saw_eof = true;
                        break;
                    }
                }
                Ok(Entry::EndBlock) => {}
                Ok(Entry::EndOfStream) | Err(_) => {
                    saw_eof = true;
                    break;
                }
            }
        }
        assert!(saw_eof);
    }
}
