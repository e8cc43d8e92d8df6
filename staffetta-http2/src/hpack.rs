// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! HPACK: Header Compression for HTTP/2
//!
//! Both directions of a connection run their own compression context: a
//! [`Decoder`] for the peer's header blocks and an [`Encoder`] for ours.
//! Each owns a dynamic table; the two tables never mix.
//!
//! # References
//! * [RFC 7541](https://httpwg.org/specs/rfc7541.html)

use std::{
    collections::VecDeque,
    io::Write,
};

/// The per-entry overhead HPACK charges on top of the name and value
/// octets.
///
/// # References
/// * [RFC 7541 - Section 4.1](https://httpwg.org/specs/rfc7541.html#calculating.table.size)
const ENTRY_OVERHEAD: usize = 32;

// TODO: some errors here should surface as a `400 Bad Request` once a
//       response can still be produced; for now the bridge resets the
//       stream, which clients handle equally well.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum DecompressionError {
    UnexpectedEndOfBlock,

    /// Index 0, or an index beyond the end of the dynamic table.
    InvalidIndex(usize),

    IntegerOverflow,
    InvalidHuffman,
    InvalidUtf8,

    DynamicTableUpdateTooLarge,
    DynamicTableUpdateNotFirst,

    DuplicateAuthority,
    DuplicateMethod,
    DuplicatePath,
    DuplicateScheme,

    PseudoAfterRegularFields,
    PseudoInTrailerSection,

    /// A pseudo-header that is not one of the four request pseudo-headers,
    /// `:status` included.
    UnknownPseudoHeader,

    EmptyPath,

    FieldNameEmpty,
    FieldNameInvalidNonVisibleAscii,
    FieldNameInvalidAsciiSpace,
    FieldNameInvalidUppercase,
    FieldNameExtendedAsciiUnicode,

    FieldValueContainsNul,
    FieldValueContainsCarriageReturn,
    FieldValueContainsLineFeed,
    FieldValueStartsWithWhitespace,
    FieldValueEndsWithWhitespace,

    /// HTTP/2 does not use the headers conveying connection-specific
    /// semantics of text-based HTTP versions.
    ///
    /// # References
    /// * [RFC 9113 - Section 8.2.2](https://httpwg.org/specs/rfc9113.html#ConnectionSpecific)
    ConnectionSpecificHeaderField,

    /// An exception to [`Self::ConnectionSpecificHeaderField`] is the `TE`
    /// header, and it may only contain `trailers`.
    TeHeaderNotTrailers,
}

impl DecompressionError {
    /// Malformed-request errors poison a single stream; everything else
    /// leaves the compression context unusable and must end the connection
    /// with COMPRESSION_ERROR.
    pub const fn is_stream_scoped(&self) -> bool {
        matches!(self,
            Self::DuplicateAuthority | Self::DuplicateMethod | Self::DuplicatePath
            | Self::DuplicateScheme | Self::PseudoAfterRegularFields
            | Self::PseudoInTrailerSection | Self::UnknownPseudoHeader | Self::EmptyPath
            | Self::FieldNameEmpty | Self::FieldNameInvalidNonVisibleAscii
            | Self::FieldNameInvalidAsciiSpace | Self::FieldNameInvalidUppercase
            | Self::FieldNameExtendedAsciiUnicode | Self::FieldValueContainsNul
            | Self::FieldValueContainsCarriageReturn | Self::FieldValueContainsLineFeed
            | Self::FieldValueStartsWithWhitespace | Self::FieldValueEndsWithWhitespace
            | Self::ConnectionSpecificHeaderField | Self::TeHeaderNotTrailers
            | Self::InvalidUtf8)
    }
}

/// One `(name, value)` pair as stored in a dynamic table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// The octets this entry occupies in a dynamic table.
    ///
    /// # References
    /// * [RFC 7541 - Section 4.1](https://httpwg.org/specs/rfc7541.html#calculating.table.size)
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// # References
/// * [RFC 7541 - Appendix A. Static Table Definition](https://httpwg.org/specs/rfc7541.html#static.table.definition)
const STATIC_TABLE: &[(&str, &str); 62] = &[
    ("", ""), // index 0 is illegal
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Look up an entry in the single index address space the static and
/// dynamic tables share.
///
/// # References
/// * [RFC 7541 - Section 2.3.3](https://httpwg.org/specs/rfc7541.html#index.address.space)
fn lookup(dynamic_table: &DynamicTable, index: usize) -> Result<HeaderField, DecompressionError> {
    if index == 0 {
        return Err(DecompressionError::InvalidIndex(index));
    }

    if index < STATIC_TABLE.len() {
        let (name, value) = STATIC_TABLE[index];
        return Ok(HeaderField::new(name, value));
    }

    dynamic_table.get(index - STATIC_TABLE.len())
        .cloned()
        .ok_or(DecompressionError::InvalidIndex(index))
}

#[derive(Debug)]
pub struct DynamicTable {
    table: VecDeque<(HeaderField, usize)>,
    current_size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: VecDeque::new(),
            current_size: 0,
            max_size,
        }
    }

    /// Entry 0 is the most recently inserted field.
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        self.table.get(index).map(|(field, _)| field)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert at the front, evicting from the back until the entry fits. An
    /// entry larger than the whole table empties it and is itself dropped.
    ///
    /// # References
    /// * [RFC 7541 - Section 4.4](https://httpwg.org/specs/rfc7541.html#entry.addition)
    pub fn insert(&mut self, field: HeaderField) {
        let field_size = field.size();
        if field_size > self.max_size {
            self.table.clear();
            self.current_size = 0;
            return;
        }

        while self.current_size + field_size > self.max_size {
            let (_, evicted_size) = self.table.pop_back()
                .expect("table empty yet current_size + field_size > max_size");
            self.current_size -= evicted_size;
        }

        self.current_size += field_size;
        self.table.push_front((field, field_size));
    }

    /// Change the maximum size, evicting from the back until the contents
    /// fit.
    ///
    /// # References
    /// * [RFC 7541 - Section 4.3](https://httpwg.org/specs/rfc7541.html#maximum.table.size)
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.current_size > max_size {
            let (_, evicted_size) = self.table.pop_back()
                .expect("table empty yet current_size > max_size");
            self.current_size -= evicted_size;
        }
    }
}

// ---------------------------------------------------------------------------
// Integer and string primitives

/// HPACK write extensions for [`Write`] objects.
trait WriteExtensions: Write {
    /// Write a number in the HPACK prefixed-integer format.
    fn write_hpack_number(&mut self, value: usize, n: u8, prefix: u8) -> Result<(), std::io::Error>;

    /// Write a string, choosing whichever of the Huffman and literal
    /// representations is shorter.
    fn write_hpack_string(&mut self, value: &[u8]) -> Result<(), std::io::Error>;
}

impl<T> WriteExtensions for T where T: Write {
    fn write_hpack_number(&mut self, value: usize, n: u8, prefix: u8) -> Result<(), std::io::Error> {
        let first_octet_max = 2_usize.pow(n as _) - 1;

        if value < first_octet_max {
            self.write_all(&[prefix | value as u8])?;
            return Ok(());
        }

        self.write_all(&[prefix | first_octet_max as u8])?;
        let mut value = value - first_octet_max;
        while value >= 128 {
            self.write_all(&[value as u8 % 128 + 128])?;
            value /= 128;
        }
        self.write_all(&[value as _])?;

        Ok(())
    }

    fn write_hpack_string(&mut self, value: &[u8]) -> Result<(), std::io::Error> {
        let huffman_length = huffman_encoded_length(value);
        if huffman_length >= value.len() {
            // Literal representation, 'H' flag clear.
            self.write_hpack_number(value.len(), 7, 0x00)?;
            self.write_all(value)?;
            return Ok(());
        }

        // 'H' flag set.
        self.write_hpack_number(huffman_length, 7, 0x80)?;
        let mut writer = BitWriter::new(self);
        for byte in value {
            let entry = HUFFMAN_CODE[*byte as usize];
            for bit in CodeBits::new(entry.code, entry.length_in_bits) {
                writer.push(bit)?;
            }
        }

        Ok(())
    }
}

fn huffman_encoded_length(value: &[u8]) -> usize {
    let bits: usize = value.iter().map(|b| HUFFMAN_CODE[*b as usize].length_in_bits as usize).sum();
    bits.div_ceil(8)
}

/// A cursor over the fragments of one header block: the HEADERS (or
/// PUSH_PROMISE) fragment followed by any CONTINUATION fragments, read as a
/// single logical byte sequence without concatenating the buffers.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    fragments: Vec<Vec<u8>>,
    cursor: usize,
}

impl HeaderBlock {
    pub fn new(first_fragment: Vec<u8>) -> Self {
        Self {
            fragments: vec![first_fragment],
            cursor: 0,
        }
    }

    pub fn push_fragment(&mut self, fragment: Vec<u8>) {
        self.fragments.push(fragment);
    }

    /// The total size of the block in octets, for MAX_FRAME_SIZE-independent
    /// sanity limits.
    pub fn octet_length(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    fn peek_u8(&self) -> Option<u8> {
        let mut cursor = self.cursor;
        for fragment in &self.fragments {
            if fragment.len() > cursor {
                return Some(fragment[cursor]);
            }
            cursor -= fragment.len();
        }
        None
    }

    fn read_u8(&mut self) -> Option<u8> {
        let value = self.peek_u8()?;
        self.cursor += 1;
        Some(value)
    }

    /// Decode a prefixed integer whose first octet (already masked) is
    /// `first_octet` under an `n`-bit prefix.
    ///
    /// # References
    /// * [RFC 7541 - Section 5.1](https://httpwg.org/specs/rfc7541.html#integer.representation)
    fn read_integer(&mut self, first_octet: u8, n: u32) -> Result<usize, DecompressionError> {
        let mut value = first_octet as usize;
        if value < 2_usize.pow(n) - 1 {
            return Ok(value);
        }

        let mut m = 0u32;
        while let Some(octet) = self.read_u8() {
            if m > 56 {
                return Err(DecompressionError::IntegerOverflow);
            }

            value = value.checked_add(((octet & 0x7F) as usize) << m)
                .ok_or(DecompressionError::IntegerOverflow)?;
            m += 7;

            if octet & 0x80 != 0x80 {
                return Ok(value);
            }
        }

        Err(DecompressionError::UnexpectedEndOfBlock)
    }

    /// # References
    /// * [RFC 7541 - Section 5.2](https://httpwg.org/specs/rfc7541.html#string.literal.representation)
    fn read_string(&mut self) -> Result<Vec<u8>, DecompressionError> {
        let first_octet = self.read_u8().ok_or(DecompressionError::UnexpectedEndOfBlock)?;

        let is_huffman = first_octet & 0x80 == 0x80;
        let length = self.read_integer(first_octet & 0x7F, 7)?;

        let mut octets = Vec::with_capacity(length);
        for _ in 0..length {
            octets.push(self.read_u8().ok_or(DecompressionError::UnexpectedEndOfBlock)?);
        }

        if !is_huffman {
            return Ok(octets);
        }

        decode_huffman(&octets).ok_or(DecompressionError::InvalidHuffman)
    }
}

// ---------------------------------------------------------------------------
// Decoding

/// The decoded contents of one header block: the four request
/// pseudo-headers, separated out, and the regular fields in wire order with
/// lowercase names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSection {
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub path: Option<String>,
    pub authority: Option<String>,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,

    /// The uncompressed size of the section: name + value + 32 per field,
    /// pseudo-headers included, compared against MAX_HEADER_LIST_SIZE.
    pub list_size: usize,
}

/// Collects decoded fields, enforcing the pseudo-header rules as they
/// arrive. A malformed field is recorded rather than returned immediately:
/// the rest of the block must still be processed so the dynamic table stays
/// synchronized with the peer's.
#[derive(Debug, Default)]
struct FieldSectionBuilder {
    section: FieldSection,
    trailer_section: bool,
    violation: Option<DecompressionError>,
}

impl FieldSectionBuilder {
    fn flag(&mut self, violation: DecompressionError) {
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    fn add(&mut self, field: HeaderField) {
        self.section.list_size += field.size();

        if field.name.first() == Some(&b':') {
            self.add_pseudo(field);
            return;
        }

        if let Err(violation) = validate_regular_field(&field) {
            self.flag(violation);
        }

        self.section.fields.push((field.name, field.value));
    }

    fn add_pseudo(&mut self, field: HeaderField) {
        if self.trailer_section {
            self.flag(DecompressionError::PseudoInTrailerSection);
            return;
        }

        if !self.section.fields.is_empty() {
            self.flag(DecompressionError::PseudoAfterRegularFields);
            return;
        }

        let Ok(value) = String::from_utf8(field.value) else {
            self.flag(DecompressionError::InvalidUtf8);
            return;
        };

        match field.name.as_slice() {
            b":method" => {
                if self.section.method.replace(value).is_some() {
                    self.flag(DecompressionError::DuplicateMethod);
                }
            }
            b":scheme" => {
                if self.section.scheme.replace(value).is_some() {
                    self.flag(DecompressionError::DuplicateScheme);
                }
            }
            b":path" => {
                if value.is_empty() {
                    self.flag(DecompressionError::EmptyPath);
                }
                if self.section.path.replace(value).is_some() {
                    self.flag(DecompressionError::DuplicatePath);
                }
            }
            b":authority" => {
                if self.section.authority.replace(value).is_some() {
                    self.flag(DecompressionError::DuplicateAuthority);
                }
            }
            _ => self.flag(DecompressionError::UnknownPseudoHeader),
        }
    }

    fn finish(self) -> Result<FieldSection, DecompressionError> {
        match self.violation {
            Some(violation) => Err(violation),
            None => Ok(self.section),
        }
    }
}

/// The receive-direction compression context.
pub struct Decoder {
    dynamic_table: DynamicTable,
    /// The ceiling for in-band dynamic table size updates: our own
    /// SETTINGS_HEADER_TABLE_SIZE.
    max_size_limit: usize,
}

impl Decoder {
    pub fn new(header_table_size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(header_table_size),
            max_size_limit: header_table_size,
        }
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.dynamic_table
    }

    /// Decode one complete header block. `trailer_section` selects the
    /// stricter rules for a block that arrives after DATA.
    ///
    /// # References
    /// * [RFC 7541 - Section 6. Binary Format](https://httpwg.org/specs/rfc7541.html#detailed.format)
    pub fn decode(&mut self, mut block: HeaderBlock, trailer_section: bool)
            -> Result<FieldSection, DecompressionError> {
        let mut sink = FieldSectionBuilder {
            trailer_section,
            ..Default::default()
        };

        let mut is_first = true;
        while let Some(first_octet) = block.read_u8() {
            let at_block_start = is_first;
            is_first = false;

            // 6.1. Indexed Header Field Representation
            if first_octet & 0x80 == 0x80 {
                let index = block.read_integer(first_octet & 0x7F, 7)?;
                sink.add(lookup(&self.dynamic_table, index)?);
                continue;
            }

            // 6.2.1. Literal Header Field with Incremental Indexing
            if first_octet & 0x40 == 0x40 {
                let field = self.read_literal(&mut block, first_octet & 0x3F, 6, &mut sink)?;
                self.dynamic_table.insert(field.clone());
                sink.add(field);
                continue;
            }

            // 6.3. Dynamic Table Size Update
            if first_octet & 0x20 == 0x20 {
                let max_size = block.read_integer(first_octet & 0x1F, 5)?;

                if !at_block_start {
                    return Err(DecompressionError::DynamicTableUpdateNotFirst);
                }

                if max_size > self.max_size_limit {
                    return Err(DecompressionError::DynamicTableUpdateTooLarge);
                }

                self.dynamic_table.set_max_size(max_size);
                continue;
            }

            // 6.2.3. Literal Header Field Never Indexed, and
            // 6.2.2. Literal Header Field without Indexing. Identical for
            // server-side processing: neither touches the dynamic table.
            let field = self.read_literal(&mut block, first_octet & 0x0F, 4, &mut sink)?;
            sink.add(field);
        }

        sink.finish()
    }

    /// Our SETTINGS_HEADER_TABLE_SIZE changed; future in-band updates are
    /// checked against the new ceiling.
    pub fn set_max_size_limit(&mut self, limit: usize) {
        self.max_size_limit = limit;
        if limit < self.dynamic_table.max_size() {
            self.dynamic_table.set_max_size(limit);
        }
    }

    fn read_literal(&mut self, block: &mut HeaderBlock, masked_first_octet: u8, n: u32,
            sink: &mut FieldSectionBuilder) -> Result<HeaderField, DecompressionError> {
        let name_index = block.read_integer(masked_first_octet, n)?;

        let name = if name_index == 0 {
            let name = block.read_string()?;
            if let Err(violation) = validate_field_name(&name) {
                sink.flag(violation);
            }
            name
        } else {
            lookup(&self.dynamic_table, name_index)?.name
        };

        let value = block.read_string()?;
        if let Err(violation) = validate_field_value(&value) {
            sink.flag(violation);
        }

        Ok(HeaderField { name, value })
    }
}

/// Validate the header names for applicability, governed by
/// [RFC 9113 Section 8.2.2](https://httpwg.org/specs/rfc9113.html#rfc.section.8.2.2)
fn validate_regular_field(field: &HeaderField) -> Result<(), DecompressionError> {
    match field.name.as_slice() {
        b"connection" | b"keep-alive" | b"proxy-connection" | b"transfer-encoding"
        | b"upgrade" => Err(DecompressionError::ConnectionSpecificHeaderField),
        b"te" => {
            if field.value != b"trailers" {
                return Err(DecompressionError::TeHeaderNotTrailers);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validate literally transmitted field names, governed by
/// [RFC 9113 Section 8.2](https://httpwg.org/specs/rfc9113.html#rfc.section.8.2)
fn validate_field_name(name: &[u8]) -> Result<(), DecompressionError> {
    if name.is_empty() {
        return Err(DecompressionError::FieldNameEmpty);
    }

    let body = if name[0] == b':' { &name[1..] } else { name };
    for &c in body {
        match c {
            0x00..=0x1f => return Err(DecompressionError::FieldNameInvalidNonVisibleAscii),
            0x20 => return Err(DecompressionError::FieldNameInvalidAsciiSpace),
            0x41..=0x5a => return Err(DecompressionError::FieldNameInvalidUppercase),
            0x7f..=0xff => return Err(DecompressionError::FieldNameExtendedAsciiUnicode),
            _ => (),
        }
    }

    Ok(())
}

/// Validate literally transmitted field values, governed by
/// [RFC 9113 Section 8.2](https://httpwg.org/specs/rfc9113.html#rfc.section.8.2)
fn validate_field_value(value: &[u8]) -> Result<(), DecompressionError> {
    if value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        return Err(DecompressionError::FieldValueStartsWithWhitespace);
    }

    if value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        return Err(DecompressionError::FieldValueEndsWithWhitespace);
    }

    for &c in value {
        match c {
            0x00 => return Err(DecompressionError::FieldValueContainsNul),
            0x0a => return Err(DecompressionError::FieldValueContainsLineFeed),
            0x0d => return Err(DecompressionError::FieldValueContainsCarriageReturn),
            _ => (),
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Encoding

enum IndexCandidate {
    None,
    FullyIndexed(usize),
    NameIndexed(usize),
}

/// The send-direction compression context.
pub struct Encoder {
    dynamic_table: DynamicTable,
    /// Set when the peer lowered SETTINGS_HEADER_TABLE_SIZE: the new size
    /// must be signalled in-band at the start of the next block.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn new(header_table_size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(header_table_size),
            pending_size_update: None,
        }
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.dynamic_table
    }

    /// The peer announced a new SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_size(&mut self, max_size: usize) {
        if max_size < self.dynamic_table.max_size() {
            self.pending_size_update = Some(max_size);
            self.dynamic_table.set_max_size(max_size);
        }
    }

    /// Encode one header block. Every field not already present in a table
    /// is inserted with incremental indexing, mirroring the state the
    /// peer's decoder will build.
    pub fn encode<'a>(&mut self, fields: impl IntoIterator<Item = (&'a [u8], &'a [u8])>) -> Vec<u8> {
        let mut data = Vec::new();

        if let Some(max_size) = self.pending_size_update.take() {
            _ = data.write_hpack_number(max_size, 5, 0x20);
        }

        for (name, value) in fields {
            match self.find_field(name, value) {
                IndexCandidate::FullyIndexed(index) => {
                    _ = data.write_hpack_number(index, 7, 0x80);
                }
                IndexCandidate::NameIndexed(index) => {
                    _ = data.write_hpack_number(index, 6, 0x40);
                    _ = data.write_hpack_string(value);
                    self.dynamic_table.insert(HeaderField::new(name, value));
                }
                IndexCandidate::None => {
                    data.push(0x40);
                    _ = data.write_hpack_string(name);
                    _ = data.write_hpack_string(value);
                    self.dynamic_table.insert(HeaderField::new(name, value));
                }
            }
        }

        data
    }

    fn find_field(&self, name: &[u8], value: &[u8]) -> IndexCandidate {
        let mut candidate = IndexCandidate::None;

        for (index, (entry_name, entry_value)) in STATIC_TABLE.iter().enumerate().skip(1) {
            if entry_name.as_bytes() != name {
                continue;
            }

            if entry_value.as_bytes() == value {
                return IndexCandidate::FullyIndexed(index);
            }

            if matches!(candidate, IndexCandidate::None) {
                candidate = IndexCandidate::NameIndexed(index);
            }
        }

        for index in 0..self.dynamic_table.len() {
            let entry = self.dynamic_table.get(index).expect("index bounded by len");
            if entry.name != name {
                continue;
            }

            if entry.value == value {
                return IndexCandidate::FullyIndexed(STATIC_TABLE.len() + index);
            }

            if matches!(candidate, IndexCandidate::None) {
                candidate = IndexCandidate::NameIndexed(STATIC_TABLE.len() + index);
            }
        }

        candidate
    }
}

// ---------------------------------------------------------------------------
// Huffman coding

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HuffmanEntry {
    code: u32,
    length_in_bits: u8,
}

impl HuffmanEntry {
    const fn new(code: u32, length_in_bits: u8) -> Self {
        Self { code, length_in_bits }
    }
}

/// The Huffman code, as defined by HPACK.
///
/// # References
/// * [RFC 7541 - Appendix B. Huffman Code](https://httpwg.org/specs/rfc7541.html#huffman.code)
const HUFFMAN_CODE: &[HuffmanEntry; 256] = &[
    HuffmanEntry::new(0x1ff8, 13),
    HuffmanEntry::new(0x7fffd8, 23),
    HuffmanEntry::new(0xfffffe2, 28),
    HuffmanEntry::new(0xfffffe3, 28),
    HuffmanEntry::new(0xfffffe4, 28),
    HuffmanEntry::new(0xfffffe5, 28),
    HuffmanEntry::new(0xfffffe6, 28),
    HuffmanEntry::new(0xfffffe7, 28),
    HuffmanEntry::new(0xfffffe8, 28),
    HuffmanEntry::new(0xffffea, 24),
    HuffmanEntry::new(0x3ffffffc, 30),
    HuffmanEntry::new(0xfffffe9, 28),
    HuffmanEntry::new(0xfffffea, 28),
    HuffmanEntry::new(0x3ffffffd, 30),
    HuffmanEntry::new(0xfffffeb, 28),
    HuffmanEntry::new(0xfffffec, 28),
    HuffmanEntry::new(0xfffffed, 28),
    HuffmanEntry::new(0xfffffee, 28),
    HuffmanEntry::new(0xfffffef, 28),
    HuffmanEntry::new(0xffffff0, 28),
    HuffmanEntry::new(0xffffff1, 28),
    HuffmanEntry::new(0xffffff2, 28),
    HuffmanEntry::new(0x3ffffffe, 30),
    HuffmanEntry::new(0xffffff3, 28),
    HuffmanEntry::new(0xffffff4, 28),
    HuffmanEntry::new(0xffffff5, 28),
    HuffmanEntry::new(0xffffff6, 28),
    HuffmanEntry::new(0xffffff7, 28),
    HuffmanEntry::new(0xffffff8, 28),
    HuffmanEntry::new(0xffffff9, 28),
    HuffmanEntry::new(0xffffffa, 28),
    HuffmanEntry::new(0xffffffb, 28),
    HuffmanEntry::new(0x14, 6),
    HuffmanEntry::new(0x3f8, 10),
    HuffmanEntry::new(0x3f9, 10),
    HuffmanEntry::new(0xffa, 12),
    HuffmanEntry::new(0x1ff9, 13),
    HuffmanEntry::new(0x15, 6),
    HuffmanEntry::new(0xf8, 8),
    HuffmanEntry::new(0x7fa, 11),
    HuffmanEntry::new(0x3fa, 10),
    HuffmanEntry::new(0x3fb, 10),
    HuffmanEntry::new(0xf9, 8),
    HuffmanEntry::new(0x7fb, 11),
    HuffmanEntry::new(0xfa, 8),
    HuffmanEntry::new(0x16, 6),
    HuffmanEntry::new(0x17, 6),
    HuffmanEntry::new(0x18, 6),
    HuffmanEntry::new(0x0, 5),
    HuffmanEntry::new(0x1, 5),
    HuffmanEntry::new(0x2, 5),
    HuffmanEntry::new(0x19, 6),
    HuffmanEntry::new(0x1a, 6),
    HuffmanEntry::new(0x1b, 6),
    HuffmanEntry::new(0x1c, 6),
    HuffmanEntry::new(0x1d, 6),
    HuffmanEntry::new(0x1e, 6),
    HuffmanEntry::new(0x1f, 6),
    HuffmanEntry::new(0x5c, 7),
    HuffmanEntry::new(0xfb, 8),
    HuffmanEntry::new(0x7ffc, 15),
    HuffmanEntry::new(0x20, 6),
    HuffmanEntry::new(0xffb, 12),
    HuffmanEntry::new(0x3fc, 10),
    HuffmanEntry::new(0x1ffa, 13),
    HuffmanEntry::new(0x21, 6),
    HuffmanEntry::new(0x5d, 7),
    HuffmanEntry::new(0x5e, 7),
    HuffmanEntry::new(0x5f, 7),
    HuffmanEntry::new(0x60, 7),
    HuffmanEntry::new(0x61, 7),
    HuffmanEntry::new(0x62, 7),
    HuffmanEntry::new(0x63, 7),
    HuffmanEntry::new(0x64, 7),
    HuffmanEntry::new(0x65, 7),
    HuffmanEntry::new(0x66, 7),
    HuffmanEntry::new(0x67, 7),
    HuffmanEntry::new(0x68, 7),
    HuffmanEntry::new(0x69, 7),
    HuffmanEntry::new(0x6a, 7),
    HuffmanEntry::new(0x6b, 7),
    HuffmanEntry::new(0x6c, 7),
    HuffmanEntry::new(0x6d, 7),
    HuffmanEntry::new(0x6e, 7),
    HuffmanEntry::new(0x6f, 7),
    HuffmanEntry::new(0x70, 7),
    HuffmanEntry::new(0x71, 7),
    HuffmanEntry::new(0x72, 7),
    HuffmanEntry::new(0xfc, 8),
    HuffmanEntry::new(0x73, 7),
    HuffmanEntry::new(0xfd, 8),
    HuffmanEntry::new(0x1ffb, 13),
    HuffmanEntry::new(0x7fff0, 19),
    HuffmanEntry::new(0x1ffc, 13),
    HuffmanEntry::new(0x3ffc, 14),
    HuffmanEntry::new(0x22, 6),
    HuffmanEntry::new(0x7ffd, 15),
    HuffmanEntry::new(0x3, 5),
    HuffmanEntry::new(0x23, 6),
    HuffmanEntry::new(0x4, 5),
    HuffmanEntry::new(0x24, 6),
    HuffmanEntry::new(0x5, 5),
    HuffmanEntry::new(0x25, 6),
    HuffmanEntry::new(0x26, 6),
    HuffmanEntry::new(0x27, 6),
    HuffmanEntry::new(0x6, 5),
    HuffmanEntry::new(0x74, 7),
    HuffmanEntry::new(0x75, 7),
    HuffmanEntry::new(0x28, 6),
    HuffmanEntry::new(0x29, 6),
    HuffmanEntry::new(0x2a, 6),
    HuffmanEntry::new(0x7, 5),
    HuffmanEntry::new(0x2b, 6),
    HuffmanEntry::new(0x76, 7),
    HuffmanEntry::new(0x2c, 6),
    HuffmanEntry::new(0x8, 5),
    HuffmanEntry::new(0x9, 5),
    HuffmanEntry::new(0x2d, 6),
    HuffmanEntry::new(0x77, 7),
    HuffmanEntry::new(0x78, 7),
    HuffmanEntry::new(0x79, 7),
    HuffmanEntry::new(0x7a, 7),
    HuffmanEntry::new(0x7b, 7),
    HuffmanEntry::new(0x7ffe, 15),
    HuffmanEntry::new(0x7fc, 11),
    HuffmanEntry::new(0x3ffd, 14),
    HuffmanEntry::new(0x1ffd, 13),
    HuffmanEntry::new(0xffffffc, 28),
    HuffmanEntry::new(0xfffe6, 20),
    HuffmanEntry::new(0x3fffd2, 22),
    HuffmanEntry::new(0xfffe7, 20),
    HuffmanEntry::new(0xfffe8, 20),
    HuffmanEntry::new(0x3fffd3, 22),
    HuffmanEntry::new(0x3fffd4, 22),
    HuffmanEntry::new(0x3fffd5, 22),
    HuffmanEntry::new(0x7fffd9, 23),
    HuffmanEntry::new(0x3fffd6, 22),
    HuffmanEntry::new(0x7fffda, 23),
    HuffmanEntry::new(0x7fffdb, 23),
    HuffmanEntry::new(0x7fffdc, 23),
    HuffmanEntry::new(0x7fffdd, 23),
    HuffmanEntry::new(0x7fffde, 23),
    HuffmanEntry::new(0xffffeb, 24),
    HuffmanEntry::new(0x7fffdf, 23),
    HuffmanEntry::new(0xffffec, 24),
    HuffmanEntry::new(0xffffed, 24),
    HuffmanEntry::new(0x3fffd7, 22),
    HuffmanEntry::new(0x7fffe0, 23),
    HuffmanEntry::new(0xffffee, 24),
    HuffmanEntry::new(0x7fffe1, 23),
    HuffmanEntry::new(0x7fffe2, 23),
    HuffmanEntry::new(0x7fffe3, 23),
    HuffmanEntry::new(0x7fffe4, 23),
    HuffmanEntry::new(0x1fffdc, 21),
    HuffmanEntry::new(0x3fffd8, 22),
    HuffmanEntry::new(0x7fffe5, 23),
    HuffmanEntry::new(0x3fffd9, 22),
    HuffmanEntry::new(0x7fffe6, 23),
    HuffmanEntry::new(0x7fffe7, 23),
    HuffmanEntry::new(0xffffef, 24),
    HuffmanEntry::new(0x3fffda, 22),
    HuffmanEntry::new(0x1fffdd, 21),
    HuffmanEntry::new(0xfffe9, 20),
    HuffmanEntry::new(0x3fffdb, 22),
    HuffmanEntry::new(0x3fffdc, 22),
    HuffmanEntry::new(0x7fffe8, 23),
    HuffmanEntry::new(0x7fffe9, 23),
    HuffmanEntry::new(0x1fffde, 21),
    HuffmanEntry::new(0x7fffea, 23),
    HuffmanEntry::new(0x3fffdd, 22),
    HuffmanEntry::new(0x3fffde, 22),
    HuffmanEntry::new(0xfffff0, 24),
    HuffmanEntry::new(0x1fffdf, 21),
    HuffmanEntry::new(0x3fffdf, 22),
    HuffmanEntry::new(0x7fffeb, 23),
    HuffmanEntry::new(0x7fffec, 23),
    HuffmanEntry::new(0x1fffe0, 21),
    HuffmanEntry::new(0x1fffe1, 21),
    HuffmanEntry::new(0x3fffe0, 22),
    HuffmanEntry::new(0x1fffe2, 21),
    HuffmanEntry::new(0x7fffed, 23),
    HuffmanEntry::new(0x3fffe1, 22),
    HuffmanEntry::new(0x7fffee, 23),
    HuffmanEntry::new(0x7fffef, 23),
    HuffmanEntry::new(0xfffea, 20),
    HuffmanEntry::new(0x3fffe2, 22),
    HuffmanEntry::new(0x3fffe3, 22),
    HuffmanEntry::new(0x3fffe4, 22),
    HuffmanEntry::new(0x7ffff0, 23),
    HuffmanEntry::new(0x3fffe5, 22),
    HuffmanEntry::new(0x3fffe6, 22),
    HuffmanEntry::new(0x7ffff1, 23),
    HuffmanEntry::new(0x3ffffe0, 26),
    HuffmanEntry::new(0x3ffffe1, 26),
    HuffmanEntry::new(0xfffeb, 20),
    HuffmanEntry::new(0x7fff1, 19),
    HuffmanEntry::new(0x3fffe7, 22),
    HuffmanEntry::new(0x7ffff2, 23),
    HuffmanEntry::new(0x3fffe8, 22),
    HuffmanEntry::new(0x1ffffec, 25),
    HuffmanEntry::new(0x3ffffe2, 26),
    HuffmanEntry::new(0x3ffffe3, 26),
    HuffmanEntry::new(0x3ffffe4, 26),
    HuffmanEntry::new(0x7ffffde, 27),
    HuffmanEntry::new(0x7ffffdf, 27),
    HuffmanEntry::new(0x3ffffe5, 26),
    HuffmanEntry::new(0xfffff1, 24),
    HuffmanEntry::new(0x1ffffed, 25),
    HuffmanEntry::new(0x7fff2, 19),
    HuffmanEntry::new(0x1fffe3, 21),
    HuffmanEntry::new(0x3ffffe6, 26),
    HuffmanEntry::new(0x7ffffe0, 27),
    HuffmanEntry::new(0x7ffffe1, 27),
    HuffmanEntry::new(0x3ffffe7, 26),
    HuffmanEntry::new(0x7ffffe2, 27),
    HuffmanEntry::new(0xfffff2, 24),
    HuffmanEntry::new(0x1fffe4, 21),
    HuffmanEntry::new(0x1fffe5, 21),
    HuffmanEntry::new(0x3ffffe8, 26),
    HuffmanEntry::new(0x3ffffe9, 26),
    HuffmanEntry::new(0xffffffd, 28),
    HuffmanEntry::new(0x7ffffe3, 27),
    HuffmanEntry::new(0x7ffffe4, 27),
    HuffmanEntry::new(0x7ffffe5, 27),
    HuffmanEntry::new(0xfffec, 20),
    HuffmanEntry::new(0xfffff3, 24),
    HuffmanEntry::new(0xfffed, 20),
    HuffmanEntry::new(0x1fffe6, 21),
    HuffmanEntry::new(0x3fffe9, 22),
    HuffmanEntry::new(0x1fffe7, 21),
    HuffmanEntry::new(0x1fffe8, 21),
    HuffmanEntry::new(0x7ffff3, 23),
    HuffmanEntry::new(0x3fffea, 22),
    HuffmanEntry::new(0x3fffeb, 22),
    HuffmanEntry::new(0x1ffffee, 25),
    HuffmanEntry::new(0x1ffffef, 25),
    HuffmanEntry::new(0xfffff4, 24),
    HuffmanEntry::new(0xfffff5, 24),
    HuffmanEntry::new(0x3ffffea, 26),
    HuffmanEntry::new(0x7ffff4, 23),
    HuffmanEntry::new(0x3ffffeb, 26),
    HuffmanEntry::new(0x7ffffe6, 27),
    HuffmanEntry::new(0x3ffffec, 26),
    HuffmanEntry::new(0x3ffffed, 26),
    HuffmanEntry::new(0x7ffffe7, 27),
    HuffmanEntry::new(0x7ffffe8, 27),
    HuffmanEntry::new(0x7ffffe9, 27),
    HuffmanEntry::new(0x7ffffea, 27),
    HuffmanEntry::new(0x7ffffeb, 27),
    HuffmanEntry::new(0xffffffe, 28),
    HuffmanEntry::new(0x7ffffec, 27),
    HuffmanEntry::new(0x7ffffed, 27),
    HuffmanEntry::new(0x7ffffee, 27),
    HuffmanEntry::new(0x7ffffef, 27),
    HuffmanEntry::new(0x7fffff0, 27),
    HuffmanEntry::new(0x3ffffee, 26),
];

const HUFFMAN_EOS_ENTRY: HuffmanEntry = HuffmanEntry::new(0x3fffffff, 30);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum HuffmanValue {
    EndOfStream,
    Symbol(u8),
}

struct HuffmanTree {
    table: hashbrown::HashMap<u8, hashbrown::HashMap<u32, HuffmanValue>>,
}

impl HuffmanTree {
    fn new() -> Self {
        let mut tree = Self {
            table: Default::default(),
        };

        for (symbol, entry) in HUFFMAN_CODE.iter().enumerate() {
            let old_entry = tree.table.entry(entry.length_in_bits)
                .or_default()
                .insert(entry.code, HuffmanValue::Symbol(symbol as _));
            debug_assert!(old_entry.is_none());
            _ = old_entry;
        }

        let old_entry = tree.table.entry(HUFFMAN_EOS_ENTRY.length_in_bits)
            .or_default()
            .insert(HUFFMAN_EOS_ENTRY.code, HuffmanValue::EndOfStream);
        debug_assert!(old_entry.is_none());
        _ = old_entry;

        tree
    }
}

lazy_static::lazy_static! {
    static ref HUFFMAN_TREE: HuffmanTree = HuffmanTree::new();
}

/// Decode a Huffman-coded string. `None` signals a coding error: the EOS
/// symbol in the body, more than seven bits of padding, or padding that is
/// not all ones.
pub(crate) fn decode_huffman(input: &[u8]) -> Option<Vec<u8>> {
    let mut output = Vec::new();

    let mut current_code = 0u32;
    let mut bit_length = 0u8;
    for bit in BitReader::new(input) {
        if bit_length == 32 {
            // Longer than any assigned code.
            return None;
        }

        bit_length += 1;
        current_code <<= 1;
        if bit {
            current_code |= 1;
        }

        if let Some(codes_of_length) = HUFFMAN_TREE.table.get(&bit_length) {
            if let Some(value) = codes_of_length.get(&current_code) {
                match value {
                    HuffmanValue::EndOfStream => return None,
                    HuffmanValue::Symbol(symbol) => output.push(*symbol),
                }
                bit_length = 0;
                current_code = 0;
            }
        }
    }

    if bit_length > 7 {
        return None;
    }

    if bit_length != 0 {
        let correct_padding = 2_u32.pow(bit_length as _) - 1;
        if correct_padding != current_code {
            return None;
        }
    }

    Some(output)
}

/// Iterate over the bits of a byte slice, most significant bit first.
struct BitReader<'a> {
    data: &'a [u8],
    byte_cursor: usize,
    bit_cursor: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_cursor: 0,
            bit_cursor: 7,
        }
    }
}

impl<'a> Iterator for BitReader<'a> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.byte_cursor == self.data.len() {
            return None;
        }

        let state = (self.data[self.byte_cursor] >> self.bit_cursor) & 1 == 1;

        if self.bit_cursor == 0 {
            self.bit_cursor = 7;
            self.byte_cursor += 1;
        } else {
            self.bit_cursor -= 1;
        }

        Some(state)
    }
}

/// Iterate over the significant bits of one Huffman code, most significant
/// first.
struct CodeBits {
    code: u32,
    bits: u8,
    bit_position: u8,
}

impl CodeBits {
    fn new(code: u32, bits: u8) -> Self {
        debug_assert!(bits <= 32);
        Self { code, bits, bit_position: 0 }
    }
}

impl Iterator for CodeBits {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.bit_position == self.bits {
            return None;
        }

        let state = (self.code >> (self.bits - 1 - self.bit_position)) & 1 == 1;
        self.bit_position += 1;
        Some(state)
    }
}

/// A bit writer with '1' padding of the final partial byte, as Huffman
/// strings require.
struct BitWriter<'a> {
    data: &'a mut dyn Write,
    current_byte: u8,
    bit_position: u8,
}

impl<'a> BitWriter<'a> {
    fn new(data: &'a mut dyn Write) -> Self {
        Self {
            data,
            current_byte: 0,
            bit_position: 7,
        }
    }

    fn push(&mut self, value: bool) -> Result<(), std::io::Error> {
        self.current_byte |= (value as u8) << self.bit_position;
        if self.bit_position == 0 {
            self.data.write_all(&[self.current_byte])?;
            self.current_byte = 0;
            self.bit_position = 7;
        } else {
            self.bit_position -= 1;
        }

        Ok(())
    }
}

impl<'a> Drop for BitWriter<'a> {
    fn drop(&mut self) {
        if self.bit_position != 7 {
            // Finish the byte by padding the leftover bits.
            let finish_byte = self.current_byte | (2_u8.pow(self.bit_position as u32 + 1) - 1);
            _ = self.data.write_all(&[finish_byte]);
        }
    }
}
