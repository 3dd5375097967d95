//! TLS ClientHello inspection.
//!
//! The fragmentation writer needs two things from a ClientHello record: the
//! byte span of the SNI extension, and a way to splice a padding extension
//! into the record before it is cut into chunks. Both work on the raw record
//! bytes, header included; nothing here depends on a TLS library.
//!
//! Record layout walked below:
//! - record header (5): type(1) version(2) length(2)
//! - handshake header (4): type(1) length(3)
//! - client hello: version(2) random(32) session_id(1+N)
//!   cipher_suites(2+N) compression(1+N) extensions(2+N)
//! - extension: type(2) length(2) data(N); SNI is type 0x0000

/// Record header size for plain TLS over TCP.
pub const RECORD_HEADER_LEN: usize = 5;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SNI: u16 = 0x0000;
const EXTENSION_PADDING: u16 = 0x0015;

/// Byte span of the SNI extension (header included) within the full record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniLocation {
    pub start: usize,
    pub end: usize,
}

/// Cheap first-bytes check used before committing to a full parse.
pub fn is_client_hello(data: &[u8]) -> bool {
    data.len() > RECORD_HEADER_LEN
        && data[0] == 0x16
        && data[1] == 0x03
        && data[RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
}

/// Offset of the two-byte extensions length field, and the end of the
/// extensions block. `None` when the record is not a well-formed ClientHello.
fn extensions_block(data: &[u8]) -> Option<(usize, usize)> {
    if !is_client_hello(data) {
        return None;
    }

    // record header + handshake header + legacy version + random
    let mut pos = RECORD_HEADER_LEN + 4 + 2 + 32;

    let session_id_len = *data.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = read_u16(data, pos)? as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *data.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(data, pos)? as usize;
    let end = pos + 2 + extensions_len;
    if end > data.len() {
        return None;
    }
    Some((pos, end))
}

/// Locate the SNI extension within a ClientHello record.
pub fn locate_sni(data: &[u8]) -> Option<SniLocation> {
    let (len_offset, end) = extensions_block(data)?;
    let mut pos = len_offset + 2;

    while pos + 4 <= end {
        let ext_type = read_u16(data, pos)?;
        let ext_len = read_u16(data, pos + 2)? as usize;
        let ext_end = pos + 4 + ext_len;
        if ext_end > end {
            return None;
        }
        if ext_type == EXTENSION_SNI {
            return Some(SniLocation { start: pos, end: ext_end });
        }
        pos = ext_end;
    }
    None
}

/// Extract the hostname carried in the SNI extension, for logging.
pub fn sni_hostname(data: &[u8]) -> Option<String> {
    let location = locate_sni(data)?;
    // ext header(4) + list length(2) + name type(1) + name length(2)
    let name_len = read_u16(data, location.start + 7)? as usize;
    let name_start = location.start + 9;
    if name_start + name_len > location.end {
        return None;
    }
    std::str::from_utf8(&data[name_start..name_start + name_len])
        .ok()
        .map(str::to_owned)
}

/// Splice a padding extension of `pad_len` content bytes onto the end of the
/// extensions block, fixing up the record, handshake and extensions length
/// fields. Returns false (record untouched) when the record cannot carry it.
pub fn splice_padding(record: &mut Vec<u8>, pad_len: usize) -> bool {
    let Some((len_offset, end)) = extensions_block(record) else {
        return false;
    };
    // The record must be complete, or the spliced lengths would lie.
    let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    if RECORD_HEADER_LEN + record_len != record.len() || end != record.len() {
        return false;
    }

    let added = 4 + pad_len;
    let new_record_len = record_len + added;
    let extensions_len = u16::from_be_bytes([record[len_offset], record[len_offset + 1]]) as usize;
    if new_record_len > u16::MAX as usize || extensions_len + added > u16::MAX as usize {
        return false;
    }

    record.reserve(added);
    record.extend_from_slice(&EXTENSION_PADDING.to_be_bytes());
    record.extend_from_slice(&(pad_len as u16).to_be_bytes());
    record.resize(record.len() + pad_len, 0);

    record[3..5].copy_from_slice(&(new_record_len as u16).to_be_bytes());
    let handshake_len = (new_record_len - 4) as u32;
    record[6..9].copy_from_slice(&handshake_len.to_be_bytes()[1..]);
    record[len_offset..len_offset + 2].copy_from_slice(&((extensions_len + added) as u16).to_be_bytes());
    true
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}
