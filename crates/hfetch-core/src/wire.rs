//! Stateless HTTP/1.1 line parsers: status line, header line, chunk size.
//!
//! These only classify single lines; which headers are honored (and when a
//! `Location` matters) is the connection state machine's business.

use crate::error::ProtocolError;

/// Largest chunk size we accept. Anything bigger is either a broken or a
/// hostile server.
const MAX_CHUNK_SIZE: u64 = i32::MAX as u64;

/// Parse `HTTP/x.y <3-digit-code> <reason>`; the reason phrase is optional.
/// Codes outside [200, 599] are rejected outright.
pub fn parse_status_line(line: &str) -> Result<u16, ProtocolError> {
    let (_, rest) = line.split_once(' ').ok_or(ProtocolError::MalformedStatus)?;
    let code = rest.get(..3).ok_or(ProtocolError::MalformedStatus)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedStatus);
    }
    let status: u16 = code.parse().map_err(|_| ProtocolError::MalformedStatus)?;
    if !(200..=599).contains(&status) {
        return Err(ProtocolError::MalformedStatus);
    }
    Ok(status)
}

/// One classified response header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Blank line: end of the header block.
    End,
    ContentLength(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    LastModified(String),
    Location(String),
    /// Anything we don't care about, including unparsable junk.
    Other,
}

/// Classify a header line. Header names match case-insensitively. Only a
/// recognized header with a broken value is an error; unknown or
/// un-splittable lines are `Other` and skipped.
pub fn parse_header_line(line: &str) -> Result<Header, ProtocolError> {
    if line.is_empty() {
        return Ok(Header::End);
    }
    let Some((name, value)) = line.split_once(':') else {
        return Ok(Header::Other);
    };
    let value = value.trim();
    if name.eq_ignore_ascii_case("content-length") {
        let digits = value.split_ascii_whitespace().next().unwrap_or("");
        let len: u64 = digits
            .parse()
            .map_err(|_| ProtocolError::MalformedHeader("Content-Length"))?;
        Ok(Header::ContentLength(len))
    } else if name.eq_ignore_ascii_case("transfer-encoding") {
        if value.eq_ignore_ascii_case("chunked") {
            Ok(Header::Chunked)
        } else {
            Ok(Header::Other)
        }
    } else if name.eq_ignore_ascii_case("last-modified") {
        Ok(Header::LastModified(value.to_string()))
    } else if name.eq_ignore_ascii_case("location") {
        Ok(Header::Location(value.to_string()))
    } else {
        Ok(Header::Other)
    }
}

/// One parsed chunk-framing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLine {
    /// Empty separator line between a chunk's data and the next size line.
    Blank,
    /// Next chunk length; `0` terminates the body.
    Size(u64),
}

/// Parse a `<hex-size>[;ext]` chunk line, ignoring any extension.
pub fn parse_chunk_line(line: &str) -> Result<ChunkLine, ProtocolError> {
    if line.is_empty() {
        return Ok(ChunkLine::Blank);
    }
    let size = match line.find(';') {
        Some(i) => &line[..i],
        None => line,
    }
    .trim();
    if size.is_empty() {
        return Err(ProtocolError::BadChunkSize);
    }
    let size = u64::from_str_radix(size, 16).map_err(|_| ProtocolError::BadChunkSize)?;
    if size > MAX_CHUNK_SIZE {
        return Err(ProtocolError::BadChunkSize);
    }
    Ok(ChunkLine::Size(size))
}
