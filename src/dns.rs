//! DNS wire-format helpers.
//!
//! Only the pieces the daemon needs: pulling the queried name out of an
//! A-record query and synthesizing a `0.0.0.0` answer for it. Every index into
//! the packet is bounds checked, so arbitrary input never panics.

const HEADER_LEN: usize = 12;

/// Queries shorter than this cannot possibly carry a name question.
pub const MIN_QUERY_LEN: usize = 14;

/// Decoded names longer than this are treated as garbage.
const MAX_NAME_LEN: usize = 1024;

/// Name search starts after the header and the first label's length byte.
const NAME_OFFSET: usize = HEADER_LEN + 1;

/// QTYPE A followed by QCLASS IN.
const TYPE_A_CLASS_IN: [u8; 4] = [0x00, 0x01, 0x00, 0x01];

/// Standard query response, recursion desired and available, no error.
const RESPONSE_FLAGS: [u8; 2] = [0x81, 0x80];

/// TTL of the synthetic answer.
pub const BLACKHOLE_TTL_SECS: u32 = 1466;

/// Answer RR: pointer to the question name, type A, class IN, TTL, 0.0.0.0.
const BLACKHOLE_RECORD: [u8; 16] = [
    0xC0, 0x0C, // Name pointer to offset 12
    0x00, 0x01, // Type: A
    0x00, 0x01, // Class: IN
    0x00, 0x00, 0x05, 0xBA, // TTL: 1466
    0x00, 0x04, // Data length
    0x00, 0x00, 0x00, 0x00, // 0.0.0.0
];

/// Extract the domain name asked by an A-record query.
///
/// Returns the name itself followed by the name with leading labels removed
/// one at a time, stopping at the last two labels. A query for
/// `a.b.github.com` yields `a.b.github.com`, `b.github.com`, `github.com`.
///
/// Returns an empty vector for undersized packets, packets without a
/// Type-A/Class-IN question, and names longer than 1024 characters.
pub fn extract_domain_names(packet: &[u8]) -> Vec<String> {
    let mut names = Vec::with_capacity(8);
    if packet.len() < MIN_QUERY_LEN {
        return names;
    }

    let Some(marker) = packet[NAME_OFFSET..]
        .windows(TYPE_A_CLASS_IN.len())
        .position(|w| w == TYPE_A_CLASS_IN)
    else {
        return names;
    };
    // The byte right before the marker is the root label and is discarded.
    if marker < 1 {
        return names;
    }
    let encoded = &packet[NAME_OFFSET..NAME_OFFSET + marker - 1];
    if encoded.len() > MAX_NAME_LEN {
        return names;
    }

    let decoded: Vec<u8> = encoded
        .iter()
        .map(|&b| if is_separator(b) { b'.' } else { b })
        .collect();
    let name = String::from_utf8_lossy(&decoded).to_lowercase();
    if name.len() > MAX_NAME_LEN {
        return names;
    }

    let mut current = name.as_str();
    names.push(current.to_string());
    while current.matches('.').count() >= 2 {
        match current.find('.') {
            Some(pos) if pos > 0 => current = &current[pos + 1..],
            _ => break,
        }
        names.push(current.to_string());
    }

    names
}

/// Bytes that can never appear in a hostname label: label lengths, control
/// characters and punctuation other than `-`.
fn is_separator(b: u8) -> bool {
    b <= 44 || (58..=64).contains(&b) || (91..=96).contains(&b)
}

/// Build a response to `query` that answers it with `0.0.0.0`.
///
/// The transaction ID and first question are copied from the query, the
/// question and answer counts are set to one and all other sections are
/// dropped. Returns an
/// empty vector if the query is undersized or its question section cannot be
/// delimited; callers must check before sending.
pub fn build_blackhole_answer(query: &[u8]) -> Vec<u8> {
    if query.len() < MIN_QUERY_LEN {
        return Vec::new();
    }
    let Some(question_end) = question_end(query) else {
        return Vec::new();
    };

    let mut answer = Vec::with_capacity(question_end + BLACKHOLE_RECORD.len());
    answer.extend_from_slice(&query[0..2]); // Transaction ID
    answer.extend_from_slice(&RESPONSE_FLAGS);
    answer.extend_from_slice(&[0x00, 0x01]); // QDCOUNT, only the first question is kept
    answer.extend_from_slice(&[0x00, 0x01]); // ANCOUNT
    answer.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    answer.extend_from_slice(&[0x00, 0x00]); // ARCOUNT
    answer.extend_from_slice(&query[HEADER_LEN..question_end]);
    answer.extend_from_slice(&BLACKHOLE_RECORD);
    answer
}

/// Offset one past the first question's QCLASS, if the question is intact.
fn question_end(packet: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let label_len = *packet.get(pos)? as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        // Compression pointers and extended label types have no place here.
        if label_len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + label_len;
    }
    let end = pos + 4; // QTYPE + QCLASS
    (end <= packet.len()).then_some(end)
}

/// Read the 16-bit transaction ID of a message.
pub fn transaction_id(packet: &[u8]) -> Option<u16> {
    match packet {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
