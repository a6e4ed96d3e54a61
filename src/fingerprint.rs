use sha2::{Digest, Sha256};

use crate::models::{CompletionRequest, Message};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Content-relevant digest of a request. Routing inputs (backend preference,
/// cost ceiling) are left out so they never split the cache.
pub fn fingerprint_for(request: &CompletionRequest) -> RequestFingerprint {
    let canonical = canonical_payload(request);
    let digest = Sha256::digest(canonical.as_bytes());
    RequestFingerprint(to_hex(digest.as_ref()))
}

fn canonical_payload(request: &CompletionRequest) -> String {
    let mut payload = String::new();
    payload.push_str(request.model.as_deref().unwrap_or("default"));
    payload.push('|');
    payload.push_str(
        &request
            .max_tokens
            .map(|tokens| tokens.to_string())
            .unwrap_or_else(|| "none".to_owned()),
    );
    payload.push('|');
    payload.push_str(&opt_float(request.temperature));

    for message in &request.messages {
        append_message(&mut payload, message);
    }

    payload
}

fn append_message(buffer: &mut String, message: &Message) {
    buffer.push('|');
    buffer.push_str(message.role.as_str());
    buffer.push(':');
    buffer.push_str(&message.content.len().to_string());
    buffer.push(':');
    buffer.push_str(&message.content);
}

/// Exact bit pattern, so distinct temperatures never share a key.
fn opt_float(value: Option<f32>) -> String {
    value
        .map(|number| format!("{:08x}", number.to_bits()))
        .unwrap_or_else(|| "none".to_owned())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push(nibble_to_hex(byte >> 4));
        encoded.push(nibble_to_hex(byte & 0x0f));
    }
    encoded
}

fn nibble_to_hex(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        10..=15 => (b'a' + (value - 10)) as char,
        _ => '0',
    }
}
