#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use streamconn_proto::prelude::DelimiterFramer;

// Input layout: [delimiter len][delimiter][chunking seed][payload...]
fuzz_target!(|data: &[u8]| {
    let Some((&len, rest)) = data.split_first() else {
        return;
    };
    let len = usize::from(len % 4) + 1;
    if rest.len() < len + 1 {
        return;
    }
    let (delimiter, rest) = rest.split_at(len);
    let (&seed, payload) = rest.split_first().unwrap();

    let expected = split_reference(payload, delimiter);

    let mut whole = DelimiterFramer::new(Bytes::copy_from_slice(delimiter));
    let mut one_shot = Vec::new();
    whole.receive(Bytes::copy_from_slice(payload), |m| one_shot.push(m));
    assert_eq!(one_shot, expected);

    // Same payload in chunks sized from the seed.
    let mut chunked = DelimiterFramer::new(Bytes::copy_from_slice(delimiter));
    let mut pieces = Vec::new();
    let mut state = u32::from(seed) | 1;
    let mut offset = 0;
    while offset < payload.len() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let size = (state as usize % 9 + 1).min(payload.len() - offset);
        chunked.receive(
            Bytes::copy_from_slice(&payload[offset..offset + size]),
            |m| pieces.push(m),
        );
        offset += size;
    }
    assert_eq!(pieces, expected);
    assert_eq!(chunked.buffered_len(), whole.buffered_len());
});

/// Left-to-right non-overlapping split; the unterminated tail is dropped.
fn split_reference(payload: &[u8], delimiter: &[u8]) -> Vec<Bytes> {
    let mut messages = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + delimiter.len() <= payload.len() {
        if &payload[i..i + delimiter.len()] == delimiter {
            messages.push(Bytes::copy_from_slice(&payload[start..i]));
            i += delimiter.len();
            start = i;
        } else {
            i += 1;
        }
    }
    messages
}
