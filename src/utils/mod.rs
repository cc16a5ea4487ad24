pub mod wait;

/// CRC16 (XMODEM) hash used to map keys onto slots.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Extract the routing portion of a key.
///
/// When the key contains a non-empty segment between the tag pair (by
/// default `{` and `}`), only that segment participates in hashing so
/// related keys land on the same slot. Otherwise the whole key hashes.
pub fn trim_hash_tag<'a>(key: &'a [u8], hash_tag: &[u8]) -> &'a [u8] {
    if hash_tag.len() != 2 {
        return key;
    }
    let open = match key.iter().position(|&b| b == hash_tag[0]) {
        Some(at) => at + 1,
        None => return key,
    };
    match key[open..].iter().position(|&b| b == hash_tag[1]) {
        Some(len) if len > 0 => &key[open..open + len],
        _ => key,
    }
}
