use rand::TryRngCore;
use rand::rngs::OsRng;

/// Length in characters of a session id: 40 lowercase hex digits.
///
/// The filesystem driver's gc filename pattern and the ingress validator
/// both assume this length.
pub const ID_LEN: usize = 40;

/// Generates a new random session id.
pub fn generate() -> String {
    let mut bytes = [0u8; ID_LEN / 2];
    OsRng.try_fill_bytes(&mut bytes).unwrap();
    hex::encode(bytes)
}

/// Strict ingress validator: exactly [`ID_LEN`] lowercase hex characters.
///
/// Session ids arrive from the transport layer and are untrusted; anything
/// failing this check is treated as an unknown session, never passed to a
/// driver.
pub fn is_valid(id: &str) -> bool {
    id.len() == ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
