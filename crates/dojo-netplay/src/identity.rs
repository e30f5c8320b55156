//! Game identity digests.

use dojo_netproto::messages::session::GameIdentity;
use ring::digest;

/// First 16 bytes of the SHA-256 of the game image.
pub fn digest_game(image: &[u8]) -> GameIdentity {
    let d = digest::digest(&digest::SHA256, image);
    let mut out = [0u8; 16];
    out.copy_from_slice(&d.as_ref()[..16]);
    GameIdentity(out)
}

pub fn identity_hex(id: &GameIdentity) -> String {
    hex::encode(id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_truncated_sha256() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        let id = digest_game(b"abc");
        assert_eq!(identity_hex(&id), "ba7816bf8f01cfea414140de5dae2223");
    }

    #[test]
    fn different_images_differ() {
        assert_ne!(digest_game(b"mvsc2.zip"), digest_game(b"cvs2.zip"));
    }
}
