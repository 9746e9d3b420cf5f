//! Digest helpers, mirroring the teacher's own
//! `openssl::sha::sha256` + `proxmox::tools::digest_to_hex` pairing
//! (see e.g. `config/drive.rs`, `config/media_pool.rs`). The hex
//! helper is reimplemented locally since the `proxmox` tools crate
//! itself is not part of this core's dependency set.

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = openssl::sha::sha256(bytes);
    digest_to_hex(&digest)
}

pub fn digest_to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
