use base64::{engine, Engine};

pub fn b64_encode(bytes: &[u8]) -> String {
    engine::general_purpose::STANDARD.encode(bytes)
}

pub fn b64_decode(enc: &str) -> Result<Vec<u8>, base64::DecodeError> {
    engine::general_purpose::STANDARD.decode(enc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        assert_eq!(b64_decode(&b64_encode(&bytes)).unwrap(), bytes);
        assert!(b64_decode("not base64!!").is_err());
    }
}
