pub const DEFAULT_CIPHER_SEED: u8 = 78;

/// Symmetric stream cipher over a connection. Each direction keeps its own
/// one-byte running key, both seeded with the same constant. A byte is
/// enciphered by XOR with the current key, after which the key advances by
/// the plaintext value modulo 256. Every byte on the wire goes through the
/// cipher, the frame length prefix included, so a single dropped or
/// corrupted byte desynchronizes the stream permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherStream {
    inbound_key: u8,
    outbound_key: u8,
}

impl CipherStream {
    pub fn new(seed: u8) -> Self {
        Self {
            inbound_key: seed,
            outbound_key: seed,
        }
    }

    pub fn encrypt_byte(&mut self, plain: u8) -> u8 {
        let ciphered = plain ^ self.outbound_key;
        self.outbound_key = self.outbound_key.wrapping_add(plain);
        ciphered
    }

    pub fn decrypt_byte(&mut self, ciphered: u8) -> u8 {
        let plain = ciphered ^ self.inbound_key;
        self.inbound_key = self.inbound_key.wrapping_add(plain);
        plain
    }

    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = self.encrypt_byte(*byte);
        }
    }

    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = self.decrypt_byte(*byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_byte_value() {
        let mut sender = CipherStream::new(DEFAULT_CIPHER_SEED);
        let mut receiver = CipherStream::new(DEFAULT_CIPHER_SEED);
        for value in 0..=255u8 {
            let ciphered = sender.encrypt_byte(value);
            assert_eq!(receiver.decrypt_byte(ciphered), value);
        }
    }

    #[test]
    fn keys_advance_by_plaintext() {
        let mut sender = CipherStream::new(10);
        let first = sender.encrypt_byte(0xf0);
        assert_eq!(first, 0xf0 ^ 10);
        // Key is now 10 + 0xf0 = 0xfa.
        let second = sender.encrypt_byte(0x0f);
        assert_eq!(second, 0x0f ^ 0xfa);
    }

    #[test]
    fn directions_are_independent() {
        let mut local = CipherStream::new(DEFAULT_CIPHER_SEED);
        let mut remote = CipherStream::new(DEFAULT_CIPHER_SEED);
        let mut outbound = *b"toward the peer";
        let mut inbound = *b"from the peer!!";
        local.encrypt_in_place(&mut outbound);
        remote.encrypt_in_place(&mut inbound);
        remote.decrypt_in_place(&mut outbound);
        local.decrypt_in_place(&mut inbound);
        assert_eq!(&outbound, b"toward the peer");
        assert_eq!(&inbound, b"from the peer!!");
    }

    #[test]
    fn in_place_matches_bytewise() {
        let mut a = CipherStream::new(3);
        let mut b = CipherStream::new(3);
        let payload: Vec<u8> = (0..64).map(|i| (i * 7 + 1) as u8).collect();
        let mut block = payload.clone();
        a.encrypt_in_place(&mut block);
        let bytewise: Vec<u8> = payload.iter().map(|&p| b.encrypt_byte(p)).collect();
        assert_eq!(block, bytewise);
    }
}
