/// Per-peer availability map. Bits are MSB-first within each byte: piece 0 is
/// the high bit of byte 0.
#[derive(Debug, Clone, Default)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn from_payload(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn has_piece(&self, piece_i: usize) -> bool {
        let byte_i = piece_i / 8;
        // bit's index from high bit to low
        let bit_i = piece_i % 8;
        let Some(byte) = self.bytes.get(byte_i) else {
            return false;
        };
        byte & 0b1000_0000 >> bit_i != 0
    }

    /// Sets the named bit, growing the map as needed. `have` messages may
    /// announce pieces past the end of the bitfield the peer sent earlier.
    pub fn set_piece(&mut self, piece_i: usize) {
        let byte_i = piece_i / 8;
        let bit_i = piece_i % 8;
        if byte_i >= self.bytes.len() {
            self.bytes.resize(byte_i + 1, 0);
        }
        self.bytes[byte_i] |= 0b1000_0000 >> bit_i;
    }
}

#[test]
fn bitfield_has_piece() {
    let bf = Bitfield::from_payload(vec![0b10101010, 0b01110110]);
    assert!(bf.has_piece(0));
    assert!(!bf.has_piece(1));
    assert!(!bf.has_piece(7));
    assert!(!bf.has_piece(8));
    assert!(bf.has_piece(14));
    assert!(!bf.has_piece(99));
}

#[test]
fn bitfield_set_piece_grows() {
    let mut bf = Bitfield::default();
    bf.set_piece(35);
    assert!(!bf.has_piece(34));
    assert!(bf.has_piece(35));
}

#[test]
fn bitfield_set_piece_keeps_existing_bits() {
    let mut bf = Bitfield::from_payload(vec![0b10000000]);
    bf.set_piece(3);
    assert!(bf.has_piece(0));
    assert!(bf.has_piece(3));
}
