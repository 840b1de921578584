use crate::INPUT_SIZE;

/// Numeric value of a single nucleotide: A=1, C=2, G=3, T=4, anything else 0
#[inline]
pub fn encode_base(base: u8) -> f32 {
    match base {
        b'A' => 1.0,
        b'C' => 2.0,
        b'G' => 3.0,
        b'T' => 4.0,
        _ => 0.0,
    }
}

/// Encodes every symbol of `seq`; the output has the same length as the input.
pub fn encode_sequence(seq: &[u8]) -> Vec<f32> {
    seq.iter().map(|&b| encode_base(b)).collect()
}

/// Encodes the first [`INPUT_SIZE`] symbols of `seq`.
///
/// Returns `None` for sequences shorter than the window; these are never padded.
pub fn encode_window(seq: &[u8]) -> Option<Vec<f32>> {
    if seq.len() < INPUT_SIZE {
        return None;
    }
    Some(encode_sequence(&seq[..INPUT_SIZE]))
}
