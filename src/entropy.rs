use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};

/// Shannon entropy of a byte sequence, in bits per byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropyScore {
    /// Value in `[0.0, 8.0]`
    pub bits: f64,
    /// Number of bytes the value was computed over
    pub len: u64,
}

/// Calculate Shannon entropy of a byte slice
///
/// Returns a value between 0.0 (a single repeated byte) and 8.0 (every byte
/// value equally frequent). Empty input has no defined entropy and is
/// rejected with [`AnalysisError::EmptyInput`].
///
/// Typical values:
/// - < 4.0: Very low (sparse data, English text)
/// - 4.0-6.0: Normal (typical code/data)
/// - 6.0-7.2: Elevated (compressed or obfuscated)
/// - > 7.2: High (encrypted or packed)
pub fn calculate_entropy(data: &[u8]) -> Result<EntropyScore> {
    if data.is_empty() {
        return Err(AnalysisError::EmptyInput);
    }

    let mut freq = [0u64; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in freq.iter().filter(|&&c| c > 0) {
        let p = count as f64 / len;
        entropy -= p * p.log2();
    }

    Ok(EntropyScore {
        // -0.0 for single-symbol input
        bits: entropy.clamp(0.0, 8.0).abs(),
        len: data.len() as u64,
    })
}

/// Entropy of decoded text, scored over its canonical UTF-8 bytes.
pub fn calculate_text_entropy(text: &str) -> Result<EntropyScore> {
    calculate_entropy(text.as_bytes())
}

/// Classify entropy level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyLevel {
    VeryLow,  // < 4.0
    Normal,   // 4.0-6.0
    Elevated, // 6.0-7.2
    High,     // >= 7.2
}

impl EntropyLevel {
    pub fn from_value(entropy: f64) -> Self {
        if entropy < 4.0 {
            EntropyLevel::VeryLow
        } else if entropy < 6.0 {
            EntropyLevel::Normal
        } else if entropy < 7.2 {
            EntropyLevel::Elevated
        } else {
            EntropyLevel::High
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntropyLevel::VeryLow => "very_low",
            EntropyLevel::Normal => "normal",
            EntropyLevel::Elevated => "elevated",
            EntropyLevel::High => "high",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_entropy() {
        let data = vec![b'A'; 100];
        let score = calculate_entropy(&data).unwrap();
        assert_eq!(score.bits, 0.0);
        assert_eq!(score.len, 100);
        assert!(score.bits.is_sign_positive());
    }

    #[test]
    fn test_max_entropy() {
        let data: Vec<u8> = (0..=255).collect();
        let score = calculate_entropy(&data).unwrap();
        assert!((score.bits - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_repeated_distribution_is_max() {
        let data: Vec<u8> = (0..=255u8).cycle().take(256 * 40).collect();
        let score = calculate_entropy(&data).unwrap();
        assert!((score.bits - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(calculate_entropy(&[]), Err(AnalysisError::EmptyInput)));
        assert!(matches!(calculate_text_entropy(""), Err(AnalysisError::EmptyInput)));
    }

    #[test]
    fn test_two_symbols_one_bit() {
        let score = calculate_entropy(b"abababab").unwrap();
        assert!((score.bits - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_order_invariance() {
        let data = b"the quick brown fox jumps over the lazy dog 0123456789".to_vec();
        let mut reversed = data.clone();
        reversed.reverse();
        let mut sorted = data.clone();
        sorted.sort_unstable();

        let a = calculate_entropy(&data).unwrap().bits;
        assert_eq!(a, calculate_entropy(&reversed).unwrap().bits);
        assert_eq!(a, calculate_entropy(&sorted).unwrap().bits);
    }

    #[test]
    fn test_bounds_on_assorted_inputs() {
        let inputs: Vec<Vec<u8>> = vec![
            vec![0],
            vec![0xff; 3],
            b"Hello, World! This is a test string with some text.".to_vec(),
            (0..5000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect(),
        ];
        for input in inputs {
            let bits = calculate_entropy(&input).unwrap().bits;
            assert!((0.0..=8.0).contains(&bits), "entropy {bits} out of range");
        }
    }

    #[test]
    fn test_text_entropy_matches_utf8_bytes() {
        let text = "Grüße, 世界";
        assert_eq!(
            calculate_text_entropy(text).unwrap(),
            calculate_entropy(text.as_bytes()).unwrap()
        );
    }

    #[test]
    fn test_entropy_classification() {
        assert_eq!(EntropyLevel::from_value(2.5), EntropyLevel::VeryLow);
        assert_eq!(EntropyLevel::from_value(5.0), EntropyLevel::Normal);
        assert_eq!(EntropyLevel::from_value(6.5), EntropyLevel::Elevated);
        assert_eq!(EntropyLevel::from_value(7.5), EntropyLevel::High);
    }
}
