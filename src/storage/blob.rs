//! Little-endian f32 vector encoding for BLOB columns

use super::traits::{StorageError, StorageResult};

pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::Corrupt(format!(
            "vector blob of {} bytes is not a whole number of f32s",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_bits() {
        let vector = vec![0.0, -0.0, 1.5, f32::MIN_POSITIVE, -3.25e7];
        let decoded = decode_vector(&encode_vector(&vector)).unwrap();
        let bits = |v: &[f32]| v.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&decoded), bits(&vector));
    }

    #[test]
    fn rejects_truncated_blob() {
        assert!(matches!(
            decode_vector(&[0, 0, 128]),
            Err(StorageError::Corrupt(_))
        ));
    }
}
