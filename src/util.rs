use std::io::Read;
use rand::Rng;

/// Pronounceable code, consonants and vowels alternating. Handed out to parents.
pub fn generate_random_string(len: usize) -> String {
    const VOWELS: &[u8] = b"aeiouy";
    const CONSONANTS: &[u8] = b"bcdfghjklmnpqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { VOWELS };
            charset[rng.random_range(0..charset.len())] as char
        })
        .collect()
}

pub fn generate_token(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Inflates at most `limit + 1` bytes, a result longer than `limit` means the stream did not fit.
pub(crate) fn unzip_data(bytes: &[u8], limit: u64) -> Result<Vec<u8>, String> {
    let mut z = flate2::read::ZlibDecoder::new(bytes).take(limit + 1);
    let mut s = Vec::new();
    z.read_to_end(&mut s).map_err(|e| { e.to_string() })?;
    Ok(s)
}

/// `part / total` as a percentage with one decimal, `None` when there is nothing to divide by.
pub fn percentage(part: i64, total: i64) -> Option<f64> {
    if total <= 0 {
        return None;
    }
    let pct = part as f64 * 100.0 / total as f64;
    Some((pct * 10.0).round() / 10.0)
}

#[cfg(test)]
pub(crate) mod test {
    use std::io::Read;
    use flate2::bufread::ZlibEncoder;
    use flate2::Compression;
    use super::*;

    pub(crate) fn zip_data(bytes: &[u8]) -> Result<Vec<u8>, String> {
        let mut ret_vec = Vec::new();
        let mut deflater = ZlibEncoder::new(bytes, Compression::fast());
        deflater.read_to_end(&mut ret_vec).map_err(|e| e.to_string())?;
        Ok(ret_vec)
    }

    #[test]
    fn test_zip() {
        let data = b"foo bar baz";
        let zdata = zip_data(data).unwrap();
        let udata = unzip_data(&zdata, 1024).unwrap();
        assert_eq!(udata, data);
        let cut = unzip_data(&zdata, 3).unwrap();
        assert_eq!(cut, b"foo ");
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), None);
        assert_eq!(percentage(3, 3), Some(100.0));
        assert_eq!(percentage(2, 3), Some(66.7));
        assert_eq!(percentage(1, 3), Some(33.3));
        assert_eq!(percentage(0, 20), Some(0.0));
    }

    #[test]
    fn test_random_strings() {
        let code = generate_random_string(10);
        assert_eq!(code.len(), 10);
        assert!(code.chars().step_by(2).all(|c| !"aeiouy".contains(c)));
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
