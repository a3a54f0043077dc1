use rand::Rng;

/// Length of a container ID in decimal digits.
const ID_LEN: usize = 10;

/// Generate a random 10-digit container ID.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_correct_length() {
        assert_eq!(generate_id().len(), ID_LEN);
    }

    #[test]
    fn generated_id_is_numeric() {
        let id = generate_id();
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn generated_ids_differ() {
        // Ten digits of entropy makes a collision across a handful of draws
        // vanishingly unlikely; a repeat here means the generator is broken.
        let ids: Vec<String> = (0..8).map(|_| generate_id()).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }
}
