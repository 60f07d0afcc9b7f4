use rand::Rng;
use uuid::Uuid;

pub type Id = Uuid;

const LABEL_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate_id() -> Id {
    Uuid::new_v4()
}

/// Generate a short random release label such as `K3Q9Z`, uniform over `[A-Z0-9]`
pub fn generate_version_label(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| LABEL_ALPHABET[rng.gen_range(0..LABEL_ALPHABET.len())] as char)
        .collect()
}

/// Parse an id from a JSON string value, ignoring anything that is not a UUID
pub fn parse_id(value: &serde_json::Value) -> Option<Id> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_label_shape() {
        for _ in 0..50 {
            let label = generate_version_label(5);
            assert_eq!(label.len(), 5);
            assert!(label
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }

        assert_eq!(generate_version_label(40).len(), 40);
    }

    #[test]
    fn test_every_label_position_covers_the_alphabet() {
        let labels: Vec<String> = (0..5000).map(|_| generate_version_label(8)).collect();
        for position in 0..8 {
            let seen: std::collections::HashSet<u8> =
                labels.iter().map(|label| label.as_bytes()[position]).collect();
            assert_eq!(seen.len(), LABEL_ALPHABET.len(), "position {}", position);
        }
    }

    #[test]
    fn test_parse_id() {
        let id = generate_id();
        assert_eq!(parse_id(&serde_json::json!(id.to_string())), Some(id));
        assert_eq!(parse_id(&serde_json::json!("not-a-uuid")), None);
        assert_eq!(parse_id(&serde_json::json!(42)), None);
    }
}
