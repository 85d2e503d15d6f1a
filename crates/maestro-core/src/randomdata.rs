//! Random input data for `inputRandom`.
//!
//! Backed by one process-local `StdRng` seeded from OS entropy at first
//! use. Diagnostic-quality randomness only; never seed from timestamps
//! per call.

use std::sync::Mutex;
use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::step::RandomDataType;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bruno", "Carla", "Daniel", "Elena", "Felix", "Grace", "Hugo", "Iris", "Jonas",
    "Klara", "Liam", "Mona", "Nadia", "Oscar", "Priya", "Quinn", "Rosa", "Samuel", "Tara",
];
const LAST_NAMES: &[&str] = &[
    "Abbott", "Becker", "Castro", "Dalton", "Eriksen", "Fischer", "Grant", "Hansen", "Ivanov",
    "Jensen", "Keller", "Larsen", "Meyer", "Novak", "Olsen", "Patel", "Quint", "Rossi",
    "Schmidt", "Tanaka",
];

fn rng() -> &'static Mutex<StdRng> {
    static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

fn pick_chars(alphabet: &[u8], length: usize) -> String {
    let mut rng = rng().lock().unwrap();
    (0..length)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

fn pick<'a>(items: &[&'a str]) -> &'a str {
    let mut rng = rng().lock().unwrap();
    items[rng.gen_range(0..items.len())]
}

/// Generates a value for the given data type. `length` applies to the
/// free-form types; emails and names have their own shape.
pub fn generate(data_type: RandomDataType, length: usize) -> String {
    let length = length.max(1);
    match data_type {
        RandomDataType::Text => pick_chars(LETTERS, length),
        RandomDataType::Number => pick_chars(DIGITS, length),
        RandomDataType::Email => format!(
            "{}.{}@example.com",
            pick_chars(LOWERCASE, 6),
            pick_chars(LOWERCASE, 6)
        ),
        RandomDataType::PersonName => format!("{} {}", pick(FIRST_NAMES), pick(LAST_NAMES)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_has_requested_length() {
        let value = generate(RandomDataType::Text, 10);
        assert_eq!(value.chars().count(), 10);
        assert!(value.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn number_is_all_digits() {
        let value = generate(RandomDataType::Number, 8);
        assert_eq!(value.len(), 8);
        assert!(value.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn email_has_address_shape() {
        let value = generate(RandomDataType::Email, 10);
        assert!(value.ends_with("@example.com"));
        assert!(value.contains('.'));
    }

    #[test]
    fn person_name_is_first_and_last() {
        let value = generate(RandomDataType::PersonName, 10);
        let parts: Vec<&str> = value.split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert!(FIRST_NAMES.contains(&parts[0]));
        assert!(LAST_NAMES.contains(&parts[1]));
    }

    #[test]
    fn zero_length_is_clamped() {
        assert_eq!(generate(RandomDataType::Text, 0).len(), 1);
    }

    #[test]
    fn values_vary_between_calls() {
        let a = generate(RandomDataType::Text, 16);
        let b = generate(RandomDataType::Text, 16);
        // Collisions at this length are astronomically unlikely.
        assert_ne!(a, b);
    }
}
