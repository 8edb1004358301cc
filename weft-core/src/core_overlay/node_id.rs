/*
    NodeId - the identifier space of the overlay

    Responsibilities:
    `node_id.rs` defines the 40-digit base-16 identifiers that nodes and keys
    live in. It handles: SHA-1 hashing of keys into digits, random identifier
    generation, shared prefix length, the surrogate better-route comparison
    used for routing and transfer decisions, the absolute-distance comparison
    used for slot ordering, and the hex wire form.

    Inputs:
    - application keys (arbitrary strings)
    - hex identifier strings from the wire

    Outputs:
    - NodeId values and the comparisons between them
*/

use std::fmt;

use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};

use super::error::OverlayError;
use super::{BASE, DIGITS};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// A 40-digit base-16 overlay identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; DIGITS]);

impl NodeId {
    /// Build an identifier from raw digits. Digits must be below [`BASE`].
    pub fn from_digits(digits: [u8; DIGITS]) -> Self {
        debug_assert!(digits.iter().all(|d| (*d as usize) < BASE));
        NodeId(digits)
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut digits = [0u8; DIGITS];
        for digit in digits.iter_mut() {
            *digit = rng.random_range(0..BASE as u8);
        }
        NodeId(digits)
    }

    /// Hash a key into the identifier space.
    ///
    /// Digit `i` is the high nibble of SHA-1 byte `(i/2) mod 20` when `i` is
    /// even and the low nibble when odd. Peers compiled against other
    /// implementations rely on this exact derivation.
    pub fn hash(key: &str) -> Self {
        let digest = Sha1::digest(key.as_bytes());
        let mut digits = [0u8; DIGITS];
        for (i, digit) in digits.iter_mut().enumerate() {
            let byte = digest[(i / 2) % digest.len()];
            *digit = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        }
        NodeId(digits)
    }

    /// The digit at `index`.
    pub fn digit(&self, index: usize) -> u8 {
        self.0[index]
    }

    /// Number of leading positions at which `self` and `other` agree.
    pub fn shared_prefix_length(&self, other: &NodeId) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Surrogate routing comparison: does `self` now route to `new` rather
    /// than `cur`?
    ///
    /// The better candidate has the longer shared prefix with `self`. On a
    /// prefix tie, the first digit at which the candidates differ decides:
    /// the one at the smaller right-modulo distance from the target digit
    /// wins. Returns false when `new == cur`.
    pub fn is_better_route(&self, new: &NodeId, cur: &NodeId) -> bool {
        if new == cur {
            return false;
        }

        let new_prefix = self.shared_prefix_length(new);
        let cur_prefix = self.shared_prefix_length(cur);

        if new_prefix == cur_prefix {
            let mut index = new_prefix;
            while index < DIGITS && new.0[index] == cur.0[index] {
                index += 1;
            }
            if index < DIGITS {
                let new_distance = right_distance(new.0[index], self.0[index]);
                let cur_distance = right_distance(cur.0[index], self.0[index]);
                if new_distance != cur_distance {
                    return new_distance < cur_distance;
                }
            }
        }

        new_prefix > cur_prefix
    }

    /// Absolute-closeness comparison used when ordering routing-table slots:
    /// is `a` nearer to `self` than `b`, reading identifiers as big-endian
    /// base-16 integers? This is not the surrogate comparison above.
    pub fn closer(&self, a: &NodeId, b: &NodeId) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Magnitude of the integer difference between `self` and `other`.
    pub fn distance(&self, other: &NodeId) -> BigUint {
        let target = self.to_biguint();
        let value = other.to_biguint();
        if value > target {
            value - target
        } else {
            target - value
        }
    }

    /// The identifier read as a big-endian base-16 integer.
    pub fn to_biguint(&self) -> BigUint {
        let mut value = BigUint::from(0u8);
        for &digit in self.0.iter() {
            value = (value << 4) + BigUint::from(digit);
        }
        value
    }

    /// Parse the wire form: exactly one hexadecimal character per digit.
    pub fn parse(s: &str) -> Result<NodeId, OverlayError> {
        if s.len() != DIGITS {
            return Err(OverlayError::Parse(format!(
                "identifier {:?} has length {}, expected {}",
                s,
                s.len(),
                DIGITS
            )));
        }
        Self::from_hex_prefix(s)
    }

    /// Build an identifier from a hex prefix, zero-padding the tail. Handy
    /// for tests and tooling that want identifiers like `"21"`.
    pub fn from_prefix(s: &str) -> Result<NodeId, OverlayError> {
        if s.len() > DIGITS {
            return Err(OverlayError::Parse(format!(
                "identifier prefix {:?} is longer than {} digits",
                s, DIGITS
            )));
        }
        Self::from_hex_prefix(s)
    }

    fn from_hex_prefix(s: &str) -> Result<NodeId, OverlayError> {
        let mut digits = [0u8; DIGITS];
        for (i, c) in s.chars().enumerate() {
            digits[i] = c
                .to_digit(16)
                .ok_or_else(|| {
                    OverlayError::Parse(format!("invalid identifier digit {:?} in {:?}", c, s))
                })? as u8;
        }
        Ok(NodeId(digits))
    }

    /// The wire form: one uppercase hex character per digit.
    pub fn to_hex(&self) -> String {
        self.0
            .iter()
            .map(|&d| HEX_DIGITS[d as usize] as char)
            .collect()
    }

    /// True for the all-zero identifier, the id of the "no peer" wire value.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&d| d == 0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId([0; DIGITS])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Distance from `target` to `digit` moving right (upward) modulo the base.
fn right_distance(digit: u8, target: u8) -> u8 {
    (digit + BASE as u8 - target) % BASE as u8
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(prefix: &str) -> NodeId {
        NodeId::from_prefix(prefix).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(NodeId::hash("alice"), NodeId::hash("alice"));
        assert_ne!(NodeId::hash("alice"), NodeId::hash("bob"));
    }

    #[test]
    fn test_hash_matches_sha1_wire_form() {
        // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d, and the
        // digit extraction walks the digest nibble by nibble.
        assert_eq!(
            NodeId::hash("abc").to_hex(),
            "A9993E364706816ABA3E25717850C26C9CD0D89D"
        );
    }

    #[test]
    fn test_hash_digits_in_range() {
        let id = NodeId::hash("some key");
        assert!((0..DIGITS).all(|i| (id.digit(i) as usize) < BASE));
    }

    #[test]
    fn test_random_digits_in_range() {
        for _ in 0..10 {
            let id = NodeId::random();
            assert!((0..DIGITS).all(|i| (id.digit(i) as usize) < BASE));
        }
    }

    #[test]
    fn test_shared_prefix_length() {
        assert_eq!(id("1234").shared_prefix_length(&id("1239")), 3);
        assert_eq!(id("1234").shared_prefix_length(&id("9234")), 0);
        let a = id("1234");
        assert_eq!(a.shared_prefix_length(&a), DIGITS);
    }

    #[test]
    fn test_is_better_route_prefers_longer_prefix() {
        let target = id("1234");
        assert!(target.is_better_route(&id("1239"), &id("1934")));
        assert!(!target.is_better_route(&id("1934"), &id("1239")));
    }

    #[test]
    fn test_is_better_route_right_distance_tiebreak() {
        // Both candidates share no prefix with the target; moving right from
        // digit 2 reaches 3 before 5 and 5 before 7.
        let target = id("2");
        assert!(target.is_better_route(&id("3"), &id("5")));
        assert!(target.is_better_route(&id("5"), &id("7")));
        assert!(!target.is_better_route(&id("7"), &id("3")));
        // Moving right from 4 wraps past F and reaches 1 before 2 or 3.
        let target = id("244");
        assert!(target.is_better_route(&id("214"), &id("224")));
        assert!(target.is_better_route(&id("224"), &id("234")));
    }

    #[test]
    fn test_is_better_route_rejects_equal_candidates() {
        let target = id("1234");
        let candidate = id("5678");
        assert!(!target.is_better_route(&candidate, &candidate));
    }

    #[test]
    fn test_closer_uses_absolute_distance() {
        let target = id("5");
        // |4 - 5| < |7 - 5| as integers, even though 7 is the better
        // surrogate route from 5.
        assert!(target.closer(&id("4"), &id("7")));
        assert!(!target.closer(&id("7"), &id("4")));
        let a = id("4");
        assert!(!target.closer(&a, &a));
    }

    #[test]
    fn test_to_biguint_ordering_matches_digits() {
        assert!(id("1").to_biguint() < id("2").to_biguint());
        assert!(id("0F").to_biguint() < id("10").to_biguint());
    }

    #[test]
    fn test_parse_round_trip() {
        let original = NodeId::hash("round trip");
        let parsed = NodeId::parse(&original.to_hex()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(NodeId::parse("123").is_err());
        assert!(NodeId::parse(&"Z".repeat(DIGITS)).is_err());
        assert!(NodeId::parse(&"A".repeat(DIGITS + 1)).is_err());
    }

    #[test]
    fn test_parse_accepts_lowercase() {
        let id = NodeId::parse(&"a".repeat(DIGITS)).unwrap();
        assert_eq!(id.to_hex(), "A".repeat(DIGITS));
    }

    #[test]
    fn test_from_prefix_pads_with_zeros() {
        let id = NodeId::from_prefix("21").unwrap();
        assert_eq!(id.digit(0), 2);
        assert_eq!(id.digit(1), 1);
        assert!((2..DIGITS).all(|i| id.digit(i) == 0));
        assert!(NodeId::from_prefix(&"1".repeat(DIGITS + 1)).is_err());
    }

    #[test]
    fn test_is_zero() {
        assert!(NodeId::default().is_zero());
        assert!(!id("1").is_zero());
    }

    fn arb_node_id() -> impl Strategy<Value = NodeId> {
        proptest::collection::vec(0u8..BASE as u8, DIGITS).prop_map(|digits| {
            let mut array = [0u8; DIGITS];
            array.copy_from_slice(&digits);
            NodeId::from_digits(array)
        })
    }

    proptest! {
        #[test]
        fn prop_hex_round_trip(id in arb_node_id()) {
            prop_assert_eq!(NodeId::parse(&id.to_hex()).unwrap(), id);
        }

        #[test]
        fn prop_biguint_order_is_lexicographic(a in arb_node_id(), b in arb_node_id()) {
            prop_assert_eq!(a.to_biguint() < b.to_biguint(), a < b);
        }

        #[test]
        fn prop_is_better_route_is_antisymmetric(
            target in arb_node_id(),
            a in arb_node_id(),
            b in arb_node_id(),
        ) {
            prop_assert!(!(target.is_better_route(&a, &b) && target.is_better_route(&b, &a)));
        }
    }
}
