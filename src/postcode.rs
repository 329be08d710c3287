use once_cell::sync::Lazy;
use regex::Regex;

// Outward code, single space, inward code. The inward letters exclude C, I, K, M, O and V.
static UK_POSTCODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z]{1,2}[0-9][A-Z0-9]? [0-9][ABD-HJLNP-UW-Z]{2}\b")
        .expect("postcode pattern compiles")
});

/// Returns the first UK-style postcode found in `address`, if any.
pub fn extract_postcode(address: &str) -> Option<&str> {
    UK_POSTCODE.find(address).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_postcode_at_end_of_address() {
        assert_eq!(
            extract_postcode("10 Downing St, London SW1A 2AA"),
            Some("SW1A 2AA")
        );
    }

    #[test]
    fn finds_postcode_in_the_middle() {
        assert_eq!(
            extract_postcode("Flat 2, M1 1AE Manchester, England"),
            Some("M1 1AE")
        );
        assert_eq!(extract_postcode("EC1A 1BB, London"), Some("EC1A 1BB"));
    }

    #[test]
    fn returns_first_of_several() {
        assert_eq!(
            extract_postcode("from B33 8TH to CR2 6XH"),
            Some("B33 8TH")
        );
    }

    #[test]
    fn rejects_near_misses() {
        assert_eq!(extract_postcode("1600 Amphitheatre Pkwy, Mountain View"), None);
        // no separating space
        assert_eq!(extract_postcode("London SW1A2AA"), None);
        // inward code may not use C, I, K, M, O or V
        assert_eq!(extract_postcode("London SW1A 2CI"), None);
        // lower case is not a postcode
        assert_eq!(extract_postcode("london sw1a 2aa"), None);
        assert_eq!(extract_postcode(""), None);
    }
}
