// src/violation.rs

use crate::types::{Reservation, Spot};

/// Uppercase ASCII alphanumerics only; None when nothing is left.
pub fn normalize_plate(text: &str) -> Option<String> {
    let filtered: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub reserved: bool,
    /// Normalised plates allowed to park, sorted and de-duplicated.
    pub allowed: Vec<String>,
}

/// Reserved if permanently reserved or under an active reservation.
/// Allowed plates are the spot's list plus the reservation holder's plate.
pub fn authorization_for(spot: &Spot, reservation: Option<&Reservation>) -> Authorization {
    let mut allowed: Vec<String> = spot
        .authorized_plates
        .iter()
        .filter_map(|p| normalize_plate(p))
        .collect();

    if let Some(norm) = reservation.and_then(|r| {
        r.plate_norm
            .as_deref()
            .and_then(normalize_plate)
            .or_else(|| normalize_plate(&r.plate))
    }) {
        allowed.push(norm);
    }

    allowed.sort();
    allowed.dedup();

    Authorization {
        reserved: spot.reserved || reservation.is_some(),
        allowed,
    }
}

impl Authorization {
    /// Flagged only for a reserved spot with a non-empty allow list and a
    /// plate that is missing or not on it.
    pub fn is_violation(&self, plate: Option<&str>) -> bool {
        if !self.reserved || self.allowed.is_empty() {
            return false;
        }
        match plate.and_then(normalize_plate) {
            Some(norm) => !self.allowed.iter().any(|a| *a == norm),
            None => true,
        }
    }

    pub fn permits(&self, plate: &str) -> bool {
        normalize_plate(plate)
            .map(|norm| self.allowed.iter().any(|a| *a == norm))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn spot(reserved: bool, plates: &[&str]) -> Spot {
        Spot {
            name: "A1".to_string(),
            polygon: vec![],
            reserved,
            authorized_plates: plates.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn reservation(plate: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            spot: "A1".to_string(),
            plate: plate.to_string(),
            plate_norm: normalize_plate(plate),
            reserved_by: Some("driver@example.com".to_string()),
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate("abc-1d23"), Some("ABC1D23".to_string()));
        assert_eq!(normalize_plate(" ab 12 cd "), Some("AB12CD".to_string()));
        assert_eq!(normalize_plate("--- "), None);
        assert_eq!(normalize_plate(""), None);
    }

    #[test]
    fn test_violation_rules() {
        let auth = authorization_for(&spot(true, &["AB12CD"]), None);
        assert!(auth.is_violation(Some("XX99ZZ")));
        assert!(!auth.is_violation(Some("AB12CD")));
        assert!(!auth.is_violation(Some("ab-12 cd")));
        assert!(auth.is_violation(None));
        assert!(auth.is_violation(Some("??")));
    }

    #[test]
    fn test_empty_allow_list_never_violates() {
        let auth = authorization_for(&spot(true, &[]), None);
        assert!(auth.reserved);
        assert!(!auth.is_violation(Some("XX99ZZ")));
        assert!(!auth.is_violation(None));
    }

    #[test]
    fn test_unreserved_never_violates() {
        let auth = authorization_for(&spot(false, &["AB12CD"]), None);
        assert!(!auth.reserved);
        assert!(!auth.is_violation(Some("XX99ZZ")));
    }

    #[test]
    fn test_reservation_adds_holder_plate() {
        let s = spot(false, &[]);
        let r = reservation("qwe-9876");
        let auth = authorization_for(&s, Some(&r));
        assert!(auth.reserved);
        assert_eq!(auth.allowed, vec!["QWE9876".to_string()]);
        assert!(!auth.is_violation(Some("QWE9876")));
        assert!(auth.is_violation(Some("ZZZ0000")));
        assert!(auth.permits("qwe 9876"));
    }
}
