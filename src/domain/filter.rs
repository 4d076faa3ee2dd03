//! Declarative advertisement filters.

use crate::domain::models::Advertisement;
use regex::Regex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum NameFilter {
    Exact(String),
    Contains(String),
    Pattern(Regex),
}

impl NameFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(expected) => name == expected,
            Self::Contains(fragment) => name.contains(fragment.as_str()),
            Self::Pattern(regex) => regex.is_match(name),
        }
    }
}

/// Predicate applied to every advertisement frame during a scan.
#[derive(Debug, Clone, Default)]
pub enum ScanFilter {
    /// Accepts every frame.
    #[default]
    All,
    Name(NameFilter),
    ServiceUuid(Uuid),
    /// Matches frames carrying data for `company_id` that starts with `prefix`.
    ManufacturerData { company_id: u16, prefix: Vec<u8> },
    /// Every nested filter must match. An empty list matches everything.
    And(Vec<ScanFilter>),
    /// At least one nested filter must match. An empty list matches nothing.
    Or(Vec<ScanFilter>),
}

impl ScanFilter {
    pub fn name_contains(fragment: impl Into<String>) -> Self {
        Self::Name(NameFilter::Contains(fragment.into()))
    }

    pub fn name_exact(name: impl Into<String>) -> Self {
        Self::Name(NameFilter::Exact(name.into()))
    }

    pub fn name_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Name(NameFilter::Pattern(Regex::new(pattern)?)))
    }

    pub fn manufacturer(company_id: u16) -> Self {
        Self::ManufacturerData {
            company_id,
            prefix: Vec::new(),
        }
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        match self {
            Self::All => true,
            Self::Name(filter) => advertisement
                .name
                .as_deref()
                .map(|name| filter.matches(name))
                .unwrap_or(false),
            Self::ServiceUuid(uuid) => advertisement.service_uuids.contains(uuid),
            Self::ManufacturerData { company_id, prefix } => advertisement
                .manufacturer_data
                .get(company_id)
                .map(|data| data.starts_with(prefix))
                .unwrap_or(false),
            Self::And(filters) => filters.iter().all(|f| f.matches(advertisement)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(advertisement)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Identity;

    fn frame(name: Option<&str>) -> Advertisement {
        let adv = Advertisement::new(Identity::le("11:22:33:44:55:66"));
        match name {
            Some(name) => adv.with_name(name),
            None => adv,
        }
    }

    #[test]
    fn test_name_filters() {
        assert!(ScanFilter::name_contains("Demo").matches(&frame(Some("DemoX"))));
        assert!(!ScanFilter::name_contains("Demo").matches(&frame(Some("Other"))));
        assert!(!ScanFilter::name_contains("Demo").matches(&frame(None)));
        assert!(ScanFilter::name_exact("DemoX").matches(&frame(Some("DemoX"))));
        assert!(!ScanFilter::name_exact("Demo").matches(&frame(Some("DemoX"))));

        let any_name = ScanFilter::name_pattern(".*").unwrap();
        assert!(any_name.matches(&frame(Some(""))));
        assert!(!any_name.matches(&frame(None)));
        assert!(ScanFilter::name_pattern("(").is_err());
    }

    #[test]
    fn test_service_and_manufacturer_filters() {
        let heart_rate = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
        let adv = frame(Some("HRM"))
            .with_service(heart_rate)
            .with_manufacturer_data(0x0059, vec![0x01, 0x02, 0x03]);

        assert!(ScanFilter::ServiceUuid(heart_rate).matches(&adv));
        assert!(!ScanFilter::ServiceUuid(Uuid::nil()).matches(&adv));
        assert!(ScanFilter::manufacturer(0x0059).matches(&adv));
        assert!(ScanFilter::ManufacturerData {
            company_id: 0x0059,
            prefix: vec![0x01, 0x02],
        }
        .matches(&adv));
        assert!(!ScanFilter::ManufacturerData {
            company_id: 0x0059,
            prefix: vec![0x02],
        }
        .matches(&adv));
        assert!(!ScanFilter::manufacturer(0x004C).matches(&adv));
    }

    #[test]
    fn test_combinators() {
        let adv = frame(Some("DemoX")).with_manufacturer_data(0x0059, vec![]);

        let both = ScanFilter::And(vec![
            ScanFilter::name_contains("Demo"),
            ScanFilter::manufacturer(0x0059),
        ]);
        assert!(both.matches(&adv));

        let either = ScanFilter::Or(vec![
            ScanFilter::manufacturer(0x004C),
            ScanFilter::name_contains("Demo"),
        ]);
        assert!(either.matches(&adv));

        assert!(ScanFilter::And(vec![]).matches(&adv));
        assert!(!ScanFilter::Or(vec![]).matches(&adv));
    }
}
