//! Property tests for delivery version resolution.

use chrono::NaiveDate;
use proptest::prelude::*;

use vfxdelivery_core::versioning::{format_tag, parse_tag, resolve_version, DeliveryFolder};

fn folder() -> impl Strategy<Value = DeliveryFolder> {
    (prop::option::of(1u32..=28), 1u32..200).prop_map(|(day, version)| {
        let date = day.and_then(|d| NaiveDate::from_ymd_opt(2024, 3, d));
        DeliveryFolder::new(&format!("folder_{}", version), date, version)
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    /// PROPERTY: A resolved version is above every folder it counts.
    #[test]
    fn property_resolved_version_exceeds_existing(
        folders in proptest::collection::vec(folder(), 0..12),
        day in 1u32..=28,
        continuous in any::<bool>(),
    ) {
        let batch_date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        let version = resolve_version(batch_date, &folders, continuous, None).unwrap();
        let number = version.number.unwrap();

        prop_assert!(number >= 1);
        for folder in &folders {
            let counted = continuous || folder.date.map_or(true, |d| d == batch_date);
            if counted {
                prop_assert!(number > folder.version);
            }
        }
        prop_assert_eq!(parse_tag(&version.tag), Some(number));
    }

    /// PROPERTY: Continuous versioning never resolves lower than per-date versioning.
    #[test]
    fn property_continuous_dominates_per_date(
        folders in proptest::collection::vec(folder(), 0..12),
        day in 1u32..=28,
    ) {
        let batch_date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        let per_date = resolve_version(batch_date, &folders, false, None).unwrap().number.unwrap();
        let continuous = resolve_version(batch_date, &folders, true, None).unwrap().number.unwrap();
        prop_assert!(continuous >= per_date);
    }

    /// PROPERTY: A manual tag is used verbatim whatever exists on disk.
    #[test]
    fn property_manual_tag_is_verbatim(
        folders in proptest::collection::vec(folder(), 0..6),
        tag in "[A-Za-z0-9_]{1,12}",
    ) {
        let batch_date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let version = resolve_version(batch_date, &folders, false, Some(&tag)).unwrap();
        prop_assert_eq!(&version.tag, &tag);
        prop_assert!(version.is_manual());
    }

    /// PROPERTY: Tags are zero padded to at least three digits.
    #[test]
    fn property_tag_padding(number in 0u32..100_000) {
        let tag = format_tag(number);
        prop_assert!(tag.starts_with('v'));
        prop_assert!(tag.len() >= 4);
        prop_assert_eq!(parse_tag(&tag), Some(number));
    }
}
