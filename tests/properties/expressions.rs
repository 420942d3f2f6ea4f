//! Property tests for field expressions and plan hashing.

use chrono::NaiveDate;
use proptest::prelude::*;
use serde_json::{Map, Value};

use vfxdelivery_core::{
    canonical_json,
    entity::Fields,
    expression::{evaluate, Expression, ExpressionContext},
};

fn timestamp() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(14, 30, 0).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 96,
        .. ProptestConfig::default()
    })]

    /// PROPERTY: Evaluation never panics on arbitrary text.
    #[test]
    fn property_evaluate_never_panics(text in "(?s).{0,128}") {
        let shot: Fields = [("code".to_string(), Value::from("010"))].into_iter().collect();
        let ctx = ExpressionContext::new(timestamp()).with_shot(&shot);
        let _ = evaluate(&text, &ctx);
        let _ = Expression::parse(&text).validate();
    }

    /// PROPERTY: Text without markup renders unchanged.
    #[test]
    fn property_plain_text_is_literal(text in "[A-Za-z0-9 _.,:;/-]{0,64}") {
        let ctx = ExpressionContext::new(timestamp());
        prop_assert_eq!(evaluate(&text, &ctx).unwrap(), text);
    }

    /// PROPERTY: A shot reference renders the shot's value.
    #[test]
    fn property_shot_reference_resolves(code in "[A-Za-z0-9_]{1,16}", prefix in "[a-z ]{0,8}") {
        let shot: Fields = [("code".to_string(), Value::from(code.clone()))].into_iter().collect();
        let ctx = ExpressionContext::new(timestamp()).with_shot(&shot);
        let rendered = evaluate(&format!("{}<shot.code>", prefix), &ctx).unwrap();
        prop_assert_eq!(rendered, format!("{}{}", prefix, code));
    }

    /// PROPERTY: Canonical JSON ignores key insertion order.
    #[test]
    fn property_canonical_json_order_independent(
        entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..10)
    ) {
        let forward: Map<String, Value> = entries.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
        let reverse: Map<String, Value> = entries.iter().rev().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
        prop_assert_eq!(
            canonical_json(&Value::Object(forward)).unwrap(),
            canonical_json(&Value::Object(reverse)).unwrap()
        );
    }
}
