use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::Vertical;

/// Attribute keys that only vehicle listings carry, in normalized form.
pub const VEHICLE_ATTRIBUTE_KEYS: &[&str] = &[
    "registrationnumber",
    "mileage",
    "fueltype",
    "transmission",
    "modelyear",
    "bodytype",
    "color",
    "make",
    "model",
    "features",
];

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Labels extracted attributes as a vehicle listing when any vehicle key is
/// present with a non-null value.
pub fn classify_vertical(attributes: &JsonMap<String, JsonValue>) -> Vertical {
    let hit = attributes.iter().any(|(key, value)| {
        !value.is_null() && VEHICLE_ATTRIBUTE_KEYS.contains(&normalize_key(key).as_str())
    });
    if hit {
        Vertical::Vehicle
    } else {
        Vertical::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn any_vehicle_key_classifies_as_vehicle() {
        assert_eq!(classify_vertical(&attrs(json!({"mileage": "120000"}))), Vertical::Vehicle);
        assert_eq!(classify_vertical(&attrs(json!({"fuelType": "diesel"}))), Vertical::Vehicle);
        assert_eq!(
            classify_vertical(&attrs(json!({"Registration Number": "ABC-123"}))),
            Vertical::Vehicle
        );
        assert_eq!(
            classify_vertical(&attrs(json!({"size": "L", "model_year": 2015}))),
            Vertical::Vehicle
        );
    }

    #[test]
    fn null_values_and_unrelated_keys_stay_generic() {
        assert_eq!(classify_vertical(&attrs(json!({"make": null}))), Vertical::Generic);
        assert_eq!(
            classify_vertical(&attrs(json!({"size": "L", "material": "oak"}))),
            Vertical::Generic
        );
        assert_eq!(classify_vertical(&JsonMap::new()), Vertical::Generic);
    }
}
