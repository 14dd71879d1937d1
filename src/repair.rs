//! Best-effort normalization of human- or model-produced numeric arguments
//! into atomic integer strings. Inputs this module cannot repair are returned
//! unchanged so the schema validator rejects them with a named field.

use serde_json::Value;

/// USDT atomic units are 10^-6 of a whole token.
pub const USDT_DECIMALS: u32 = 6;
/// Lamports are 10^-9 of the native chain currency.
pub const LAMPORT_DECIMALS: u32 = 9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// When set, a trailing alphabetic unit suffix separated by whitespace
    /// ("0.12 usdt") is stripped before parsing. Off by default: masking a
    /// unit the caller spelled out may mask their intent.
    pub strip_unit_suffix: bool,
}

/// Repairs `input` into an atomic integer string for a token with `decimals`
/// fractional digits. Integer strings pass through, decimal strings are
/// scaled exactly, everything else is returned unchanged.
pub fn coerce_atomic(input: &str, decimals: u32, opts: RepairOptions) -> String {
    let trimmed = input.trim();

    let without_suffix = if opts.strip_unit_suffix {
        strip_unit_suffix(trimmed)
    } else {
        trimmed
    };

    // Formatting artifacts only; anything else stays untouched.
    let cleaned: String = without_suffix
        .chars()
        .filter(|c| *c != '_' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return input.to_string();
    }

    if cleaned.bytes().all(|b| b.is_ascii_digit()) {
        return cleaned;
    }

    match scale_decimal(&cleaned, decimals) {
        Some(atomic) => atomic,
        None => input.to_string(),
    }
}

pub fn coerce_usdt(input: &str) -> String {
    coerce_atomic(input, USDT_DECIMALS, RepairOptions::default())
}

pub fn coerce_lamports(input: &str) -> String {
    coerce_atomic(input, LAMPORT_DECIMALS, RepairOptions::default())
}

/// Repairs a JSON value in place of a string: finite numbers are scaled by
/// `10^decimals`, strings go through [`coerce_atomic`], other values pass
/// through unchanged.
pub fn coerce_value(value: &Value, decimals: u32, opts: RepairOptions) -> Value {
    match value {
        Value::String(s) => Value::String(coerce_atomic(s, decimals, opts)),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                match pow10(decimals).and_then(|m| u128::from(u).checked_mul(m)) {
                    Some(scaled) => Value::String(scaled.to_string()),
                    None => value.clone(),
                }
            } else if n.is_f64() {
                // Shortest round-trip formatting, then the exact string path.
                let rendered = n.to_string();
                let repaired = coerce_atomic(&rendered, decimals, opts);
                if repaired == rendered {
                    value.clone()
                } else {
                    Value::String(repaired)
                }
            } else {
                // Negative integers are out of range for atomic amounts.
                value.clone()
            }
        }
        _ => value.clone(),
    }
}

/// Moves top-level scalar fields of an `offer_post`-style request into a
/// single-element `offers[]` array. Values already present in the first offer
/// are never overwritten.
pub fn flatten_offer(request: &mut Value, scalar_fields: &[&str]) {
    let Some(obj) = request.as_object_mut() else {
        return;
    };

    let mut moved = serde_json::Map::new();
    for field in scalar_fields {
        if let Some(v) = obj.get(*field) {
            if !v.is_object() && !v.is_array() {
                moved.insert((*field).to_string(), v.clone());
            }
        }
    }
    if moved.is_empty() {
        return;
    }

    for key in moved.keys() {
        obj.remove(key);
    }

    let offers = obj
        .entry("offers")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(list) = offers.as_array_mut() else {
        return;
    };
    if list.is_empty() {
        list.push(Value::Object(serde_json::Map::new()));
    }
    if let Some(first) = list[0].as_object_mut() {
        for (key, value) in moved {
            first.entry(key).or_insert(value);
        }
    }
}

fn strip_unit_suffix(s: &str) -> &str {
    match s.split_once(char::is_whitespace) {
        Some((head, tail)) if !head.is_empty() && tail.chars().all(|c| c.is_ascii_alphabetic()) => {
            head
        }
        _ => s,
    }
}

fn scale_decimal(s: &str, decimals: u32) -> Option<String> {
    let (int_part, frac_part) = s.split_once('.')?;
    if !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac_part.is_empty() || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac_part.len() as u32 > decimals {
        return None;
    }

    let int_value: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let frac_value: u128 = frac_part.parse().ok()?;

    let scale = pow10(decimals)?;
    let frac_scale = pow10(decimals - frac_part.len() as u32)?;
    let atomic = int_value
        .checked_mul(scale)?
        .checked_add(frac_value.checked_mul(frac_scale)?)?;
    Some(atomic.to_string())
}

fn pow10(exp: u32) -> Option<u128> {
    10u128.checked_pow(exp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_strings_pass_through() {
        assert_eq!(coerce_usdt("120000"), "120000");
        assert_eq!(coerce_lamports("1"), "1");
    }

    #[test]
    fn decimal_strings_scale_exactly() {
        assert_eq!(coerce_usdt("0.12"), "120000");
        assert_eq!(coerce_usdt("100"), "100");
        assert_eq!(coerce_usdt("1.5"), "1500000");
        assert_eq!(coerce_lamports("0.01"), "10000000");
    }

    #[test]
    fn unparseable_input_is_returned_unchanged() {
        assert_eq!(coerce_usdt("not-a-number"), "not-a-number");
        assert_eq!(coerce_usdt("-3"), "-3");
        assert_eq!(coerce_usdt("1.2.3"), "1.2.3");
        assert_eq!(coerce_usdt(""), "");
    }

    #[test]
    fn too_many_fraction_digits_is_rejected() {
        assert_eq!(coerce_usdt("0.1234567"), "0.1234567");
    }

    #[test]
    fn separators_are_stripped() {
        assert_eq!(coerce_usdt("1_000"), "1000");
        assert_eq!(coerce_usdt("1,000.5"), "1000500000");
    }

    #[test]
    fn unit_suffix_needs_opt_in() {
        assert_eq!(coerce_usdt("0.12 usdt"), "0.12 usdt");
        let opts = RepairOptions {
            strip_unit_suffix: true,
        };
        assert_eq!(coerce_atomic("0.12 usdt", USDT_DECIMALS, opts), "120000");
        // A non-alphabetic tail is not a unit suffix.
        assert_eq!(coerce_atomic("0.12 34", USDT_DECIMALS, opts), "0.12 34");
    }

    #[test]
    fn json_numbers_scale() {
        let v = coerce_value(&json!(5), USDT_DECIMALS, RepairOptions::default());
        assert_eq!(v, json!("5000000"));
        let v = coerce_value(&json!(0.12), USDT_DECIMALS, RepairOptions::default());
        assert_eq!(v, json!("120000"));
        let v = coerce_value(&json!("abc"), USDT_DECIMALS, RepairOptions::default());
        assert_eq!(v, json!("abc"));
    }

    #[test]
    fn flatten_moves_scalars_without_overwriting() {
        let mut req = json!({
            "usdt_amount": "100",
            "btc_sats": 50,
            "offers": [{"btc_sats": 75}]
        });
        flatten_offer(&mut req, &["usdt_amount", "btc_sats"]);
        assert_eq!(req["offers"][0]["usdt_amount"], json!("100"));
        // Conflicting value in the existing offer is kept.
        assert_eq!(req["offers"][0]["btc_sats"], json!(75));
        assert!(req.get("usdt_amount").is_none());
    }

    #[test]
    fn flatten_creates_offers_when_missing() {
        let mut req = json!({"usdt_amount": "100"});
        flatten_offer(&mut req, &["usdt_amount"]);
        assert_eq!(req["offers"][0]["usdt_amount"], json!("100"));
    }
}
