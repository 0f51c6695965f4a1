//! Boolean coercion for flags coming from device payloads.
//!
//! Truth table:
//!
//! | input                                   | result        |
//! |-----------------------------------------|---------------|
//! | `true` / `false`                        | itself        |
//! | `null`                                  | false         |
//! | number                                  | `n != 0`      |
//! | string "true" / "false" (trim, any case)| true / false  |
//! | numeric string (trimmed, "" counts as 0)| `n != 0`      |
//! | any other string                        | false         |
//! | array / object                          | false         |

use serde_json::Value;

pub fn is_flag_active(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => string_flag(s),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn string_flag(raw: &str) -> bool {
    let trimmed = raw.trim().to_ascii_lowercase();
    match trimmed.as_str() {
        "true" => true,
        "false" | "" => false,
        other => match other.parse::<f64>() {
            Ok(n) if !n.is_nan() => n != 0.0,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truth_table() {
        let cases = [
            (json!(true), true),
            (json!(false), false),
            (json!(null), false),
            (json!(1), true),
            (json!(0), false),
            (json!(-3), true),
            (json!(0.0), false),
            (json!(2.5), true),
            (json!("1"), true),
            (json!("0"), false),
            (json!(" 1 "), true),
            (json!("TRUE"), true),
            (json!(" false "), false),
            (json!(""), false),
            (json!("   "), false),
            (json!("12"), true),
            (json!("0.0"), false),
            (json!("on"), false),
            (json!("nan"), false),
            (json!([1]), false),
            (json!({"a": 1}), false),
        ];
        for (input, expected) in cases {
            assert_eq!(is_flag_active(&input), expected, "input {}", input);
        }
    }
}
