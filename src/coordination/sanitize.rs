use serde_json::Value;

/// Field names treated as secret once case and separators are folded away
const SECRET_NAMES: [&str; 21] = [
    "password",
    "passwd",
    "passphrase",
    "secret",
    "apikey",
    "apisecret",
    "clientsecret",
    "secretkey",
    "privatekey",
    "accesstoken",
    "refreshtoken",
    "authtoken",
    "apitoken",
    "idtoken",
    "sessiontoken",
    "bearertoken",
    "credential",
    "credentials",
    "otp",
    "mnemonic",
    "seedphrase",
];

/// Lowercase words of a key, split on `_`, `-` and camelCase boundaries
fn segments(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in key.chars() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// A key is secret when the whole name, its last word, or its last two
/// words form one of [`SECRET_NAMES`]. `token` or `footprint` alone are not.
fn is_secret_key(key: &str) -> bool {
    let words = segments(key);
    if is_secret_name(&words.concat()) {
        return true;
    }
    match words.as_slice() {
        [.., last] if is_secret_name(last) => true,
        [.., a, b] => is_secret_name(&format!("{}{}", a, b)),
        _ => false,
    }
}

fn is_secret_name(name: &str) -> bool {
    SECRET_NAMES.contains(&name)
}

/// Copy of `value` with every secret-looking field removed, at any depth
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| !is_secret_key(k))
                .map(|(k, v)| (k.clone(), sanitize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
